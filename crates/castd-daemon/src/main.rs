//! Castd daemon entry point.
//!
//! This binary supervises a single encoder worker for one session: it
//! launches the worker, configures and starts the stream once the worker
//! reaches the bus, and winds it down again on interrupt.

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod encoder;
mod error;
mod spawner;

use castd_types::{DisplayRect, EncoderState, SessionParams};
use encoder::{Encoder, EncoderConfig};

/// Castd daemon - supervises an encoder worker over the control bus
#[derive(Parser, Debug)]
#[command(name = "castd-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Custom bus socket path (defaults to `$XDG_RUNTIME_DIR/castd-bus.sock` or `/tmp/castd-bus.sock`)
    #[arg(long, value_name = "PATH")]
    bus_path: Option<PathBuf>,

    /// Encoder program to launch
    #[arg(long, default_value = "gstencoder")]
    encoder: String,

    /// Display target the worker captures
    #[arg(long, default_value = ":0")]
    display: String,

    /// Authentication cookie file for the display
    #[arg(long, value_name = "PATH")]
    xauthority: PathBuf,

    /// Network address of the stream sink
    #[arg(long)]
    peer_address: String,

    /// Network address the worker binds locally
    #[arg(long)]
    local_address: String,

    /// Primary RTP port on the peer
    #[arg(long)]
    rtp_port: u16,

    /// Negotiated RTCP port, if any
    #[arg(long)]
    rtcp_port: Option<u16>,

    /// Display region to capture, as `x,y,WIDTHxHEIGHT`
    #[arg(long, value_parser = parse_rect)]
    rect: Option<DisplayRect>,
}

fn parse_rect(s: &str) -> Result<DisplayRect, String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err("expected x,y,WIDTHxHEIGHT".to_string());
    }
    let (width, height) = parts[2]
        .split_once('x')
        .ok_or_else(|| "expected WIDTHxHEIGHT".to_string())?;
    let parse = |v: &str| v.trim().parse::<u32>().map_err(|e| e.to_string());
    Ok(DisplayRect {
        x: parse(parts[0])?,
        y: parse(parts[1])?,
        width: parse(width)?,
        height: parse(height)?,
    })
}

/// Set up logging with file output for debugging.
/// In debug builds, defaults to debug level and logs to timestamped file.
/// In release builds, defaults to info level and logs to stderr.
fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("castd={default_level}")));

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("castd-daemon-{timestamp}.log");
        let log_path = temp_dir.join(&log_filename);

        #[cfg(unix)]
        {
            let symlink_path = temp_dir.join("castd-daemon.log");
            let _ = std::fs::remove_file(&symlink_path);
            let _ = std::os::unix::fs::symlink(&log_path, &symlink_path);
        }

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .init();

        eprintln!("Logging to: {} (and stderr)", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    setup_logging();

    info!("Starting castd daemon...");

    let session = SessionParams {
        display_name: args.display,
        display_auth: args.xauthority,
        peer_address: args.peer_address,
        local_address: args.local_address,
        rtp_port: args.rtp_port,
        rtcp_port: args.rtcp_port,
        display_rect: args.rect,
    };

    let mut config = EncoderConfig {
        program: args.encoder,
        ..EncoderConfig::default()
    };
    if let Some(path) = args.bus_path {
        config.bus_path = path;
    }

    let encoder = Encoder::spawn(session, config)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    encoder.set_observer(move |state| {
        let _ = tx.send(state);
    });

    loop {
        tokio::select! {
            state = rx.recv() => {
                let Some(state) = state else { break };
                info!("encoder is now {state}");
                match state {
                    EncoderState::Spawned => {
                        encoder.configure().await?;
                        encoder.start().await?;
                    }
                    EncoderState::Terminated => break,
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping encoder");
                if let Err(e) = encoder.stop().await {
                    warn!("stop failed: {e}");
                }
            }
        }
    }

    info!("Castd daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rect_valid() {
        let rect = parse_rect("0,0,1920x1080").unwrap();
        assert_eq!(rect.x, 0);
        assert_eq!(rect.y, 0);
        assert_eq!(rect.width, 1920);
        assert_eq!(rect.height, 1080);
    }

    #[test]
    fn test_parse_rect_with_offset() {
        let rect = parse_rect("100,200,1280x720").unwrap();
        assert_eq!(rect.x, 100);
        assert_eq!(rect.y, 200);
        assert_eq!(rect.width, 1280);
        assert_eq!(rect.height, 720);
    }

    #[test]
    fn test_parse_rect_invalid() {
        assert!(parse_rect("1920x1080").is_err());
        assert!(parse_rect("0,0,1920").is_err());
        assert!(parse_rect("a,b,cxd").is_err());
    }
}
