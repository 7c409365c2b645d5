//! Worker process launch and signalling.
//!
//! The worker runs with a clean environment carrying only the display
//! target, the authentication cookie path, and a debug flag. The write end
//! of the handshake pipe is duplicated onto a well-known descriptor before
//! exec, so every worker knows where to report its bus name.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::Stdio;

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStderr, Command};
use tracing::debug;

use castd_types::SessionParams;

use crate::error::Result;

/// Descriptor the worker writes its bus name to.
pub(crate) const HANDSHAKE_FD: RawFd = 3;

pub(crate) struct SpawnedWorker {
    pub child: Child,
    pub pipe: pipe::Receiver,
}

/// Create the handshake pipe and launch the worker.
///
/// If the pipe's read end cannot be registered with the runtime after the
/// child already exists, no watcher is there to observe an exit, so the
/// child is killed forcefully before the error returns.
pub(crate) fn spawn_worker(program: &str, session: &SessionParams) -> Result<SpawnedWorker> {
    let (read_end, write_end) = new_pipe()?;
    let read_raw = read_end.as_raw_fd();
    let write_raw = write_end.as_raw_fd();

    let mut command = Command::new(program);
    command
        .env_clear()
        .env("DISPLAY", &session.display_name)
        .env("XAUTHORITY", &session.display_auth)
        .env("G_MESSAGES_DEBUG", "all")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Runs in the child between fork and exec: restore the default signal
    // mask and move the pipe's write end onto the well-known descriptor.
    // Only async-signal-safe calls are allowed here.
    unsafe {
        command.pre_exec(move || {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            if libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut()) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if read_raw != HANDSHAKE_FD {
                libc::close(read_raw);
            }
            if write_raw != HANDSHAKE_FD {
                if libc::dup2(write_raw, HANDSHAKE_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(write_raw);
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    drop(write_end);

    let pipe = match handshake_receiver(read_end) {
        Ok(receiver) => receiver,
        Err(e) => {
            if let Some(pid) = child.id() {
                let _ = signal_worker(pid_from_u32(pid), false);
            }
            return Err(e.into());
        }
    };

    Ok(SpawnedWorker { child, pipe })
}

fn new_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: fds is a valid two-element array for pipe(2) to fill.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: pipe(2) just returned ownership of both descriptors.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

fn handshake_receiver(read_end: OwnedFd) -> std::io::Result<pipe::Receiver> {
    set_nonblocking(&read_end)?;
    pipe::Receiver::from_owned_fd(read_end)
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    // SAFETY: fd is owned and stays valid across both calls.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

// Pids fit in i32 on every supported platform
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn pid_from_u32(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}

/// Send a termination signal to the worker. SIGTERM asks it to wind down;
/// SIGKILL is the forceful fallback.
pub(crate) fn signal_worker(pid: Pid, graceful: bool) -> nix::Result<()> {
    let sig = if graceful {
        Signal::SIGTERM
    } else {
        Signal::SIGKILL
    };
    signal::kill(pid, sig)
}

/// Forward the worker's stderr to the log until it closes.
pub(crate) fn spawn_stderr_logger(pid: u32, stderr: ChildStderr) {
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[encoder:{}] {}", pid, line);
        }
    });
}
