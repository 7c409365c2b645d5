//! Error types for the castd daemon.

/// Errors that can occur while supervising an encoder worker
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    /// I/O error while creating the worker process or handshake pipe
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bus-level failure, including remote call errors
    #[error("Bus error: {0}")]
    Bus(#[from] castd_rpc::Error),

    /// Signalling the worker process failed
    #[error("Signal error: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// Operation requires a completed handshake
    #[error("Worker not reachable on the bus yet")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, EncoderError>;
