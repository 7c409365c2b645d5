//! Error types for the castd-rpc crate.

use crate::transport::CodecError;

/// Unified error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The remote peer answered the call with an error.
    #[error("call failed with {code}: {message}")]
    Call { code: i32, message: String },

    #[error("Connection closed")]
    Disconnected,

    #[error("Call timeout")]
    Timeout,
}

impl From<crate::protocol::RpcError> for Error {
    fn from(e: crate::protocol::RpcError) -> Self {
        Self::Call {
            code: e.code,
            message: e.message,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RpcError;

    #[test]
    fn test_error_from_rpc_error() {
        let err: Error = RpcError::method_not_found().into();
        match err {
            Error::Call { code, message } => {
                assert_eq!(code, crate::protocol::METHOD_NOT_FOUND);
                assert!(message.contains("not found"));
            }
            _ => panic!("Expected Call error"),
        }
    }

    #[test]
    fn test_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "socket not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("socket not found"));
    }

    #[test]
    fn test_error_from_codec_error() {
        let err: Error = CodecError::FrameTooLarge(999_999_999).into();
        assert!(matches!(err, Error::Codec(_)));
        assert!(err.to_string().contains("999999999"));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Disconnected.to_string(), "Connection closed");
        assert_eq!(Error::Timeout.to_string(), "Call timeout");

        let err = Error::Call {
            code: -32603,
            message: "encoder failed".to_string(),
        };
        assert!(err.to_string().contains("-32603"));
        assert!(err.to_string().contains("encoder failed"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_error() -> Result<i32> {
            Err(Error::Timeout)
        }
        assert!(matches!(returns_error(), Err(Error::Timeout)));
    }
}
