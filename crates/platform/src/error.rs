//! Error types for Tern

use std::fmt;
use std::sync::Arc;

/// Unified error type for all Tern operations.
///
/// The type is `Clone` so that one terminal failure (for example a dropped
/// transport) can be handed to every waiter that depended on it.
#[derive(Debug, Clone)]
pub enum TernError {
    /// I/O error
    Io(Arc<std::io::Error>),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed or unexpected input)
    Protocol(String),

    /// Security error (signature, host key, integrity)
    Security(String),

    /// Read past the end of the available bytes
    Underflow {
        /// Bytes the read needed
        requested: usize,
        /// Bytes that were left
        available: usize,
    },

    /// A bounded wait expired
    Timeout(String),

    /// The resource was closed before the operation could finish
    Closed(String),

    /// Transport-fatal error carrying an SSH disconnect reason code
    Disconnect {
        /// RFC 4253 §11.1 reason code
        code: u32,
        /// Human readable description
        message: String,
    },

    /// The peer refused a request (channel open, global request, SFTP status)
    Rejected {
        /// Peer supplied reason or status code
        code: u32,
        /// Peer supplied description
        message: String,
    },

    /// Authentication did not succeed with any method
    Auth {
        /// Summary of the failure
        message: String,
        /// Saved causes, most recent first
        causes: Vec<TernError>,
    },

    /// Not implemented
    NotImplemented(String),
}

impl TernError {
    /// Returns `true` for errors raised by an expired wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TernError::Timeout(_))
    }

    /// Returns the most recent saved cause of an authentication failure.
    pub fn most_recent_cause(&self) -> Option<&TernError> {
        match self {
            TernError::Auth { causes, .. } => causes.first(),
            _ => None,
        }
    }
}

impl fmt::Display for TernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TernError::Io(e) => write!(f, "IO error: {}", e),
            TernError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TernError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TernError::Security(msg) => write!(f, "Security error: {}", msg),
            TernError::Underflow {
                requested,
                available,
            } => write!(
                f,
                "Buffer underflow: needed {} bytes, {} available",
                requested, available
            ),
            TernError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            TernError::Closed(msg) => write!(f, "Closed: {}", msg),
            TernError::Disconnect { code, message } => {
                write!(f, "Disconnected (reason {}): {}", code, message)
            }
            TernError::Rejected { code, message } => {
                write!(f, "Rejected (code {}): {}", code, message)
            }
            TernError::Auth { message, causes } => match causes.first() {
                Some(cause) => write!(f, "Authentication failed: {} ({})", message, cause),
                None => write!(f, "Authentication failed: {}", message),
            },
            TernError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
        }
    }
}

impl std::error::Error for TernError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TernError::Io(e) => Some(e.as_ref()),
            TernError::Auth { causes, .. } => causes
                .first()
                .map(|c| c as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TernError {
    fn from(err: std::io::Error) -> Self {
        TernError::Io(Arc::new(err))
    }
}

impl From<TernError> for std::io::Error {
    fn from(err: TernError) -> Self {
        match err {
            TernError::Io(e) => std::io::Error::new(e.kind(), e.to_string()),
            TernError::Timeout(_) => std::io::Error::new(std::io::ErrorKind::TimedOut, err),
            TernError::Closed(_) => std::io::Error::new(std::io::ErrorKind::BrokenPipe, err),
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

/// Result type for Tern operations
pub type TernResult<T> = Result<T, TernError>;
