//! Disconnect reason codes (RFC 4253 Section 11.1).
//!
//! The set is closed: codes received from a peer outside the range are kept
//! as raw numbers inside [`TernError::Disconnect`] but never produced locally.

use tern_platform::TernError;

/// Reason sent with `SSH_MSG_DISCONNECT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Returns the wire code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Maps a wire code to a reason.
    pub fn from_code(code: u32) -> Option<Self> {
        use DisconnectReason::*;
        Some(match code {
            1 => HostNotAllowedToConnect,
            2 => ProtocolError,
            3 => KeyExchangeFailed,
            4 => Reserved,
            5 => MacError,
            6 => CompressionError,
            7 => ServiceNotAvailable,
            8 => ProtocolVersionNotSupported,
            9 => HostKeyNotVerifiable,
            10 => ConnectionLost,
            11 => ByApplication,
            12 => TooManyConnections,
            13 => AuthCancelledByUser,
            14 => NoMoreAuthMethodsAvailable,
            15 => IllegalUserName,
            _ => return None,
        })
    }

    /// Builds the transport-fatal error for this reason.
    pub fn error(self, message: impl Into<String>) -> TernError {
        TernError::Disconnect {
            code: self.code(),
            message: message.into(),
        }
    }

    /// Picks the reason to report to the peer for a local failure.
    pub fn for_error(err: &TernError) -> Self {
        match err {
            TernError::Disconnect { code, .. } => {
                Self::from_code(*code).unwrap_or(DisconnectReason::ProtocolError)
            }
            TernError::Protocol(_) | TernError::Underflow { .. } => DisconnectReason::ProtocolError,
            TernError::Security(_) => DisconnectReason::KeyExchangeFailed,
            TernError::Io(_) | TernError::Timeout(_) | TernError::Closed(_) => {
                DisconnectReason::ConnectionLost
            }
            _ => DisconnectReason::ByApplication,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DisconnectReason::HostNotAllowedToConnect => "HOST_NOT_ALLOWED_TO_CONNECT",
            DisconnectReason::ProtocolError => "PROTOCOL_ERROR",
            DisconnectReason::KeyExchangeFailed => "KEY_EXCHANGE_FAILED",
            DisconnectReason::Reserved => "RESERVED",
            DisconnectReason::MacError => "MAC_ERROR",
            DisconnectReason::CompressionError => "COMPRESSION_ERROR",
            DisconnectReason::ServiceNotAvailable => "SERVICE_NOT_AVAILABLE",
            DisconnectReason::ProtocolVersionNotSupported => "PROTOCOL_VERSION_NOT_SUPPORTED",
            DisconnectReason::HostKeyNotVerifiable => "HOST_KEY_NOT_VERIFIABLE",
            DisconnectReason::ConnectionLost => "CONNECTION_LOST",
            DisconnectReason::ByApplication => "BY_APPLICATION",
            DisconnectReason::TooManyConnections => "TOO_MANY_CONNECTIONS",
            DisconnectReason::AuthCancelledByUser => "AUTH_CANCELLED_BY_USER",
            DisconnectReason::NoMoreAuthMethodsAvailable => "NO_MORE_AUTH_METHODS_AVAILABLE",
            DisconnectReason::IllegalUserName => "ILLEGAL_USER_NAME",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for code in 1..=15 {
            let reason = DisconnectReason::from_code(code).unwrap();
            assert_eq!(reason.code(), code);
        }
        assert_eq!(DisconnectReason::from_code(0), None);
        assert_eq!(DisconnectReason::from_code(16), None);
    }

    #[test]
    fn test_error_carries_code() {
        let err = DisconnectReason::MacError.error("MAC mismatch");
        assert!(matches!(err, TernError::Disconnect { code: 5, .. }));
        assert_eq!(DisconnectReason::for_error(&err), DisconnectReason::MacError);
    }

    #[test]
    fn test_classification() {
        let err = TernError::Protocol("bad".into());
        assert_eq!(DisconnectReason::for_error(&err), DisconnectReason::ProtocolError);

        let err = TernError::Timeout("kex".into());
        assert_eq!(DisconnectReason::for_error(&err), DisconnectReason::ConnectionLost);

        let err = TernError::Disconnect {
            code: 99,
            message: "vendor".into(),
        };
        assert_eq!(DisconnectReason::for_error(&err), DisconnectReason::ProtocolError);
    }

    #[test]
    fn test_display() {
        assert_eq!(DisconnectReason::ByApplication.to_string(), "BY_APPLICATION");
    }
}
