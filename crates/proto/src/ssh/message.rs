//! SSH message numbers (RFC 4250 Section 4.1).
//!
//! Message numbers are grouped in ranges that decide who handles them:
//!
//! - **1-19**: transport generic (disconnect, ignore, debug, service request)
//! - **20-29**: algorithm negotiation
//! - **30-49**: key exchange method specific
//! - **50-79**: user authentication
//! - **80-127**: connection protocol
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::message::MessageType;
//!
//! let msg = MessageType::from_u8(94).unwrap();
//! assert_eq!(msg, MessageType::ChannelData);
//! assert!(msg.is_channel_scoped());
//! ```

macro_rules! message_types {
    ($($(#[$doc:meta])* $variant:ident = $value:literal => $name:literal,)+) => {
        /// SSH message numbers understood by this implementation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $($(#[$doc])* $variant = $value,)+
        }

        impl MessageType {
            /// Converts a wire byte into a known message type.
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(MessageType::$variant),)+
                    _ => None,
                }
            }

            /// Returns the RFC name of the message, e.g. `SSH_MSG_KEXINIT`.
            pub fn name(&self) -> &'static str {
                match self {
                    $(MessageType::$variant => $name,)+
                }
            }
        }
    };
}

message_types! {
    /// Terminates the connection.
    Disconnect = 1 => "SSH_MSG_DISCONNECT",
    /// Padding or keepalive traffic.
    Ignore = 2 => "SSH_MSG_IGNORE",
    /// Reply to a message number the peer does not know.
    Unimplemented = 3 => "SSH_MSG_UNIMPLEMENTED",
    /// Debugging text.
    Debug = 4 => "SSH_MSG_DEBUG",
    /// Requests a service such as `ssh-userauth`.
    ServiceRequest = 5 => "SSH_MSG_SERVICE_REQUEST",
    /// Grants a requested service.
    ServiceAccept = 6 => "SSH_MSG_SERVICE_ACCEPT",
    /// Algorithm negotiation.
    KexInit = 20 => "SSH_MSG_KEXINIT",
    /// Switches the sender's direction to the new keys.
    NewKeys = 21 => "SSH_MSG_NEWKEYS",
    /// Client ephemeral public value (DH and ECDH share the number).
    KexdhInit = 30 => "SSH_MSG_KEXDH_INIT",
    /// Server ephemeral public value, host key and signature.
    KexdhReply = 31 => "SSH_MSG_KEXDH_REPLY",
    /// Authentication request.
    UserauthRequest = 50 => "SSH_MSG_USERAUTH_REQUEST",
    /// Authentication failure with the methods that can continue.
    UserauthFailure = 51 => "SSH_MSG_USERAUTH_FAILURE",
    /// Authentication success.
    UserauthSuccess = 52 => "SSH_MSG_USERAUTH_SUCCESS",
    /// Banner to show before authentication.
    UserauthBanner = 53 => "SSH_MSG_USERAUTH_BANNER",
    /// Method specific: PK_OK, INFO_REQUEST or PASSWD_CHANGEREQ.
    Userauth60 = 60 => "SSH_MSG_USERAUTH_60",
    /// Keyboard-interactive responses.
    UserauthInfoResponse = 61 => "SSH_MSG_USERAUTH_INFO_RESPONSE",
    /// Connection-wide request.
    GlobalRequest = 80 => "SSH_MSG_GLOBAL_REQUEST",
    /// Global request succeeded.
    RequestSuccess = 81 => "SSH_MSG_REQUEST_SUCCESS",
    /// Global request failed.
    RequestFailure = 82 => "SSH_MSG_REQUEST_FAILURE",
    /// Opens a channel.
    ChannelOpen = 90 => "SSH_MSG_CHANNEL_OPEN",
    /// Channel open accepted.
    ChannelOpenConfirmation = 91 => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
    /// Channel open refused.
    ChannelOpenFailure = 92 => "SSH_MSG_CHANNEL_OPEN_FAILURE",
    /// Grants more window credit.
    ChannelWindowAdjust = 93 => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
    /// Channel payload.
    ChannelData = 94 => "SSH_MSG_CHANNEL_DATA",
    /// Typed channel payload (stderr).
    ChannelExtendedData = 95 => "SSH_MSG_CHANNEL_EXTENDED_DATA",
    /// Sender will send no more data.
    ChannelEof = 96 => "SSH_MSG_CHANNEL_EOF",
    /// Channel teardown.
    ChannelClose = 97 => "SSH_MSG_CHANNEL_CLOSE",
    /// Channel specific request.
    ChannelRequest = 98 => "SSH_MSG_CHANNEL_REQUEST",
    /// Channel request succeeded.
    ChannelSuccess = 99 => "SSH_MSG_CHANNEL_SUCCESS",
    /// Channel request failed.
    ChannelFailure = 100 => "SSH_MSG_CHANNEL_FAILURE",
}

impl MessageType {
    /// Returns the wire byte.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Returns `true` if the message number lies in `low..=high`.
    pub fn in_range(self, low: u8, high: u8) -> bool {
        (low..=high).contains(&self.code())
    }

    /// Key exchange traffic (20-49).
    pub fn is_kex(self) -> bool {
        is_kex_code(self.code())
    }

    /// User authentication traffic (50-79).
    pub fn is_userauth(self) -> bool {
        self.in_range(50, 79)
    }

    /// Connection protocol traffic (80-127).
    pub fn is_connection(self) -> bool {
        self.in_range(80, 127)
    }

    /// Messages routed to a channel by recipient id.
    pub fn is_channel_scoped(self) -> bool {
        self.in_range(91, 100)
    }
}

/// Key exchange message numbers, including method specific ones this
/// implementation has no variant for.
pub fn is_kex_code(code: u8) -> bool {
    (20..=49).contains(&code)
}

/// Messages that may be sent while a key exchange is running: transport
/// generic messages other than service requests, and key exchange messages.
pub fn allowed_during_kex(code: u8) -> bool {
    matches!(code, 1..=4) || is_kex_code(code)
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(61), Some(MessageType::UserauthInfoResponse));
        assert_eq!(MessageType::from_u8(255), None);
        assert_eq!(MessageType::from_u8(0), None);
    }

    #[test]
    fn test_message_ranges() {
        assert!(MessageType::KexdhReply.is_kex());
        assert!(MessageType::Userauth60.is_userauth());
        assert!(MessageType::GlobalRequest.is_connection());
        assert!(!MessageType::GlobalRequest.is_channel_scoped());
        assert!(!MessageType::ChannelOpen.is_channel_scoped());
        assert!(MessageType::ChannelWindowAdjust.is_channel_scoped());
        assert!(MessageType::ChannelFailure.is_channel_scoped());
    }

    #[test]
    fn test_allowed_during_kex() {
        assert!(allowed_during_kex(MessageType::Disconnect.code()));
        assert!(allowed_during_kex(MessageType::NewKeys.code()));
        assert!(allowed_during_kex(32));
        assert!(!allowed_during_kex(MessageType::ServiceRequest.code()));
        assert!(!allowed_during_kex(MessageType::ChannelData.code()));
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
        assert_eq!(MessageType::ChannelEof.name(), "SSH_MSG_CHANNEL_EOF");
    }
}
