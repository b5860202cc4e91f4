//! Services layered on the transport (RFC 4253 Section 10).
//!
//! The transport hands every message numbered 50 and above to exactly one
//! active [`Service`]. Switching the active service is done by the transport
//! itself, either after `SSH_MSG_SERVICE_ACCEPT` or when user authentication
//! succeeds and names the next service.

use crate::ssh::buffer::Buffer;
use crate::ssh::disconnect::DisconnectReason;
use crate::ssh::message::MessageType;
use tern_platform::{TernError, TernResult};

/// A protocol layer running on top of the transport.
///
/// Handlers run on the transport's reader task and must not block; replies
/// go through [`Transport::enqueue`](crate::ssh::transport::Transport::enqueue).
pub trait Service: Send + Sync {
    /// Service name, as used in `SSH_MSG_SERVICE_REQUEST`.
    fn name(&self) -> &str;

    /// Handles one message. `buf` is positioned after the message number.
    ///
    /// An error is fatal to the transport.
    fn handle(&self, msg: MessageType, buf: &mut Buffer) -> TernResult<()>;

    /// Called once when the transport dies, with the terminal error.
    fn notify_error(&self, err: &TernError);

    /// Called when the peer answers `SSH_MSG_UNIMPLEMENTED` for one of our
    /// packets. Fatal unless overridden.
    fn notify_unimplemented(&self, seq: u32) -> TernResult<()> {
        Err(DisconnectReason::ProtocolError.error(format!(
            "Peer did not implement packet #{} sent by {}",
            seq,
            self.name()
        )))
    }
}

impl std::fmt::Debug for dyn Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Service({})", self.name())
    }
}
