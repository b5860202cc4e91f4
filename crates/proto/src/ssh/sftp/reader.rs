//! Response dispatch for the SFTP request/response engine.
//!
//! A background task reads packets off the channel and resolves the pending
//! request with the matching id. A late response for a request whose caller
//! gave up is dropped. A response for an id that was never issued means the
//! two sides disagree about the stream, so it ends the reader. When the reader
//! ends for any reason every pending and future request fails with the same
//! error.

use super::message::SftpMessage;
use crate::ssh::transport::lock;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tern_platform::{TernError, TernResult};
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

type Reply = oneshot::Sender<TernResult<SftpMessage>>;

#[derive(Default)]
struct Slots {
    waiting: HashMap<u32, Reply>,
    abandoned: HashSet<u32>,
    error: Option<TernError>,
}

/// Requests awaiting a response, keyed by request id.
#[derive(Default)]
pub struct PendingRequests {
    slots: Mutex<Slots>,
}

impl PendingRequests {
    /// Creates an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `id` before its request is sent. Fails once the reader
    /// has stopped.
    pub fn register(&self, id: u32) -> TernResult<oneshot::Receiver<TernResult<SftpMessage>>> {
        let mut slots = lock(&self.slots);
        if let Some(err) = &slots.error {
            return Err(err.clone());
        }
        if slots.abandoned.contains(&id) {
            return Err(TernError::Protocol(format!("SFTP request id {} reused", id)));
        }
        match slots.waiting.entry(id) {
            Entry::Occupied(_) => Err(TernError::Protocol(format!("SFTP request id {} reused", id))),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Drops the slot for `id` after a failed send or an expired wait.
    ///
    /// The server may still answer `id`; that answer is discarded.
    pub fn cancel(&self, id: u32) {
        let mut slots = lock(&self.slots);
        if slots.waiting.remove(&id).is_some() {
            slots.abandoned.insert(id);
        }
    }

    /// Number of requests still waiting.
    pub fn len(&self) -> usize {
        lock(&self.slots).waiting.len()
    }

    /// Whether no request is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves `id` with `msg`.
    fn resolve(&self, id: u32, msg: SftpMessage) -> TernResult<()> {
        let reply = {
            let mut slots = lock(&self.slots);
            match slots.waiting.remove(&id) {
                Some(reply) => reply,
                None if slots.abandoned.remove(&id) => {
                    debug!(request_id = id, "Dropping late SFTP response");
                    return Ok(());
                }
                None => {
                    return Err(TernError::Protocol(format!(
                        "SFTP response for unknown request id {}",
                        id
                    )))
                }
            }
        };
        // the caller may have stopped waiting; that is not a desync
        let _ = reply.send(Ok(msg));
        Ok(())
    }

    /// Fails every waiting request and all later registrations with `err`.
    pub fn fail_all(&self, err: TernError) {
        let waiting = {
            let mut slots = lock(&self.slots);
            if slots.error.is_none() {
                slots.error = Some(err.clone());
            }
            std::mem::take(&mut slots.waiting)
        };
        if !waiting.is_empty() {
            debug!(pending = waiting.len(), error = %err, "Failing pending SFTP requests");
        }
        for (_, reply) in waiting {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

/// Background task feeding responses into [`PendingRequests`].
pub struct PacketReader {
    handle: JoinHandle<()>,
}

impl PacketReader {
    /// Spawns the reader over `input`.
    pub fn spawn<R>(input: R, pending: Arc<PendingRequests>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let err = Self::run(input, &pending).await;
            match &err {
                TernError::Closed(_) => debug!("SFTP channel closed"),
                other => warn!(error = %other, "SFTP reader stopped"),
            }
            pending.fail_all(err);
        });
        Self { handle }
    }

    async fn run<R: AsyncRead + Unpin>(mut input: R, pending: &PendingRequests) -> TernError {
        loop {
            let mut msg = match SftpMessage::read_from(&mut input).await {
                Ok(msg) => msg,
                Err(TernError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return TernError::Closed("SFTP channel closed".to_string())
                }
                Err(err) => return err,
            };

            if !msg.msg_type.is_response() {
                return TernError::Protocol(format!(
                    "Unexpected SFTP message {:?} from server",
                    msg.msg_type
                ));
            }
            let id = match msg.payload.read_u32() {
                Ok(id) => id,
                Err(err) => return err,
            };
            trace!(request_id = id, kind = ?msg.msg_type, "SFTP response");
            if let Err(err) = pending.resolve(id, msg) {
                return err;
            }
        }
    }

    /// Whether the reader has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the reader.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for PacketReader {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::buffer::Buffer;
    use crate::ssh::sftp::message::{finish, SftpMessageType};
    use tokio::io::AsyncWriteExt;

    fn status(id: u32, code: u32) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u32(0)
            .put_u8(SftpMessageType::Status as u8)
            .put_u32(id)
            .put_u32(code)
            .put_str("")
            .put_str("");
        finish(buf)
    }

    #[tokio::test]
    async fn test_responses_resolve_by_id() {
        let (mut server, client) = tokio::io::duplex(1024);
        let pending = PendingRequests::new();
        let one = pending.register(1).unwrap();
        let two = pending.register(2).unwrap();
        let _reader = PacketReader::spawn(client, pending.clone());

        server.write_all(&status(2, 4)).await.unwrap();
        server.write_all(&status(1, 0)).await.unwrap();

        let mut first = one.await.unwrap().unwrap();
        assert_eq!(first.msg_type, SftpMessageType::Status);
        assert_eq!(first.payload.read_u32().unwrap(), 0);
        let mut second = two.await.unwrap().unwrap();
        assert_eq!(second.payload.read_u32().unwrap(), 4);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_fails_everything() {
        let (mut server, client) = tokio::io::duplex(1024);
        let pending = PendingRequests::new();
        let waiting = pending.register(1).unwrap();
        let reader = PacketReader::spawn(client, pending.clone());

        server.write_all(&status(9, 0)).await.unwrap();

        assert!(matches!(waiting.await.unwrap(), Err(TernError::Protocol(_))));
        assert!(matches!(pending.register(2), Err(TernError::Protocol(_))));
        tokio::task::yield_now().await;
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn test_stream_end_fails_pending() {
        let (server, client) = tokio::io::duplex(1024);
        let pending = PendingRequests::new();
        let waiting = pending.register(1).unwrap();
        let _reader = PacketReader::spawn(client, pending.clone());

        drop(server);
        assert!(matches!(waiting.await.unwrap(), Err(TernError::Closed(_))));
    }

    #[test]
    fn test_cancel_removes_slot() {
        let pending = PendingRequests::new();
        let _rx = pending.register(5).unwrap();
        assert!(pending.register(5).is_err());
        pending.cancel(5);
        assert!(pending.is_empty());
        // still owed a reply, so not reusable yet
        assert!(pending.register(5).is_err());
    }

    #[tokio::test]
    async fn test_late_response_for_cancelled_request_is_dropped() {
        let (mut server, client) = tokio::io::duplex(1024);
        let pending = PendingRequests::new();
        let gave_up = pending.register(1).unwrap();
        let waiting = pending.register(2).unwrap();
        pending.cancel(1);
        drop(gave_up);
        let reader = PacketReader::spawn(client, pending.clone());

        server.write_all(&status(1, 0)).await.unwrap();
        server.write_all(&status(2, 0)).await.unwrap();

        assert!(waiting.await.unwrap().is_ok());
        assert!(!reader.is_finished());

        // a second answer for the same id is a desync
        let next = pending.register(3).unwrap();
        server.write_all(&status(1, 0)).await.unwrap();
        assert!(matches!(next.await.unwrap(), Err(TernError::Protocol(_))));
    }
}
