//! SSH connection protocol (RFC 4254).
//!
//! [`Connection`] is the `ssh-connection` service. It owns the registry of
//! live channels and routes every channel-scoped message purely by recipient
//! id; an id with no channel is a protocol error.
//!
//! # Global requests
//!
//! Replies to global requests carry no id. The protocol guarantees they come
//! back in request order, so pending requests wait in a FIFO. Pushing onto
//! the FIFO and writing the request happen under one lock so the FIFO order
//! always matches the wire order.
//!
//! # Incoming channels
//!
//! Channel opens from the peer are matched by type against registered
//! [`ChannelOpener`]s. Unknown types are refused with
//! `SSH_OPEN_UNKNOWN_CHANNEL_TYPE`.

use crate::ssh::buffer::Buffer;
use crate::ssh::channel::{Channel, ChannelParams, ChannelShared, ChannelType, OpenFailureReason};
use crate::ssh::disconnect::DisconnectReason;
use crate::ssh::message::MessageType;
use crate::ssh::service::Service;
use crate::ssh::transport::{lock, Transport};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tern_platform::{TernError, TernResult};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Service name.
pub const SERVICE_NAME: &str = "ssh-connection";

enum Slot {
    Opening {
        kind: String,
        reply: oneshot::Sender<TernResult<Channel>>,
    },
    /// Open request whose caller timed out; the peer's late answer is
    /// still expected and must not be treated as a desync.
    Abandoned {
        kind: String,
    },
    Open(Arc<ChannelShared>),
}

/// Registry of channels keyed by local id.
#[derive(Default)]
pub(crate) struct ChannelTable {
    slots: Mutex<HashMap<u32, Slot>>,
}

impl ChannelTable {
    pub(crate) fn remove(&self, id: u32) {
        if lock(&self.slots).remove(&id).is_some() {
            debug!(channel = id, "Channel removed");
        }
    }

    fn get(&self, id: u32) -> TernResult<Arc<ChannelShared>> {
        match lock(&self.slots).get(&id) {
            Some(Slot::Open(channel)) => Ok(channel.clone()),
            Some(Slot::Opening { .. } | Slot::Abandoned { .. }) => Err(
                DisconnectReason::ProtocolError.error(format!("Channel {} is not open yet", id)),
            ),
            None => Err(DisconnectReason::ProtocolError
                .error(format!("Received message for unknown channel {}", id))),
        }
    }

    fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| !matches!(slot, Slot::Abandoned { .. }))
            .count()
    }

    /// Releases the waiter of a timed out open, keeping only a marker
    /// for the peer's answer.
    fn abandon_opening(&self, id: u32) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(&id) {
            if let Slot::Opening { kind, .. } = slot {
                debug!(channel = id, kind = %kind, "Channel open abandoned");
                let kind = std::mem::take(kind);
                *slot = Slot::Abandoned { kind };
            }
        }
    }
}

/// A channel open received from the peer.
#[derive(Debug, Clone)]
pub struct IncomingOpen {
    /// Channel type
    pub kind: String,
    /// Peer's channel id
    pub sender: u32,
    /// Peer's initial window
    pub window: u32,
    /// Peer's maximum packet size
    pub max_packet: u32,
    /// Type specific data
    pub data: Vec<u8>,
}

/// Refusal of an incoming channel open.
#[derive(Debug, Clone)]
pub struct OpenRejection {
    /// Reason sent to the peer
    pub reason: OpenFailureReason,
    /// Description sent to the peer
    pub message: String,
}

impl OpenRejection {
    /// Creates a rejection.
    pub fn new(reason: OpenFailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Receives an accepted incoming channel.
pub type OpenedHandler = Box<dyn FnOnce(Channel) + Send>;

/// Accepts or refuses incoming channels of one type.
pub trait ChannelOpener: Send + Sync {
    /// Channel type handled, e.g. "forwarded-tcpip".
    fn channel_type(&self) -> &str;

    /// Decides on `open`. Runs on the transport reader task, so it must not
    /// block; the returned handler receives the channel once confirmed.
    fn handle_open(&self, open: &IncomingOpen) -> Result<OpenedHandler, OpenRejection>;
}

struct Inner {
    transport: Transport,
    table: Arc<ChannelTable>,
    next_id: AtomicU32,
    global_replies: Mutex<VecDeque<oneshot::Sender<TernResult<Vec<u8>>>>>,
    global_order: AsyncMutex<()>,
    openers: Mutex<HashMap<String, Arc<dyn ChannelOpener>>>,
}

/// The `ssh-connection` service: channel multiplexer and global requests.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates the service. It becomes active once authentication succeeds.
    pub fn new(transport: Transport) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                table: Arc::new(ChannelTable::default()),
                next_id: AtomicU32::new(0),
                global_replies: Mutex::new(VecDeque::new()),
                global_order: AsyncMutex::new(()),
                openers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Number of registered channels, including ones still opening.
    pub fn channel_count(&self) -> usize {
        self.inner.table.len()
    }

    fn next_id(&self) -> u32 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Opens a channel of type `kind` and waits for the peer's answer.
    ///
    /// A refusal is returned as [`TernError::Rejected`] carrying the peer's
    /// reason code; the transport stays up.
    pub async fn open_channel(&self, kind: ChannelType) -> TernResult<Channel> {
        let transport = &self.inner.transport;
        transport.check_open()?;
        let config = transport.config();

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.table.slots).insert(
            id,
            Slot::Opening {
                kind: kind.name().to_string(),
                reply: tx,
            },
        );

        let mut buf = Buffer::for_message(MessageType::ChannelOpen);
        buf.put_str(kind.name())
            .put_u32(id)
            .put_u32(config.window_size)
            .put_u32(config.max_packet_size);
        kind.put_data(&mut buf);
        debug!(channel = id, kind = kind.name(), "Opening channel");

        if let Err(err) = transport.send(buf.as_slice()).await {
            self.inner.table.remove(id);
            return Err(err);
        }

        match timeout(config.timeout, rx).await {
            Err(_) => {
                self.inner.table.abandon_opening(id);
                Err(TernError::Timeout(format!(
                    "Opening {} channel {}",
                    kind.name(),
                    id
                )))
            }
            Ok(Err(_)) => Err(transport
                .error()
                .unwrap_or_else(|| TernError::Closed("Connection closed".to_string()))),
            Ok(Ok(result)) => result,
        }
    }

    /// Opens a session channel.
    pub async fn open_session(&self) -> TernResult<Channel> {
        self.open_channel(ChannelType::Session).await
    }

    /// Sends a global request.
    ///
    /// With `want_reply`, waits for the answer and returns the
    /// `REQUEST_SUCCESS` payload; `REQUEST_FAILURE` becomes
    /// [`TernError::Rejected`]. Without it, returns an empty payload once sent.
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> TernResult<Vec<u8>> {
        let transport = &self.inner.transport;
        let mut buf = Buffer::for_message(MessageType::GlobalRequest);
        buf.put_str(name).put_bool(want_reply).put_raw(data);
        debug!(request = name, want_reply, "Global request");

        if !want_reply {
            transport.send(buf.as_slice()).await?;
            return Ok(Vec::new());
        }

        let rx = {
            let _order = self.inner.global_order.lock().await;
            transport.check_open()?;
            let (tx, rx) = oneshot::channel();
            lock(&self.inner.global_replies).push_back(tx);
            if let Err(err) = transport.send(buf.as_slice()).await {
                // keep the FIFO aligned with what reached the wire
                lock(&self.inner.global_replies).pop_back();
                return Err(err);
            }
            rx
        };

        match timeout(transport.config().timeout, rx).await {
            Err(_) => Err(TernError::Timeout(format!("Global request {}", name))),
            Ok(Err(_)) => Err(transport
                .error()
                .unwrap_or_else(|| TernError::Closed("Connection closed".to_string()))),
            Ok(Ok(result)) => result,
        }
    }

    /// Registers `opener` for its channel type, replacing any previous one.
    pub fn attach(&self, opener: Arc<dyn ChannelOpener>) {
        let kind = opener.channel_type().to_string();
        debug!(kind = %kind, "Channel opener attached");
        lock(&self.inner.openers).insert(kind, opener);
    }

    /// Removes the opener for `kind`. Returns whether one was registered.
    pub fn detach(&self, kind: &str) -> bool {
        lock(&self.inner.openers).remove(kind).is_some()
    }

    fn on_global_reply(&self, success: bool, buf: &mut Buffer) -> TernResult<()> {
        let waiter = lock(&self.inner.global_replies).pop_front().ok_or_else(|| {
            DisconnectReason::ProtocolError.error("Global request reply with no request pending")
        })?;
        let result = if success {
            Ok(buf.remaining().to_vec())
        } else {
            Err(TernError::Rejected {
                code: 0,
                message: "Global request refused".to_string(),
            })
        };
        if waiter.send(result).is_err() {
            trace!("Global request waiter gave up");
        }
        Ok(())
    }

    fn on_global_request(&self, buf: &mut Buffer) -> TernResult<()> {
        let name = buf.read_string()?;
        let want_reply = buf.read_bool()?;
        debug!(request = %name, "Refusing global request");
        if want_reply {
            self.inner
                .transport
                .enqueue(vec![MessageType::RequestFailure.code()]);
        }
        Ok(())
    }

    fn on_open_confirmation(&self, buf: &mut Buffer) -> TernResult<()> {
        let id = buf.read_u32()?;
        let recipient = buf.read_u32()?;
        let window = buf.read_u32()?;
        let max_packet = buf.read_u32()?;

        let mut slots = lock(&self.inner.table.slots);
        let kind = match slots.get(&id) {
            Some(Slot::Opening { kind, .. } | Slot::Abandoned { kind }) => kind.clone(),
            Some(Slot::Open(_)) => {
                return Err(DisconnectReason::ProtocolError
                    .error(format!("Duplicate open confirmation for channel {}", id)))
            }
            None => {
                return Err(DisconnectReason::ProtocolError
                    .error(format!("Open confirmation for unknown channel {}", id)))
            }
        };

        let config = self.inner.transport.config();
        let params = ChannelParams {
            id,
            recipient,
            local_window: config.window_size,
            local_max_packet: config.max_packet_size,
            remote_window: window,
            remote_max_packet: max_packet,
        };
        let (shared, channel) = ChannelShared::open(
            params,
            &kind,
            self.inner.transport.clone(),
            Arc::downgrade(&self.inner.table),
        );
        // registered before anyone is told, so data right behind the
        // confirmation finds the channel
        let previous = slots.insert(id, Slot::Open(shared.clone()));
        drop(slots);

        match previous {
            Some(Slot::Opening { reply, .. }) => {
                if reply.send(Ok(channel)).is_err() {
                    debug!(channel = id, "Closing channel nobody waits for");
                    shared.abandon();
                }
            }
            _ => {
                debug!(channel = id, "Closing late confirmed channel");
                drop(channel);
                shared.abandon();
            }
        }
        Ok(())
    }

    fn on_open_failure(&self, buf: &mut Buffer) -> TernResult<()> {
        let id = buf.read_u32()?;
        let code = buf.read_u32()?;
        let description = buf.read_string()?;

        let slot = lock(&self.inner.table.slots).remove(&id);
        match slot {
            Some(Slot::Opening { kind, reply }) => {
                info!(channel = id, kind = %kind, code, "Channel open refused");
                let reason = OpenFailureReason::from_u32(code)
                    .map(|r| r.as_str().to_string())
                    .unwrap_or_else(|| format!("reason {}", code));
                let _ = reply.send(Err(TernError::Rejected {
                    code,
                    message: format!("Opening {} channel failed: {} ({})", kind, reason, description),
                }));
                Ok(())
            }
            Some(Slot::Abandoned { kind }) => {
                debug!(channel = id, kind = %kind, code, "Late open failure dropped");
                Ok(())
            }
            Some(open @ Slot::Open(_)) => {
                lock(&self.inner.table.slots).insert(id, open);
                Err(DisconnectReason::ProtocolError
                    .error(format!("Open failure for already open channel {}", id)))
            }
            None => Err(DisconnectReason::ProtocolError
                .error(format!("Open failure for unknown channel {}", id))),
        }
    }

    fn on_channel_open(&self, buf: &mut Buffer) -> TernResult<()> {
        let open = IncomingOpen {
            kind: buf.read_string()?,
            sender: buf.read_u32()?,
            window: buf.read_u32()?,
            max_packet: buf.read_u32()?,
            data: buf.remaining().to_vec(),
        };
        debug!(kind = %open.kind, sender = open.sender, "Peer opens channel");

        let opener = lock(&self.inner.openers).get(&open.kind).cloned();
        let decision = match opener {
            Some(opener) => opener.handle_open(&open),
            None => Err(OpenRejection::new(
                OpenFailureReason::UnknownChannelType,
                format!("Unknown channel type: {}", open.kind),
            )),
        };

        let transport = &self.inner.transport;
        match decision {
            Err(rejection) => {
                warn!(kind = %open.kind, reason = %rejection.reason, "Refusing channel open");
                let mut reply = Buffer::for_message(MessageType::ChannelOpenFailure);
                reply
                    .put_u32(open.sender)
                    .put_u32(rejection.reason.code())
                    .put_str(&rejection.message)
                    .put_str("");
                transport.enqueue(reply.into_vec());
                Ok(())
            }
            Ok(handler) => {
                let config = transport.config();
                let params = ChannelParams {
                    id: self.next_id(),
                    recipient: open.sender,
                    local_window: config.window_size,
                    local_max_packet: config.max_packet_size,
                    remote_window: open.window,
                    remote_max_packet: open.max_packet,
                };
                let (shared, channel) = ChannelShared::open(
                    params,
                    &open.kind,
                    transport.clone(),
                    Arc::downgrade(&self.inner.table),
                );
                lock(&self.inner.table.slots).insert(params.id, Slot::Open(shared));

                let mut reply = Buffer::for_message(MessageType::ChannelOpenConfirmation);
                reply
                    .put_u32(open.sender)
                    .put_u32(params.id)
                    .put_u32(params.local_window)
                    .put_u32(params.local_max_packet);
                transport.enqueue(reply.into_vec());
                handler(channel);
                Ok(())
            }
        }
    }
}

impl Service for Connection {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn handle(&self, msg: MessageType, buf: &mut Buffer) -> TernResult<()> {
        match msg {
            MessageType::GlobalRequest => self.on_global_request(buf),
            MessageType::RequestSuccess => self.on_global_reply(true, buf),
            MessageType::RequestFailure => self.on_global_reply(false, buf),
            MessageType::ChannelOpen => self.on_channel_open(buf),
            MessageType::ChannelOpenConfirmation => self.on_open_confirmation(buf),
            MessageType::ChannelOpenFailure => self.on_open_failure(buf),
            _ if msg.is_channel_scoped() => {
                let channel = self.inner.table.get(buf.read_u32()?)?;
                match msg {
                    MessageType::ChannelWindowAdjust => channel.on_window_adjust(buf.read_u32()?),
                    MessageType::ChannelData => channel.on_data(buf.read_bytes()?),
                    MessageType::ChannelExtendedData => {
                        let code = buf.read_u32()?;
                        channel.on_extended_data(code, buf.read_bytes()?)
                    }
                    MessageType::ChannelEof => {
                        channel.on_eof();
                        Ok(())
                    }
                    MessageType::ChannelClose => {
                        channel.on_close();
                        Ok(())
                    }
                    MessageType::ChannelRequest => {
                        let name = buf.read_string()?;
                        let want_reply = buf.read_bool()?;
                        channel.on_request(&name, want_reply, buf)
                    }
                    MessageType::ChannelSuccess => channel.on_request_reply(true),
                    MessageType::ChannelFailure => channel.on_request_reply(false),
                    _ => Err(DisconnectReason::ProtocolError
                        .error(format!("Unexpected {} for channel {}", msg, channel.id()))),
                }
            }
            _ => Err(DisconnectReason::ProtocolError
                .error(format!("Unexpected {} in {}", msg, SERVICE_NAME))),
        }
    }

    fn notify_error(&self, err: &TernError) {
        let slots: Vec<Slot> = lock(&self.inner.table.slots)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            match slot {
                Slot::Opening { reply, .. } => {
                    let _ = reply.send(Err(err.clone()));
                }
                Slot::Open(channel) => channel.fail(err),
                Slot::Abandoned { .. } => {}
            }
        }

        let waiters: Vec<_> = lock(&self.inner.global_replies).drain(..).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
        debug!(error = %err, "Connection service notified");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("channels", &self.channel_count())
            .finish_non_exhaustive()
    }
}
