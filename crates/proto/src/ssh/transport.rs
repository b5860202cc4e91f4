//! SSH transport layer (RFC 4253).
//!
//! [`Transport`] owns one byte stream and runs it as:
//!
//! - a **reader task** that decodes packets, drives key exchange and
//!   dispatches everything numbered 50 and above to the active [`Service`]
//! - a **serialized write path** ([`Transport::send`]) shared by every caller
//! - an **outbox pump** that sends replies queued by the reader
//!   ([`Transport::enqueue`]), so the reader never waits behind the key
//!   exchange write gate
//!
//! # Key exchange and re-keying
//!
//! While a key exchange runs, only transport and key exchange messages may be
//! written; other writers wait (bounded by the configured timeout). Each
//! direction switches keys independently: outgoing keys right after our
//! NEWKEYS is written, incoming keys right after the server's NEWKEYS is
//! decoded. A re-key starts on [`Transport::rekey`], when the peer sends
//! KEXINIT, or when the configured byte or time limit is reached.
//!
//! # Failure
//!
//! The first fatal error wins. It is sent to the peer as a DISCONNECT when
//! that makes sense, stored for every later call, and handed to every
//! service so no waiter is left hanging.

use crate::ssh::buffer::Buffer;
use crate::ssh::config::SshConfig;
use crate::ssh::crypto::{Cipher, Mac};
use crate::ssh::disconnect::DisconnectReason;
use crate::ssh::hostkey::{HostKeyVerifier, PublicKey};
use crate::ssh::kex::{KexInit, Negotiated, NewKeys};
use crate::ssh::kex_dh::{derive_keys, KexContext, KexEngine};
use crate::ssh::message::{allowed_during_kex, MessageType};
use crate::ssh::packet::{Decoder, Encoder, Packet};
use crate::ssh::service::Service;
use crate::ssh::keepalive::{ignore_message, Heartbeat};
use crate::ssh::version::{self, Version, VersionExchange};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};

/// Upper bound on flushing a DISCONNECT while shutting down.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Observable link state, used to wake waiters.
#[derive(Debug, Clone, Copy, Default)]
struct LinkState {
    kex_pending: bool,
    kex_count: u64,
    dead: bool,
}

/// Outgoing half: stream, encoder and the key exchange write gate.
struct Writer {
    stream: BoxedWrite,
    encoder: Encoder,
    kex_pending: bool,
    bytes_since_kex: u64,
}

impl Writer {
    async fn write_payload(&mut self, payload: &[u8]) -> TernResult<()> {
        let packet = self.encoder.encode(payload)?;
        self.write_packet(&packet).await
    }

    async fn write_packet(&mut self, packet: &[u8]) -> TernResult<()> {
        self.stream.write_all(packet).await?;
        self.stream.flush().await?;
        self.bytes_since_kex += packet.len() as u64;
        Ok(())
    }
}

enum Command {
    Rekey,
}

#[derive(Default)]
struct Services {
    active: Option<Arc<dyn Service>>,
    known: Vec<Arc<dyn Service>>,
}

struct PendingService {
    service: Arc<dyn Service>,
    reply: oneshot::Sender<TernResult<()>>,
}

struct Shared {
    config: SshConfig,
    host: String,
    port: u16,
    versions: VersionExchange,
    verifier: Arc<dyn HostKeyVerifier>,
    writer: AsyncMutex<Writer>,
    state: watch::Sender<LinkState>,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    commands: mpsc::UnboundedSender<Command>,
    error: Mutex<Option<TernError>>,
    services: Mutex<Services>,
    pending_service: Mutex<Option<PendingService>>,
    session_id: OnceLock<Vec<u8>>,
    host_key: Mutex<Option<PublicKey>>,
    authenticated: AtomicBool,
    keepalive: Mutex<Option<Heartbeat>>,
}

/// Handle to a running SSH transport. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Runs version exchange and the first key exchange over `stream`.
    ///
    /// `host` and `port` are only used for host key verification and logs.
    pub async fn connect<S>(
        stream: S,
        host: &str,
        port: u16,
        config: SshConfig,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> TernResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;

        let mut stream = stream;
        let local = Version::new(&config.software_version, None);
        let versions = timeout(config.timeout, version::exchange(&mut stream, &local))
            .await
            .map_err(|_| TernError::Timeout("Version exchange".to_string()))??;
        info!(host, port, server = %versions.server_line, "Connected");

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LinkState::default());

        let writer = Writer {
            stream: Box::new(write_half),
            encoder: Encoder::new(config.random.clone()),
            kex_pending: false,
            bytes_since_kex: 0,
        };

        let transport = Transport {
            shared: Arc::new(Shared {
                host: host.to_string(),
                port,
                versions,
                verifier,
                writer: AsyncMutex::new(writer),
                state,
                outbox: outbox_tx,
                commands: command_tx,
                error: Mutex::new(None),
                services: Mutex::new(Services::default()),
                pending_service: Mutex::new(None),
                session_id: OnceLock::new(),
                host_key: Mutex::new(None),
                authenticated: AtomicBool::new(false),
                keepalive: Mutex::new(None),
                config,
            }),
        };

        let reader = Reader {
            transport: transport.clone(),
            stream: Box::new(read_half),
            decoder: Decoder::new(),
            commands: command_rx,
            kex: None,
            last_kex: Instant::now(),
            bytes_since_kex: 0,
        };
        tokio::spawn(reader.run());
        tokio::spawn(pump(transport.clone(), outbox_rx));

        if let Err(err) = transport.wait_for_kex(0).await {
            transport.die(err.clone(), true).await;
            return Err(err);
        }

        if let Some(period) = transport.shared.config.keepalive_interval {
            let beating = transport.clone();
            let heartbeat = Heartbeat::spawn(period, move || {
                let transport = beating.clone();
                async move {
                    let msg = ignore_message(transport.config().random.as_ref(), 16);
                    transport.send(&msg).await
                }
            });
            *lock(&transport.shared.keepalive) = Some(heartbeat);
        }

        Ok(transport)
    }

    /// Client configuration.
    pub fn config(&self) -> &SshConfig {
        &self.shared.config
    }

    /// Parsed server identification.
    pub fn server_version(&self) -> &Version {
        &self.shared.versions.server
    }

    /// Lines the server sent before its identification.
    pub fn server_banner(&self) -> &[String] {
        &self.shared.versions.banner
    }

    /// Session identifier (exchange hash of the first key exchange).
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.shared.session_id.get().cloned()
    }

    /// Server host key from the latest key exchange.
    pub fn host_key(&self) -> Option<PublicKey> {
        lock(&self.shared.host_key).clone()
    }

    /// Number of completed key exchanges.
    pub fn kex_count(&self) -> u64 {
        self.shared.state.borrow().kex_count
    }

    /// `true` until the transport fails or is disconnected.
    pub fn is_open(&self) -> bool {
        lock(&self.shared.error).is_none()
    }

    /// Terminal error, if the transport is closed.
    pub fn error(&self) -> Option<TernError> {
        lock(&self.shared.error).clone()
    }

    /// Fails with the terminal error if the transport is closed.
    pub fn check_open(&self) -> TernResult<()> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Waits until the transport closes and returns the terminal error.
    pub async fn closed(&self) -> TernError {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| s.dead).await;
        self.error()
            .unwrap_or_else(|| TernError::Closed("Transport closed".to_string()))
    }

    /// Marks the user as authenticated.
    pub fn set_authenticated(&self) {
        self.shared.authenticated.store(true, Ordering::SeqCst);
    }

    /// Whether user authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    /// Sends one payload, waiting for a running key exchange to finish if the
    /// message is not allowed during key exchange.
    ///
    /// Concurrent callers are serialized; packets never interleave.
    pub async fn send(&self, payload: &[u8]) -> TernResult<()> {
        let code = *payload
            .first()
            .ok_or_else(|| TernError::Protocol("Empty payload".to_string()))?;
        let gated = !allowed_during_kex(code);

        loop {
            self.check_open()?;
            if gated {
                self.wait_kex_idle().await?;
            }

            let mut writer = self.shared.writer.lock().await;
            if gated && writer.kex_pending {
                continue;
            }
            self.check_open()?;

            let packet = writer.encoder.encode(payload)?;
            let result = writer.write_packet(&packet).await;
            let rekey_due = !writer.kex_pending
                && writer.bytes_since_kex >= self.shared.config.rekey_bytes_limit;
            drop(writer);

            return match result {
                Ok(()) => {
                    if rekey_due {
                        let _ = self.shared.commands.send(Command::Rekey);
                    }
                    Ok(())
                }
                Err(err) => {
                    self.die(err.clone(), false).await;
                    Err(err)
                }
            };
        }
    }

    /// Queues a payload for sending without waiting.
    ///
    /// Used by service handlers running on the reader task.
    pub fn enqueue(&self, payload: Vec<u8>) {
        if self.shared.outbox.send(payload).is_err() {
            debug!("Outbox closed, dropping payload");
        }
    }

    /// Requests `service` with `SSH_MSG_SERVICE_REQUEST` and makes it active
    /// once the server accepts.
    pub async fn request_service(&self, service: Arc<dyn Service>) -> TernResult<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.shared.pending_service);
            if pending.is_some() {
                return Err(TernError::Protocol(
                    "A service request is already pending".to_string(),
                ));
            }
            *pending = Some(PendingService {
                service: service.clone(),
                reply: tx,
            });
        }
        if let Err(err) = self.check_open() {
            lock(&self.shared.pending_service).take();
            return Err(err);
        }

        debug!(service = service.name(), "Requesting service");
        let mut buf = Buffer::for_message(MessageType::ServiceRequest);
        buf.put_str(service.name());
        self.send(buf.as_slice()).await?;

        match timeout(self.shared.config.timeout, rx).await {
            Err(_) => {
                lock(&self.shared.pending_service).take();
                Err(TernError::Timeout(format!(
                    "Service request for {}",
                    service.name()
                )))
            }
            Ok(Err(_)) => Err(self.closed_error()),
            Ok(Ok(result)) => result,
        }
    }

    /// Makes `service` the recipient of all non-transport messages.
    pub fn set_service(&self, service: Arc<dyn Service>) {
        let mut services = lock(&self.shared.services);
        if let Some(err) = self.error() {
            drop(services);
            service.notify_error(&err);
            return;
        }
        if !services.known.iter().any(|s| Arc::ptr_eq(s, &service)) {
            services.known.push(service.clone());
        }
        info!(service = service.name(), "Service active");
        services.active = Some(service);
    }

    /// Name of the active service.
    pub fn active_service_name(&self) -> Option<String> {
        lock(&self.shared.services)
            .active
            .as_ref()
            .map(|s| s.name().to_string())
    }

    fn active_service(&self) -> Option<Arc<dyn Service>> {
        lock(&self.shared.services).active.clone()
    }

    /// Runs a new key exchange and waits for it to complete.
    pub async fn rekey(&self) -> TernResult<()> {
        self.check_open()?;
        let before = self.kex_count();
        self.shared
            .commands
            .send(Command::Rekey)
            .map_err(|_| self.closed_error())?;
        self.wait_for_kex(before).await
    }

    /// Sends DISCONNECT with `reason` and closes the transport.
    ///
    /// Closing an already closed transport is a no-op.
    pub async fn disconnect(&self, reason: DisconnectReason, message: &str) -> TernResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        info!(%reason, message, "Disconnecting");
        self.die(reason.error(message), true).await;
        Ok(())
    }

    fn closed_error(&self) -> TernError {
        self.error()
            .unwrap_or_else(|| TernError::Closed("Transport closed".to_string()))
    }

    async fn wait_kex_idle(&self) -> TernResult<()> {
        let mut state = self.shared.state.subscribe();
        let waited = timeout(
            self.shared.config.timeout,
            async { state.wait_for(|s| !s.kex_pending || s.dead).await.map(|_| ()) },
        )
        .await;
        match waited {
            Err(_) => Err(TernError::Timeout(
                "Waiting for key exchange to finish".to_string(),
            )),
            Ok(_) => self.check_open(),
        }
    }

    async fn wait_for_kex(&self, after: u64) -> TernResult<()> {
        let mut state = self.shared.state.subscribe();
        let waited = timeout(
            self.shared.config.timeout,
            async { state.wait_for(|s| s.kex_count > after || s.dead).await.map(|_| ()) },
        )
        .await;
        match waited {
            Err(_) => Err(TernError::Timeout("Key exchange".to_string())),
            Ok(_) => self.check_open(),
        }
    }

    /// Writes a key exchange message, bypassing the write gate.
    async fn send_kex(&self, payload: &[u8]) -> TernResult<()> {
        self.shared.writer.lock().await.write_payload(payload).await
    }

    /// Records the terminal error and tears everything down. Only the first
    /// call has any effect.
    pub(crate) async fn die(&self, err: TernError, notify_peer: bool) {
        {
            let mut slot = lock(&self.shared.error);
            if slot.is_some() {
                return;
            }
            *slot = Some(err.clone());
        }

        match &err {
            TernError::Disconnect { .. } => info!(error = %err, "Transport closed"),
            _ => warn!(error = %err, "Transport failed"),
        }

        self.shared.state.send_modify(|s| {
            s.dead = true;
            s.kex_pending = false;
        });

        if let Some(pending) = lock(&self.shared.pending_service).take() {
            let _ = pending.reply.send(Err(err.clone()));
        }

        let services = {
            let mut services = lock(&self.shared.services);
            services.active = None;
            std::mem::take(&mut services.known)
        };
        for service in services {
            service.notify_error(&err);
        }

        if let Some(heartbeat) = lock(&self.shared.keepalive).take() {
            heartbeat.stop();
        }

        let shutdown = async {
            let mut writer = self.shared.writer.lock().await;
            if notify_peer {
                let reason = DisconnectReason::for_error(&err);
                let payload = disconnect_payload(reason, &err.to_string());
                if let Ok(packet) = writer.encoder.encode(&payload) {
                    let _ = writer.write_packet(&packet).await;
                }
            }
            let _ = writer.stream.shutdown().await;
        };
        if timeout(DISCONNECT_GRACE, shutdown).await.is_err() {
            debug!("Timed out flushing DISCONNECT");
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("host", &self.shared.host)
            .field("port", &self.shared.port)
            .field("server", &self.shared.versions.server_line)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Builds `SSH_MSG_DISCONNECT`.
pub fn disconnect_payload(reason: DisconnectReason, description: &str) -> Vec<u8> {
    let mut buf = Buffer::for_message(MessageType::Disconnect);
    buf.put_u32(reason.code()).put_str(description).put_str("");
    buf.into_vec()
}

/// Builds `SSH_MSG_UNIMPLEMENTED` for the packet numbered `seq`.
pub fn unimplemented_payload(seq: u32) -> Vec<u8> {
    let mut buf = Buffer::for_message(MessageType::Unimplemented);
    buf.put_u32(seq);
    buf.into_vec()
}

/// Resolves once the link is marked dead or its sender is gone.
///
/// The borrow `wait_for` returns is released here, so the future stays `Send`.
async fn until_dead(state: &mut watch::Receiver<LinkState>) {
    let _ = state.wait_for(|s| s.dead).await;
}

/// Sends payloads queued with [`Transport::enqueue`].
async fn pump(transport: Transport, mut outbox: mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut state = transport.shared.state.subscribe();
    loop {
        tokio::select! {
            payload = outbox.recv() => {
                let Some(payload) = payload else { break };
                if let Err(err) = transport.send(&payload).await {
                    if !transport.is_open() {
                        break;
                    }
                    warn!(error = %err, "Failed to send queued payload");
                }
            }
            _ = until_dead(&mut state) => break,
        }
    }
    trace!("Outbox pump stopped");
}

/// One key exchange in progress.
struct KexRun {
    started: Instant,
    client_kexinit: Vec<u8>,
    server_kexinit: Option<Vec<u8>>,
    negotiated: Option<Negotiated>,
    engine: Option<KexEngine>,
    incoming: Option<(Box<dyn Cipher>, Option<Box<dyn Mac>>)>,
    ignore_guessed: bool,
}

/// Incoming half, owned by the reader task.
struct Reader {
    transport: Transport,
    stream: BoxedRead,
    decoder: Decoder,
    commands: mpsc::UnboundedReceiver<Command>,
    kex: Option<KexRun>,
    last_kex: Instant,
    bytes_since_kex: u64,
}

impl Reader {
    async fn run(mut self) {
        if let Err(err) = self.run_loop().await {
            let notify_peer = !matches!(err, TernError::Io(_) | TernError::Closed(_));
            self.transport.die(err, notify_peer).await;
        }
        debug!("Transport reader stopped");
    }

    async fn run_loop(&mut self) -> TernResult<()> {
        let mut state = self.transport.shared.state.subscribe();
        let timeout_limit = self.transport.shared.config.timeout;
        let rekey_interval = self.transport.shared.config.rekey_time_limit;
        let rekey_bytes = self.transport.shared.config.rekey_bytes_limit;

        self.begin_kex().await?;

        loop {
            let kex_deadline = self.kex.as_ref().map(|run| run.started + timeout_limit);
            let rekey_at = self.last_kex + rekey_interval;

            tokio::select! {
                read = self.stream.read_buf(self.decoder.input_mut()) => {
                    let n = read?;
                    if n == 0 {
                        return Err(TernError::Closed("Connection closed by peer".to_string()));
                    }
                    self.bytes_since_kex += n as u64;
                    while let Some(packet) = self.decoder.next_packet()? {
                        self.dispatch(packet).await?;
                        if !self.transport.is_open() {
                            return Ok(());
                        }
                    }
                    if self.kex.is_none() && self.bytes_since_kex >= rekey_bytes {
                        debug!(bytes = self.bytes_since_kex, "Inbound re-key limit reached");
                        self.begin_kex().await?;
                    }
                }
                Some(Command::Rekey) = self.commands.recv() => self.begin_kex().await?,
                _ = sleep_until(rekey_at), if kex_deadline.is_none() => {
                    debug!("Re-key interval elapsed");
                    self.begin_kex().await?;
                }
                _ = sleep_until(kex_deadline.unwrap_or(rekey_at)), if kex_deadline.is_some() => {
                    return Err(TernError::Timeout("Key exchange".to_string()));
                }
                _ = until_dead(&mut state) => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet) -> TernResult<()> {
        let Packet { seq, payload } = packet;
        let code = *payload
            .first()
            .ok_or_else(|| DisconnectReason::ProtocolError.error("Empty packet"))?;
        trace!(seq, code, "Received packet");

        if let Some(run) = &self.kex {
            if run.server_kexinit.is_some() && !allowed_during_kex(code) {
                return Err(DisconnectReason::ProtocolError.error(format!(
                    "Message {} received during key exchange",
                    code
                )));
            }
        }

        let mut buf = Buffer::from_vec(payload);
        buf.read_u8()?;

        match code {
            1 => {
                let reason = buf.read_u32()?;
                let description = buf.read_string().unwrap_or_default();
                let err = TernError::Disconnect {
                    code: reason,
                    message: description,
                };
                self.transport.die(err, false).await;
                Ok(())
            }
            2 => {
                trace!(seq, "Ignoring SSH_MSG_IGNORE");
                Ok(())
            }
            3 => {
                let rejected = buf.read_u32()?;
                match self.transport.active_service() {
                    Some(service) => service.notify_unimplemented(rejected),
                    None => Err(DisconnectReason::ProtocolError.error(format!(
                        "Peer did not implement packet #{}",
                        rejected
                    ))),
                }
            }
            4 => {
                let _always_display = buf.read_bool()?;
                let message = buf.read_string()?;
                debug!(message = %message, "Peer debug message");
                Ok(())
            }
            6 => self.service_accept(&mut buf),
            20 => self.on_kexinit(buf.into_vec()).await,
            21 => self.on_newkeys(),
            30..=49 => self.on_kex_message(code, buf.as_slice()).await,
            _ => match MessageType::from_u8(code) {
                Some(msg) if code >= 50 => match self.transport.active_service() {
                    Some(service) => service.handle(msg, &mut buf),
                    None => Err(DisconnectReason::ProtocolError
                        .error(format!("{} received with no active service", msg))),
                },
                _ => {
                    debug!(seq, code, "Answering unknown message with UNIMPLEMENTED");
                    self.transport.enqueue(unimplemented_payload(seq));
                    Ok(())
                }
            },
        }
    }

    fn service_accept(&mut self, buf: &mut Buffer) -> TernResult<()> {
        let name = buf.read_string()?;
        let pending = lock(&self.transport.shared.pending_service).take();
        match pending {
            Some(pending) if pending.service.name() == name => {
                self.transport.set_service(pending.service);
                let _ = pending.reply.send(Ok(()));
                Ok(())
            }
            Some(pending) => {
                let err = DisconnectReason::ProtocolError.error(format!(
                    "Requested service {} but server accepted {}",
                    pending.service.name(),
                    name
                ));
                let _ = pending.reply.send(Err(err.clone()));
                Err(err)
            }
            None => Err(DisconnectReason::ProtocolError
                .error(format!("Unexpected SERVICE_ACCEPT for {}", name))),
        }
    }

    async fn begin_kex(&mut self) -> TernResult<()> {
        if self.kex.is_some() {
            return Ok(());
        }

        let shared = &self.transport.shared;
        let kexinit = KexInit::from_config(&shared.config).to_bytes();
        {
            let mut writer = shared.writer.lock().await;
            writer.kex_pending = true;
            shared.state.send_modify(|s| s.kex_pending = true);
            writer.write_payload(&kexinit).await?;
        }
        info!(round = self.transport.kex_count() + 1, "Key exchange started");

        self.kex = Some(KexRun {
            started: Instant::now(),
            client_kexinit: kexinit,
            server_kexinit: None,
            negotiated: None,
            engine: None,
            incoming: None,
            ignore_guessed: false,
        });
        Ok(())
    }

    async fn on_kexinit(&mut self, payload: Vec<u8>) -> TernResult<()> {
        if self.kex.is_none() {
            debug!("Server initiated key exchange");
            self.begin_kex().await?;
        }
        let transport = self.transport.clone();
        let run = self
            .kex
            .as_mut()
            .ok_or_else(|| DisconnectReason::ProtocolError.error("Key exchange not running"))?;
        if run.server_kexinit.is_some() {
            return Err(DisconnectReason::ProtocolError.error("Duplicate SSH_MSG_KEXINIT"));
        }

        let client = KexInit::from_bytes(&run.client_kexinit)?;
        let server = KexInit::from_bytes(&payload)?;
        let negotiated = Negotiated::new(&client, &server)?;
        debug!(
            kex = negotiated.kex.name(),
            host_key = negotiated.host_key.name(),
            cipher = negotiated.cipher_c2s.name(),
            mac = negotiated.mac_c2s.name(),
            "Algorithms negotiated"
        );

        let mut engine = KexEngine::new(negotiated.kex, transport.shared.config.random.as_ref());
        let init = engine.init_message();

        run.server_kexinit = Some(payload);
        run.ignore_guessed = negotiated.ignore_guessed_packet;
        run.negotiated = Some(negotiated);
        run.engine = Some(engine);

        transport.send_kex(&init).await
    }

    async fn on_kex_message(&mut self, code: u8, payload: &[u8]) -> TernResult<()> {
        let transport = self.transport.clone();
        let shared = &transport.shared;
        let run = self.kex.as_mut().ok_or_else(|| {
            DisconnectReason::ProtocolError
                .error(format!("Key exchange message {} outside key exchange", code))
        })?;

        if run.ignore_guessed {
            run.ignore_guessed = false;
            debug!(code, "Ignoring wrongly guessed key exchange packet");
            return Ok(());
        }

        let (Some(engine), Some(negotiated), Some(server_kexinit)) =
            (run.engine.as_mut(), run.negotiated, run.server_kexinit.as_deref())
        else {
            return Err(DisconnectReason::ProtocolError
                .error(format!("Unexpected key exchange message {}", code)));
        };
        if code != MessageType::KexdhReply.code() {
            return Err(DisconnectReason::ProtocolError
                .error(format!("Unexpected key exchange message {}", code)));
        }

        let ctx = KexContext {
            client_version: &shared.versions.client_line,
            server_version: &shared.versions.server_line,
            client_kexinit: &run.client_kexinit,
            server_kexinit,
        };
        let output = engine.handle_reply(payload, &ctx)?;

        if !shared
            .verifier
            .verify(&shared.host, shared.port, &output.host_key)
        {
            return Err(DisconnectReason::HostKeyNotVerifiable.error(format!(
                "Host key {} rejected for {}:{}",
                output.host_key.fingerprint(),
                shared.host,
                shared.port
            )));
        }

        let session_id = shared
            .session_id
            .get_or_init(|| output.exchange_hash.clone())
            .clone();
        *lock(&shared.host_key) = Some(output.host_key.clone());

        let keys = derive_keys(
            &negotiated,
            &output.shared_secret,
            &output.exchange_hash,
            &session_id,
        );
        let out_cipher = negotiated.cipher_c2s.create(&keys.enc_c2s, &keys.iv_c2s)?;
        let out_mac = negotiated.mac_c2s.create(&keys.mac_c2s)?;
        let in_cipher = negotiated.cipher_s2c.create(&keys.enc_s2c, &keys.iv_s2c)?;
        let in_mac = negotiated.mac_s2c.create(&keys.mac_s2c)?;
        run.incoming = Some((in_cipher, Some(in_mac)));

        let mut writer = shared.writer.lock().await;
        writer.write_payload(&NewKeys::new().to_bytes()).await?;
        writer.encoder.set_keys(out_cipher, Some(out_mac));
        writer.kex_pending = false;
        writer.bytes_since_kex = 0;
        shared.state.send_modify(|s| s.kex_pending = false);
        trace!("Outgoing keys switched");
        Ok(())
    }

    fn on_newkeys(&mut self) -> TernResult<()> {
        let run = self
            .kex
            .take()
            .ok_or_else(|| DisconnectReason::ProtocolError.error("NEWKEYS outside key exchange"))?;
        let (cipher, mac) = run.incoming.ok_or_else(|| {
            DisconnectReason::ProtocolError.error("NEWKEYS before key exchange reply")
        })?;
        self.decoder.set_keys(cipher, mac);
        self.last_kex = Instant::now();
        self.bytes_since_kex = 0;

        let shared = &self.transport.shared;
        shared.state.send_modify(|s| s.kex_count += 1);
        info!(
            round = shared.state.borrow().kex_count,
            elapsed_ms = run.started.elapsed().as_millis() as u64,
            "Key exchange complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::AcceptAnyHostKey;
    use tokio::io::duplex;

    fn config() -> SshConfig {
        SshConfig::builder()
            .with_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    #[test]
    fn test_disconnect_payload() {
        let payload = disconnect_payload(DisconnectReason::ByApplication, "bye");
        let mut buf = Buffer::from_vec(payload);
        assert_eq!(buf.read_u8().unwrap(), 1);
        assert_eq!(buf.read_u32().unwrap(), 11);
        assert_eq!(buf.read_string().unwrap(), "bye");
        assert_eq!(buf.read_string().unwrap(), "");
    }

    fn assert_send<T: Send>(_: &T) {}

    // the background tasks must be spawnable on a multi-threaded runtime
    #[allow(dead_code)]
    fn background_tasks_are_send(reader: Reader, transport: Transport) {
        let (_tx, rx) = mpsc::unbounded_channel();
        assert_send(&reader.run());
        assert_send(&pump(transport.clone(), rx));
        assert_send(&transport.closed());
        assert_send(&transport.rekey());
    }

    #[test]
    fn test_unimplemented_payload() {
        assert_eq!(unimplemented_payload(7), vec![3, 0, 0, 0, 7]);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_identification() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"SSH-1.5-Ancient\r\n").await.unwrap();
            let mut sink = vec![0u8; 1024];
            while server.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let err = Transport::connect(client, "test", 22, config(), Arc::new(AcceptAnyHostKey))
            .await
            .unwrap_err();
        assert!(matches!(err, TernError::Disconnect { code: 8, .. }));
    }

    #[tokio::test]
    async fn test_connect_fails_when_peer_closes_during_kex() {
        let (client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            server.write_all(b"SSH-2.0-Mock\r\n").await.unwrap();
            let mut buf = vec![0u8; 512];
            let _ = server.read(&mut buf).await;
            drop(server);
        });

        let err = Transport::connect(client, "test", 22, config(), Arc::new(AcceptAnyHostKey))
            .await
            .unwrap_err();
        assert!(matches!(err, TernError::Closed(_) | TernError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_without_kexinit() {
        let (client, mut server) = duplex(64 * 1024);
        let _server = tokio::spawn(async move {
            server.write_all(b"SSH-2.0-Silent\r\n").await.unwrap();
            let mut sink = vec![0u8; 1024];
            while server.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let err = Transport::connect(client, "test", 22, config(), Arc::new(AcceptAnyHostKey))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
