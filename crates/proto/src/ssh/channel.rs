//! SSH channels (RFC 4254 Section 5).
//!
//! A [`Channel`] is a flow-controlled duplex stream multiplexed over the
//! transport. Incoming data is queued by the connection service (on the
//! transport's reader task) and read through [`ChannelReader`], which
//! implements [`AsyncRead`]. Outgoing data is buffered by [`ChannelWriter`]
//! up to the peer's maximum packet size and sent once remote window credit is
//! available.
//!
//! Closing is idempotent and tracked per direction: EOF and CLOSE sent and
//! received. The channel leaves the connection's registry once CLOSE has
//! gone both ways.

use crate::ssh::buffer::Buffer;
use crate::ssh::connection::ChannelTable;
use crate::ssh::message::MessageType;
use crate::ssh::transport::{lock, Transport};
use crate::ssh::window::{LocalWindow, RemoteWindow};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel type requested in `SSH_MSG_CHANNEL_OPEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (interactive shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (local port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
        }
    }

    /// Appends the type specific part of `SSH_MSG_CHANNEL_OPEN`.
    pub(crate) fn put_data(&self, buf: &mut Buffer) {
        match self {
            ChannelType::Session => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                buf.put_str(host)
                    .put_u32(*port)
                    .put_str(originator_address)
                    .put_u32(*originator_port);
            }
        }
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl OpenFailureReason {
    /// Converts from the wire code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Wire code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

impl fmt::Display for OpenFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests we send on a channel (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// PTY request (pseudoterminal allocation)
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start interactive shell
    Shell,
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal size change
    WindowChange {
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
    },
    /// Deliver a signal, named without the "SIG" prefix
    Signal {
        /// Signal name
        name: String,
    },
    /// Ask the server to forward X11 connections over this session
    X11Req {
        /// Forward only the first connection
        single_connection: bool,
        /// Authentication protocol, usually "MIT-MAGIC-COOKIE-1"
        auth_protocol: String,
        /// Hex encoded cookie
        auth_cookie: String,
        /// X11 screen number
        screen: u32,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::X11Req { .. } => "x11-req",
        }
    }

    /// Builds `SSH_MSG_CHANNEL_REQUEST` for channel `recipient`.
    pub fn to_message(&self, recipient: u32, want_reply: bool) -> Vec<u8> {
        let mut buf = Buffer::for_message(MessageType::ChannelRequest);
        buf.put_u32(recipient).put_str(self.name()).put_bool(want_reply);

        match self {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                buf.put_str(term)
                    .put_u32(*width_chars)
                    .put_u32(*height_rows)
                    .put_u32(*width_pixels)
                    .put_u32(*height_pixels)
                    .put_bytes(modes);
            }
            ChannelRequestType::Env { name, value } => {
                buf.put_str(name).put_str(value);
            }
            ChannelRequestType::Exec { command } => {
                buf.put_str(command);
            }
            ChannelRequestType::Shell => {}
            ChannelRequestType::Subsystem { name } => {
                buf.put_str(name);
            }
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars)
                    .put_u32(*height_rows)
                    .put_u32(*width_pixels)
                    .put_u32(*height_pixels);
            }
            ChannelRequestType::Signal { name } => {
                buf.put_str(name);
            }
            ChannelRequestType::X11Req {
                single_connection,
                auth_protocol,
                auth_cookie,
                screen,
            } => {
                buf.put_bool(*single_connection)
                    .put_str(auth_protocol)
                    .put_str(auth_cookie)
                    .put_u32(*screen);
            }
        }

        buf.into_vec()
    }
}

/// `exit-signal` details reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name without the "SIG" prefix
    pub name: String,
    /// Whether a core was dumped
    pub core_dumped: bool,
    /// Error message
    pub message: String,
}

/// Parameters of an open channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelParams {
    pub id: u32,
    pub recipient: u32,
    pub local_window: u32,
    pub local_max_packet: u32,
    pub remote_window: u32,
    pub remote_max_packet: u32,
}

/// State shared between a channel's handles and the connection service.
pub(crate) struct ChannelShared {
    id: u32,
    recipient: u32,
    kind: String,
    transport: Transport,
    table: Weak<ChannelTable>,
    local: LocalWindow,
    remote: RemoteWindow,
    data_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    stderr_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    requests: Mutex<VecDeque<oneshot::Sender<bool>>>,
    request_lock: AsyncMutex<()>,
    eof_sent: AtomicBool,
    eof_received: AtomicBool,
    close_sent: AtomicBool,
    close_received: watch::Sender<bool>,
    exit_status: Mutex<Option<u32>>,
    exit_signal: Mutex<Option<ExitSignal>>,
    error: Mutex<Option<TernError>>,
}

impl ChannelShared {
    /// Creates the shared state and the channel handles around it.
    pub(crate) fn open(
        params: ChannelParams,
        kind: &str,
        transport: Transport,
        table: Weak<ChannelTable>,
    ) -> (Arc<Self>, Channel) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (close_received, _) = watch::channel(false);

        let shared = Arc::new(Self {
            id: params.id,
            recipient: params.recipient,
            kind: kind.to_string(),
            transport,
            table,
            local: LocalWindow::new(params.id, params.local_window, params.local_max_packet),
            remote: RemoteWindow::new(params.id, params.remote_window, params.remote_max_packet),
            data_tx: Mutex::new(Some(data_tx)),
            stderr_tx: Mutex::new(Some(stderr_tx)),
            requests: Mutex::new(VecDeque::new()),
            request_lock: AsyncMutex::new(()),
            eof_sent: AtomicBool::new(false),
            eof_received: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            close_received,
            exit_status: Mutex::new(None),
            exit_signal: Mutex::new(None),
            error: Mutex::new(None),
        });

        info!(
            channel = params.id,
            recipient = params.recipient,
            kind,
            "Channel open"
        );

        let channel = Channel {
            reader: ChannelReader::new(shared.clone(), data_rx),
            stderr: Some(ChannelReader::new(shared.clone(), stderr_rx)),
            writer: ChannelWriter::new(shared.clone()),
            shared: shared.clone(),
        };
        (shared, channel)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    fn error(&self) -> Option<TernError> {
        lock(&self.error).clone()
    }

    fn closed_error(&self) -> TernError {
        self.error()
            .unwrap_or_else(|| TernError::Closed(format!("Channel {} closed", self.id)))
    }

    fn check_writable(&self) -> TernResult<()> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        if self.eof_sent.load(Ordering::SeqCst) || self.close_sent.load(Ordering::SeqCst) {
            return Err(TernError::Closed(format!(
                "Channel {} is closed for writing",
                self.id
            )));
        }
        Ok(())
    }

    // ---- inbound, called on the transport reader task ----

    pub(crate) fn on_window_adjust(&self, bytes: u32) -> TernResult<()> {
        self.remote.expand(bytes)
    }

    pub(crate) fn on_data(&self, data: Vec<u8>) -> TernResult<()> {
        self.local.consume(data.len() as u32)?;
        trace!(channel = self.id, len = data.len(), "Channel data");
        self.deliver(&self.data_tx, data);
        Ok(())
    }

    pub(crate) fn on_extended_data(&self, code: u32, data: Vec<u8>) -> TernResult<()> {
        self.local.consume(data.len() as u32)?;
        if code == EXTENDED_DATA_STDERR {
            self.deliver(&self.stderr_tx, data);
        } else {
            debug!(channel = self.id, code, "Discarding unknown extended data");
            self.release(data.len());
        }
        Ok(())
    }

    fn deliver(&self, queue: &Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>, data: Vec<u8>) {
        let len = data.len();
        let delivered = match lock(queue).as_ref() {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        };
        // Nobody will read it; give the credit straight back.
        if !delivered {
            self.release(len);
        }
    }

    pub(crate) fn on_eof(&self) {
        debug!(channel = self.id, "Peer sent EOF");
        self.eof_received.store(true, Ordering::SeqCst);
        lock(&self.data_tx).take();
        lock(&self.stderr_tx).take();
    }

    pub(crate) fn on_close(&self) {
        info!(channel = self.id, "Peer closed channel");
        self.on_eof();
        self.remote
            .close(TernError::Closed(format!("Channel {} closed by peer", self.id)));
        lock(&self.requests).clear();
        self.close_received.send_replace(true);

        if !self.close_sent.swap(true, Ordering::SeqCst) {
            self.transport.enqueue(close_message(self.recipient));
        }
        self.forget();
    }

    pub(crate) fn on_request(&self, name: &str, want_reply: bool, buf: &mut Buffer) -> TernResult<()> {
        match name {
            "exit-status" => {
                let status = buf.read_u32()?;
                debug!(channel = self.id, status, "Exit status");
                *lock(&self.exit_status) = Some(status);
            }
            "exit-signal" => {
                let signal = ExitSignal {
                    name: buf.read_string()?,
                    core_dumped: buf.read_bool()?,
                    message: buf.read_string()?,
                };
                debug!(channel = self.id, signal = %signal.name, "Exit signal");
                *lock(&self.exit_signal) = Some(signal);
            }
            _ => {
                debug!(channel = self.id, request = name, "Ignoring channel request");
                if want_reply {
                    let mut reply = Buffer::for_message(MessageType::ChannelFailure);
                    reply.put_u32(self.recipient);
                    self.transport.enqueue(reply.into_vec());
                }
            }
        }
        Ok(())
    }

    pub(crate) fn on_request_reply(&self, success: bool) -> TernResult<()> {
        match lock(&self.requests).pop_front() {
            Some(waiter) => {
                let _ = waiter.send(success);
                Ok(())
            }
            None => Err(TernError::Protocol(format!(
                "Unexpected channel request reply on channel {}",
                self.id
            ))),
        }
    }

    /// Fails every waiter with `err`. Used when the transport dies.
    pub(crate) fn fail(&self, err: &TernError) {
        {
            let mut slot = lock(&self.error);
            if slot.is_none() {
                *slot = Some(err.clone());
            }
        }
        self.remote.close(err.clone());
        lock(&self.data_tx).take();
        lock(&self.stderr_tx).take();
        lock(&self.requests).clear();
        self.close_received.send_replace(true);
    }

    /// Closes a channel whose opener stopped waiting.
    pub(crate) fn abandon(&self) {
        lock(&self.data_tx).take();
        lock(&self.stderr_tx).take();
        if !self.close_sent.swap(true, Ordering::SeqCst) {
            self.transport.enqueue(close_message(self.recipient));
        }
    }

    fn release(&self, len: usize) {
        if let Some(adjust) = self.local.release(len as u32) {
            let mut buf = Buffer::for_message(MessageType::ChannelWindowAdjust);
            buf.put_u32(self.recipient).put_u32(adjust);
            self.transport.enqueue(buf.into_vec());
        }
    }

    fn forget(&self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(self.id);
        }
    }

    // ---- outbound ----

    /// Sends `data` as window credit allows, counting delivered bytes in
    /// `sent` so a caller can keep what is left after a failure.
    async fn send_data(&self, data: &[u8], sent: &mut usize) -> TernResult<()> {
        let wait = self.transport.config().timeout;
        while *sent < data.len() {
            self.check_writable()?;
            let rest = &data[*sent..];
            let n = self.remote.acquire(rest.len() as u32, wait).await? as usize;
            let mut buf = Buffer::for_message(MessageType::ChannelData);
            buf.put_u32(self.recipient).put_bytes(&rest[..n]);
            self.transport.send(buf.as_slice()).await?;
            *sent += n;
        }
        Ok(())
    }

    async fn send_eof(&self) -> TernResult<()> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        if self.close_sent.load(Ordering::SeqCst) || self.eof_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(channel = self.id, "Sending EOF");
        let mut buf = Buffer::for_message(MessageType::ChannelEof);
        buf.put_u32(self.recipient);
        self.transport.send(buf.as_slice()).await
    }

    async fn send_close(&self) -> TernResult<()> {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(channel = self.id, "Closing channel");
        let result = self.transport.send(&close_message(self.recipient)).await;
        if *self.close_received.borrow() {
            self.forget();
        }
        result
    }

    async fn request(&self, request: &ChannelRequestType, want_reply: bool) -> TernResult<()> {
        self.check_writable()?;
        let message = request.to_message(self.recipient, want_reply);
        debug!(channel = self.id, request = request.name(), want_reply, "Channel request");

        if !want_reply {
            return self.transport.send(&message).await;
        }

        let rx = {
            // replies come back in request order
            let _order = self.request_lock.lock().await;
            let (tx, rx) = oneshot::channel();
            lock(&self.requests).push_back(tx);
            self.transport.send(&message).await?;
            rx
        };

        match timeout(self.transport.config().timeout, rx).await {
            Err(_) => Err(TernError::Timeout(format!(
                "{} request on channel {}",
                request.name(),
                self.id
            ))),
            Ok(Err(_)) => Err(self.closed_error()),
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(TernError::Rejected {
                code: 0,
                message: format!("{} request refused on channel {}", request.name(), self.id),
            }),
        }
    }
}

impl fmt::Debug for ChannelShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("recipient", &self.recipient)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn close_message(recipient: u32) -> Vec<u8> {
    let mut buf = Buffer::for_message(MessageType::ChannelClose);
    buf.put_u32(recipient);
    buf.into_vec()
}

/// An open channel.
#[derive(Debug)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    reader: ChannelReader,
    stderr: Option<ChannelReader>,
    writer: ChannelWriter,
}

impl Channel {
    /// Local channel id.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Peer's channel id.
    pub fn recipient(&self) -> u32 {
        self.shared.recipient
    }

    /// Channel type name.
    pub fn kind(&self) -> &str {
        &self.shared.kind
    }

    /// Remote window credit left.
    pub fn remote_window(&self) -> u32 {
        self.shared.remote.size()
    }

    /// Local window credit left.
    pub fn local_window(&self) -> u32 {
        self.shared.local.size()
    }

    /// Sends a channel request; with `want_reply`, waits for the answer and
    /// maps a refusal to [`TernError::Rejected`].
    pub async fn request(&self, request: ChannelRequestType, want_reply: bool) -> TernResult<()> {
        self.shared.request(&request, want_reply).await
    }

    /// Runs `command` on a session channel.
    pub async fn exec(&self, command: &str) -> TernResult<()> {
        self.request(
            ChannelRequestType::Exec {
                command: command.to_string(),
            },
            true,
        )
        .await
    }

    /// Starts the user's shell.
    pub async fn shell(&self) -> TernResult<()> {
        self.request(ChannelRequestType::Shell, true).await
    }

    /// Starts a subsystem such as "sftp".
    pub async fn subsystem(&self, name: &str) -> TernResult<()> {
        self.request(
            ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
            true,
        )
        .await
    }

    /// Exit status reported by the peer, if any.
    pub fn exit_status(&self) -> Option<u32> {
        *lock(&self.shared.exit_status)
    }

    /// Exit signal reported by the peer, if any.
    pub fn exit_signal(&self) -> Option<ExitSignal> {
        lock(&self.shared.exit_signal).clone()
    }

    /// Whether the peer sent EOF.
    pub fn eof_received(&self) -> bool {
        self.shared.eof_received.load(Ordering::SeqCst)
    }

    /// Standard output stream.
    pub fn reader(&mut self) -> &mut ChannelReader {
        &mut self.reader
    }

    /// Takes the stderr stream. Returns `None` after the first call.
    pub fn take_stderr(&mut self) -> Option<ChannelReader> {
        self.stderr.take()
    }

    /// Output stream.
    pub fn writer(&mut self) -> &mut ChannelWriter {
        &mut self.writer
    }

    /// Buffers `data` for sending.
    pub async fn write(&mut self, data: &[u8]) -> TernResult<()> {
        self.writer.write(data).await
    }

    /// Sends everything buffered.
    pub async fn flush(&mut self) -> TernResult<()> {
        self.writer.flush().await
    }

    /// Flushes and sends EOF.
    pub async fn send_eof(&mut self) -> TernResult<()> {
        self.writer.send_eof().await
    }

    /// Flushes pending output, sends EOF and CLOSE. Closing twice is a no-op.
    pub async fn close(&mut self) -> TernResult<()> {
        self.writer.close().await
    }

    /// Waits until the peer closes the channel or the transport dies.
    pub async fn wait_closed(&self) {
        let mut closed = self.shared.close_received.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Splits into independently owned read and write halves. Stderr stays
    /// available through [`Channel::take_stderr`] before splitting.
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a channel.
pub struct ChannelReader {
    shared: Arc<ChannelShared>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl ChannelReader {
    fn new(shared: Arc<ChannelShared>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            shared,
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }

    /// Local channel id.
    pub fn id(&self) -> u32 {
        self.shared.id
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.offset >= this.pending.len() {
            match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(chunk)) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                Poll::Ready(None) => {
                    return match this.shared.error() {
                        Some(err) => Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            err,
                        ))),
                        None => Poll::Ready(Ok(())),
                    };
                }
            }
        }

        let available = &this.pending[this.offset..];
        let n = available.len().min(out.remaining());
        out.put_slice(&available[..n]);
        this.offset += n;
        this.shared.release(n);
        Poll::Ready(Ok(()))
    }
}

impl fmt::Debug for ChannelReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReader")
            .field("channel", &self.shared.id)
            .field("buffered", &(self.pending.len() - self.offset))
            .finish()
    }
}

/// Write half of a channel.
pub struct ChannelWriter {
    shared: Arc<ChannelShared>,
    buffer: Vec<u8>,
}

impl ChannelWriter {
    fn new(shared: Arc<ChannelShared>) -> Self {
        Self {
            shared,
            buffer: Vec::new(),
        }
    }

    /// Local channel id.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Buffers `data`, flushing whenever a full packet has accumulated.
    pub async fn write(&mut self, data: &[u8]) -> TernResult<()> {
        self.shared.check_writable()?;
        let packet = self.shared.remote.max_packet() as usize;
        let mut rest = data;
        while !rest.is_empty() {
            let room = packet.saturating_sub(self.buffer.len());
            if room == 0 {
                self.flush().await?;
                continue;
            }
            let n = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Sends everything buffered, waiting for window credit as needed.
    ///
    /// On failure the unsent bytes stay buffered for a later flush.
    pub async fn flush(&mut self) -> TernResult<()> {
        if self.buffer.is_empty() {
            return self.shared.check_writable();
        }
        let mut sent = 0;
        let result = self.shared.send_data(&self.buffer, &mut sent).await;
        self.buffer.drain(..sent);
        result
    }

    /// Bytes written but not yet sent.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Flushes and sends EOF. Later writes fail.
    pub async fn send_eof(&mut self) -> TernResult<()> {
        self.flush().await?;
        self.shared.send_eof().await
    }

    /// Flushes, sends EOF and CLOSE. Closing twice is a no-op.
    pub async fn close(&mut self) -> TernResult<()> {
        if self.shared.close_sent.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.shared.error().is_none() {
            if !self.shared.eof_sent.load(Ordering::SeqCst) {
                if let Err(err) = self.flush().await {
                    warn!(channel = self.shared.id, error = %err, "Dropping unflushed channel data");
                }
            }
            self.shared.send_eof().await?;
        }
        self.shared.send_close().await
    }
}

impl fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("channel", &self.shared.id)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
