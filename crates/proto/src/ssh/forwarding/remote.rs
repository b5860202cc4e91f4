//! Remote port forwarding (`tcpip-forward`).
//!
//! 1. [`RemotePortForwarder::bind`] sends the `tcpip-forward` global request
//! 2. The server listens on the requested address
//! 3. For each connection it accepts, the server opens a `forwarded-tcpip`
//!    channel naming the forward
//! 4. The channel is handed to the forward's [`ConnectListener`] on its own
//!    task; channels for forwards we never bound are refused

use super::types::{ConnectListener, ForwardAddr, ForwardedConnection};
use crate::ssh::buffer::Buffer;
use crate::ssh::channel::OpenFailureReason;
use crate::ssh::connection::{ChannelOpener, Connection, IncomingOpen, OpenRejection, OpenedHandler};
use crate::ssh::transport::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tern_platform::{TernError, TernResult};
use tracing::{info, warn};

/// Channel type opened by the server for remote forwards.
pub const FORWARDED_TCPIP: &str = "forwarded-tcpip";

const PF_REQ: &str = "tcpip-forward";
const PF_CANCEL: &str = "cancel-tcpip-forward";

type Listeners = Mutex<HashMap<ForwardAddr, Arc<dyn ConnectListener>>>;

/// Opener registered with the connection for `forwarded-tcpip`.
struct ForwardOpener {
    listeners: Arc<Listeners>,
}

impl ChannelOpener for ForwardOpener {
    fn channel_type(&self) -> &str {
        FORWARDED_TCPIP
    }

    fn handle_open(&self, open: &IncomingOpen) -> Result<OpenedHandler, OpenRejection> {
        let parsed = parse_open(&open.data).map_err(|err| {
            OpenRejection::new(OpenFailureReason::ConnectFailed, err.to_string())
        })?;
        let (forward, originator) = parsed;

        let listener = lock(&self.listeners).get(&forward).cloned().ok_or_else(|| {
            OpenRejection::new(
                OpenFailureReason::AdministrativelyProhibited,
                format!("Forwarding was not requested on `{}`", forward),
            )
        })?;

        Ok(Box::new(move |channel| {
            tokio::spawn(async move {
                let connection = ForwardedConnection {
                    forward,
                    originator,
                    channel,
                };
                if let Err(err) = listener.got_connect(connection).await {
                    warn!(error = %err, "Forwarded connection failed");
                }
            });
        }))
    }
}

fn parse_open(data: &[u8]) -> TernResult<(ForwardAddr, ForwardAddr)> {
    let mut buf = Buffer::from(data);
    let forward = read_addr(&mut buf)?;
    let originator = read_addr(&mut buf)?;
    Ok((forward, originator))
}

pub(super) fn read_addr(buf: &mut Buffer) -> TernResult<ForwardAddr> {
    let host = buf.read_string()?;
    let port = buf.read_u32()?;
    let port = u16::try_from(port)
        .map_err(|_| TernError::Protocol(format!("Invalid port number: {}", port)))?;
    Ok(ForwardAddr::new(host, port))
}

/// Requests, tracks and cancels remote forwards.
#[derive(Clone)]
pub struct RemotePortForwarder {
    connection: Connection,
    listeners: Arc<Listeners>,
}

impl RemotePortForwarder {
    /// Creates the forwarder and registers it for `forwarded-tcpip` channels.
    pub fn new(connection: Connection) -> Self {
        let listeners: Arc<Listeners> = Arc::default();
        connection.attach(Arc::new(ForwardOpener {
            listeners: listeners.clone(),
        }));
        Self {
            connection,
            listeners,
        }
    }

    /// Asks the server to listen on `forward` and routes its connections to
    /// `listener`.
    ///
    /// With port 0 the server picks the port; the returned forward carries
    /// the port it reported.
    pub async fn bind(
        &self,
        forward: ForwardAddr,
        listener: Arc<dyn ConnectListener>,
    ) -> TernResult<ForwardAddr> {
        let reply = self.request(PF_REQ, &forward).await?;
        let mut forward = forward;
        if forward.port == 0 {
            let port = Buffer::from_vec(reply).read_u32()?;
            forward.port = u16::try_from(port).map_err(|_| {
                TernError::Protocol(format!("Server assigned invalid port {}", port))
            })?;
        }
        info!(%forward, "Remote end listening");
        lock(&self.listeners).insert(forward.clone(), listener);
        Ok(forward)
    }

    /// Cancels `forward`. The local registration is removed even if the
    /// server refuses.
    pub async fn cancel(&self, forward: &ForwardAddr) -> TernResult<()> {
        let result = self.request(PF_CANCEL, forward).await.map(|_| ());
        lock(&self.listeners).remove(forward);
        info!(%forward, "Remote forward cancelled");
        result
    }

    /// Forwards currently bound.
    pub fn active_forwards(&self) -> Vec<ForwardAddr> {
        lock(&self.listeners).keys().cloned().collect()
    }

    async fn request(&self, name: &str, forward: &ForwardAddr) -> TernResult<Vec<u8>> {
        let mut data = Buffer::new();
        data.put_str(&forward.host).put_u32(u32::from(forward.port));
        self.connection
            .global_request(name, true, data.as_slice())
            .await
    }
}

impl std::fmt::Debug for RemotePortForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePortForwarder")
            .field("forwards", &self.active_forwards())
            .finish()
    }
}
