//! Common types for port forwarding.

use crate::ssh::channel::Channel;
use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// A host and port on either end of a forward.
///
/// Some bind addresses have special meaning to the server: `""` binds all
/// protocol families, `0.0.0.0` all IPv4 and `::` all IPv6 addresses, and
/// `localhost` the loopback interfaces only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardAddr {
    /// Host or IP address
    pub host: String,
    /// Port number; 0 asks the server to pick one
    pub port: u16,
}

impl ForwardAddr {
    /// Creates a new forward address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Converts to a socket address if the host is an IP address.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for ForwardAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses "host:port" or "[v6-host]:port".
///
/// # Example
///
/// ```rust
/// use tern_proto::ssh::forwarding::parse_forward_addr;
///
/// let addr = parse_forward_addr("[::1]:8080").unwrap();
/// assert_eq!(addr.host, "::1");
/// assert_eq!(addr.port, 8080);
/// ```
pub fn parse_forward_addr(addr: &str) -> TernResult<ForwardAddr> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            TernError::Config(format!("Invalid IPv6 address: missing ']': {}", addr))
        })?;
        let port = tail.strip_prefix(':').ok_or_else(|| {
            TernError::Config(format!("Invalid address format: missing ':' after ']': {}", addr))
        })?;
        (host, port)
    } else {
        addr.rsplit_once(':').ok_or_else(|| {
            TernError::Config(format!(
                "Invalid address format: expected 'host:port', got '{}'",
                addr
            ))
        })?
    };

    let port = port
        .parse::<u16>()
        .map_err(|_| TernError::Config(format!("Invalid port number: {}", port)))?;
    Ok(ForwardAddr::new(host, port))
}

/// A `forwarded-tcpip` channel accepted for a bound forward.
#[derive(Debug)]
pub struct ForwardedConnection {
    /// Forward the connection arrived on
    pub forward: ForwardAddr,
    /// Address of the remote client that connected
    pub originator: ForwardAddr,
    /// The channel carrying the connection
    pub channel: Channel,
}

/// Handles connections arriving on a remote forward.
#[async_trait]
pub trait ConnectListener: Send + Sync {
    /// Called on a separate task for each forwarded connection.
    async fn got_connect(&self, connection: ForwardedConnection) -> TernResult<()>;
}

/// Relays forwarded connections to a local TCP address.
#[derive(Debug, Clone)]
pub struct SocketForwardingListener {
    target: String,
}

impl SocketForwardingListener {
    /// Creates a listener relaying to `target` ("host:port").
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Relay target.
    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl ConnectListener for SocketForwardingListener {
    async fn got_connect(&self, connection: ForwardedConnection) -> TernResult<()> {
        let ForwardedConnection {
            forward,
            originator,
            mut channel,
        } = connection;
        info!(%forward, %originator, target = %self.target, "Forwarded connection");

        let socket = match TcpStream::connect(&self.target).await {
            Ok(socket) => socket,
            Err(err) => {
                let _ = channel.close().await;
                return Err(err.into());
            }
        };
        let (mut sock_read, mut sock_write) = socket.into_split();
        let (mut chan_read, mut chan_write) = channel.split();

        let to_socket = async {
            let copied = tokio::io::copy(&mut chan_read, &mut sock_write).await?;
            sock_write.shutdown().await?;
            Ok::<u64, TernError>(copied)
        };
        let to_channel = async {
            let mut buf = vec![0u8; 16 * 1024];
            let mut copied = 0u64;
            loop {
                let n = sock_read.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                chan_write.write(&buf[..n]).await?;
                chan_write.flush().await?;
                copied += n as u64;
            }
            chan_write.send_eof().await?;
            Ok::<u64, TernError>(copied)
        };

        let (down, up) = tokio::try_join!(to_socket, to_channel)?;
        debug!(%forward, down, up, "Forwarded connection finished");
        chan_write.close().await
    }
}
