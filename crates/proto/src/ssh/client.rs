//! SSH client.
//!
//! Ties the layers together: a [`Transport`] carrying the `ssh-userauth`
//! service until authentication succeeds, then the `ssh-connection` service
//! for channels, SFTP and port forwarding.
//!
//! # Example
//!
//! ```rust,no_run
//! use tern_proto::ssh::client::SshClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SshClient::connect("127.0.0.1:22").await?;
//! client.authenticate_password("user", "password").await?;
//!
//! let output = client.execute("ls -la").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::channel::Channel;
use crate::ssh::config::SshConfig;
use crate::ssh::connection::Connection;
use crate::ssh::disconnect::DisconnectReason;
use crate::ssh::forwarding::{ConnectListener, RemotePortForwarder, X11Forwarder};
use crate::ssh::hostkey::{AcceptAnyHostKey, HostKeyVerifier, PublicKey, Signer};
use crate::ssh::sftp::SftpClient;
use crate::ssh::transport::Transport;
use crate::ssh::userauth::{AuthMethod, PasswordResponder, UserAuth};
use std::sync::{Arc, OnceLock};
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Output of [`SshClient::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output
    pub stdout: Vec<u8>,
    /// Standard error
    pub stderr: Vec<u8>,
    /// Exit status, if the server reported one
    pub exit_status: Option<u32>,
}

/// SSH client.
///
/// Cheap to share: every method takes `&self`.
pub struct SshClient {
    transport: Transport,
    connection: Connection,
    userauth: UserAuth,
    forwarder: OnceLock<RemotePortForwarder>,
    username: OnceLock<String>,
}

impl SshClient {
    /// Connects to `addr` (`host` or `host:port`) with default settings.
    ///
    /// Any host key is accepted; use
    /// [`connect_with_verifier`](Self::connect_with_verifier) to check it.
    pub async fn connect(addr: &str) -> TernResult<Self> {
        Self::connect_with_config(addr, SshConfig::default()).await
    }

    /// Connects with custom configuration, accepting any host key.
    pub async fn connect_with_config(addr: &str, config: SshConfig) -> TernResult<Self> {
        warn!(addr, "Host key verification disabled");
        Self::connect_with_verifier(addr, config, Arc::new(AcceptAnyHostKey)).await
    }

    /// Connects with custom configuration and host key policy.
    pub async fn connect_with_verifier(
        addr: &str,
        config: SshConfig,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> TernResult<Self> {
        config.validate()?;
        let (host, port) = split_addr(addr)?;
        let stream = timeout(config.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| TernError::Timeout(format!("Connecting to {}", addr)))??;
        stream.set_nodelay(true)?;
        Self::connect_stream(stream, &host, port, config, verifier).await
    }

    /// Runs the protocol over an already connected stream.
    pub async fn connect_stream<S>(
        stream: S,
        host: &str,
        port: u16,
        config: SshConfig,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> TernResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Transport::connect(stream, host, port, config, verifier).await?;
        Ok(Self {
            connection: Connection::new(transport.clone()),
            userauth: UserAuth::new(transport.clone()),
            transport,
            forwarder: OnceLock::new(),
            username: OnceLock::new(),
        })
    }

    /// Authenticates `user` trying `methods` in order.
    pub async fn authenticate(&self, user: &str, methods: &[AuthMethod]) -> TernResult<()> {
        self.userauth
            .authenticate(user, Arc::new(self.connection.clone()), methods)
            .await?;
        let _ = self.username.set(user.to_string());
        Ok(())
    }

    /// Authenticates with a password, falling back to keyboard-interactive
    /// password prompts.
    pub async fn authenticate_password(&self, user: &str, password: &str) -> TernResult<()> {
        self.authenticate(
            user,
            &[
                AuthMethod::Password(password.to_string()),
                AuthMethod::KeyboardInteractive(Arc::new(PasswordResponder::new(password))),
            ],
        )
        .await
    }

    /// Authenticates with a private key.
    pub async fn authenticate_publickey(&self, user: &str, signer: Arc<dyn Signer>) -> TernResult<()> {
        self.authenticate(user, &[AuthMethod::PublicKey(signer)]).await
    }

    fn check_authenticated(&self) -> TernResult<()> {
        self.transport.check_open()?;
        if !self.transport.is_authenticated() {
            return Err(TernError::Protocol("Not authenticated".to_string()));
        }
        Ok(())
    }

    /// Opens a session channel.
    pub async fn open_session(&self) -> TernResult<Channel> {
        self.check_authenticated()?;
        self.connection.open_session().await
    }

    /// Runs `command` and collects its output.
    pub async fn execute(&self, command: &str) -> TernResult<ExecOutput> {
        let mut channel = self.open_session().await?;
        channel.exec(command).await?;
        channel.send_eof().await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stderr_reader = channel.take_stderr();
        let read_stderr = async {
            if let Some(reader) = stderr_reader.as_mut() {
                reader.read_to_end(&mut stderr).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (out, err) = tokio::join!(channel.reader().read_to_end(&mut stdout), read_stderr);
        out?;
        err?;

        let mut output = ExecOutput {
            stdout,
            stderr,
            exit_status: None,
        };
        // exit-status arrives before CLOSE
        let _ = timeout(self.transport.config().timeout, channel.wait_closed()).await;
        output.exit_status = channel.exit_status();
        channel.close().await?;
        info!(command, status = ?output.exit_status, "Command finished");
        Ok(output)
    }

    /// Starts an SFTP session on a new channel.
    pub async fn sftp(&self) -> TernResult<SftpClient> {
        let channel = self.open_session().await?;
        SftpClient::new(channel, self.transport.config().timeout).await
    }

    /// Remote port forwarding, shared by every caller.
    pub fn remote_port_forwarder(&self) -> TernResult<RemotePortForwarder> {
        self.check_authenticated()?;
        Ok(self
            .forwarder
            .get_or_init(|| RemotePortForwarder::new(self.connection.clone()))
            .clone())
    }

    /// Accepts `x11` channels and hands them to `listener`.
    ///
    /// The server only opens them for sessions that sent an `x11-req`.
    pub fn x11_forwarder(&self, listener: Arc<dyn ConnectListener>) -> TernResult<X11Forwarder> {
        self.check_authenticated()?;
        Ok(X11Forwarder::start(self.connection.clone(), listener))
    }

    /// Re-keys the transport.
    pub async fn rekey(&self) -> TernResult<()> {
        self.transport.rekey().await
    }

    /// Disconnects from the server.
    pub async fn disconnect(&self) -> TernResult<()> {
        self.transport
            .disconnect(DisconnectReason::ByApplication, "Client disconnecting")
            .await
    }

    /// Transport carrying this client.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Connection service.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Authentication banner sent by the server, if any.
    pub fn banner(&self) -> Option<String> {
        self.userauth.banner()
    }

    /// Authenticated username.
    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    /// Whether authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.transport.is_authenticated()
    }

    /// Whether the transport is still usable.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Server host key.
    pub fn server_host_key(&self) -> Option<PublicKey> {
        self.transport.host_key()
    }

    /// OpenSSH style fingerprint of the server host key.
    pub fn server_host_key_fingerprint(&self) -> Option<String> {
        self.server_host_key().map(|key| key.fingerprint())
    }
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("server", &self.transport.server_version().to_string())
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
fn split_addr(addr: &str) -> TernResult<(String, u16)> {
    let bad = || TernError::Config(format!("Invalid address: {}", addr));

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| bad())?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(bad()),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        // a bare IPv6 literal has more than one colon
        Some((host, _)) if host.contains(':') => Ok((addr.to_string(), DEFAULT_PORT)),
        Some((host, port)) if !host.is_empty() => {
            Ok((host.to_string(), port.parse().map_err(|_| bad())?))
        }
        Some(_) => Err(bad()),
        None if addr.is_empty() => Err(bad()),
        None => Ok((addr.to_string(), DEFAULT_PORT)),
    }
}
