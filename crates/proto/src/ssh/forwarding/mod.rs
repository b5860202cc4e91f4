//! Server-side listeners relayed back over the connection.
//!
//! A `tcpip-forward` global request asks the server to listen on an address.
//! Each connection it accepts arrives as a `forwarded-tcpip` channel, which
//! [`RemotePortForwarder`] routes to the [`ConnectListener`] bound for that
//! address. [`SocketForwardingListener`] is the stock listener: it dials a
//! local TCP endpoint and pipes bytes both ways. [`X11Forwarder`] takes the
//! `x11` channels a session opens after an `x11-req`.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tern_proto::ssh::client::SshClient;
//! use tern_proto::ssh::forwarding::{ForwardAddr, SocketForwardingListener};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SshClient::connect("bastion:22").await?;
//! client.authenticate_password("deploy", "secret").await?;
//!
//! // port 0 lets the server pick; the bound address reports its choice
//! let forwarder = client.remote_port_forwarder()?;
//! let relay = Arc::new(SocketForwardingListener::new("127.0.0.1:3000"));
//! let bound = forwarder.bind(ForwardAddr::new("localhost", 0), relay).await?;
//! println!("reachable on the server at {}", bound);
//! # Ok(())
//! # }
//! ```

pub mod remote;
pub mod types;
pub mod x11;

pub use remote::RemotePortForwarder;
pub use types::{
    parse_forward_addr, ConnectListener, ForwardAddr, ForwardedConnection, SocketForwardingListener,
};
pub use x11::X11Forwarder;
