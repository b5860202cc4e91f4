//! SSH (Secure Shell) client protocol implementation.
//!
//! This module implements the client side of RFC 4251-4254.
//!
//! # Architecture
//!
//! The SSH implementation is layered:
//!
//! 1. **Wire codec** ([`buffer`], [`packet`]) - Data types and the binary packet protocol
//! 2. **Transport** ([`transport`], [`kex`], [`kex_dh`], [`crypto`]) - Version exchange,
//!    key exchange, re-keying, encryption and MAC (RFC 4253)
//! 3. **Services** ([`service`]) - One active service receives every message numbered
//!    50 and above
//! 4. **Authentication** ([`userauth`], [`auth`]) - The `ssh-userauth` service (RFC 4252, RFC 4256)
//! 5. **Connection** ([`connection`], [`channel`], [`window`]) - Channels, flow control and
//!    global requests (RFC 4254)
//! 6. **Subsystems** ([`sftp`], [`forwarding`]) - SFTP v3 and remote port forwarding
//! 7. **Client** ([`client`]) - Ties the layers together
//!
//! # Concurrency
//!
//! Each transport runs one reader task that decodes packets and dispatches
//! them to the active service. Handlers never block: replies are queued on
//! an outbound task. Callers wait on futures bounded by the configured
//! timeout, and when the transport dies every waiter fails with the same
//! error.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::Buffer;
//!
//! let mut buf = Buffer::new();
//! buf.put_str("ssh-connection").put_u32(7);
//!
//! assert_eq!(buf.read_string().unwrap(), "ssh-connection");
//! assert_eq!(buf.read_u32().unwrap(), 7);
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod disconnect;
pub mod forwarding;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod keepalive;
pub mod message;
pub mod packet;
pub mod service;
pub mod sftp;
pub mod transport;
pub mod userauth;
pub mod version;
pub mod window;

// Re-export main types
pub use buffer::Buffer;
pub use channel::{
    Channel, ChannelReader, ChannelRequestType, ChannelType, ChannelWriter, ExitSignal,
    OpenFailureReason,
};
pub use client::{ExecOutput, SshClient};
pub use config::{SshConfig, SshConfigBuilder};
pub use connection::{ChannelOpener, Connection, IncomingOpen, OpenRejection};
pub use crypto::{CipherAlgorithm, MacAlgorithm};
pub use disconnect::DisconnectReason;
pub use forwarding::{ConnectListener, ForwardAddr, RemotePortForwarder};
pub use hostkey::{
    AcceptAnyHostKey, Ed25519Signer, FingerprintVerifier, HostKeyVerifier, PublicKey,
    SignatureAlgorithm, Signer,
};
pub use kex::{KexInit, Negotiated, NewKeys};
pub use kex_dh::{HashAlgorithm, KexAlgorithm};
pub use message::MessageType;
pub use packet::{Decoder, Encoder, Packet};
pub use service::Service;
pub use sftp::SftpClient;
pub use transport::Transport;
pub use userauth::{AuthMethod, ChallengeResponder, PasswordResponder, UserAuth};
pub use version::Version;
