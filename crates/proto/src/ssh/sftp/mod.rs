//! SFTP (SSH File Transfer Protocol) version 3.
//!
//! SFTP runs as the `sftp` subsystem of a session channel. After the
//! INIT/VERSION handshake every request carries an id, starting at 1, and
//! the server may answer out of order. A background
//! [`PacketReader`](reader::PacketReader) matches responses to waiting
//! requests.
//!
//! ```text
//! Client                          Server
//!   |-- SSH_MSG_CHANNEL_REQUEST --->|  (subsystem "sftp")
//!   |<- SSH_MSG_CHANNEL_SUCCESS ----|
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|
//!   |-- SSH_FXP_OPEN (id 1) ------->|
//!   |<- SSH_FXP_HANDLE (id 1) ------|
//!   |-- SSH_FXP_READ (id 2) ------->|
//!   |<- SSH_FXP_DATA (id 2) --------|
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use tern_proto::ssh::client::SshClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SshClient::connect("server:22").await?;
//! client.authenticate_password("alice", "hunter2").await?;
//!
//! let sftp = client.sftp().await?;
//! for entry in sftp.readdir("/var/log").await? {
//!     println!("{}", entry.filename);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [SFTP Draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02)

pub mod client;
pub mod message;
pub mod reader;
pub mod types;

pub use client::SftpClient;
pub use message::{SftpMessage, SftpMessageType, SFTP_VERSION};
pub use reader::{PacketReader, PendingRequests};
pub use types::{
    DirEntry, FileAttributes, FileHandle, FileMode, FileType, OpenFlags, Status, StatusCode,
};
