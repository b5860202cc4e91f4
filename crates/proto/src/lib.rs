//! Protocol implementations for Tern.
//!
//! This crate provides an asynchronous SSH2 client core:
//!
//! - **Transport** - version exchange, Curve25519 and Diffie-Hellman key
//!   exchange, AES-CTR encryption with HMAC integrity, automatic re-keying
//! - **Connection** - multiplexed channels with flow control, global
//!   requests and remote port forwarding
//! - **Authentication** - `none`, `password`, `publickey`,
//!   `keyboard-interactive` and `hostbased`
//! - **SFTP** - version 3 file transfer over a subsystem channel
//!
//! # Features
//!
//! - `ssh` (default) - SSH client support
//!
//! # Example
//!
//! ```rust,no_run
//! use tern_proto::ssh::SshClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SshClient::connect("server:22").await?;
//! client.authenticate_password("alice", "hunter2").await?;
//!
//! let output = client.execute("uname -a").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic primitives come from vetted libraries (`ring`, `dalek`, RustCrypto)
//! - MAC verification is constant-time
//! - Keys, passwords and MAC keys are zeroized with `zeroize`
//! - Randomness is injected through [`tern_platform::RandomSource`]

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
