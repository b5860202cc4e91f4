//! SSH key exchange messages and algorithm negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT message
//! - SSH_MSG_NEWKEYS message
//! - Algorithm negotiation
//!
//! The Diffie-Hellman exchange itself lives in [`kex_dh`](super::kex_dh).
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server also lists)
//! 3. Key exchange (DH or ECDH)
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches keys after its NEWKEYS
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::config::SshConfig;
//! use tern_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let config = SshConfig::default();
//! let kexinit = KexInit::from_config(&config);
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use crate::ssh::buffer::Buffer;
use crate::ssh::config::SshConfig;
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::disconnect::DisconnectReason;
use crate::ssh::hostkey::SignatureAlgorithm;
use crate::ssh::kex_dh::KexAlgorithm;
use crate::ssh::message::MessageType;
use tern_platform::{RandomSource, TernError, TernResult};

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT advertising the configured preferences, with a
    /// cookie drawn from the configured randomness source.
    pub fn from_config(config: &SshConfig) -> Self {
        Self::with_random(config, config.random.as_ref())
    }

    /// Creates a KEXINIT drawing the cookie from `random`.
    pub fn with_random(config: &SshConfig, random: &dyn RandomSource) -> Self {
        let mut cookie = [0u8; 16];
        random.fill(&mut cookie);

        Self {
            cookie,
            kex_algorithms: config.kex_algorithms.clone(),
            server_host_key_algorithms: config.host_key_algorithms.clone(),
            encryption_algorithms_client_to_server: config.ciphers.clone(),
            encryption_algorithms_server_to_client: config.ciphers.clone(),
            mac_algorithms_client_to_server: config.macs.clone(),
            mac_algorithms_server_to_client: config.macs.clone(),
            compression_algorithms_client_to_server: config.compression.clone(),
            compression_algorithms_server_to_client: config.compression.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns whether a guessed KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message (without packet framing).
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::for_message(MessageType::KexInit);
        buf.put_raw(&self.cookie)
            .put_name_list(&self.kex_algorithms)
            .put_name_list(&self.server_host_key_algorithms)
            .put_name_list(&self.encryption_algorithms_client_to_server)
            .put_name_list(&self.encryption_algorithms_server_to_client)
            .put_name_list(&self.mac_algorithms_client_to_server)
            .put_name_list(&self.mac_algorithms_server_to_client)
            .put_name_list(&self.compression_algorithms_client_to_server)
            .put_name_list(&self.compression_algorithms_server_to_client)
            .put_name_list(&self.languages_client_to_server)
            .put_name_list(&self.languages_server_to_client)
            .put_bool(self.first_kex_packet_follows)
            .put_u32(0);
        buf.into_vec()
    }

    /// Parses a KEXINIT payload.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        let mut buf = Buffer::from(data);
        let msg = buf.read_u8()?;
        if msg != MessageType::KexInit.code() {
            return Err(TernError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&buf.read_raw(16)?);

        let kexinit = Self {
            cookie,
            kex_algorithms: buf.read_name_list()?,
            server_host_key_algorithms: buf.read_name_list()?,
            encryption_algorithms_client_to_server: buf.read_name_list()?,
            encryption_algorithms_server_to_client: buf.read_name_list()?,
            mac_algorithms_client_to_server: buf.read_name_list()?,
            mac_algorithms_server_to_client: buf.read_name_list()?,
            compression_algorithms_client_to_server: buf.read_name_list()?,
            compression_algorithms_server_to_client: buf.read_name_list()?,
            languages_client_to_server: buf.read_name_list()?,
            languages_server_to_client: buf.read_name_list()?,
            first_kex_packet_follows: buf.read_bool()?,
        };
        // reserved
        buf.read_u32()?;
        Ok(kexinit)
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// After a side sends NEWKEYS, everything it sends uses the new keys. The
/// packet sequence number is not reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys.code()]
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        match data.first() {
            None => Err(TernError::Protocol("NEWKEYS message is empty".to_string())),
            Some(&21) => Ok(Self),
            Some(other) => Err(TernError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {}",
                other
            ))),
        }
    }
}

/// Picks the first client preference that the server also supports.
///
/// ```rust
/// use tern_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
/// assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "aes256-ctr");
/// ```
///
/// # Errors
///
/// No common algorithm fails with a `KEY_EXCHANGE_FAILED` disconnect.
pub fn negotiate_algorithm(
    kind: &str,
    client_list: &[String],
    server_list: &[String],
) -> TernResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            DisconnectReason::KeyExchangeFailed.error(format!(
                "No common {} algorithm: client={:?}, server={:?}",
                kind, client_list, server_list
            ))
        })
}

/// Algorithms agreed for one key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method.
    pub kex: KexAlgorithm,
    /// Host key signature algorithm.
    pub host_key: SignatureAlgorithm,
    /// Cipher, client to server.
    pub cipher_c2s: CipherAlgorithm,
    /// Cipher, server to client.
    pub cipher_s2c: CipherAlgorithm,
    /// MAC, client to server.
    pub mac_c2s: MacAlgorithm,
    /// MAC, server to client.
    pub mac_s2c: MacAlgorithm,
    /// The server sent a guessed KEX packet using a method that lost the
    /// negotiation; that packet must be ignored.
    pub ignore_guessed_packet: bool,
}

impl Negotiated {
    /// Negotiates every algorithm category from the two KEXINIT messages.
    pub fn new(client: &KexInit, server: &KexInit) -> TernResult<Self> {
        let kex_name = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
        let host_key_name = negotiate_algorithm(
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?;
        let cipher_c2s = negotiate_algorithm(
            "cipher",
            &client.encryption_algorithms_client_to_server,
            &server.encryption_algorithms_client_to_server,
        )?;
        let cipher_s2c = negotiate_algorithm(
            "cipher",
            &client.encryption_algorithms_server_to_client,
            &server.encryption_algorithms_server_to_client,
        )?;
        let mac_c2s = negotiate_algorithm(
            "MAC",
            &client.mac_algorithms_client_to_server,
            &server.mac_algorithms_client_to_server,
        )?;
        let mac_s2c = negotiate_algorithm(
            "MAC",
            &client.mac_algorithms_server_to_client,
            &server.mac_algorithms_server_to_client,
        )?;
        negotiate_algorithm(
            "compression",
            &client.compression_algorithms_client_to_server,
            &server.compression_algorithms_client_to_server,
        )?;
        negotiate_algorithm(
            "compression",
            &client.compression_algorithms_server_to_client,
            &server.compression_algorithms_server_to_client,
        )?;

        let guess_right = server.kex_algorithms.first() == Some(&kex_name)
            && server.server_host_key_algorithms.first() == Some(&host_key_name);

        Ok(Self {
            kex: lookup(&kex_name, KexAlgorithm::from_name)?,
            host_key: lookup(&host_key_name, SignatureAlgorithm::from_name)?,
            cipher_c2s: lookup(&cipher_c2s, CipherAlgorithm::from_name)?,
            cipher_s2c: lookup(&cipher_s2c, CipherAlgorithm::from_name)?,
            mac_c2s: lookup(&mac_c2s, MacAlgorithm::from_name)?,
            mac_s2c: lookup(&mac_s2c, MacAlgorithm::from_name)?,
            ignore_guessed_packet: server.first_kex_packet_follows && !guess_right,
        })
    }
}

fn lookup<T>(name: &str, from_name: impl Fn(&str) -> Option<T>) -> TernResult<T> {
    from_name(name).ok_or_else(|| {
        DisconnectReason::KeyExchangeFailed.error(format!("Unsupported algorithm '{}'", name))
    })
}
