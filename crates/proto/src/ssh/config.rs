//! Client configuration.
//!
//! [`SshConfig`] collects algorithm preferences, timeouts, re-key policy and
//! channel sizing. Build it with [`SshConfig::builder`] or start from
//! `SshConfig::default()` and adjust fields directly.
//!
//! ```rust
//! use std::time::Duration;
//! use tern_proto::ssh::config::SshConfig;
//!
//! let config = SshConfig::builder()
//!     .with_timeout(Duration::from_secs(5))
//!     .with_ciphers(vec!["aes256-ctr".into()])
//!     .build()
//!     .unwrap();
//! assert_eq!(config.ciphers, vec!["aes256-ctr".to_string()]);
//! ```

use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::hostkey::SignatureAlgorithm;
use crate::ssh::kex_dh::KexAlgorithm;
use crate::ssh::packet::MAX_PACKET_SIZE;
use std::fmt;
use std::time::Duration;
use tern_platform::{OsRandom, SharedRandom, TernError, TernResult};

/// Default initial channel window (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum channel packet size (32 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Room reserved for channel message headers inside a transport packet.
const CHANNEL_HEADER_ROOM: usize = 1024;

/// SSH client configuration.
#[derive(Clone)]
pub struct SshConfig {
    /// Software part of the identification string.
    pub software_version: String,
    /// Key exchange algorithms, most preferred first.
    pub kex_algorithms: Vec<String>,
    /// Host key algorithms, most preferred first.
    pub host_key_algorithms: Vec<String>,
    /// Ciphers, most preferred first (used for both directions).
    pub ciphers: Vec<String>,
    /// MACs, most preferred first (used for both directions).
    pub macs: Vec<String>,
    /// Compression algorithms; only `none` is implemented.
    pub compression: Vec<String>,
    /// Upper bound on every blocking wait.
    pub timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Re-key after this many bytes in either direction.
    pub rekey_bytes_limit: u64,
    /// Re-key after this much time.
    pub rekey_time_limit: Duration,
    /// Interval for `SSH_MSG_IGNORE` keepalives, if any.
    pub keepalive_interval: Option<Duration>,
    /// Initial local window advertised for each channel.
    pub window_size: u32,
    /// Largest data packet accepted on each channel.
    pub max_packet_size: u32,
    /// Randomness for padding, cookies and ephemeral keys.
    pub random: SharedRandom,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            software_version: format!("Tern_{}", env!("CARGO_PKG_VERSION")),
            kex_algorithms: KexAlgorithm::SUPPORTED
                .iter()
                .map(|k| k.name().to_string())
                .collect(),
            host_key_algorithms: SignatureAlgorithm::SUPPORTED
                .iter()
                .map(|s| s.name().to_string())
                .collect(),
            ciphers: CipherAlgorithm::SUPPORTED
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            macs: MacAlgorithm::SUPPORTED
                .iter()
                .map(|m| m.name().to_string())
                .collect(),
            compression: vec!["none".to_string()],
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            rekey_bytes_limit: 1 << 30,
            rekey_time_limit: Duration::from_secs(3600),
            keepalive_interval: None,
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            random: OsRandom::shared(),
        }
    }
}

impl SshConfig {
    /// Creates a builder starting from the defaults.
    pub fn builder() -> SshConfigBuilder {
        SshConfigBuilder::new()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> TernResult<()> {
        if self.software_version.is_empty()
            || self
                .software_version
                .chars()
                .any(|c| c.is_whitespace() || c == '-' || c.is_control())
        {
            return Err(TernError::Config(format!(
                "Invalid software version '{}'",
                self.software_version
            )));
        }

        check_names("key exchange", &self.kex_algorithms, |n| {
            KexAlgorithm::from_name(n).is_some()
        })?;
        check_names("host key", &self.host_key_algorithms, |n| {
            SignatureAlgorithm::from_name(n).is_some()
        })?;
        check_names("cipher", &self.ciphers, |n| {
            CipherAlgorithm::from_name(n).is_some()
        })?;
        check_names("MAC", &self.macs, |n| MacAlgorithm::from_name(n).is_some())?;
        check_names("compression", &self.compression, |n| n == "none")?;

        if self.timeout.is_zero() {
            return Err(TernError::Config("timeout cannot be zero".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(TernError::Config("connect_timeout cannot be zero".into()));
        }
        if self.rekey_bytes_limit == 0 || self.rekey_time_limit.is_zero() {
            return Err(TernError::Config("re-key limits cannot be zero".into()));
        }
        if self.keepalive_interval.map_or(false, |d| d.is_zero()) {
            return Err(TernError::Config("keepalive_interval cannot be zero".into()));
        }
        if self.window_size == 0 {
            return Err(TernError::Config("window_size cannot be zero".into()));
        }
        if self.max_packet_size == 0
            || self.max_packet_size as usize + CHANNEL_HEADER_ROOM > MAX_PACKET_SIZE
        {
            return Err(TernError::Config(format!(
                "max_packet_size must be between 1 and {}",
                MAX_PACKET_SIZE - CHANNEL_HEADER_ROOM
            )));
        }
        Ok(())
    }
}

fn check_names(kind: &str, names: &[String], known: impl Fn(&str) -> bool) -> TernResult<()> {
    if names.is_empty() {
        return Err(TernError::Config(format!(
            "At least one {} algorithm required",
            kind
        )));
    }
    match names.iter().find(|n| !known(n)) {
        Some(unknown) => Err(TernError::Config(format!(
            "Unsupported {} algorithm '{}'",
            kind, unknown
        ))),
        None => Ok(()),
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("software_version", &self.software_version)
            .field("kex_algorithms", &self.kex_algorithms)
            .field("host_key_algorithms", &self.host_key_algorithms)
            .field("ciphers", &self.ciphers)
            .field("macs", &self.macs)
            .field("timeout", &self.timeout)
            .field("rekey_bytes_limit", &self.rekey_bytes_limit)
            .field("rekey_time_limit", &self.rekey_time_limit)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("window_size", &self.window_size)
            .field("max_packet_size", &self.max_packet_size)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SshConfig`].
#[derive(Debug, Default)]
pub struct SshConfigBuilder {
    config: SshConfig,
}

impl SshConfigBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the software version.
    pub fn with_software_version(mut self, version: impl Into<String>) -> Self {
        self.config.software_version = version.into();
        self
    }

    /// Sets key exchange preferences.
    pub fn with_kex_algorithms(mut self, names: Vec<String>) -> Self {
        self.config.kex_algorithms = names;
        self
    }

    /// Sets host key preferences.
    pub fn with_host_key_algorithms(mut self, names: Vec<String>) -> Self {
        self.config.host_key_algorithms = names;
        self
    }

    /// Sets cipher preferences.
    pub fn with_ciphers(mut self, names: Vec<String>) -> Self {
        self.config.ciphers = names;
        self
    }

    /// Sets MAC preferences.
    pub fn with_macs(mut self, names: Vec<String>) -> Self {
        self.config.macs = names;
        self
    }

    /// Sets the bound on blocking waits.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Sets the TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the re-key thresholds.
    pub fn with_rekey_limits(mut self, bytes: u64, time: Duration) -> Self {
        self.config.rekey_bytes_limit = bytes;
        self.config.rekey_time_limit = time;
        self
    }

    /// Enables keepalives.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = Some(interval);
        self
    }

    /// Sets the channel window and packet sizes.
    pub fn with_channel_limits(mut self, window_size: u32, max_packet_size: u32) -> Self {
        self.config.window_size = window_size;
        self.config.max_packet_size = max_packet_size;
        self
    }

    /// Sets the randomness provider.
    pub fn with_random(mut self, random: SharedRandom) -> Self {
        self.config.random = random;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> TernResult<SshConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
