//! Named cipher and MAC strategies.
//!
//! The transport treats encryption and integrity as opaque strategies picked
//! by the names negotiated in KEXINIT:
//!
//! - ciphers: `none`, `aes128-ctr`, `aes192-ctr`, `aes256-ctr`
//! - MACs: `hmac-sha1`, `hmac-sha2-256`, `hmac-sha2-512`
//!
//! A [`Cipher`] transforms bytes in place and keeps its own keystream state
//! across packets. A [`Mac`] authenticates `sequence_number || packet` and
//! compares tags in constant time.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
//!
//! let alg = CipherAlgorithm::from_name("aes128-ctr").unwrap();
//! let mut enc = alg.create(&[7u8; 16], &[1u8; 16]).unwrap();
//! let mut dec = alg.create(&[7u8; 16], &[1u8; 16]).unwrap();
//!
//! let mut data = b"sixteen byte msg".to_vec();
//! enc.apply(&mut data);
//! dec.apply(&mut data);
//! assert_eq!(data, b"sixteen byte msg");
//!
//! let mac = MacAlgorithm::HmacSha256.create(&[9u8; 32]).unwrap();
//! let tag = mac.sign(3, b"packet");
//! assert!(mac.verify(3, b"packet", &tag));
//! ```

use aes::{Aes128, Aes192, Aes256};
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac as _};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tern_platform::{TernError, TernResult};

/// Symmetric cipher applied to whole packets.
pub trait Cipher: Send {
    /// Cipher block size; packets are padded to a multiple of it.
    fn block_size(&self) -> usize;

    /// Encrypts or decrypts `data` in place.
    fn apply(&mut self, data: &mut [u8]);
}

/// Message authentication code over `sequence_number || packet`.
pub trait Mac: Send + Sync {
    /// Tag length in bytes.
    fn size(&self) -> usize;

    /// Computes the tag for `packet` sent with sequence number `seq`.
    fn sign(&self, seq: u32, packet: &[u8]) -> Vec<u8>;

    /// Checks `tag` in constant time.
    fn verify(&self, seq: u32, packet: &[u8], tag: &[u8]) -> bool {
        let expected = self.sign(seq, packet);
        expected.len() == tag.len() && bool::from(expected.ct_eq(tag))
    }
}

/// Cipher algorithms this implementation can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// No encryption; only valid before the first key exchange.
    None,
    /// AES-128 in counter mode (RFC 4344)
    Aes128Ctr,
    /// AES-192 in counter mode
    Aes192Ctr,
    /// AES-256 in counter mode
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// All negotiable ciphers in default preference order.
    pub const SUPPORTED: &'static [CipherAlgorithm] = &[
        CipherAlgorithm::Aes128Ctr,
        CipherAlgorithm::Aes192Ctr,
        CipherAlgorithm::Aes256Ctr,
    ];

    /// Returns the algorithm name used in KEXINIT.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Parses an algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CipherAlgorithm::None),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes192-ctr" => Some(CipherAlgorithm::Aes192Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            _ => None,
        }
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes192Ctr => 24,
            CipherAlgorithm::Aes256Ctr => 32,
        }
    }

    /// IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            _ => 16,
        }
    }

    /// Builds the cipher from derived key material. Longer material is
    /// truncated to the algorithm sizes.
    pub fn create(&self, key: &[u8], iv: &[u8]) -> TernResult<Box<dyn Cipher>> {
        if key.len() < self.key_size() || iv.len() < self.iv_size() {
            return Err(TernError::Security(format!(
                "Insufficient key material for {}: need {}+{} bytes, got {}+{}",
                self.name(),
                self.key_size(),
                self.iv_size(),
                key.len(),
                iv.len()
            )));
        }

        let key = &key[..self.key_size()];
        let iv = &iv[..self.iv_size()];
        let invalid = |_| TernError::Security(format!("Invalid key for {}", self.name()));

        Ok(match self {
            CipherAlgorithm::None => Box::new(NoCipher),
            CipherAlgorithm::Aes128Ctr => Box::new(AesCtr::Aes128(
                Ctr128BE::<Aes128>::new_from_slices(key, iv).map_err(invalid)?,
            )),
            CipherAlgorithm::Aes192Ctr => Box::new(AesCtr::Aes192(
                Ctr128BE::<Aes192>::new_from_slices(key, iv).map_err(invalid)?,
            )),
            CipherAlgorithm::Aes256Ctr => Box::new(AesCtr::Aes256(
                Ctr128BE::<Aes256>::new_from_slices(key, iv).map_err(invalid)?,
            )),
        })
    }
}

/// Identity cipher used before the first NEWKEYS.
#[derive(Debug, Default)]
pub struct NoCipher;

impl Cipher for NoCipher {
    fn block_size(&self) -> usize {
        8
    }

    fn apply(&mut self, _data: &mut [u8]) {}
}

enum AesCtr {
    Aes128(Ctr128BE<Aes128>),
    Aes192(Ctr128BE<Aes192>),
    Aes256(Ctr128BE<Aes256>),
}

impl Cipher for AesCtr {
    fn block_size(&self) -> usize {
        16
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            AesCtr::Aes128(c) => c.apply_keystream(data),
            AesCtr::Aes192(c) => c.apply_keystream(data),
            AesCtr::Aes256(c) => c.apply_keystream(data),
        }
    }
}

/// MAC algorithms this implementation can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA1 (RFC 4253)
    HmacSha1,
    /// HMAC-SHA2-256 (RFC 6668)
    HmacSha256,
    /// HMAC-SHA2-512 (RFC 6668)
    HmacSha512,
}

impl MacAlgorithm {
    /// All negotiable MACs in default preference order.
    pub const SUPPORTED: &'static [MacAlgorithm] = &[
        MacAlgorithm::HmacSha256,
        MacAlgorithm::HmacSha512,
        MacAlgorithm::HmacSha1,
    ];

    /// Returns the algorithm name used in KEXINIT.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Parses an algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Tag size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Builds the MAC from derived key material.
    pub fn create(&self, key_material: &[u8]) -> TernResult<Box<dyn Mac>> {
        if key_material.len() < self.key_size() {
            return Err(TernError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                self.key_size(),
                key_material.len()
            )));
        }

        let key = &key_material[..self.key_size()];
        let invalid = |_| TernError::Security(format!("Invalid key for {}", self.name()));

        Ok(Box::new(match self {
            MacAlgorithm::HmacSha1 => {
                HmacKey::Sha1(Hmac::<Sha1>::new_from_slice(key).map_err(invalid)?)
            }
            MacAlgorithm::HmacSha256 => {
                HmacKey::Sha256(Hmac::<Sha256>::new_from_slice(key).map_err(invalid)?)
            }
            MacAlgorithm::HmacSha512 => {
                HmacKey::Sha512(Hmac::<Sha512>::new_from_slice(key).map_err(invalid)?)
            }
        }))
    }
}

/// Keyed HMAC state; cloned per packet so the key is absorbed only once.
#[derive(Clone)]
enum HmacKey {
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

fn hmac_tag<M: hmac::Mac + Clone>(keyed: &M, seq: u32, packet: &[u8]) -> Vec<u8> {
    let mut mac = keyed.clone();
    mac.update(&seq.to_be_bytes());
    mac.update(packet);
    mac.finalize().into_bytes().to_vec()
}

impl Mac for HmacKey {
    fn size(&self) -> usize {
        match self {
            HmacKey::Sha1(_) => 20,
            HmacKey::Sha256(_) => 32,
            HmacKey::Sha512(_) => 64,
        }
    }

    fn sign(&self, seq: u32, packet: &[u8]) -> Vec<u8> {
        match self {
            HmacKey::Sha1(k) => hmac_tag(k, seq, packet),
            HmacKey::Sha256(k) => hmac_tag(k, seq, packet),
            HmacKey::Sha512(k) => hmac_tag(k, seq, packet),
        }
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacKey")
            .field("size", &self.size())
            .field("key", &"<redacted>")
            .finish()
    }
}
