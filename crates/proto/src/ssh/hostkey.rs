//! Host keys and signatures (RFC 4253 Section 6.6, RFC 8332, RFC 8709).
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519
//! - `rsa-sha2-512` - RSA signature with SHA-512
//! - `rsa-sha2-256` - RSA signature with SHA-256
//! - `ssh-rsa` - RSA signature with SHA-1 (legacy servers)
//!
//! Verification is driven by the key blob's declared type: an RSA key accepts
//! any of the three RSA signature formats, an Ed25519 key only `ssh-ed25519`.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::hostkey::{verify_signature, Ed25519Signer, Signer};
//!
//! let signer = Ed25519Signer::from_bytes(&[7u8; 32]).unwrap();
//! let signature = signer.sign(b"exchange hash").unwrap();
//! verify_signature(&signer.public_key(), b"exchange hash", &signature).unwrap();
//! ```

use crate::ssh::buffer::Buffer;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use ring::signature::{
    RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tern_platform::{RandomSource, TernError, TernResult};
use zeroize::Zeroizing;

/// Signature algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// rsa-sha2-512
    RsaSha2_512,
    /// rsa-sha2-256
    RsaSha2_256,
    /// ssh-rsa (SHA-1)
    SshRsa,
}

impl SignatureAlgorithm {
    /// Supported algorithms in default preference order.
    pub const SUPPORTED: &'static [SignatureAlgorithm] = &[
        SignatureAlgorithm::SshEd25519,
        SignatureAlgorithm::RsaSha2_512,
        SignatureAlgorithm::RsaSha2_256,
        SignatureAlgorithm::SshRsa,
    ];

    /// Get the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            SignatureAlgorithm::SshEd25519 => "ssh-ed25519",
            SignatureAlgorithm::RsaSha2_512 => "rsa-sha2-512",
            SignatureAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            SignatureAlgorithm::SshRsa => "ssh-rsa",
        }
    }

    /// Parse algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::SUPPORTED.iter().copied().find(|a| a.name() == name)
    }

    /// Key type this signature algorithm is used with.
    pub fn key_type(&self) -> &'static str {
        match self {
            SignatureAlgorithm::SshEd25519 => "ssh-ed25519",
            _ => "ssh-rsa",
        }
    }
}

/// A public key decoded from its SSH wire blob.
#[derive(Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Ed25519 public key.
    Ed25519([u8; 32]),
    /// RSA public key (big-endian magnitudes).
    Rsa {
        /// Public exponent.
        e: Vec<u8>,
        /// Modulus.
        n: Vec<u8>,
    },
}

impl PublicKey {
    /// Decodes `string key_type || key data`.
    pub fn from_blob(blob: &[u8]) -> TernResult<Self> {
        let mut buf = Buffer::from(blob);
        let key_type = buf.read_string()?;
        match key_type.as_str() {
            "ssh-ed25519" => {
                let raw = buf.read_bytes()?;
                let key: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    TernError::Security("Ed25519 public key must be 32 bytes".to_string())
                })?;
                Ok(PublicKey::Ed25519(key))
            }
            "ssh-rsa" => {
                let e = buf.read_mpint_bytes()?;
                let n = buf.read_mpint_bytes()?;
                Ok(PublicKey::Rsa { e, n })
            }
            other => Err(TernError::Security(format!(
                "Unsupported host key type '{}'",
                other
            ))),
        }
    }

    /// Encodes the key as its SSH wire blob.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_str(self.key_type());
        match self {
            PublicKey::Ed25519(key) => {
                buf.put_bytes(key);
            }
            PublicKey::Rsa { e, n } => {
                buf.put_mpint_bytes(e).put_mpint_bytes(n);
            }
        }
        buf.into_vec()
    }

    /// Declared key type.
    pub fn key_type(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa { .. } => "ssh-rsa",
        }
    }

    /// OpenSSH style fingerprint, `SHA256:<base64>`.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_blob());
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("type", &self.key_type())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Verifies `string algorithm || string signature` over `data`.
///
/// # Errors
///
/// Returns [`TernError::Security`] when the signature format does not suit
/// the key type or the signature does not verify.
pub fn verify_signature(key: &PublicKey, data: &[u8], signature_blob: &[u8]) -> TernResult<()> {
    let mut buf = Buffer::from(signature_blob);
    let alg_name = buf.read_string()?;
    let signature = buf.read_bytes()?;

    let alg = SignatureAlgorithm::from_name(&alg_name).ok_or_else(|| {
        TernError::Security(format!("Unsupported signature algorithm '{}'", alg_name))
    })?;
    if alg.key_type() != key.key_type() {
        return Err(TernError::Security(format!(
            "Signature algorithm {} does not match key type {}",
            alg_name,
            key.key_type()
        )));
    }

    let verified = match key {
        PublicKey::Ed25519(raw) => {
            let verifying_key = VerifyingKey::from_bytes(raw)
                .map_err(|e| TernError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
            let sig: [u8; 64] = signature.as_slice().try_into().map_err(|_| {
                TernError::Security("Ed25519 signature must be 64 bytes".to_string())
            })?;
            verifying_key
                .verify(data, &Signature::from_bytes(&sig))
                .is_ok()
        }
        PublicKey::Rsa { e, n } => {
            let params = match alg {
                SignatureAlgorithm::RsaSha2_512 => &RSA_PKCS1_2048_8192_SHA512,
                SignatureAlgorithm::RsaSha2_256 => &RSA_PKCS1_2048_8192_SHA256,
                _ => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
            };
            RsaPublicKeyComponents { n, e }
                .verify(params, data, &signature)
                .is_ok()
        }
    };

    if verified {
        Ok(())
    } else {
        Err(TernError::Security(format!(
            "{} signature verification failed",
            alg_name
        )))
    }
}

/// Host key acceptance policy, consulted once the server has proven
/// possession of the key.
pub trait HostKeyVerifier: Send + Sync {
    /// Returns `true` to accept `key` for `host:port`.
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool;
}

/// Accepts every host key.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        tracing::warn!(host, port, fingerprint = %key.fingerprint(), "Accepting unverified host key");
        true
    }
}

/// Accepts host keys whose `SHA256:` fingerprint is in a fixed set.
#[derive(Debug, Clone, Default)]
pub struct FingerprintVerifier {
    fingerprints: HashSet<String>,
}

impl FingerprintVerifier {
    /// Creates a verifier from OpenSSH fingerprints.
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }
}

impl HostKeyVerifier for FingerprintVerifier {
    fn verify(&self, _host: &str, _port: u16, key: &PublicKey) -> bool {
        self.fingerprints.contains(&key.fingerprint())
    }
}

/// A private key able to produce SSH signatures.
pub trait Signer: Send + Sync {
    /// Signature algorithm used by [`sign`](Self::sign).
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Public half of the key.
    fn public_key(&self) -> PublicKey;

    /// Signs `data`, returning `string algorithm || string signature`.
    fn sign(&self, data: &[u8]) -> TernResult<Vec<u8>>;
}

/// Ed25519 signing key.
#[derive(Clone)]
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Generates a key from `random`.
    pub fn generate(random: &dyn RandomSource) -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        random.fill(&mut secret[..]);
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Creates a key from a 32-byte secret.
    pub fn from_bytes(secret: &[u8]) -> TernResult<Self> {
        let secret: Zeroizing<[u8; 32]> = Zeroizing::new(secret.try_into().map_err(|_| {
            TernError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?);
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }
}

impl Signer for Ed25519Signer {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::SshEd25519
    }

    fn public_key(&self) -> PublicKey {
        PublicKey::Ed25519(self.signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, data: &[u8]) -> TernResult<Vec<u8>> {
        use ed25519_dalek::Signer as _;

        let signature = self.signing_key.sign(data);
        let mut buf = Buffer::new();
        buf.put_str(self.algorithm().name())
            .put_bytes(&signature.to_bytes());
        Ok(buf.into_vec())
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &hex::encode(self.signing_key.verifying_key().as_bytes()))
            .finish_non_exhaustive()
    }
}
