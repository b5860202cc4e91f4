//! Diffie-Hellman key exchange engine (RFC 4253 Section 8, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - curve25519-sha256 and curve25519-sha256@libssh.com
//! - diffie-hellman-group14-sha256, diffie-hellman-group14-sha1
//! - diffie-hellman-group1-sha1
//!
//! The engine walks `Init -> WaitReply -> Verified | Failed`. It produces the
//! shared secret `K` and exchange hash `H`; [`derive_keys`] turns those into
//! per-direction session keys.
//!
//! # Security
//!
//! - Ephemeral secrets come from the injected [`RandomSource`]
//! - Group DH peer values are range checked, an all-zero X25519 result is rejected
//! - Shared secrets and session keys are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use tern_platform::SeededRandom;
//! use tern_proto::ssh::kex_dh::{KexAlgorithm, KexEngine, KexState};
//!
//! let mut engine = KexEngine::new(KexAlgorithm::Curve25519Sha256, &SeededRandom::new(1));
//! let init = engine.init_message();
//! assert_eq!(init[0], 30); // SSH_MSG_KEXDH_INIT / SSH_MSG_KEX_ECDH_INIT
//! assert_eq!(engine.state(), KexState::WaitReply);
//! ```

use crate::ssh::buffer::Buffer;
use crate::ssh::disconnect::DisconnectReason;
use crate::ssh::hostkey::{verify_signature, PublicKey};
use crate::ssh::kex::Negotiated;
use crate::ssh::message::MessageType;
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tern_platform::{RandomSource, TernError, TernResult};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

/// Oakley group 2 prime (1024-bit, RFC 2409).
static GROUP1_P: Lazy<BigUint> = Lazy::new(|| {
    prime_from_hex(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
         FFFFFFFFFFFFFFFF",
    )
});

/// Group 14 prime (2048-bit, RFC 3526).
static GROUP14_P: Lazy<BigUint> = Lazy::new(|| {
    prime_from_hex(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
         83655D23DCA3AD961C62F356208552BB9ED529077096966D\
         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
         DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
         15728E5A8AACAA68FFFFFFFFFFFFFFFF",
    )
});

fn prime_from_hex(hex_str: &str) -> BigUint {
    BigUint::from_bytes_be(&hex::decode(hex_str).expect("Invalid hex"))
}

/// Exchange hash strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                parts.iter().for_each(|p| hasher.update(p));
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                parts.iter().for_each(|p| hasher.update(p));
                hasher.finalize().to_vec()
            }
        }
    }
}

/// Key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexAlgorithm {
    /// curve25519-sha256 (RFC 8731)
    Curve25519Sha256,
    /// curve25519-sha256@libssh.com
    Curve25519Sha256Libssh,
    /// diffie-hellman-group14-sha256 (RFC 8268)
    DhGroup14Sha256,
    /// diffie-hellman-group14-sha1
    DhGroup14Sha1,
    /// diffie-hellman-group1-sha1
    DhGroup1Sha1,
}

impl KexAlgorithm {
    /// Supported methods in default preference order.
    pub const SUPPORTED: &'static [KexAlgorithm] = &[
        KexAlgorithm::Curve25519Sha256,
        KexAlgorithm::Curve25519Sha256Libssh,
        KexAlgorithm::DhGroup14Sha256,
        KexAlgorithm::DhGroup14Sha1,
        KexAlgorithm::DhGroup1Sha1,
    ];

    /// Algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            KexAlgorithm::Curve25519Sha256 => "curve25519-sha256",
            KexAlgorithm::Curve25519Sha256Libssh => "curve25519-sha256@libssh.com",
            KexAlgorithm::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
            KexAlgorithm::DhGroup14Sha1 => "diffie-hellman-group14-sha1",
            KexAlgorithm::DhGroup1Sha1 => "diffie-hellman-group1-sha1",
        }
    }

    /// Parses an algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::SUPPORTED.iter().copied().find(|k| k.name() == name)
    }

    /// Hash used for the exchange hash and key derivation.
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            KexAlgorithm::DhGroup14Sha1 | KexAlgorithm::DhGroup1Sha1 => HashAlgorithm::Sha1,
            _ => HashAlgorithm::Sha256,
        }
    }

    /// `true` for the elliptic curve methods, whose public values are
    /// encoded as strings rather than mpints.
    pub fn is_curve25519(&self) -> bool {
        matches!(
            self,
            KexAlgorithm::Curve25519Sha256 | KexAlgorithm::Curve25519Sha256Libssh
        )
    }

    fn prime(&self) -> Option<&'static BigUint> {
        match self {
            KexAlgorithm::DhGroup14Sha256 | KexAlgorithm::DhGroup14Sha1 => Some(&GROUP14_P),
            KexAlgorithm::DhGroup1Sha1 => Some(&GROUP1_P),
            _ => None,
        }
    }
}

/// Key exchange progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexState {
    /// Ephemeral key generated, nothing sent yet.
    Init,
    /// Public value sent, waiting for the server's reply.
    WaitReply,
    /// Reply processed and host signature verified.
    Verified,
    /// Reply rejected.
    Failed,
}

/// Transcript pieces hashed into `H` besides the exchanged values.
#[derive(Debug, Clone, Copy)]
pub struct KexContext<'a> {
    /// Client identification line without CR LF.
    pub client_version: &'a str,
    /// Server identification line without CR LF.
    pub server_version: &'a str,
    /// Client KEXINIT payload.
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload.
    pub server_kexinit: &'a [u8],
}

/// Result of a verified exchange.
pub struct KexOutput {
    /// Server host key.
    pub host_key: PublicKey,
    /// Shared secret `K` as an unsigned big-endian magnitude.
    pub shared_secret: Zeroizing<Vec<u8>>,
    /// Exchange hash `H`.
    pub exchange_hash: Vec<u8>,
}

impl std::fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexOutput")
            .field("host_key", &self.host_key)
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .finish_non_exhaustive()
    }
}

enum Ephemeral {
    Curve25519(StaticSecret),
    Dh {
        prime: &'static BigUint,
        secret: Zeroizing<Vec<u8>>,
    },
}

/// Client side of one key exchange.
pub struct KexEngine {
    algorithm: KexAlgorithm,
    state: KexState,
    ephemeral: Ephemeral,
    client_public: Vec<u8>,
}

impl KexEngine {
    /// Generates the ephemeral key pair for `algorithm`.
    pub fn new(algorithm: KexAlgorithm, random: &dyn RandomSource) -> Self {
        let (ephemeral, client_public) = match algorithm.prime() {
            None => {
                let mut bytes = Zeroizing::new([0u8; 32]);
                random.fill(&mut bytes[..]);
                let secret = StaticSecret::from(*bytes);
                let public = X25519Public::from(&secret).to_bytes().to_vec();
                (Ephemeral::Curve25519(secret), public)
            }
            Some(prime) => {
                // x in [2, p - 2]
                let mut bytes = Zeroizing::new(vec![0u8; (prime.bits() as usize + 7) / 8]);
                random.fill(&mut bytes);
                let x = BigUint::from_bytes_be(&bytes) % (prime.clone() - 3u32) + 2u32;
                let e = BigUint::from(2u32).modpow(&x, prime);
                (
                    Ephemeral::Dh {
                        prime,
                        secret: Zeroizing::new(x.to_bytes_be()),
                    },
                    e.to_bytes_be(),
                )
            }
        };

        Self {
            algorithm,
            state: KexState::Init,
            ephemeral,
            client_public,
        }
    }

    /// Negotiated method.
    pub fn algorithm(&self) -> KexAlgorithm {
        self.algorithm
    }

    /// Current state.
    pub fn state(&self) -> KexState {
        self.state
    }

    /// Client public value (`e` or `Q_C`).
    pub fn client_public(&self) -> &[u8] {
        &self.client_public
    }

    /// Builds the KEXDH_INIT / KEX_ECDH_INIT payload and moves to `WaitReply`.
    pub fn init_message(&mut self) -> Vec<u8> {
        let mut buf = Buffer::for_message(MessageType::KexdhInit);
        put_public(&mut buf, self.algorithm, &self.client_public);
        self.state = KexState::WaitReply;
        buf.into_vec()
    }

    /// Processes KEXDH_REPLY / KEX_ECDH_REPLY.
    ///
    /// # Errors
    ///
    /// Any failure moves the engine to `Failed` and returns a
    /// `KEY_EXCHANGE_FAILED` disconnect.
    pub fn handle_reply(&mut self, payload: &[u8], ctx: &KexContext<'_>) -> TernResult<KexOutput> {
        if self.state != KexState::WaitReply {
            return Err(DisconnectReason::ProtocolError
                .error(format!("Unexpected key exchange reply in state {:?}", self.state)));
        }

        match self.process_reply(payload, ctx) {
            Ok(output) => {
                self.state = KexState::Verified;
                Ok(output)
            }
            Err(err) => {
                self.state = KexState::Failed;
                Err(match err {
                    TernError::Disconnect { .. } => err,
                    other => DisconnectReason::KeyExchangeFailed.error(other.to_string()),
                })
            }
        }
    }

    fn process_reply(&self, payload: &[u8], ctx: &KexContext<'_>) -> TernResult<KexOutput> {
        let mut buf = Buffer::from(payload);
        let msg = buf.read_u8()?;
        if msg != MessageType::KexdhReply.code() {
            return Err(DisconnectReason::ProtocolError.error(format!(
                "Expected SSH_MSG_KEXDH_REPLY, got message {}",
                msg
            )));
        }

        let host_key_blob = buf.read_bytes()?;
        let server_public = if self.algorithm.is_curve25519() {
            buf.read_bytes()?
        } else {
            buf.read_mpint_bytes()?
        };
        let signature = buf.read_bytes()?;

        let host_key = PublicKey::from_blob(&host_key_blob)?;
        let shared_secret = self.shared_secret(&server_public)?;

        let exchange_hash = exchange_hash(
            self.algorithm,
            ctx,
            &host_key_blob,
            &self.client_public,
            &server_public,
            &shared_secret,
        );

        verify_signature(&host_key, &exchange_hash, &signature)?;

        tracing::debug!(
            algorithm = self.algorithm.name(),
            host_key = %host_key.fingerprint(),
            "Host signature verified"
        );

        Ok(KexOutput {
            host_key,
            shared_secret,
            exchange_hash,
        })
    }

    fn shared_secret(&self, server_public: &[u8]) -> TernResult<Zeroizing<Vec<u8>>> {
        match &self.ephemeral {
            Ephemeral::Curve25519(secret) => {
                let peer: [u8; 32] = server_public.try_into().map_err(|_| {
                    TernError::Security("Curve25519 public key must be 32 bytes".to_string())
                })?;
                let shared = secret.diffie_hellman(&X25519Public::from(peer));
                if !shared.was_contributory() {
                    return Err(TernError::Security(
                        "Curve25519 shared secret is all zero".to_string(),
                    ));
                }
                Ok(Zeroizing::new(shared.as_bytes().to_vec()))
            }
            Ephemeral::Dh { prime, secret } => {
                let f = BigUint::from_bytes_be(server_public);
                let p_minus_one = (*prime).clone() - 1u32;
                if f <= BigUint::from(1u32) || f >= p_minus_one {
                    return Err(TernError::Security(
                        "Invalid peer public key: out of range".to_string(),
                    ));
                }
                let x = BigUint::from_bytes_be(secret);
                Ok(Zeroizing::new(f.modpow(&x, prime).to_bytes_be()))
            }
        }
    }
}

impl std::fmt::Debug for KexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexEngine")
            .field("algorithm", &self.algorithm)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn put_public(buf: &mut Buffer, algorithm: KexAlgorithm, value: &[u8]) {
    if algorithm.is_curve25519() {
        buf.put_bytes(value);
    } else {
        buf.put_mpint_bytes(value);
    }
}

/// Computes the exchange hash
/// `HASH(V_C || V_S || I_C || I_S || K_S || e || f || K)`.
///
/// DH public values are encoded as mpints, curve25519 values as strings; `K`
/// is always an mpint.
pub fn exchange_hash(
    algorithm: KexAlgorithm,
    ctx: &KexContext<'_>,
    host_key_blob: &[u8],
    client_public: &[u8],
    server_public: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut buf = Buffer::new();
    buf.put_str(ctx.client_version)
        .put_str(ctx.server_version)
        .put_bytes(ctx.client_kexinit)
        .put_bytes(ctx.server_kexinit)
        .put_bytes(host_key_blob);
    put_public(&mut buf, algorithm, client_public);
    put_public(&mut buf, algorithm, server_public);
    buf.put_mpint_bytes(shared_secret);
    algorithm.hash().digest(&[buf.as_slice()])
}

/// Derives one key: `HASH(K || H || letter || session_id)`, extended with
/// `HASH(K || H || K1 || K2 ...)` until `len` bytes are available.
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    len: usize,
) -> Zeroizing<Vec<u8>> {
    let mut k = Buffer::new();
    k.put_mpint_bytes(shared_secret);
    let k = Zeroizing::new(k.into_vec());

    let mut key = Zeroizing::new(hash.digest(&[k.as_slice(), exchange_hash, &[letter][..], session_id]));
    while key.len() < len {
        let block = hash.digest(&[k.as_slice(), exchange_hash, key.as_slice()]);
        key.extend_from_slice(&block);
    }
    key.truncate(len);
    key
}

/// Keys for both directions of one key exchange.
pub struct SessionKeys {
    /// IV client to server ("A").
    pub iv_c2s: Zeroizing<Vec<u8>>,
    /// IV server to client ("B").
    pub iv_s2c: Zeroizing<Vec<u8>>,
    /// Cipher key client to server ("C").
    pub enc_c2s: Zeroizing<Vec<u8>>,
    /// Cipher key server to client ("D").
    pub enc_s2c: Zeroizing<Vec<u8>>,
    /// MAC key client to server ("E").
    pub mac_c2s: Zeroizing<Vec<u8>>,
    /// MAC key server to client ("F").
    pub mac_s2c: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys([REDACTED])")
    }
}

/// Derives the six session keys sized for the negotiated algorithms.
pub fn derive_keys(
    negotiated: &Negotiated,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
) -> SessionKeys {
    let hash = negotiated.kex.hash();
    let derive =
        |letter: u8, len: usize| derive_key(hash, shared_secret, exchange_hash, letter, session_id, len);

    SessionKeys {
        iv_c2s: derive(b'A', negotiated.cipher_c2s.iv_size()),
        iv_s2c: derive(b'B', negotiated.cipher_s2c.iv_size()),
        enc_c2s: derive(b'C', negotiated.cipher_c2s.key_size()),
        enc_s2c: derive(b'D', negotiated.cipher_s2c.key_size()),
        mac_c2s: derive(b'E', negotiated.mac_c2s.key_size()),
        mac_s2c: derive(b'F', negotiated.mac_s2c.key_size()),
    }
}
