//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (over sequence_number || unencrypted packet)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does NOT include `mac` or the length field itself
//! - `padding_length` is at least 4 and at most 255
//! - `packet_length + 4` is a multiple of the cipher block size (at least 8)
//! - Packets are at least 16 bytes and at most 35000 bytes
//!
//! # Security
//!
//! - The MAC is verified before any payload byte is handed out; a mismatch is
//!   a fatal `MAC_ERROR`, never a warning.
//! - Only the first cipher block is decrypted before the length is validated.
//! - Padding comes from the injected [`RandomSource`](tern_platform::RandomSource).
//!
//! Each direction owns its own codec: [`Encoder`] for outgoing packets and
//! [`Decoder`] for incoming ones. Both carry their direction's sequence
//! number and swap cipher/MAC independently on NEWKEYS.
//!
//! # Example
//!
//! ```rust
//! use tern_platform::OsRandom;
//! use tern_proto::ssh::packet::{Decoder, Encoder};
//!
//! let mut encoder = Encoder::new(OsRandom::shared());
//! let mut decoder = Decoder::new();
//!
//! let wire = encoder.encode(b"\x05payload").unwrap();
//! decoder.feed(&wire);
//!
//! let packet = decoder.next_packet().unwrap().unwrap();
//! assert_eq!(packet.payload, b"\x05payload");
//! assert_eq!(packet.seq, 0);
//! ```

use crate::ssh::crypto::{Cipher, Mac, NoCipher};
use crate::ssh::disconnect::DisconnectReason;
use bytes::BytesMut;
use tern_platform::{SharedRandom, TernError, TernResult};
use tracing::trace;

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum packet size in bytes, length field included.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Smallest alignment, used by the `none` cipher.
const MIN_BLOCK_SIZE: usize = 8;

/// Computes the padding length for a payload.
///
/// The result is at least [`MIN_PADDING_LEN`], aligns
/// `4 + 1 + payload + padding` to `block_size` and keeps the packet at or
/// above [`MIN_PACKET_SIZE`].
pub fn padding_len(payload_len: usize, block_size: usize) -> usize {
    let block_size = block_size.max(MIN_BLOCK_SIZE);
    let unpadded = 5 + payload_len;

    let mut padding = block_size - (unpadded % block_size);
    if padding < MIN_PADDING_LEN {
        padding += block_size;
    }
    while unpadded + padding < MIN_PACKET_SIZE {
        padding += block_size;
    }
    padding
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number the packet was received with.
    pub seq: u32,
    /// Message payload; the first byte is the message number.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Message number, if the payload is not empty.
    pub fn message_code(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Outgoing half of the packet codec.
pub struct Encoder {
    cipher: Box<dyn Cipher>,
    mac: Option<Box<dyn Mac>>,
    seq: u32,
    rng: SharedRandom,
}

impl Encoder {
    /// Creates an encoder with no encryption and no MAC.
    pub fn new(rng: SharedRandom) -> Self {
        Self {
            cipher: Box::new(NoCipher),
            mac: None,
            seq: 0,
            rng,
        }
    }

    /// Installs new keys; applies from the next packet on.
    pub fn set_keys(&mut self, cipher: Box<dyn Cipher>, mac: Option<Box<dyn Mac>>) {
        self.cipher = cipher;
        self.mac = mac;
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// Frames, pads, authenticates and encrypts one payload.
    pub fn encode(&mut self, payload: &[u8]) -> TernResult<Vec<u8>> {
        let block_size = self.cipher.block_size();
        let padding = padding_len(payload.len(), block_size);
        let packet_len = 1 + payload.len() + padding;

        if 4 + packet_len > MAX_PACKET_SIZE {
            return Err(TernError::Protocol(format!(
                "Packet size {} exceeds maximum {}",
                4 + packet_len,
                MAX_PACKET_SIZE
            )));
        }

        let mac_size = self.mac.as_ref().map_or(0, |m| m.size());
        let mut out = Vec::with_capacity(4 + packet_len + mac_size);
        out.extend_from_slice(&(packet_len as u32).to_be_bytes());
        out.push(padding as u8);
        out.extend_from_slice(payload);

        let pad_start = out.len();
        out.resize(pad_start + padding, 0);
        self.rng.fill(&mut out[pad_start..]);

        let tag = self.mac.as_ref().map(|m| m.sign(self.seq, &out));
        self.cipher.apply(&mut out);
        if let Some(tag) = tag {
            out.extend_from_slice(&tag);
        }

        trace!(seq = self.seq, len = packet_len, "encoded packet");
        self.seq = self.seq.wrapping_add(1);
        Ok(out)
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("seq", &self.seq)
            .field("mac", &self.mac.is_some())
            .finish_non_exhaustive()
    }
}

/// First block of a packet that has been decrypted and length-checked.
struct PartialPacket {
    plain: Vec<u8>,
    packet_len: usize,
}

/// Incoming half of the packet codec.
///
/// Bytes are fed in as they arrive; [`Decoder::next_packet`] yields complete
/// packets one at a time. Ciphertext is only decrypted when the packet it
/// belongs to is requested, so keys installed between two calls apply to
/// every later packet.
pub struct Decoder {
    cipher: Box<dyn Cipher>,
    mac: Option<Box<dyn Mac>>,
    seq: u32,
    input: BytesMut,
    partial: Option<PartialPacket>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    /// Creates a decoder with no encryption and no MAC.
    pub fn new() -> Self {
        Self {
            cipher: Box::new(NoCipher),
            mac: None,
            seq: 0,
            input: BytesMut::with_capacity(8 * 1024),
            partial: None,
        }
    }

    /// Installs new keys; applies from the next packet on.
    pub fn set_keys(&mut self, cipher: Box<dyn Cipher>, mac: Option<Box<dyn Mac>>) {
        self.cipher = cipher;
        self.mac = mac;
    }

    /// Sequence number the next packet is expected to carry.
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// Appends raw bytes read from the stream.
    pub fn feed(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
    }

    /// Buffer to read stream bytes into directly.
    pub fn input_mut(&mut self) -> &mut BytesMut {
        &mut self.input
    }

    /// Returns the next complete packet, or `None` if more bytes are needed.
    pub fn next_packet(&mut self) -> TernResult<Option<Packet>> {
        let block_size = self.cipher.block_size().max(MIN_BLOCK_SIZE);

        if self.partial.is_none() {
            if self.input.len() < block_size {
                return Ok(None);
            }
            let mut first = self.input.split_to(block_size).to_vec();
            self.cipher.apply(&mut first);

            let packet_len = u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;
            check_packet_len(packet_len, block_size)?;

            self.partial = Some(PartialPacket {
                plain: first,
                packet_len,
            });
        }

        let (rest_len, mac_size) = match &self.partial {
            Some(p) => (
                4 + p.packet_len - p.plain.len(),
                self.mac.as_ref().map_or(0, |m| m.size()),
            ),
            None => return Ok(None),
        };
        if self.input.len() < rest_len + mac_size {
            return Ok(None);
        }

        let PartialPacket {
            mut plain,
            packet_len,
        } = match self.partial.take() {
            Some(p) => p,
            None => return Ok(None),
        };

        let mut rest = self.input.split_to(rest_len).to_vec();
        self.cipher.apply(&mut rest);
        plain.extend_from_slice(&rest);

        if let Some(mac) = &self.mac {
            let tag = self.input.split_to(mac_size);
            if !mac.verify(self.seq, &plain, &tag) {
                return Err(DisconnectReason::MacError.error(format!(
                    "MAC verification failed for packet {}",
                    self.seq
                )));
            }
        }

        let padding = plain[4] as usize;
        if padding < MIN_PADDING_LEN {
            return Err(DisconnectReason::ProtocolError
                .error(format!("Padding too short: {} bytes", padding)));
        }
        if padding + 1 > packet_len {
            return Err(DisconnectReason::ProtocolError.error(format!(
                "Padding length {} exceeds packet length {}",
                padding, packet_len
            )));
        }

        let payload = plain[5..4 + packet_len - padding].to_vec();
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        trace!(seq, len = packet_len, "decoded packet");
        Ok(Some(Packet { seq, payload }))
    }
}

fn check_packet_len(packet_len: usize, block_size: usize) -> TernResult<()> {
    if packet_len + 4 < MIN_PACKET_SIZE {
        return Err(DisconnectReason::ProtocolError
            .error(format!("Packet too short: {} bytes", packet_len)));
    }
    if packet_len + 4 > MAX_PACKET_SIZE {
        return Err(DisconnectReason::ProtocolError.error(format!(
            "Packet too large: {} bytes (max {})",
            packet_len, MAX_PACKET_SIZE
        )));
    }
    if (packet_len + 4) % block_size != 0 {
        return Err(DisconnectReason::ProtocolError.error(format!(
            "Packet length {} not aligned to block size {}",
            packet_len, block_size
        )));
    }
    Ok(())
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("seq", &self.seq)
            .field("buffered", &self.input.len())
            .field("mac", &self.mac.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
    use tern_platform::SeededRandom;

    fn keyed_pair() -> (Encoder, Decoder) {
        let key = [3u8; 16];
        let iv = [4u8; 16];
        let mac_key = [5u8; 32];

        let mut enc = Encoder::new(SeededRandom::shared(1));
        enc.set_keys(
            CipherAlgorithm::Aes128Ctr.create(&key, &iv).unwrap(),
            Some(MacAlgorithm::HmacSha256.create(&mac_key).unwrap()),
        );
        let mut dec = Decoder::new();
        dec.set_keys(
            CipherAlgorithm::Aes128Ctr.create(&key, &iv).unwrap(),
            Some(MacAlgorithm::HmacSha256.create(&mac_key).unwrap()),
        );
        (enc, dec)
    }

    #[test]
    fn test_padding_alignment() {
        for len in 0..100 {
            for block in [8usize, 16] {
                let padding = padding_len(len, block);
                assert!(padding >= MIN_PADDING_LEN);
                assert!(padding <= MAX_PADDING_LEN);
                assert_eq!((5 + len + padding) % block, 0);
                assert!(5 + len + padding >= MIN_PACKET_SIZE);
            }
        }
    }

    #[test]
    fn test_packet_minimum_size() {
        let mut enc = Encoder::new(SeededRandom::shared(1));
        let wire = enc.encode(b"\x02").unwrap();
        assert_eq!(wire.len(), MIN_PACKET_SIZE);
    }

    #[test]
    fn test_plain_round_trip() {
        let mut enc = Encoder::new(SeededRandom::shared(1));
        let mut dec = Decoder::new();

        let wire = enc.encode(b"\x14hello").unwrap();
        dec.feed(&wire);

        let packet = dec.next_packet().unwrap().unwrap();
        assert_eq!(packet.payload, b"\x14hello");
        assert_eq!(packet.message_code(), Some(0x14));
        assert!(dec.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_encrypted_round_trip_in_fragments() {
        let (mut enc, mut dec) = keyed_pair();

        let mut wire = enc.encode(b"\x5efirst").unwrap();
        wire.extend(enc.encode(&[0x5e; 300]).unwrap());

        // feed one byte at a time to exercise partial reads
        let mut packets = Vec::new();
        for byte in wire {
            dec.feed(&[byte]);
            while let Some(p) = dec.next_packet().unwrap() {
                packets.push(p);
            }
        }

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload, b"\x5efirst");
        assert_eq!(packets[0].seq, 0);
        assert_eq!(packets[1].payload, vec![0x5e; 300]);
        assert_eq!(packets[1].seq, 1);
        assert_eq!(dec.sequence(), 2);
    }

    #[test]
    fn test_mac_mismatch_is_fatal() {
        let (mut enc, mut dec) = keyed_pair();
        let mut wire = enc.encode(b"\x5edata").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        dec.feed(&wire);
        match dec.next_packet() {
            Err(TernError::Disconnect { code, .. }) => {
                assert_eq!(code, DisconnectReason::MacError.code())
            }
            other => panic!("expected MAC error, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_mismatch_fails_mac() {
        let (mut enc, mut dec) = keyed_pair();
        // encoder skips a packet the decoder never sees
        let _lost = enc.encode(b"\x02lost").unwrap();
        let wire = enc.encode(b"\x02kept").unwrap();

        dec.feed(&wire);
        assert!(dec.next_packet().is_err());
    }

    #[test]
    fn test_invalid_too_short() {
        let mut dec = Decoder::new();
        dec.feed(&[0, 0, 0, 4, 4, 0, 0, 0]);
        assert!(matches!(
            dec.next_packet(),
            Err(TernError::Disconnect { code: 2, .. })
        ));
    }

    #[test]
    fn test_invalid_too_large() {
        let mut dec = Decoder::new();
        dec.feed(&[0, 1, 0, 0, 4, 0, 0, 0]);
        assert!(dec.next_packet().is_err());
    }

    #[test]
    fn test_invalid_padding_too_short() {
        let mut dec = Decoder::new();
        // packet_length 12, padding_length 2
        let mut wire = vec![0, 0, 0, 12, 2];
        wire.extend_from_slice(&[0u8; 11]);
        dec.feed(&wire);
        assert!(dec.next_packet().is_err());
    }

    #[test]
    fn test_incomplete_waits_for_more() {
        let mut enc = Encoder::new(SeededRandom::shared(2));
        let wire = enc.encode(b"\x02incomplete").unwrap();

        let mut dec = Decoder::new();
        dec.feed(&wire[..wire.len() - 1]);
        assert!(dec.next_packet().unwrap().is_none());
        dec.feed(&wire[wire.len() - 1..]);
        assert!(dec.next_packet().unwrap().is_some());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut enc = Encoder::new(SeededRandom::shared(3));
        assert!(matches!(
            enc.encode(&vec![0u8; MAX_PACKET_SIZE]),
            Err(TernError::Protocol(_))
        ));
    }

    #[test]
    fn test_sequence_wraps() {
        let mut enc = Encoder::new(SeededRandom::shared(4));
        enc.seq = u32::MAX;
        enc.encode(b"\x02").unwrap();
        assert_eq!(enc.sequence(), 0);
    }
}
