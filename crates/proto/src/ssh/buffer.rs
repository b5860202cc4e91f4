//! SSH wire buffer (RFC 4251 Section 5).
//!
//! [`Buffer`] is a growable byte buffer with independent read and write
//! cursors and typed accessors for every SSH data type:
//!
//! ```text
//! boolean   1 byte, 0 = false
//! byte      1 byte
//! uint32    4 bytes big-endian
//! uint64    8 bytes big-endian
//! string    uint32 length + bytes
//! mpint     string holding a two's complement big-endian integer
//! name-list string holding comma separated names
//! ```
//!
//! Reads never zero-fill: reading past the write cursor fails with
//! [`TernError::Underflow`]. A failed read leaves the read cursor where it
//! was, even when a length prefix had already been consumed.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::buffer::Buffer;
//!
//! let mut buf = Buffer::new();
//! buf.put_str("ssh-userauth").put_u32(7);
//!
//! assert_eq!(buf.read_string().unwrap(), "ssh-userauth");
//! assert_eq!(buf.read_u32().unwrap(), 7);
//! assert!(buf.read_u8().is_err());
//! ```

use crate::ssh::message::MessageType;
use num_bigint::BigUint;
use tern_platform::{TernError, TernResult};
use zeroize::Zeroize;

/// Byte buffer with read/write cursors.
///
/// Invariant: `rpos <= wpos <= capacity`. The write cursor is always the end
/// of the stored bytes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    rpos: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            rpos: 0,
        }
    }

    /// Creates a buffer whose first byte is the message number.
    pub fn for_message(msg: MessageType) -> Self {
        let mut buf = Self::with_capacity(64);
        buf.put_u8(msg.code());
        buf
    }

    /// Wraps existing bytes for reading.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, rpos: 0 }
    }

    /// Read cursor.
    pub fn rpos(&self) -> usize {
        self.rpos
    }

    /// Moves the read cursor. Positions past the write cursor are rejected.
    pub fn set_rpos(&mut self, rpos: usize) -> TernResult<()> {
        if rpos > self.data.len() {
            return Err(TernError::Underflow {
                requested: rpos,
                available: self.data.len(),
            });
        }
        self.rpos = rpos;
        Ok(())
    }

    /// Write cursor.
    pub fn wpos(&self) -> usize {
        self.data.len()
    }

    /// Bytes left to read.
    pub fn available(&self) -> usize {
        self.data.len() - self.rpos
    }

    /// All written bytes, regardless of the read cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Bytes between the read and write cursors.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.rpos..]
    }

    /// Consumes the buffer, returning all written bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    // ---- writes ----

    /// Writes a boolean.
    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.put_u8(u8::from(value))
    }

    /// Writes a byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    /// Writes a big-endian uint32.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Writes a big-endian uint64.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Writes bytes without a length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Writes a length-prefixed byte string.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_u32(bytes.len() as u32);
        self.put_raw(bytes)
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    /// Writes a string and then wipes the caller's copy.
    pub fn put_sensitive_string(&mut self, value: &mut String) -> &mut Self {
        self.put_bytes(value.as_bytes());
        value.zeroize();
        self
    }

    /// Writes a comma separated name-list.
    pub fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) -> &mut Self {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_str(&joined)
    }

    /// Writes an mpint from an unsigned big-endian magnitude.
    ///
    /// Leading zero bytes are dropped and a single zero byte is inserted when
    /// the top bit of the first byte is set, keeping the value positive.
    pub fn put_mpint_bytes(&mut self, magnitude: &[u8]) -> &mut Self {
        let first = magnitude.iter().position(|&b| b != 0);
        let digits = match first {
            Some(i) => &magnitude[i..],
            None => &[][..],
        };
        if digits.first().map_or(false, |&b| b & 0x80 != 0) {
            self.put_u32(digits.len() as u32 + 1);
            self.put_u8(0);
            self.put_raw(digits)
        } else {
            self.put_bytes(digits)
        }
    }

    /// Writes an mpint.
    pub fn put_mpint(&mut self, value: &BigUint) -> &mut Self {
        self.put_mpint_bytes(&value.to_bytes_be())
    }

    // ---- reads ----

    fn take(&mut self, len: usize) -> TernResult<&[u8]> {
        let available = self.available();
        if len > available {
            return Err(TernError::Underflow {
                requested: len,
                available,
            });
        }
        let start = self.rpos;
        self.rpos += len;
        Ok(&self.data[start..start + len])
    }

    /// Reads a boolean.
    pub fn read_bool(&mut self) -> TernResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a byte.
    pub fn read_u8(&mut self) -> TernResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a big-endian uint32.
    pub fn read_u32(&mut self) -> TernResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian uint64.
    pub fn read_u64(&mut self) -> TernResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    /// Reads `len` bytes without a length prefix.
    pub fn read_raw(&mut self, len: usize) -> TernResult<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Runs `read`, rewinding the read cursor if it fails.
    fn rewinding<T>(&mut self, read: impl FnOnce(&mut Self) -> TernResult<T>) -> TernResult<T> {
        let start = self.rpos;
        let result = read(self);
        if result.is_err() {
            self.rpos = start;
        }
        result
    }

    /// Reads a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> TernResult<Vec<u8>> {
        self.rewinding(|buf| {
            let len = buf.read_u32()? as usize;
            buf.read_raw(len)
        })
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> TernResult<String> {
        self.rewinding(|buf| {
            String::from_utf8(buf.read_bytes()?)
                .map_err(|_| TernError::Protocol("String contains invalid UTF-8".to_string()))
        })
    }

    /// Reads a comma separated name-list. An empty string is an empty list.
    pub fn read_name_list(&mut self) -> TernResult<Vec<String>> {
        let joined = self.read_string()?;
        if joined.is_empty() {
            return Ok(Vec::new());
        }
        Ok(joined.split(',').map(String::from).collect())
    }

    /// Reads an mpint, returning its magnitude without sign padding.
    ///
    /// Negative values never occur in this protocol and are rejected.
    pub fn read_mpint_bytes(&mut self) -> TernResult<Vec<u8>> {
        let raw = self.rewinding(|buf| {
            let raw = buf.read_bytes()?;
            if raw.first().map_or(false, |&b| b & 0x80 != 0) {
                return Err(TernError::Protocol("Negative mpint".to_string()));
            }
            Ok(raw)
        })?;
        let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        Ok(raw[start..].to_vec())
    }

    /// Reads an mpint.
    pub fn read_mpint(&mut self) -> TernResult<BigUint> {
        Ok(BigUint::from_bytes_be(&self.read_mpint_bytes()?))
    }

    /// Reads a message number, failing on numbers this crate does not know.
    pub fn read_message_type(&mut self) -> TernResult<MessageType> {
        let code = self.read_u8()?;
        MessageType::from_u8(code)
            .ok_or_else(|| TernError::Protocol(format!("Unknown message number {}", code)))
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("rpos", &self.rpos)
            .field("wpos", &self.wpos())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_types() {
        let mut buf = Buffer::new();

        assert!(buf.put_bool(true).read_bool().unwrap());
        assert_eq!(buf.put_u8(10).read_u8().unwrap(), 10);
        assert_eq!(
            buf.put_bytes(b"some string").read_bytes().unwrap(),
            b"some string"
        );

        let big: BigUint = "1111111111111111111111111111111".parse().unwrap();
        assert_eq!(buf.put_mpint(&big).read_mpint().unwrap(), big);

        assert_eq!(buf.put_str("some string").read_string().unwrap(), "some string");
        assert_eq!(buf.put_u32(0xffff_ffff).read_u32().unwrap(), 0xffff_ffff);
        assert_eq!(buf.put_u64(u64::MAX - 1).read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn test_mpint_high_bit_padding() {
        let mut buf = Buffer::new();
        buf.put_mpint_bytes(&[0x80]);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 2, 0x00, 0x80]);
        assert_eq!(buf.read_mpint_bytes().unwrap(), vec![0x80]);

        let mut buf = Buffer::new();
        buf.put_mpint_bytes(&[0x00, 0x00, 0x7f]);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 1, 0x7f]);

        // zero is the empty string
        let mut buf = Buffer::new();
        buf.put_mpint(&BigUint::from(0u32));
        assert_eq!(buf.as_slice(), &[0, 0, 0, 0]);
        assert_eq!(buf.read_mpint().unwrap(), BigUint::from(0u32));
    }

    #[test]
    fn test_negative_mpint_rejected() {
        let mut buf = Buffer::from_vec(vec![0, 0, 0, 1, 0xff]);
        assert!(matches!(buf.read_mpint(), Err(TernError::Protocol(_))));
    }

    #[test]
    fn test_sensitive_string_is_wiped() {
        let mut password = String::from("lolcatz");
        let mut buf = Buffer::new();
        buf.put_sensitive_string(&mut password);

        assert_eq!(buf.read_string().unwrap(), "lolcatz");
        assert!(password.is_empty());
    }

    #[test]
    fn test_position() {
        let mut buf = Buffer::from_vec(b"Hello".to_vec());
        assert_eq!(buf.wpos(), 5);
        assert_eq!(buf.rpos(), 0);
        assert_eq!(buf.available(), 5);

        assert_eq!(buf.read_u8().unwrap(), b'H');
        assert_eq!(buf.rpos(), 1);
        assert_eq!(buf.available(), 4);
        assert_eq!(buf.remaining(), b"ello");
    }

    #[test]
    fn test_underflow() {
        let mut buf = Buffer::from_vec(b"Hello".to_vec());
        for _ in 0..5 {
            buf.read_u8().unwrap();
        }

        match buf.read_u8() {
            Err(TernError::Underflow {
                requested,
                available,
            }) => {
                assert_eq!(requested, 1);
                assert_eq!(available, 0);
            }
            other => panic!("expected underflow, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_string_is_underflow() {
        // claims 10 bytes, carries 3
        let mut buf = Buffer::from_vec(vec![0, 0, 0, 10, b'a', b'b', b'c']);
        assert!(matches!(buf.read_bytes(), Err(TernError::Underflow { .. })));
    }

    #[test]
    fn test_failed_reads_keep_cursor() {
        let mut buf = Buffer::from_vec(vec![7, 0, 0, 0, 10, b'a', b'b', b'c']);
        assert_eq!(buf.read_u8().unwrap(), 7);

        assert!(matches!(buf.read_bytes(), Err(TernError::Underflow { .. })));
        assert_eq!(buf.rpos(), 1);
        assert!(buf.read_string().is_err());
        assert!(buf.read_mpint_bytes().is_err());
        assert_eq!(buf.rpos(), 1);
        assert_eq!(buf.read_u32().unwrap(), 10);

        let mut utf = Buffer::new();
        utf.put_bytes(&[0xff, 0xfe]);
        assert!(matches!(utf.read_string(), Err(TernError::Protocol(_))));
        assert_eq!(utf.rpos(), 0);

        let mut negative = Buffer::new();
        negative.put_bytes(&[0x80, 0x01]);
        assert!(negative.read_mpint_bytes().is_err());
        assert_eq!(negative.rpos(), 0);
        assert_eq!(negative.read_bytes().unwrap(), vec![0x80, 0x01]);
    }

    #[test]
    fn test_name_list() {
        let mut buf = Buffer::new();
        buf.put_name_list(&["aes128-ctr", "aes256-ctr"]);
        buf.put_name_list::<&str>(&[]);

        assert_eq!(
            buf.read_name_list().unwrap(),
            vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()]
        );
        assert!(buf.read_name_list().unwrap().is_empty());
    }

    #[test]
    fn test_for_message() {
        let mut buf = Buffer::for_message(MessageType::ChannelEof);
        buf.put_u32(3);
        assert_eq!(buf.read_message_type().unwrap(), MessageType::ChannelEof);
        assert_eq!(buf.read_u32().unwrap(), 3);
    }
}
