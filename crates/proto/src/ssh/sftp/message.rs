//! SFTP packet framing.
//!
//! ```text
//! uint32    length
//! byte      type
//! uint32    request-id     (every type except INIT and VERSION)
//! ....      type specific fields
//! ```

use crate::ssh::buffer::Buffer;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// SFTP protocol version spoken by the client.
pub const SFTP_VERSION: u32 = 3;

/// Largest packet accepted from the server.
pub const MAX_SFTP_PACKET: u32 = 256 * 1024 + 1024;

/// SFTP message type (SSH_FXP_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SftpMessageType {
    /// SSH_FXP_INIT
    Init = 1,
    /// SSH_FXP_VERSION
    Version = 2,
    /// SSH_FXP_OPEN
    Open = 3,
    /// SSH_FXP_CLOSE
    Close = 4,
    /// SSH_FXP_READ
    Read = 5,
    /// SSH_FXP_WRITE
    Write = 6,
    /// SSH_FXP_LSTAT
    LStat = 7,
    /// SSH_FXP_FSTAT
    FStat = 8,
    /// SSH_FXP_SETSTAT
    SetStat = 9,
    /// SSH_FXP_FSETSTAT
    FSetStat = 10,
    /// SSH_FXP_OPENDIR
    OpenDir = 11,
    /// SSH_FXP_READDIR
    ReadDir = 12,
    /// SSH_FXP_REMOVE
    Remove = 13,
    /// SSH_FXP_MKDIR
    MkDir = 14,
    /// SSH_FXP_RMDIR
    RmDir = 15,
    /// SSH_FXP_REALPATH
    RealPath = 16,
    /// SSH_FXP_STAT
    Stat = 17,
    /// SSH_FXP_RENAME
    Rename = 18,
    /// SSH_FXP_READLINK
    ReadLink = 19,
    /// SSH_FXP_SYMLINK
    Symlink = 20,
    /// SSH_FXP_STATUS
    Status = 101,
    /// SSH_FXP_HANDLE
    Handle = 102,
    /// SSH_FXP_DATA
    Data = 103,
    /// SSH_FXP_NAME
    Name = 104,
    /// SSH_FXP_ATTRS
    Attrs = 105,
    /// SSH_FXP_EXTENDED
    Extended = 200,
    /// SSH_FXP_EXTENDED_REPLY
    ExtendedReply = 201,
}

impl SftpMessageType {
    /// Convert from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Init,
            2 => Self::Version,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::LStat,
            8 => Self::FStat,
            9 => Self::SetStat,
            10 => Self::FSetStat,
            11 => Self::OpenDir,
            12 => Self::ReadDir,
            13 => Self::Remove,
            14 => Self::MkDir,
            15 => Self::RmDir,
            16 => Self::RealPath,
            17 => Self::Stat,
            18 => Self::Rename,
            19 => Self::ReadLink,
            20 => Self::Symlink,
            101 => Self::Status,
            102 => Self::Handle,
            103 => Self::Data,
            104 => Self::Name,
            105 => Self::Attrs,
            200 => Self::Extended,
            201 => Self::ExtendedReply,
            _ => return None,
        })
    }

    /// Whether this is a server response carrying a request id.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::Status | Self::Handle | Self::Data | Self::Name | Self::Attrs | Self::ExtendedReply
        )
    }
}

/// One SFTP packet, without its length prefix.
#[derive(Debug)]
pub struct SftpMessage {
    /// Message type
    pub msg_type: SftpMessageType,
    /// Fields after the type byte (request id included)
    pub payload: Buffer,
}

impl SftpMessage {
    /// Creates a request carrying `request_id`; fields are appended to the
    /// returned buffer.
    pub fn request(msg_type: SftpMessageType, request_id: u32) -> Buffer {
        let mut buf = Buffer::new();
        buf.put_u32(0).put_u8(msg_type as u8).put_u32(request_id);
        buf
    }

    /// Creates SSH_FXP_INIT.
    pub fn init(version: u32) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u32(0).put_u8(SftpMessageType::Init as u8).put_u32(version);
        finish(buf)
    }

    /// Parses a packet body (type byte onwards).
    pub fn from_bytes(data: Vec<u8>) -> TernResult<Self> {
        let mut payload = Buffer::from_vec(data);
        let code = payload.read_u8()?;
        let msg_type = SftpMessageType::from_u8(code)
            .ok_or_else(|| TernError::Protocol(format!("Unknown SFTP message type: {}", code)))?;
        Ok(Self { msg_type, payload })
    }

    /// Reads one length-prefixed packet from `reader`.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> TernResult<Self> {
        let len = reader.read_u32().await?;
        if len == 0 || len > MAX_SFTP_PACKET {
            return Err(TernError::Protocol(format!("Invalid SFTP packet length: {}", len)));
        }
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;
        Self::from_bytes(body)
    }
}

/// Fills in the length prefix of a buffer built by [`SftpMessage::request`].
pub fn finish(buf: Buffer) -> Vec<u8> {
    let mut bytes = buf.into_vec();
    let len = (bytes.len() - 4) as u32;
    bytes[..4].copy_from_slice(&len.to_be_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(SftpMessageType::from_u8(1), Some(SftpMessageType::Init));
        assert_eq!(SftpMessageType::from_u8(101), Some(SftpMessageType::Status));
        assert_eq!(SftpMessageType::from_u8(255), None);
        assert!(SftpMessageType::Attrs.is_response());
        assert!(!SftpMessageType::Version.is_response());
    }

    #[test]
    fn test_init_framing() {
        let bytes = SftpMessage::init(SFTP_VERSION);
        assert_eq!(bytes, vec![0, 0, 0, 5, 1, 0, 0, 0, 3]);
    }

    #[test]
    fn test_request_framing() {
        let mut buf = SftpMessage::request(SftpMessageType::Stat, 7);
        buf.put_str("/tmp");
        let bytes = finish(buf);

        assert_eq!(&bytes[..4], &(bytes.len() as u32 - 4).to_be_bytes());
        let mut msg = SftpMessage::from_bytes(bytes[4..].to_vec()).unwrap();
        assert_eq!(msg.msg_type, SftpMessageType::Stat);
        assert_eq!(msg.payload.read_u32().unwrap(), 7);
        assert_eq!(msg.payload.read_string().unwrap(), "/tmp");
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let mut wire: &[u8] = &[0, 0, 0, 5, 2, 0, 0, 0, 3];
        let mut msg = SftpMessage::read_from(&mut wire).await.unwrap();
        assert_eq!(msg.msg_type, SftpMessageType::Version);
        assert_eq!(msg.payload.read_u32().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let mut wire: &[u8] = &[0xff, 0, 0, 0, 2];
        assert!(matches!(
            SftpMessage::read_from(&mut wire).await,
            Err(TernError::Protocol(_))
        ));
    }
}
