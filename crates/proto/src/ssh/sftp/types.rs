//! SFTP data types and structures.

use crate::ssh::buffer::Buffer;
use std::fmt;
use tern_platform::{TernError, TernResult};

/// SFTP status codes (SSH_FX_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// SSH_FX_OK
    Ok = 0,
    /// SSH_FX_EOF
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED
    PermissionDenied = 3,
    /// SSH_FX_FAILURE
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED
    OpUnsupported = 8,
}

impl StatusCode {
    /// Convert from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::Eof,
            2 => Self::NoSuchFile,
            3 => Self::PermissionDenied,
            4 => Self::Failure,
            5 => Self::BadMessage,
            6 => Self::NoConnection,
            7 => Self::ConnectionLost,
            8 => Self::OpUnsupported,
            _ => return None,
        })
    }

    /// Wire value.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Returns error message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// SSH_FXP_STATUS body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Raw status code
    pub code: u32,
    /// Server supplied message
    pub message: String,
    /// Language tag
    pub language: String,
}

impl Status {
    /// Parses the fields after the request id. Version 3 servers may omit
    /// the message and language.
    pub fn parse(buf: &mut Buffer) -> TernResult<Self> {
        let code = buf.read_u32()?;
        let message = if buf.available() > 0 {
            buf.read_string()?
        } else {
            String::new()
        };
        let language = if buf.available() > 0 {
            buf.read_string()?
        } else {
            String::new()
        };
        Ok(Self {
            code,
            message,
            language,
        })
    }

    /// Known status code, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u32(self.code)
    }

    /// Whether this is SSH_FX_OK.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok.code()
    }

    /// Whether this is SSH_FX_EOF.
    pub fn is_eof(&self) -> bool {
        self.code == StatusCode::Eof.code()
    }

    /// Converts a failed status into [`TernError::Rejected`].
    pub fn into_error(self) -> TernError {
        let message = if self.message.is_empty() {
            self.status_code()
                .map(|c| c.message().to_string())
                .unwrap_or_else(|| format!("SFTP status {}", self.code))
        } else {
            self.message
        };
        TernError::Rejected {
            code: self.code,
            message,
        }
    }
}

/// File type, from the `S_IFMT` bits of the permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Special file
    Special,
    /// Unknown type
    Unknown,
}

/// File open flags (SSH_FXF_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// SSH_FXF_READ - Open for reading
    pub const READ: u32 = 0x00000001;
    /// SSH_FXF_WRITE - Open for writing
    pub const WRITE: u32 = 0x00000002;
    /// SSH_FXF_APPEND - Force writes to append
    pub const APPEND: u32 = 0x00000004;
    /// SSH_FXF_CREAT - Create if doesn't exist
    pub const CREAT: u32 = 0x00000008;
    /// SSH_FXF_TRUNC - Truncate to 0 length
    pub const TRUNC: u32 = 0x00000010;
    /// SSH_FXF_EXCL - Fail if file exists
    pub const EXCL: u32 = 0x00000020;

    /// Read only.
    pub fn read() -> Self {
        Self(Self::READ)
    }

    /// Write, creating or truncating.
    pub fn write_truncate() -> Self {
        Self(Self::WRITE | Self::CREAT | Self::TRUNC)
    }
}

/// File mode: permission bits plus the file type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FileMode {
    /// Mask of the type bits
    pub const S_IFMT: u32 = 0o170000;
    /// Socket
    pub const S_IFSOCK: u32 = 0o140000;
    /// Symbolic link
    pub const S_IFLNK: u32 = 0o120000;
    /// Regular file
    pub const S_IFREG: u32 = 0o100000;
    /// Block device
    pub const S_IFBLK: u32 = 0o060000;
    /// Directory
    pub const S_IFDIR: u32 = 0o040000;
    /// Character device
    pub const S_IFCHR: u32 = 0o020000;
    /// FIFO
    pub const S_IFIFO: u32 = 0o010000;

    /// Default file permissions (0644 = rw-r--r--)
    pub const DEFAULT_FILE: u32 = 0o644;
    /// Default directory permissions (0755 = rwxr-xr-x)
    pub const DEFAULT_DIR: u32 = 0o755;

    /// File type encoded in the mode.
    pub fn file_type(self) -> FileType {
        match self.0 & Self::S_IFMT {
            Self::S_IFREG => FileType::Regular,
            Self::S_IFDIR => FileType::Directory,
            Self::S_IFLNK => FileType::Symlink,
            Self::S_IFSOCK | Self::S_IFBLK | Self::S_IFCHR | Self::S_IFIFO => FileType::Special,
            _ => FileType::Unknown,
        }
    }

    /// Permission bits only.
    pub fn permissions(self) -> u32 {
        self.0 & 0o7777
    }
}

/// File attribute flags.
#[derive(Debug, Clone, Copy)]
pub struct AttrFlags(pub u32);

impl AttrFlags {
    /// SSH_FILEXFER_ATTR_SIZE
    pub const SIZE: u32 = 0x00000001;
    /// SSH_FILEXFER_ATTR_UIDGID
    pub const UIDGID: u32 = 0x00000002;
    /// SSH_FILEXFER_ATTR_PERMISSIONS
    pub const PERMISSIONS: u32 = 0x00000004;
    /// SSH_FILEXFER_ATTR_ACMODTIME
    pub const ACMODTIME: u32 = 0x00000008;
    /// SSH_FILEXFER_ATTR_EXTENDED
    pub const EXTENDED: u32 = 0x80000000;
}

/// File attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// File size in bytes
    pub size: Option<u64>,
    /// User ID
    pub uid: Option<u32>,
    /// Group ID
    pub gid: Option<u32>,
    /// Permissions
    pub permissions: Option<FileMode>,
    /// Access time (Unix timestamp)
    pub atime: Option<u32>,
    /// Modification time (Unix timestamp)
    pub mtime: Option<u32>,
    /// Extended name/value pairs
    pub extended: Vec<(String, String)>,
}

impl FileAttributes {
    /// Creates empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes carrying only permissions.
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(FileMode(mode)),
            ..Self::default()
        }
    }

    /// File type, when permissions are present.
    pub fn file_type(&self) -> FileType {
        self.permissions
            .map(FileMode::file_type)
            .unwrap_or(FileType::Unknown)
    }

    /// Whether the attributes describe a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// Flags bitmask for the fields present.
    pub fn flags(&self) -> u32 {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= AttrFlags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= AttrFlags::ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= AttrFlags::EXTENDED;
        }
        flags
    }

    /// Appends the encoded attributes to `buf`.
    pub fn write(&self, buf: &mut Buffer) {
        buf.put_u32(self.flags());
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid).put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions.0);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime).put_u32(mtime);
        }
        if !self.extended.is_empty() {
            buf.put_u32(self.extended.len() as u32);
            for (name, value) in &self.extended {
                buf.put_str(name).put_str(value);
            }
        }
    }

    /// Reads encoded attributes from `buf`.
    pub fn read(buf: &mut Buffer) -> TernResult<Self> {
        let flags = buf.read_u32()?;
        let mut attrs = Self::new();

        if flags & AttrFlags::SIZE != 0 {
            attrs.size = Some(buf.read_u64()?);
        }
        if flags & AttrFlags::UIDGID != 0 {
            attrs.uid = Some(buf.read_u32()?);
            attrs.gid = Some(buf.read_u32()?);
        }
        if flags & AttrFlags::PERMISSIONS != 0 {
            attrs.permissions = Some(FileMode(buf.read_u32()?));
        }
        if flags & AttrFlags::ACMODTIME != 0 {
            attrs.atime = Some(buf.read_u32()?);
            attrs.mtime = Some(buf.read_u32()?);
        }
        if flags & AttrFlags::EXTENDED != 0 {
            let count = buf.read_u32()?;
            for _ in 0..count {
                attrs.extended.push((buf.read_string()?, buf.read_string()?));
            }
        }
        Ok(attrs)
    }
}

/// One entry of an SSH_FXP_NAME response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name
    pub filename: String,
    /// `ls -l` style line
    pub longname: String,
    /// Attributes
    pub attrs: FileAttributes,
}

impl DirEntry {
    /// Reads the entries of an SSH_FXP_NAME body (after the request id).
    pub fn read_all(buf: &mut Buffer) -> TernResult<Vec<Self>> {
        let count = buf.read_u32()?;
        // a name entry takes at least twelve bytes
        let mut entries = Vec::with_capacity((count as usize).min(buf.available() / 12));
        for _ in 0..count {
            entries.push(Self {
                filename: buf.read_string()?,
                longname: buf.read_string()?,
                attrs: FileAttributes::read(buf)?,
            });
        }
        Ok(entries)
    }

    /// Whether this is `.` or `..`.
    pub fn is_dot(&self) -> bool {
        self.filename == "." || self.filename == ".."
    }
}

/// Opaque server handle for an open file or directory.
#[derive(Clone, PartialEq, Eq)]
pub struct FileHandle(pub(crate) Vec<u8>);

impl FileHandle {
    /// Raw handle bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle({})", hex::encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_conversion() {
        assert_eq!(StatusCode::from_u32(0), Some(StatusCode::Ok));
        assert_eq!(StatusCode::from_u32(2), Some(StatusCode::NoSuchFile));
        assert_eq!(StatusCode::from_u32(8), Some(StatusCode::OpUnsupported));
        assert_eq!(StatusCode::from_u32(999), None);
    }

    #[test]
    fn test_status_into_error() {
        let mut buf = Buffer::new();
        buf.put_u32(2);
        let status = Status::parse(&mut buf).unwrap();
        assert!(!status.is_ok());
        match status.into_error() {
            TernError::Rejected { code, message } => {
                assert_eq!(code, 2);
                assert_eq!(message, "No such file or directory");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_file_attributes_with_extended() {
        let attrs = FileAttributes {
            size: Some(1024),
            uid: Some(1000),
            gid: Some(100),
            permissions: Some(FileMode(FileMode::S_IFREG | 0o644)),
            atime: None,
            mtime: None,
            extended: vec![("acl@example.com".to_string(), "rw".to_string())],
        };

        let mut buf = Buffer::new();
        attrs.write(&mut buf);
        assert_eq!(
            &buf.as_slice()[..4],
            &(AttrFlags::SIZE | AttrFlags::UIDGID | AttrFlags::PERMISSIONS | AttrFlags::EXTENDED)
                .to_be_bytes()
        );

        let parsed = FileAttributes::read(&mut buf).unwrap();
        assert_eq!(parsed, attrs);
        assert_eq!(parsed.file_type(), FileType::Regular);
    }

    #[test]
    fn test_file_mode_types() {
        assert_eq!(FileMode(0o040755).file_type(), FileType::Directory);
        assert_eq!(FileMode(0o120777).file_type(), FileType::Symlink);
        assert_eq!(FileMode(0o020666).file_type(), FileType::Special);
        assert_eq!(FileMode(0o644).file_type(), FileType::Unknown);
        assert_eq!(FileMode(0o100644).permissions(), 0o644);
    }

    #[test]
    fn test_truncated_attributes() {
        let mut buf = Buffer::new();
        buf.put_u32(AttrFlags::SIZE).put_u32(1);
        assert!(matches!(
            FileAttributes::read(&mut buf),
            Err(TernError::Underflow { .. })
        ));
    }
}
