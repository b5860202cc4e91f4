//! Identification string exchange (RFC 4253 Section 4.2).
//!
//! Each side opens with a line of the form
//! `SSH-<protocol>-<software>[ <comment>]\r\n`. The server may precede its
//! line with free text, of which up to [`MAX_BANNER_LINES`] lines are kept
//! and reported. Only protocol `2.0`, and the compatibility alias `1.99`,
//! are accepted.
//!
//! ```rust
//! use tern_proto::ssh::version::Version;
//!
//! let ours = Version::new("Tern_0.1.0", None);
//! assert_eq!(ours.to_string(), "SSH-2.0-Tern_0.1.0");
//!
//! let theirs = Version::parse("SSH-1.99-OpenSSH_9.6 Debian").unwrap();
//! assert_eq!(theirs.protocol(), "1.99");
//! assert_eq!(theirs.comment(), Some("Debian"));
//! ```

use crate::ssh::disconnect::DisconnectReason;
use std::fmt;
use tern_platform::{TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of an identification line, CR LF included.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of lines accepted before the server identification.
pub const MAX_BANNER_LINES: usize = 50;

/// A parsed identification line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    protocol: String,
    software: String,
    comment: Option<String>,
}

impl Version {
    /// Our own identification: always protocol 2.0.
    pub fn new(software: &str, comment: Option<&str>) -> Self {
        Self {
            protocol: "2.0".into(),
            software: software.into(),
            comment: comment.map(Into::into),
        }
    }

    /// Parses an identification line, tolerating a trailing CR LF or LF.
    ///
    /// An unsupported protocol number is a [`TernError::Disconnect`] with
    /// reason 8; every other malformation is a [`TernError::Protocol`].
    pub fn parse(line: &str) -> TernResult<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.len() > MAX_VERSION_LENGTH {
            return Err(TernError::Protocol(format!(
                "Identification of {} bytes exceeds {}",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.bytes().any(|b| b == 0) {
            return Err(TernError::Protocol("NUL in identification".into()));
        }

        let rest = line
            .strip_prefix("SSH-")
            .ok_or_else(|| TernError::Protocol(format!("Not an identification: '{}'", line)))?;
        let (protocol, tail) = rest
            .split_once('-')
            .ok_or_else(|| TernError::Protocol(format!("Malformed identification: '{}'", line)))?;

        if !matches!(protocol, "2.0" | "1.99") {
            return Err(DisconnectReason::ProtocolVersionNotSupported
                .error(format!("Unsupported protocol version {}", protocol)));
        }

        let (software, comment) = match tail.split_once(' ') {
            Some((software, comment)) => (software, Some(comment.trim().to_string())),
            None => (tail, None),
        };
        Ok(Self {
            protocol: protocol.into(),
            software: software.into(),
            comment,
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn software(&self) -> &str {
        &self.software
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// The line as sent on the wire, CR LF included.
    pub fn wire_line(&self) -> Vec<u8> {
        let mut line = self.to_string().into_bytes();
        line.extend_from_slice(b"\r\n");
        line
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SSH-")?;
        f.write_str(&self.protocol)?;
        f.write_str("-")?;
        f.write_str(&self.software)?;
        match &self.comment {
            Some(comment) => write!(f, " {}", comment),
            None => Ok(()),
        }
    }
}

/// Outcome of the identification exchange.
#[derive(Debug, Clone)]
pub struct VersionExchange {
    /// Our identification line without CR LF (hashed as `V_C`).
    pub client_line: String,
    /// Server identification line exactly as received, without CR LF
    /// (hashed as `V_S`).
    pub server_line: String,
    /// Parsed server identification.
    pub server: Version,
    /// Lines the server sent before its identification.
    pub banner: Vec<String>,
}

/// Sends `local` and reads the server identification, skipping banner lines.
///
/// Reads one byte at a time so nothing past the identification line is
/// consumed from `stream`.
pub async fn exchange<S>(stream: &mut S, local: &Version) -> TernResult<VersionExchange>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&local.wire_line()).await?;
    stream.flush().await?;

    let mut banner = Vec::new();
    loop {
        let line = read_line(stream).await?;
        if line.starts_with("SSH-") {
            let server = Version::parse(&line)?;
            tracing::debug!(server = %line, "Received server identification");
            return Ok(VersionExchange {
                client_line: local.to_string(),
                server_line: line,
                server,
                banner,
            });
        }

        tracing::debug!(line = %line, "Skipping pre-identification line");
        banner.push(line);
        if banner.len() > MAX_BANNER_LINES {
            return Err(TernError::Protocol(format!(
                "No identification string within {} lines",
                MAX_BANNER_LINES
            )));
        }
    }
}

/// Reads one line, returning it without the trailing CR LF.
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> TernResult<String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        if reader.read(&mut byte).await? == 0 {
            return Err(TernError::Closed(
                "Connection closed during version exchange".to_string(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_VERSION_LENGTH {
            return Err(TernError::Protocol("Version line too long".to_string()));
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| TernError::Protocol("Version line is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_identification_round_trips_through_display() {
        let ours = Version::new("Tern_0.1.0", Some("client"));
        assert_eq!(ours.wire_line(), b"SSH-2.0-Tern_0.1.0 client\r\n");
        assert_eq!(Version::parse(&ours.to_string()).unwrap(), ours);
    }

    #[test]
    fn test_parse_splits_software_and_comment() {
        let openssh = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(openssh.protocol(), "2.0");
        assert_eq!(openssh.software(), "OpenSSH_8.9");
        assert_eq!(openssh.comment(), Some("Ubuntu-3ubuntu0.1"));

        // the software part may itself contain dashes
        let dashed = Version::parse("SSH-2.0-dropbear-2022.83\n").unwrap();
        assert_eq!(dashed.software(), "dropbear-2022.83");
        assert_eq!(dashed.comment(), None);
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        for bad in ["HTTP/1.1 400 Bad Request", "SSH-2.0", "SSH-2.0-Bad\0Nul"] {
            assert!(
                matches!(Version::parse(bad), Err(TernError::Protocol(_))),
                "{}",
                bad
            );
        }
        assert!(Version::parse(&format!("SSH-2.0-{}", "x".repeat(300))).is_err());
    }

    #[test]
    fn test_old_protocol_disconnects_with_reason_8() {
        match Version::parse("SSH-1.5-Ancient") {
            Err(TernError::Disconnect { code, message }) => {
                assert_eq!(code, 8);
                assert!(message.contains("1.5"), "{}", message);
            }
            other => panic!("expected disconnect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exchange_skips_banner_lines() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move {
            server
                .write_all(b"Welcome\r\nauthorized use only\nSSH-2.0-Mock_1.0 test\r\nrest")
                .await
                .unwrap();
            let mut buf = vec![0u8; 19];
            server.read_exact(&mut buf).await.unwrap();
            buf
        });

        let local = Version::new("Tern_test", None);
        let result = exchange(&mut client, &local).await.unwrap();
        assert_eq!(result.server_line, "SSH-2.0-Mock_1.0 test");
        assert_eq!(result.server.software(), "Mock_1.0");
        assert_eq!(result.banner, vec!["Welcome", "authorized use only"]);
        assert_eq!(result.client_line, "SSH-2.0-Tern_test");

        // bytes after the identification line stay unread
        let mut rest = [0u8; 4];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"rest");

        assert_eq!(server_task.await.unwrap(), b"SSH-2.0-Tern_test\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_exchange_too_many_banner_lines() {
        let (mut client, mut server) = duplex(64 * 1024);
        let mut lines = String::new();
        for i in 0..=MAX_BANNER_LINES {
            lines.push_str(&format!("line {}\r\n", i));
        }
        server.write_all(lines.as_bytes()).await.unwrap();

        let err = exchange(&mut client, &Version::new("Tern_test", None))
            .await
            .unwrap_err();
        assert!(matches!(err, TernError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_exchange_peer_closes() {
        let (mut client, server) = duplex(64);
        drop(server);
        let err = exchange(&mut client, &Version::new("Tern_test", None)).await;
        assert!(err.is_err());
    }
}
