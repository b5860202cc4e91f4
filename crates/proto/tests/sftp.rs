//! SFTP over a scripted `sftp` subsystem.

mod common;

use common::{connect_authenticated, connect_authenticated_with, MockServer};
use std::time::Duration;
use tern_platform::{SeededRandom, TernError, TernResult};
use tern_proto::ssh::buffer::Buffer;
use tern_proto::ssh::sftp::{FileAttributes, FileMode, SftpClient, SftpMessageType, StatusCode};
use tern_proto::ssh::{SshClient, SshConfig};

/// Server end of the subsystem: reassembles SFTP packets from channel data.
struct SftpPeer {
    server: MockServer,
    channel: u32,
    pending: Vec<u8>,
}

/// A request read by the peer.
struct Request {
    kind: SftpMessageType,
    id: u32,
    body: Buffer,
}

impl SftpPeer {
    /// Accepts the session channel, the subsystem request and INIT.
    async fn start(mut server: MockServer) -> TernResult<Self> {
        let open = server.accept_channel(1 << 20, 32 * 1024).await?;
        let request = server.answer_channel_request(open.sender, true).await?;
        assert_eq!(request, "subsystem");

        let mut peer = Self {
            server,
            channel: open.sender,
            pending: Vec::new(),
        };
        let mut init = peer.next_packet().await?;
        assert_eq!(init.read_u8()?, SftpMessageType::Init as u8);
        assert_eq!(init.read_u32()?, 3);

        peer.reply(SftpMessageType::Version, |buf| {
            buf.put_u32(3)
                .put_str("posix-rename@openssh.com")
                .put_str("1");
        })
        .await?;
        Ok(peer)
    }

    async fn next_packet(&mut self) -> TernResult<Buffer> {
        loop {
            if self.pending.len() >= 4 {
                let len = u32::from_be_bytes([
                    self.pending[0],
                    self.pending[1],
                    self.pending[2],
                    self.pending[3],
                ]) as usize;
                if self.pending.len() >= 4 + len {
                    let packet = self.pending[4..4 + len].to_vec();
                    self.pending.drain(..4 + len);
                    return Ok(Buffer::from_vec(packet));
                }
            }
            let data = self.server.recv_channel_data().await?;
            self.pending.extend(data);
        }
    }

    async fn request(&mut self) -> TernResult<Request> {
        let mut body = self.next_packet().await?;
        let code = body.read_u8()?;
        let kind = SftpMessageType::from_u8(code)
            .ok_or_else(|| TernError::Protocol(format!("unknown request {}", code)))?;
        let id = body.read_u32()?;
        Ok(Request { kind, id, body })
    }

    async fn reply(&mut self, kind: SftpMessageType, fill: impl FnOnce(&mut Buffer)) -> TernResult<()> {
        let mut body = Buffer::new();
        body.put_u8(kind as u8);
        fill(&mut body);
        let mut packet = Buffer::new();
        packet.put_bytes(body.as_slice());
        self.server.send_channel_data(self.channel, packet.as_slice()).await
    }

    async fn status(&mut self, id: u32, code: StatusCode, message: &str) -> TernResult<()> {
        self.reply(SftpMessageType::Status, |buf| {
            buf.put_u32(id).put_u32(code.code()).put_str(message).put_str("");
        })
        .await
    }

    async fn names(&mut self, id: u32, names: &[&str]) -> TernResult<()> {
        self.reply(SftpMessageType::Name, |buf| {
            buf.put_u32(id).put_u32(names.len() as u32);
            for name in names {
                buf.put_str(name).put_str(&format!("-rw-r--r-- 1 u g 0 {}", name));
                FileAttributes::with_permissions(FileMode::S_IFREG | 0o644).write(buf);
            }
        })
        .await
    }
}

async fn start() -> (SshClient, SftpClient, SftpPeer) {
    let (client, server) = connect_authenticated().await;
    open_sftp(client, server).await
}

async fn open_sftp(client: SshClient, server: MockServer) -> (SshClient, SftpClient, SftpPeer) {
    let (sftp, peer) = tokio::join!(client.sftp(), SftpPeer::start(server));
    (client, sftp.unwrap(), peer.unwrap())
}

#[tokio::test]
async fn test_version_handshake() {
    let (_client, sftp, _peer) = start().await;

    assert_eq!(sftp.version(), 3);
    assert_eq!(
        sftp.extensions(),
        &[("posix-rename@openssh.com".to_string(), "1".to_string())]
    );
    assert!(sftp.is_open());
}

#[tokio::test]
async fn test_stat() {
    let (_client, sftp, mut peer) = start().await;

    let server_side = async {
        let mut request = peer.request().await?;
        assert_eq!(request.kind, SftpMessageType::Stat);
        assert_eq!(request.body.read_string()?, "/etc/hosts");
        let attrs = FileAttributes {
            size: Some(1234),
            permissions: Some(FileMode(FileMode::S_IFREG | 0o644)),
            mtime: Some(1_700_000_000),
            atime: Some(1_700_000_000),
            ..FileAttributes::default()
        };
        peer.reply(SftpMessageType::Attrs, |buf| {
            buf.put_u32(request.id);
            attrs.write(buf);
        })
        .await
    };
    let (attrs, served) = tokio::join!(sftp.stat("/etc/hosts"), server_side);
    served.unwrap();

    let attrs = attrs.unwrap();
    assert_eq!(attrs.size, Some(1234));
    assert_eq!(attrs.mtime, Some(1_700_000_000));
    assert!(!attrs.is_dir());
}

#[tokio::test]
async fn test_readdir_collects_batches_until_eof() {
    let (_client, sftp, mut peer) = start().await;

    let server_side = async {
        let mut open = peer.request().await?;
        assert_eq!(open.kind, SftpMessageType::OpenDir);
        assert_eq!(open.body.read_string()?, "/srv");
        peer.reply(SftpMessageType::Handle, |buf| {
            buf.put_u32(open.id).put_bytes(b"dir-1");
        })
        .await?;

        let batches: [&[&str]; 2] = [&[".", "..", "a.txt"], &["b.txt"]];
        for batch in batches {
            let mut read = peer.request().await?;
            assert_eq!(read.kind, SftpMessageType::ReadDir);
            assert_eq!(read.body.read_bytes()?, b"dir-1");
            peer.names(read.id, batch).await?;
        }
        let done = peer.request().await?;
        assert_eq!(done.kind, SftpMessageType::ReadDir);
        peer.status(done.id, StatusCode::Eof, "End of file").await?;

        let close = peer.request().await?;
        assert_eq!(close.kind, SftpMessageType::Close);
        peer.status(close.id, StatusCode::Ok, "").await
    };
    let (entries, served) = tokio::join!(sftp.readdir("/srv"), server_side);
    served.unwrap();

    let names: Vec<String> = entries.unwrap().into_iter().map(|e| e.filename).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
}

#[tokio::test]
async fn test_error_status_becomes_rejected() {
    let (_client, sftp, mut peer) = start().await;

    let server_side = async {
        let request = peer.request().await?;
        assert_eq!(request.kind, SftpMessageType::Remove);
        peer.status(request.id, StatusCode::NoSuchFile, "No such file").await
    };
    let (removed, served) = tokio::join!(sftp.remove("/nope"), server_side);
    served.unwrap();

    match removed {
        Err(TernError::Rejected { code, message }) => {
            assert_eq!(code, StatusCode::NoSuchFile.code());
            assert!(message.contains("No such file"), "{}", message);
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(sftp.is_open());
}

#[tokio::test]
async fn test_responses_matched_by_request_id() {
    let (_client, sftp, mut peer) = start().await;

    let server_side = async {
        let mut first = peer.request().await?;
        let mut second = peer.request().await?;
        let first_path = first.body.read_string()?;
        let second_path = second.body.read_string()?;

        // answer in reverse order, each with the size of its path
        for (id, path) in [(second.id, second_path), (first.id, first_path)] {
            let attrs = FileAttributes {
                size: Some(path.len() as u64),
                ..FileAttributes::default()
            };
            peer.reply(SftpMessageType::Attrs, |buf| {
                buf.put_u32(id);
                attrs.write(buf);
            })
            .await?;
        }
        Ok::<_, TernError>(())
    };
    let (short, long, served) = tokio::join!(sftp.stat("/a"), sftp.stat("/a/much/longer/path"), server_side);
    served.unwrap();

    assert_eq!(short.unwrap().size, Some(2));
    assert_eq!(long.unwrap().size, Some(19));
}

#[tokio::test]
async fn test_read_file_until_eof() {
    let (_client, sftp, mut peer) = start().await;

    let server_side = async {
        let mut open = peer.request().await?;
        assert_eq!(open.kind, SftpMessageType::Open);
        assert_eq!(open.body.read_string()?, "/motd");
        peer.reply(SftpMessageType::Handle, |buf| {
            buf.put_u32(open.id).put_bytes(b"file-7");
        })
        .await?;

        let mut read = peer.request().await?;
        assert_eq!(read.kind, SftpMessageType::Read);
        assert_eq!(read.body.read_bytes()?, b"file-7");
        assert_eq!(read.body.read_u64()?, 0);
        peer.reply(SftpMessageType::Data, |buf| {
            buf.put_u32(read.id).put_bytes(b"welcome\n");
        })
        .await?;

        let mut read = peer.request().await?;
        assert_eq!(read.body.read_bytes()?, b"file-7");
        assert_eq!(read.body.read_u64()?, 8);
        peer.status(read.id, StatusCode::Eof, "").await?;

        let close = peer.request().await?;
        assert_eq!(close.kind, SftpMessageType::Close);
        peer.status(close.id, StatusCode::Ok, "").await
    };
    let (data, served) = tokio::join!(sftp.read_file("/motd"), server_side);
    served.unwrap();
    assert_eq!(data.unwrap(), b"welcome\n");
}

#[tokio::test]
async fn test_pending_requests_fail_when_channel_closes() {
    let (_client, sftp, mut peer) = start().await;

    let server_side = async {
        peer.request().await?;
        let mut close = Buffer::for_message(tern_proto::ssh::MessageType::ChannelClose);
        close.put_u32(peer.channel);
        peer.server.send(close.as_slice()).await
    };
    let (stat, served) = tokio::join!(sftp.stat("/tmp"), server_side);
    served.unwrap();

    let err = stat.unwrap_err();
    assert!(!err.is_timeout(), "{:?}", err);
}

#[tokio::test]
async fn test_late_response_after_timeout_is_dropped() {
    let config = SshConfig::builder()
        .with_timeout(Duration::from_millis(500))
        .with_random(SeededRandom::shared(1))
        .build()
        .unwrap();
    let (client, server) = connect_authenticated_with(config).await;
    let (_client, sftp, mut peer) = open_sftp(client, server).await;

    // the server sits on the first request past the deadline
    let (slow_stat, slow) = tokio::join!(sftp.stat("/slow"), peer.request());
    assert!(slow_stat.unwrap_err().is_timeout());
    let slow = slow.unwrap();
    peer.status(slow.id, StatusCode::Ok, "").await.unwrap();

    let server_side = async {
        let mut fast = peer.request().await?;
        assert_eq!(fast.body.read_string()?, "/fast");
        let attrs = FileAttributes {
            size: Some(5),
            ..FileAttributes::default()
        };
        peer.reply(SftpMessageType::Attrs, |buf| {
            buf.put_u32(fast.id);
            attrs.write(buf);
        })
        .await
    };
    let (fast_stat, served) = tokio::join!(sftp.stat("/fast"), server_side);
    served.unwrap();

    assert_eq!(fast_stat.unwrap().size, Some(5));
    assert!(sftp.is_open());
}
