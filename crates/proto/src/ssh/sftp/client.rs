//! SFTP client implementation.

use super::message::{finish, SftpMessage, SftpMessageType, SFTP_VERSION};
use super::reader::{PacketReader, PendingRequests};
use super::types::{DirEntry, FileAttributes, FileHandle, OpenFlags, Status};
use crate::ssh::buffer::Buffer;
use crate::ssh::channel::{Channel, ChannelWriter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tern_platform::{TernError, TernResult};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

/// Largest chunk sent in one SSH_FXP_WRITE.
pub const MAX_WRITE_CHUNK: usize = 32 * 1024;

/// SFTP client over a `sftp` subsystem channel.
///
/// Requests may be issued concurrently from clones of an `Arc<SftpClient>`;
/// responses are matched by request id.
pub struct SftpClient {
    writer: Mutex<ChannelWriter>,
    pending: Arc<PendingRequests>,
    reader: PacketReader,
    next_request_id: AtomicU32,
    version: u32,
    extensions: Vec<(String, String)>,
    timeout: Duration,
}

impl SftpClient {
    /// Starts the `sftp` subsystem on `channel` and performs the version
    /// handshake.
    pub async fn new(mut channel: Channel, wait: Duration) -> TernResult<Self> {
        info!(channel = channel.id(), "Opening SFTP session");
        channel.subsystem("sftp").await?;
        channel.write(&SftpMessage::init(SFTP_VERSION)).await?;
        channel.flush().await?;

        let mut version_msg = timeout(wait, SftpMessage::read_from(channel.reader()))
            .await
            .map_err(|_| TernError::Timeout("SFTP version".to_string()))??;
        if version_msg.msg_type != SftpMessageType::Version {
            return Err(TernError::Protocol(format!(
                "Expected VERSION, got {:?}",
                version_msg.msg_type
            )));
        }

        let version = version_msg.payload.read_u32()?;
        if version < SFTP_VERSION {
            return Err(TernError::Protocol(format!(
                "Unsupported SFTP version {}",
                version
            )));
        }
        let mut extensions = Vec::new();
        while version_msg.payload.available() > 0 {
            extensions.push((
                version_msg.payload.read_string()?,
                version_msg.payload.read_string()?,
            ));
        }
        info!(version, extensions = extensions.len(), "SFTP protocol initialized");

        let (reader, writer) = channel.split();
        let pending = PendingRequests::new();
        Ok(Self {
            writer: Mutex::new(writer),
            reader: PacketReader::spawn(reader, pending.clone()),
            pending,
            next_request_id: AtomicU32::new(1),
            version,
            extensions,
            timeout: wait,
        })
    }

    /// Version announced by the server.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Extension pairs announced by the server.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.extensions
    }

    /// Whether the response reader is still running.
    pub fn is_open(&self) -> bool {
        !self.reader.is_finished()
    }

    fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Sends one request and waits for its response.
    ///
    /// `fill` appends the fields that follow the request id.
    async fn request<F>(&self, msg_type: SftpMessageType, fill: F) -> TernResult<SftpMessage>
    where
        F: FnOnce(&mut Buffer),
    {
        let id = self.next_request_id();
        let mut buf = SftpMessage::request(msg_type, id);
        fill(&mut buf);
        let packet = finish(buf);

        let rx = self.pending.register(id)?;
        debug!(request_id = id, kind = ?msg_type, "SFTP request");
        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.write(&packet).await {
                Ok(()) => writer.flush().await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = sent {
            self.pending.cancel(id);
            return Err(err);
        }

        match timeout(self.timeout, rx).await {
            Err(_) => {
                self.pending.cancel(id);
                Err(TernError::Timeout(format!("SFTP request {}", id)))
            }
            Ok(Err(_)) => Err(TernError::Closed("SFTP session closed".to_string())),
            Ok(Ok(result)) => result,
        }
    }

    async fn expect_status(&self, msg_type: SftpMessageType, fill: impl FnOnce(&mut Buffer)) -> TernResult<()> {
        let mut msg = self.request(msg_type, fill).await?;
        match msg.msg_type {
            SftpMessageType::Status => {
                let status = Status::parse(&mut msg.payload)?;
                if status.is_ok() {
                    Ok(())
                } else {
                    Err(status.into_error())
                }
            }
            other => Err(unexpected(other)),
        }
    }

    async fn expect_handle(&self, msg_type: SftpMessageType, fill: impl FnOnce(&mut Buffer)) -> TernResult<FileHandle> {
        let mut msg = self.request(msg_type, fill).await?;
        match msg.msg_type {
            SftpMessageType::Handle => Ok(FileHandle(msg.payload.read_bytes()?)),
            SftpMessageType::Status => Err(Status::parse(&mut msg.payload)?.into_error()),
            other => Err(unexpected(other)),
        }
    }

    async fn expect_attrs(&self, msg_type: SftpMessageType, fill: impl FnOnce(&mut Buffer)) -> TernResult<FileAttributes> {
        let mut msg = self.request(msg_type, fill).await?;
        match msg.msg_type {
            SftpMessageType::Attrs => FileAttributes::read(&mut msg.payload),
            SftpMessageType::Status => Err(Status::parse(&mut msg.payload)?.into_error()),
            other => Err(unexpected(other)),
        }
    }

    /// Sends a request answered by SSH_FXP_NAME; `None` on SSH_FX_EOF.
    async fn expect_names(&self, msg_type: SftpMessageType, fill: impl FnOnce(&mut Buffer)) -> TernResult<Option<Vec<DirEntry>>> {
        let mut msg = self.request(msg_type, fill).await?;
        match msg.msg_type {
            SftpMessageType::Name => Ok(Some(DirEntry::read_all(&mut msg.payload)?)),
            SftpMessageType::Status => {
                let status = Status::parse(&mut msg.payload)?;
                if status.is_eof() {
                    Ok(None)
                } else {
                    Err(status.into_error())
                }
            }
            other => Err(unexpected(other)),
        }
    }

    /// Opens a file.
    pub async fn open(&self, path: &str, flags: OpenFlags, attrs: &FileAttributes) -> TernResult<FileHandle> {
        self.expect_handle(SftpMessageType::Open, |buf| {
            buf.put_str(path).put_u32(flags.0);
            attrs.write(buf);
        })
        .await
    }

    /// Closes a file or directory handle.
    pub async fn close(&self, handle: &FileHandle) -> TernResult<()> {
        self.expect_status(SftpMessageType::Close, |buf| {
            buf.put_bytes(handle.as_bytes());
        })
        .await
    }

    /// Reads up to `len` bytes at `offset`. Returns `None` at end of file.
    pub async fn read(&self, handle: &FileHandle, offset: u64, len: u32) -> TernResult<Option<Vec<u8>>> {
        let mut msg = self
            .request(SftpMessageType::Read, |buf| {
                buf.put_bytes(handle.as_bytes()).put_u64(offset).put_u32(len);
            })
            .await?;
        match msg.msg_type {
            SftpMessageType::Data => Ok(Some(msg.payload.read_bytes()?)),
            SftpMessageType::Status => {
                let status = Status::parse(&mut msg.payload)?;
                if status.is_eof() {
                    Ok(None)
                } else {
                    Err(status.into_error())
                }
            }
            other => Err(unexpected(other)),
        }
    }

    /// Writes `data` at `offset`, split into chunks of [`MAX_WRITE_CHUNK`].
    pub async fn write(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> TernResult<()> {
        let mut position = offset;
        for chunk in data.chunks(MAX_WRITE_CHUNK) {
            self.expect_status(SftpMessageType::Write, |buf| {
                buf.put_bytes(handle.as_bytes()).put_u64(position).put_bytes(chunk);
            })
            .await?;
            position += chunk.len() as u64;
        }
        Ok(())
    }

    /// Opens a directory for listing.
    pub async fn opendir(&self, path: &str) -> TernResult<FileHandle> {
        self.expect_handle(SftpMessageType::OpenDir, |buf| {
            buf.put_str(path);
        })
        .await
    }

    /// Reads the next batch of entries. Returns `None` once the listing is
    /// complete.
    pub async fn readdir_batch(&self, handle: &FileHandle) -> TernResult<Option<Vec<DirEntry>>> {
        self.expect_names(SftpMessageType::ReadDir, |buf| {
            buf.put_bytes(handle.as_bytes());
        })
        .await
    }

    /// Lists a directory, without `.` and `..`.
    pub async fn readdir(&self, path: &str) -> TernResult<Vec<DirEntry>> {
        let handle = self.opendir(path).await?;
        let mut entries = Vec::new();
        let listed = loop {
            match self.readdir_batch(&handle).await {
                Ok(Some(batch)) => entries.extend(batch.into_iter().filter(|e| !e.is_dot())),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        let closed = self.close(&handle).await;
        listed?;
        closed?;
        debug!(path, entries = entries.len(), "Listed directory");
        Ok(entries)
    }

    /// Attributes of `path`, following symbolic links.
    pub async fn stat(&self, path: &str) -> TernResult<FileAttributes> {
        self.expect_attrs(SftpMessageType::Stat, |buf| {
            buf.put_str(path);
        })
        .await
    }

    /// Attributes of `path` itself.
    pub async fn lstat(&self, path: &str) -> TernResult<FileAttributes> {
        self.expect_attrs(SftpMessageType::LStat, |buf| {
            buf.put_str(path);
        })
        .await
    }

    /// Attributes of an open file.
    pub async fn fstat(&self, handle: &FileHandle) -> TernResult<FileAttributes> {
        self.expect_attrs(SftpMessageType::FStat, |buf| {
            buf.put_bytes(handle.as_bytes());
        })
        .await
    }

    /// Changes the attributes of `path`.
    pub async fn setstat(&self, path: &str, attrs: &FileAttributes) -> TernResult<()> {
        self.expect_status(SftpMessageType::SetStat, |buf| {
            buf.put_str(path);
            attrs.write(buf);
        })
        .await
    }

    /// Removes a file.
    pub async fn remove(&self, path: &str) -> TernResult<()> {
        self.expect_status(SftpMessageType::Remove, |buf| {
            buf.put_str(path);
        })
        .await
    }

    /// Creates a directory.
    pub async fn mkdir(&self, path: &str, attrs: &FileAttributes) -> TernResult<()> {
        self.expect_status(SftpMessageType::MkDir, |buf| {
            buf.put_str(path);
            attrs.write(buf);
        })
        .await
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, path: &str) -> TernResult<()> {
        self.expect_status(SftpMessageType::RmDir, |buf| {
            buf.put_str(path);
        })
        .await
    }

    /// Renames `old_path` to `new_path`.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> TernResult<()> {
        self.expect_status(SftpMessageType::Rename, |buf| {
            buf.put_str(old_path).put_str(new_path);
        })
        .await
    }

    /// Canonical absolute form of `path`.
    pub async fn realpath(&self, path: &str) -> TernResult<String> {
        let entries = self
            .expect_names(SftpMessageType::RealPath, |buf| {
                buf.put_str(path);
            })
            .await?
            .unwrap_or_default();
        match entries.into_iter().next() {
            Some(entry) => Ok(entry.filename),
            None => Err(TernError::Protocol("Empty REALPATH response".to_string())),
        }
    }

    /// Reads a whole file.
    pub async fn read_file(&self, path: &str) -> TernResult<Vec<u8>> {
        let handle = self.open(path, OpenFlags::read(), &FileAttributes::new()).await?;
        let mut data = Vec::new();
        let result = loop {
            match self.read(&handle, data.len() as u64, MAX_WRITE_CHUNK as u32).await {
                Ok(Some(chunk)) if !chunk.is_empty() => data.extend_from_slice(&chunk),
                Ok(_) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        let closed = self.close(&handle).await;
        result?;
        closed?;
        Ok(data)
    }

    /// Creates or truncates `path` and writes `data` to it.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> TernResult<()> {
        let attrs = FileAttributes::with_permissions(super::types::FileMode::DEFAULT_FILE);
        let handle = self.open(path, OpenFlags::write_truncate(), &attrs).await?;
        let written = self.write(&handle, 0, data).await;
        let closed = self.close(&handle).await;
        written?;
        closed
    }

    /// Closes the subsystem channel. Pending requests fail.
    pub async fn shutdown(&self) -> TernResult<()> {
        self.reader.abort();
        self.pending
            .fail_all(TernError::Closed("SFTP session closed".to_string()));
        self.writer.lock().await.close().await
    }
}

impl std::fmt::Debug for SftpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpClient")
            .field("version", &self.version)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn unexpected(msg_type: SftpMessageType) -> TernError {
    TernError::Protocol(format!("Unexpected SFTP response {:?}", msg_type))
}
