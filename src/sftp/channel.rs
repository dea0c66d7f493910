//! The negotiated SFTP channel
//!
//! [`RemoteChannel`] is the set of single remote calls the client builds on.
//! The production implementation, [`RusshChannel`], wraps russh-sftp's
//! `SftpSession` plus an optional raw session for protocol extensions.

use std::collections::HashMap;
use std::io::SeekFrom;

use async_trait::async_trait;
use russh_sftp::client::{RawSftpSession, SftpSession};
use russh_sftp::protocol::{FileAttributes, OpenFlags, Packet, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::error::{ErrorCode, SftpError};
use super::types::{RawDirEntry, RemoteAttrs, WriteMode};

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Remote file operations over one SFTP channel.
///
/// Errors returned here are raw: the calling operation tags them.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError>;

    /// Attributes, following symlinks
    async fn stat(&self, path: &str) -> Result<RemoteAttrs, SftpError>;

    /// Attributes of the link itself
    async fn lstat(&self, path: &str) -> Result<RemoteAttrs, SftpError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<RawDirEntry>, SftpError>;

    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;

    /// Atomic rename through the `posix-rename@openssh.com` extension
    async fn posix_rename(&self, from: &str, to: &str) -> Result<(), SftpError>;

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError>;

    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, SftpError>;

    /// The returned writer must be shut down to release the remote handle.
    async fn open_write(
        &self,
        path: &str,
        mode: WriteMode,
        offset: u64,
    ) -> Result<RemoteWriter, SftpError>;

    /// Read up to `len` bytes starting at `offset`.
    async fn read_block(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, SftpError> {
        let mut reader = self.open_read(path, offset).await?;
        let mut buf = Vec::with_capacity(len);
        (&mut reader).take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Write `data` at `offset` of an existing file.
    async fn write_block(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), SftpError> {
        let mut writer = self.open_write(path, WriteMode::Update, offset).await?;
        writer.write_all(data).await?;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Extension request name for atomic rename
pub const POSIX_RENAME: &str = "posix-rename@openssh.com";

/// russh-sftp backed channel.
pub struct RusshChannel {
    session: SftpSession,
    /// Side session for extended requests, kept only when it is useful
    extensions: Option<RawSftpSession>,
}

impl RusshChannel {
    pub fn new(session: SftpSession) -> Self {
        Self {
            session,
            extensions: None,
        }
    }

    /// `announced` is the extension map from the raw session's VERSION reply.
    pub fn with_extensions(
        session: SftpSession,
        raw: RawSftpSession,
        announced: &HashMap<String, String>,
    ) -> Self {
        let extensions = if supports_posix_rename(announced) {
            Some(raw)
        } else {
            debug!("Server does not announce {}", POSIX_RENAME);
            None
        };
        Self {
            session,
            extensions,
        }
    }
}

pub(crate) fn supports_posix_rename(announced: &HashMap<String, String>) -> bool {
    announced.contains_key(POSIX_RENAME)
}

fn put_ssh_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Request payload: `string oldpath, string newpath`.
pub(crate) fn posix_rename_payload(from: &str, to: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + from.len() + to.len());
    put_ssh_string(&mut data, from);
    put_ssh_string(&mut data, to);
    data
}

#[async_trait]
impl RemoteChannel for RusshChannel {
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        Ok(self.session.canonicalize(path).await?)
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, SftpError> {
        let metadata = self.session.metadata(path).await?;
        Ok(RemoteAttrs::from(&metadata))
    }

    async fn lstat(&self, path: &str) -> Result<RemoteAttrs, SftpError> {
        let metadata = self.session.symlink_metadata(path).await?;
        Ok(RemoteAttrs::from(&metadata))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RawDirEntry>, SftpError> {
        let entries = self.session.read_dir(path).await?;
        Ok(entries
            .map(|entry| RawDirEntry {
                filename: entry.file_name(),
                // russh-sftp does not expose the server's longname
                longname: String::new(),
                attrs: RemoteAttrs::from(&entry.metadata()),
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        Ok(self.session.create_dir(path).await?)
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        Ok(self.session.remove_dir(path).await?)
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        Ok(self.session.remove_file(path).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        Ok(self.session.rename(from, to).await?)
    }

    async fn posix_rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        let Some(raw) = &self.extensions else {
            return Err(SftpError::new(
                ErrorCode::OpUnsupported,
                format!("{} is not supported by the server", POSIX_RENAME),
            ));
        };

        debug!("{}: {} -> {}", POSIX_RENAME, from, to);
        match raw
            .extended(POSIX_RENAME, posix_rename_payload(from, to))
            .await?
        {
            Packet::Status(status) if status.status_code == StatusCode::Ok => Ok(()),
            Packet::Status(status) => {
                Err(russh_sftp::client::error::Error::Status(status).into())
            }
            _ => Err(SftpError::new(
                ErrorCode::BadMessage,
                format!("Unexpected reply to {}", POSIX_RENAME),
            )),
        }
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode);
        Ok(self.session.set_metadata(path, attrs).await?)
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, SftpError> {
        let mut file = self.session.open_with_flags(path, OpenFlags::READ).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn open_write(
        &self,
        path: &str,
        mode: WriteMode,
        offset: u64,
    ) -> Result<RemoteWriter, SftpError> {
        let flags = match mode {
            WriteMode::Truncate => OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            WriteMode::Append => OpenFlags::CREATE | OpenFlags::APPEND | OpenFlags::WRITE,
            WriteMode::Update => OpenFlags::CREATE | OpenFlags::WRITE,
        };
        let mut file = self.session.open_with_flags(path, flags).await?;
        if offset > 0 && mode != WriteMode::Append {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }
}
