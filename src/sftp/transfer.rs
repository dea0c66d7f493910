//! File transfers
//!
//! Streamed `get`/`put`/`append`, caller-owned streams, and the parallel
//! block transfers `fast_get`/`fast_put`. Local paths are validated before
//! the first remote request.

use std::io::SeekFrom;
use std::path::Path;

use futures_util::stream::{self, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::channel::{RemoteChannel, RemoteReader, RemoteWriter};
use super::constants::STREAM_BUFFER_SIZE;
use super::error::SftpError;
use super::local::{check_local_readable, check_local_writable};
use super::ops::target_type;
use super::types::{
    EntryType, FastTransferOptions, GetOutcome, GetTarget, PutSource, ReadOptions, WriteMode,
    WriteOptions,
};
use crate::client::SftpClient;

const STREAM_LABEL: &str = "<stream>";

impl SftpClient {
    /// Download `remote` into memory, a local file, or a caller-owned writer.
    ///
    /// A caller-owned writer is flushed but not shut down.
    pub async fn get(
        &self,
        remote: &str,
        target: GetTarget<'_>,
        opts: ReadOptions,
    ) -> Result<GetOutcome, SftpError> {
        self.guarded("get", async move {
            if let GetTarget::Path(local) = &target {
                check_local_writable(local).await?;
            }
            let channel = self.channel()?;
            get_on(&*channel, remote, target, opts).await
        })
        .await
    }

    /// Download with several block reads in flight. Returns bytes written.
    pub async fn fast_get(
        &self,
        remote: &str,
        local: &Path,
        opts: FastTransferOptions,
    ) -> Result<u64, SftpError> {
        self.guarded("fast_get", async {
            check_local_writable(local).await?;
            let channel = self.channel()?;
            fast_get_on(&*channel, remote, local, opts).await
        })
        .await
    }

    /// Upload with several block writes in flight. Returns bytes written.
    pub async fn fast_put(
        &self,
        local: &Path,
        remote: &str,
        opts: FastTransferOptions,
    ) -> Result<u64, SftpError> {
        self.guarded("fast_put", async {
            check_local_readable(local).await?;
            let channel = self.channel()?;
            fast_put_on(&*channel, local, remote, opts).await
        })
        .await
    }

    /// Write a buffer, local file or caller-owned reader to `remote`.
    pub async fn put(
        &self,
        source: PutSource<'_>,
        remote: &str,
        opts: WriteOptions,
    ) -> Result<u64, SftpError> {
        self.guarded("put", async move {
            if let PutSource::Path(local) = &source {
                check_local_readable(local).await?;
            }
            let channel = self.channel()?;
            put_on(&*channel, source, remote, opts).await
        })
        .await
    }

    /// Add bytes to the end of `remote`, creating it if needed.
    pub async fn append(
        &self,
        source: PutSource<'_>,
        remote: &str,
        opts: WriteOptions,
    ) -> Result<u64, SftpError> {
        self.guarded("append", async move {
            if let PutSource::Path(local) = &source {
                return Err(SftpError::bad_path(format!(
                    "Cannot append one file to another: {}",
                    local.display()
                )));
            }
            let channel = self.channel()?;
            if target_type(&*channel, remote).await? == Some(EntryType::Directory) {
                return Err(SftpError::bad_path(format!(
                    "Bad path: {} is a directory",
                    remote
                )));
            }
            let opts = WriteOptions {
                flags: WriteMode::Append,
                ..opts
            };
            put_on(&*channel, source, remote, opts).await
        })
        .await
    }

    /// Raw reader over `remote`, limited to `opts.start..opts.end`.
    pub async fn create_read_stream(
        &self,
        remote: &str,
        opts: ReadOptions,
    ) -> Result<RemoteReader, SftpError> {
        self.guarded("create_read_stream", async {
            let channel = self.channel()?;
            open_ranged(&*channel, remote, opts).await
        })
        .await
    }

    /// Raw writer into `remote`. Shut it down to close the remote handle.
    pub async fn create_write_stream(
        &self,
        remote: &str,
        opts: WriteOptions,
    ) -> Result<RemoteWriter, SftpError> {
        self.guarded("create_write_stream", async {
            let channel = self.channel()?;
            let writer = channel.open_write(remote, opts.flags, opts.start).await?;
            if let Some(mode) = opts.mode {
                channel.set_permissions(remote, mode).await?;
            }
            Ok(writer)
        })
        .await
    }
}

/// Copy until EOF, then flush. Errors name the side that failed.
async fn pipe<R, W>(reader: &mut R, writer: &mut W, from: &str, to: &str) -> Result<u64, SftpError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| SftpError::io_at(&e, from))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| SftpError::io_at(&e, to))?;
        total += n as u64;
    }
    writer.flush().await.map_err(|e| SftpError::io_at(&e, to))?;
    Ok(total)
}

async fn open_ranged(
    channel: &dyn RemoteChannel,
    remote: &str,
    opts: ReadOptions,
) -> Result<RemoteReader, SftpError> {
    let reader = channel.open_read(remote, opts.start).await?;
    let reader: RemoteReader = match opts.end {
        Some(end) => Box::new(reader.take(end.saturating_sub(opts.start))),
        None => reader,
    };
    Ok(reader)
}

pub(crate) async fn get_on(
    channel: &dyn RemoteChannel,
    remote: &str,
    target: GetTarget<'_>,
    opts: ReadOptions,
) -> Result<GetOutcome, SftpError> {
    let mut reader = open_ranged(channel, remote, opts).await?;
    match target {
        GetTarget::Buffer => {
            let mut buf = Vec::new();
            pipe(&mut reader, &mut buf, remote, "<buffer>").await?;
            debug!("Read {} bytes from {}", buf.len(), remote);
            Ok(GetOutcome::Buffer(buf))
        }
        GetTarget::Path(local) => {
            let label = local.display().to_string();
            let mut file = tokio::fs::File::create(local)
                .await
                .map_err(|e| SftpError::io_at(&e, &label))?;
            let n = pipe(&mut reader, &mut file, remote, &label).await?;
            info!("Downloaded {} to {} ({} bytes)", remote, label, n);
            Ok(GetOutcome::Written(n))
        }
        GetTarget::Writer(writer) => {
            let n = pipe(&mut reader, writer, remote, STREAM_LABEL).await?;
            Ok(GetOutcome::Written(n))
        }
    }
}

pub(crate) async fn put_on(
    channel: &dyn RemoteChannel,
    source: PutSource<'_>,
    remote: &str,
    opts: WriteOptions,
) -> Result<u64, SftpError> {
    let mut writer = channel.open_write(remote, opts.flags, opts.start).await?;
    let written = match source {
        PutSource::Buffer(data) => {
            writer
                .write_all(data)
                .await
                .map_err(|e| SftpError::io_at(&e, remote))?;
            data.len() as u64
        }
        PutSource::Path(local) => {
            let label = local.display().to_string();
            let mut file = tokio::fs::File::open(local)
                .await
                .map_err(|e| SftpError::io_at(&e, &label))?;
            pipe(&mut file, &mut writer, &label, remote).await?
        }
        PutSource::Reader(reader) => pipe(reader, &mut writer, STREAM_LABEL, remote).await?,
    };
    writer
        .shutdown()
        .await
        .map_err(|e| SftpError::io_at(&e, remote))?;

    if let Some(mode) = opts.mode {
        channel.set_permissions(remote, mode).await?;
    }
    debug!("Wrote {} bytes to {} ({:?})", written, remote, opts.flags);
    Ok(written)
}

/// Block offsets covering `size` bytes.
fn block_offsets(size: u64, chunk_size: usize) -> impl Iterator<Item = (u64, usize)> {
    let chunk = chunk_size.max(1) as u64;
    (0..size)
        .step_by(chunk as usize)
        .map(move |offset| (offset, chunk.min(size - offset) as usize))
}

pub(crate) async fn fast_get_on(
    channel: &dyn RemoteChannel,
    remote: &str,
    local: &Path,
    opts: FastTransferOptions,
) -> Result<u64, SftpError> {
    let attrs = channel.stat(remote).await?;
    if attrs.entry_type() != EntryType::File {
        return Err(SftpError::bad_path(format!(
            "Bad path: {} is not a regular file",
            remote
        )));
    }
    let size = attrs.size.unwrap_or(0);

    let label = local.display().to_string();
    let mut file = tokio::fs::File::create(local)
        .await
        .map_err(|e| SftpError::io_at(&e, &label))?;

    // Reads overlap, writes stay in file order
    let mut blocks = stream::iter(block_offsets(size, opts.chunk_size))
        .map(|(offset, len)| channel.read_block(remote, offset, len))
        .buffered(opts.concurrency.max(1));

    let mut total = 0u64;
    while let Some(block) = blocks.next().await {
        let block = block?;
        file.write_all(&block)
            .await
            .map_err(|e| SftpError::io_at(&e, &label))?;
        total += block.len() as u64;
    }
    file.flush().await.map_err(|e| SftpError::io_at(&e, &label))?;

    info!("Fast download of {} complete ({} bytes)", remote, total);
    Ok(total)
}

async fn read_local_block(local: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(local).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

pub(crate) async fn fast_put_on(
    channel: &dyn RemoteChannel,
    local: &Path,
    remote: &str,
    opts: FastTransferOptions,
) -> Result<u64, SftpError> {
    let size = tokio::fs::metadata(local)
        .await
        .map_err(|e| SftpError::io_at(&e, &local.display().to_string()))?
        .len();

    // Create or truncate before the block writes land
    let mut writer = channel.open_write(remote, WriteMode::Truncate, 0).await?;
    writer
        .shutdown()
        .await
        .map_err(|e| SftpError::io_at(&e, remote))?;

    let label = local.display().to_string();
    let label = label.as_str();
    let mut writes = stream::iter(block_offsets(size, opts.chunk_size))
        .map(|(offset, len)| async move {
            let data = read_local_block(local, offset, len)
                .await
                .map_err(|e| SftpError::io_at(&e, label))?;
            channel.write_block(remote, offset, &data).await?;
            Ok::<u64, SftpError>(len as u64)
        })
        .buffer_unordered(opts.concurrency.max(1));

    let mut total = 0u64;
    while let Some(written) = writes.next().await {
        total += written?;
    }

    info!("Fast upload of {} complete ({} bytes)", remote, total);
    Ok(total)
}
