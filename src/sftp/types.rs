//! SFTP data types

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use russh_sftp::protocol::FileAttributes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::SftpError;

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

/// Type of a remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    Directory,
    File,
    Symlink,
    /// Device, socket, FIFO or anything else
    Other,
}

impl EntryType {
    /// Single-character form used in long listings (`d`, `-`, `l`).
    pub fn as_char(&self) -> char {
        match self {
            EntryType::Directory => 'd',
            EntryType::File => '-',
            EntryType::Symlink => 'l',
            EntryType::Other => '?',
        }
    }

    pub fn from_char(c: char) -> Self {
        match c {
            'd' => EntryType::Directory,
            '-' => EntryType::File,
            'l' => EntryType::Symlink,
            _ => EntryType::Other,
        }
    }

    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => EntryType::Directory,
            S_IFREG => EntryType::File,
            S_IFLNK => EntryType::Symlink,
            _ => EntryType::Other,
        }
    }
}

/// Permission triads with the `-` placeholders removed, e.g. `rwx`, `rx`, `r`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rights {
    pub user: String,
    pub group: String,
    pub other: String,
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Object type derived from the long-form descriptor
    pub entry_type: EntryType,
    /// File name (not full path)
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification, milliseconds since the epoch
    pub modify_time: i64,
    /// Last access, milliseconds since the epoch
    pub access_time: i64,
    pub rights: Rights,
    /// Owning uid
    pub owner: u32,
    /// Owning gid
    pub group: u32,
    /// Raw long-form descriptor line
    pub longname: String,
}

/// Attribute subset the client consumes from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    /// Seconds since the epoch
    pub atime: Option<u32>,
    /// Seconds since the epoch
    pub mtime: Option<u32>,
}

impl RemoteAttrs {
    pub fn mode(&self) -> u32 {
        self.permissions.unwrap_or(0)
    }

    pub fn entry_type(&self) -> EntryType {
        EntryType::from_mode(self.mode())
    }
}

impl From<&FileAttributes> for RemoteAttrs {
    fn from(attrs: &FileAttributes) -> Self {
        Self {
            size: attrs.size,
            uid: attrs.uid,
            gid: attrs.gid,
            permissions: attrs.permissions,
            atime: attrs.atime,
            mtime: attrs.mtime,
        }
    }
}

/// Normalized result of `stat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Milliseconds since the epoch
    pub access_time: i64,
    /// Milliseconds since the epoch
    pub modify_time: i64,
    pub is_directory: bool,
    pub is_file: bool,
    pub is_block_device: bool,
    pub is_character_device: bool,
    pub is_symbolic_link: bool,
    pub is_fifo: bool,
    pub is_socket: bool,
}

impl From<RemoteAttrs> for FileStats {
    fn from(attrs: RemoteAttrs) -> Self {
        let mode = attrs.mode();
        let fmt = mode & S_IFMT;
        Self {
            mode,
            uid: attrs.uid.unwrap_or(0),
            gid: attrs.gid.unwrap_or(0),
            size: attrs.size.unwrap_or(0),
            access_time: secs_to_millis(attrs.atime),
            modify_time: secs_to_millis(attrs.mtime),
            is_directory: fmt == S_IFDIR,
            is_file: fmt == S_IFREG,
            is_block_device: fmt == S_IFBLK,
            is_character_device: fmt == S_IFCHR,
            is_symbolic_link: fmt == S_IFLNK,
            is_fifo: fmt == S_IFIFO,
            is_socket: fmt == S_IFSOCK,
        }
    }
}

fn secs_to_millis(secs: Option<u32>) -> i64 {
    secs.map(|s| s as i64 * 1000).unwrap_or(0)
}

/// Directory entry as returned by the channel, before parsing.
#[derive(Debug, Clone)]
pub struct RawDirEntry {
    pub filename: String,
    /// `ls -l` style descriptor; empty when the server did not send one
    pub longname: String,
    pub attrs: RemoteAttrs,
}

impl RawDirEntry {
    pub fn into_entry(self) -> RemoteEntry {
        let longname = if self.longname.is_empty() {
            format_longname(&self.filename, &self.attrs)
        } else {
            self.longname
        };
        let (entry_type, rights) = parse_longname(&longname);
        RemoteEntry {
            entry_type,
            name: self.filename,
            size: self.attrs.size.unwrap_or(0),
            modify_time: secs_to_millis(self.attrs.mtime),
            access_time: secs_to_millis(self.attrs.atime),
            rights,
            owner: self.attrs.uid.unwrap_or(0),
            group: self.attrs.gid.unwrap_or(0),
            longname,
        }
    }
}

/// Outcome of `mkdir`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MkdirOutcome {
    Created,
    AlreadyExists,
}

/// How a remote file is opened for writing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Create or truncate
    #[default]
    Truncate,
    /// Create if missing, write at the end
    Append,
    /// Create if missing, keep existing content
    Update,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// First byte to read
    pub start: u64,
    /// Stop before this offset
    pub end: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Offset the first byte lands at (ignored in append mode)
    pub start: u64,
    /// Permission bits applied once the write completes
    pub mode: Option<u32>,
    pub flags: WriteMode,
}

#[derive(Debug, Clone, Copy)]
pub struct FastTransferOptions {
    /// Block requests in flight at once
    pub concurrency: usize,
    /// Block size in bytes
    pub chunk_size: usize,
}

impl Default for FastTransferOptions {
    fn default() -> Self {
        Self {
            concurrency: constants::FAST_TRANSFER_CONCURRENCY,
            chunk_size: constants::FAST_TRANSFER_CHUNK_SIZE,
        }
    }
}

/// Inclusion predicate over `(path, is_directory)` used by directory sync.
pub type SyncFilter = dyn Fn(&str, bool) -> bool + Send + Sync;

/// Predicate over listing entries.
pub type EntryFilter = dyn Fn(&RemoteEntry) -> bool + Send + Sync;

#[derive(Clone, Default)]
pub struct SyncOptions {
    pub filter: Option<Arc<SyncFilter>>,
    /// Move files with the parallel block transfer instead of a stream
    pub use_fast_transfer: bool,
}

impl SyncOptions {
    pub fn with_filter(mut self, filter: impl Fn(&str, bool) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn fast(mut self) -> Self {
        self.use_fast_transfer = true;
        self
    }

    pub(crate) fn accepts(&self, path: &str, is_dir: bool) -> bool {
        self.filter.as_ref().map_or(true, |f| f(path, is_dir))
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("filter", &self.filter.is_some())
            .field("use_fast_transfer", &self.use_fast_transfer)
            .finish()
    }
}

/// Sync filter keeping directories and files whose name matches `pattern`.
pub fn glob_filter(pattern: &str) -> Result<Arc<SyncFilter>, SftpError> {
    let pattern = glob::Pattern::new(pattern)
        .map_err(|e| SftpError::bad_path(format!("Invalid pattern '{}': {}", pattern, e)))?;
    Ok(Arc::new(move |path: &str, is_dir: bool| {
        if is_dir {
            return true;
        }
        let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
        pattern.matches(name)
    }))
}

/// Where `get` puts the downloaded bytes.
pub enum GetTarget<'a> {
    /// Collect into memory
    Buffer,
    /// Write to a local file
    Path(&'a Path),
    /// Stream into a caller-owned writer
    Writer(&'a mut (dyn AsyncWrite + Send + Unpin)),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Buffer(Vec<u8>),
    /// Bytes written to a path or writer
    Written(u64),
}

/// Where `put` and `append` take bytes from.
pub enum PutSource<'a> {
    Buffer(&'a [u8]),
    Path(&'a Path),
    Reader(&'a mut (dyn AsyncRead + Send + Unpin)),
}

/// `drwxr-xr-x` style rendering of a mode.
pub fn permission_string(mode: u32) -> String {
    let mut s = String::with_capacity(10);
    s.push(match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFBLK => 'b',
        S_IFCHR => 'c',
        S_IFIFO => 'p',
        S_IFSOCK => 's',
        _ => '-',
    });
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}

/// Builds an `ls -l` style line for servers that omit one.
pub fn format_longname(name: &str, attrs: &RemoteAttrs) -> String {
    let date = attrs
        .mtime
        .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0))
        .map(|d| d.format("%b %d %H:%M").to_string())
        .unwrap_or_else(|| "Jan 01 00:00".to_string());
    format!(
        "{} 1 {} {} {} {} {}",
        permission_string(attrs.mode()),
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        date,
        name
    )
}

/// Type and permission triads from the first column of a long listing.
pub fn parse_longname(longname: &str) -> (EntryType, Rights) {
    let chars: Vec<char> = longname.chars().take(10).collect();
    let Some(first) = chars.first() else {
        return (EntryType::Other, Rights::default());
    };
    let entry_type = EntryType::from_char(*first);
    let triad = |from: usize| -> String {
        chars
            .iter()
            .skip(from)
            .take(3)
            .filter(|c| **c != '-')
            .collect()
    };
    let rights = Rights {
        user: triad(1),
        group: triad(4),
        other: triad(7),
    };
    (entry_type, rights)
}

/// Constants
pub mod constants {
    use std::time::Duration;

    /// Block size for parallel block transfers
    pub const FAST_TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

    /// Block requests in flight during parallel transfers
    pub const FAST_TRANSFER_CONCURRENCY: usize = 16;

    /// Buffer size for streamed copies
    pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

    /// Window after connect in which a trailing termination signal of the
    /// same attempt is still attributed to it
    pub const CONNECT_SETTLE_DELAY: Duration = Duration::from_millis(100);

    /// Longest `end()` waits for the transport to report closure
    pub const END_TIMEOUT: Duration = Duration::from_secs(10);
}
