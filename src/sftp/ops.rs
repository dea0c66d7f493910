//! Single-object remote operations: path resolution, metadata, listing,
//! delete, rename, chmod and mkdir.
//!
//! The public methods live on [`SftpClient`]; the `*_on` helpers take a bare
//! channel so directory sync can reuse them under its own operation name.

use tracing::{debug, info};

use super::channel::RemoteChannel;
use super::error::{ErrorCode, SftpError};
use super::path_utils::{
    is_absolute_remote_path, normalize_remote_path, resolve_remote_path, split_remote_parent,
};
use super::types::{EntryFilter, EntryType, FileStats, MkdirOutcome, RemoteEntry};
use crate::client::SftpClient;

impl SftpClient {
    /// Server-side canonical form of `path`, or `""` if it does not exist.
    pub async fn real_path(&self, path: &str) -> Result<String, SftpError> {
        self.guarded("real_path", async {
            let channel = self.channel()?;
            canonical_or_empty(&*channel, path).await
        })
        .await
    }

    /// Current remote working directory.
    pub async fn cwd(&self) -> Result<String, SftpError> {
        self.guarded("cwd", async {
            let channel = self.channel()?;
            canonical_or_empty(&*channel, ".").await
        })
        .await
    }

    pub async fn stat(&self, path: &str) -> Result<FileStats, SftpError> {
        self.guarded("stat", async {
            let channel = self.channel()?;
            let attrs = channel.stat(path).await.map_err(|e| absent_as(e, path))?;
            Ok(FileStats::from(attrs))
        })
        .await
    }

    /// Like [`stat`](Self::stat) without following a final symlink.
    pub async fn lstat(&self, path: &str) -> Result<FileStats, SftpError> {
        self.guarded("lstat", async {
            let channel = self.channel()?;
            let attrs = channel.lstat(path).await.map_err(|e| absent_as(e, path))?;
            Ok(FileStats::from(attrs))
        })
        .await
    }

    /// Type of the object at `path`, `None` if there is nothing there.
    ///
    /// Special files (sockets, devices, FIFOs) also answer `None`.
    pub async fn exists(&self, path: &str) -> Result<Option<EntryType>, SftpError> {
        self.guarded("exists", async {
            let channel = self.channel()?;
            exists_on(&*channel, path).await
        })
        .await
    }

    /// Directory entries in server order, without `.` and `..`.
    pub async fn list(
        &self,
        path: &str,
        filter: Option<&EntryFilter>,
    ) -> Result<Vec<RemoteEntry>, SftpError> {
        self.guarded("list", async {
            let channel = self.channel()?;
            let mut entries = list_on(&*channel, path).await?;
            if let Some(filter) = filter {
                entries.retain(|entry| filter(entry));
            }
            Ok(entries)
        })
        .await
    }

    /// Remove a file. With `not_found_ok` a missing file is not an error.
    pub async fn delete(&self, path: &str, not_found_ok: bool) -> Result<(), SftpError> {
        self.guarded("delete", async {
            let channel = self.channel()?;
            match channel.remove_file(path).await {
                Ok(()) => {
                    info!("Deleted {}", path);
                    Ok(())
                }
                Err(e) if e.is_not_exist() && not_found_ok => {
                    debug!("Delete of missing {} ignored", path);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.guarded("rename", async {
            let channel = self.channel()?;
            info!("Renaming {} to {}", from, to);
            channel.rename(from, to).await
        })
        .await
    }

    /// Rename that replaces an existing target atomically.
    pub async fn posix_rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.guarded("posix_rename", async {
            let channel = self.channel()?;
            info!("POSIX renaming {} to {}", from, to);
            channel.posix_rename(from, to).await
        })
        .await
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        self.guarded("chmod", async {
            let channel = self.channel()?;
            debug!("chmod {:o} {}", mode, path);
            channel.set_permissions(path, mode).await
        })
        .await
    }

    /// Create a directory, and with `recursive` any missing parents.
    pub async fn mkdir(&self, path: &str, recursive: bool) -> Result<MkdirOutcome, SftpError> {
        self.guarded("mkdir", async {
            let channel = self.channel()?;
            mkdir_on(&*channel, path, recursive).await
        })
        .await
    }
}

async fn canonical_or_empty(channel: &dyn RemoteChannel, path: &str) -> Result<String, SftpError> {
    match channel.canonicalize(path).await {
        Ok(resolved) => Ok(resolved),
        Err(e) if e.is_not_exist() => Ok(String::new()),
        Err(e) => Err(e),
    }
}

fn absent_as(err: SftpError, path: &str) -> SftpError {
    if err.is_not_exist() {
        SftpError::not_exist(path)
    } else {
        err
    }
}

/// Absolute, normalized form of a path that may not exist yet.
pub(crate) async fn absolute_path(
    channel: &dyn RemoteChannel,
    path: &str,
) -> Result<String, SftpError> {
    if is_absolute_remote_path(path) {
        return Ok(normalize_remote_path(path));
    }
    let cwd = channel.canonicalize(".").await?;
    Ok(resolve_remote_path(&cwd, path))
}

pub(crate) async fn exists_on(
    channel: &dyn RemoteChannel,
    path: &str,
) -> Result<Option<EntryType>, SftpError> {
    if path == "." {
        return Ok(Some(EntryType::Directory));
    }
    match channel.lstat(path).await {
        Ok(attrs) => Ok(match attrs.entry_type() {
            EntryType::Other => None,
            known => Some(known),
        }),
        Err(e) if e.is_not_exist() => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) async fn list_on(
    channel: &dyn RemoteChannel,
    path: &str,
) -> Result<Vec<RemoteEntry>, SftpError> {
    let raw = channel.read_dir(path).await?;
    let entries: Vec<RemoteEntry> = raw
        .into_iter()
        .filter(|entry| entry.filename != "." && entry.filename != "..")
        .map(|entry| entry.into_entry())
        .collect();
    debug!("Listed {} entries in {}", entries.len(), path);
    Ok(entries)
}

/// Type of `path` after following symlinks, `None` when absent.
pub(crate) async fn target_type(
    channel: &dyn RemoteChannel,
    path: &str,
) -> Result<Option<EntryType>, SftpError> {
    match channel.stat(path).await {
        Ok(attrs) => Ok(Some(attrs.entry_type())),
        Err(e) if e.is_not_exist() => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) async fn mkdir_on(
    channel: &dyn RemoteChannel,
    path: &str,
    recursive: bool,
) -> Result<MkdirOutcome, SftpError> {
    let target = absolute_path(channel, path).await?;

    match target_type(channel, &target).await? {
        Some(EntryType::Directory) => {
            debug!("Directory {} already exists", target);
            return Ok(MkdirOutcome::AlreadyExists);
        }
        Some(_) => {
            return Err(SftpError::bad_path(format!(
                "Bad path: {} already exists as a file",
                target
            )))
        }
        None => {}
    }

    if !recursive {
        create_one(channel, &target).await?;
        info!("Created directory {}", target);
        return Ok(MkdirOutcome::Created);
    }

    // Walk up to the nearest existing ancestor
    let mut missing = vec![target.clone()];
    let mut current = target.clone();
    while let Some((parent, _)) = split_remote_parent(&current) {
        let parent = parent.to_string();
        match target_type(channel, &parent).await? {
            Some(EntryType::Directory) => break,
            Some(_) => {
                return Err(SftpError::bad_path(format!(
                    "Bad path: {} is not a directory",
                    parent
                )))
            }
            None => {
                missing.push(parent.clone());
                current = parent;
            }
        }
    }

    for dir in missing.iter().rev() {
        create_one(channel, dir).await?;
    }
    info!("Created directory {} ({} levels)", target, missing.len());
    Ok(MkdirOutcome::Created)
}

async fn create_one(channel: &dyn RemoteChannel, path: &str) -> Result<(), SftpError> {
    let Err(e) = channel.create_dir(path).await else {
        return Ok(());
    };
    match e.code() {
        ErrorCode::NoSuchFile => Err(SftpError::bad_path(format!(
            "Bad path: {} parent not a directory or not exist",
            path
        ))),
        ErrorCode::PermissionDenied => Err(SftpError::bad_path(format!(
            "Bad path: {} permission denied",
            path
        ))),
        // Generic failure: somebody may have created it concurrently
        ErrorCode::Failure => match target_type(channel, path).await? {
            Some(EntryType::Directory) => Ok(()),
            _ => Err(e),
        },
        _ => Err(e),
    }
}
