//! Directory trees: upload, download and recursive removal
//!
//! Traversal keeps an explicit stack of open directories. Every transfer and
//! deletion runs one at a time.

use std::path::{Path, PathBuf};
use std::vec;

use tracing::{debug, info};

use super::channel::RemoteChannel;
use super::error::SftpError;
use super::local::ensure_local_dir;
use super::ops::{absolute_path, exists_on, list_on, mkdir_on, target_type};
use super::path_utils::join_remote_path;
use super::transfer::{fast_get_on, fast_put_on, get_on, put_on};
use super::types::{
    EntryType, FastTransferOptions, GetTarget, PutSource, ReadOptions, RemoteEntry, SyncOptions,
    WriteOptions,
};
use crate::client::SftpClient;
use crate::session::ClientEvent;

#[derive(Debug)]
struct LocalEntry {
    name: String,
    is_dir: bool,
    is_file: bool,
}

/// One directory being walked, with the entries still to visit.
struct Frame<E> {
    local: PathBuf,
    remote: String,
    entries: vec::IntoIter<E>,
}

impl SftpClient {
    /// Copy a local directory tree to `remote`. Returns the number of files
    /// uploaded.
    ///
    /// Only directories and regular files are copied.
    pub async fn upload_dir(
        &self,
        local: &Path,
        remote: &str,
        opts: &SyncOptions,
    ) -> Result<u64, SftpError> {
        self.guarded("upload_dir", async {
            match tokio::fs::metadata(local).await {
                Ok(meta) if meta.is_dir() => {}
                _ => {
                    return Err(SftpError::bad_path(format!(
                        "Bad path: {} is not a directory",
                        local.display()
                    )))
                }
            }
            let channel = self.channel()?;
            let root = absolute_path(&*channel, remote).await?;
            ensure_remote_dir(&*channel, &root).await?;
            info!("Uploading directory {} to {}", local.display(), root);

            let mut stack = vec![Frame {
                entries: read_local_dir(local, opts).await?,
                local: local.to_path_buf(),
                remote: root,
            }];
            let mut count = 0u64;

            while let Some(frame) = stack.last_mut() {
                let Some(entry) = frame.entries.next() else {
                    stack.pop();
                    continue;
                };
                let local_path = frame.local.join(&entry.name);
                let remote_path = join_remote_path(&frame.remote, &entry.name);

                if entry.is_dir {
                    mkdir_on(&*channel, &remote_path, false).await?;
                    stack.push(Frame {
                        entries: read_local_dir(&local_path, opts).await?,
                        local: local_path,
                        remote: remote_path,
                    });
                } else if entry.is_file {
                    if opts.use_fast_transfer {
                        fast_put_on(
                            &*channel,
                            &local_path,
                            &remote_path,
                            FastTransferOptions::default(),
                        )
                        .await?;
                    } else {
                        put_on(
                            &*channel,
                            PutSource::Path(&local_path),
                            &remote_path,
                            WriteOptions::default(),
                        )
                        .await?;
                    }
                    self.lifecycle.publish(ClientEvent::Upload {
                        source: local_path,
                        destination: remote_path,
                    });
                    count += 1;
                } else {
                    debug!("Skipping {}: not a regular file", local_path.display());
                }
            }

            info!("Upload directory complete: {} files", count);
            Ok(count)
        })
        .await
    }

    /// Copy a remote directory tree into `local`. Returns the number of files
    /// downloaded.
    pub async fn download_dir(
        &self,
        remote: &str,
        local: &Path,
        opts: &SyncOptions,
    ) -> Result<u64, SftpError> {
        self.guarded("download_dir", async {
            let channel = self.channel()?;
            if target_type(&*channel, remote).await? != Some(EntryType::Directory) {
                return Err(SftpError::bad_path(format!(
                    "Bad path: {} is not a remote directory",
                    remote
                )));
            }
            ensure_local_dir(local).await?;
            info!("Downloading directory {} to {}", remote, local.display());

            let mut stack = vec![Frame {
                entries: read_remote_dir(&*channel, remote, opts).await?,
                local: local.to_path_buf(),
                remote: remote.to_string(),
            }];
            let mut count = 0u64;

            while let Some(frame) = stack.last_mut() {
                let Some(entry) = frame.entries.next() else {
                    stack.pop();
                    continue;
                };
                let local_path = frame.local.join(&entry.name);
                let remote_path = join_remote_path(&frame.remote, &entry.name);

                match entry.entry_type {
                    EntryType::Directory => {
                        ensure_local_dir(&local_path).await?;
                        stack.push(Frame {
                            entries: read_remote_dir(&*channel, &remote_path, opts).await?,
                            local: local_path,
                            remote: remote_path,
                        });
                    }
                    EntryType::File => {
                        if opts.use_fast_transfer {
                            fast_get_on(
                                &*channel,
                                &remote_path,
                                &local_path,
                                FastTransferOptions::default(),
                            )
                            .await?;
                        } else {
                            get_on(
                                &*channel,
                                &remote_path,
                                GetTarget::Path(&local_path),
                                ReadOptions::default(),
                            )
                            .await?;
                        }
                        self.lifecycle.publish(ClientEvent::Download {
                            source: remote_path,
                            destination: local_path,
                        });
                        count += 1;
                    }
                    _ => debug!("Skipping {}: not a regular file", remote_path),
                }
            }

            info!("Download directory complete: {} files", count);
            Ok(count)
        })
        .await
    }

    /// Remove a remote directory. With `recursive`, its contents go first.
    pub async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), SftpError> {
        self.guarded("rmdir", async {
            let channel = self.channel()?;
            match exists_on(&*channel, path).await? {
                Some(EntryType::Directory) => {}
                Some(_) => {
                    return Err(SftpError::bad_path(format!(
                        "Bad path: {} not a directory",
                        path
                    )))
                }
                None => {
                    return Err(SftpError::bad_path(format!(
                        "Bad path: {} No such directory",
                        path
                    )))
                }
            }

            if !recursive {
                channel.remove_dir(path).await?;
                info!("Removed directory {}", path);
                return Ok(());
            }

            // Parents are recorded before their children
            let mut dirs = Vec::new();
            let mut files = Vec::new();
            let mut pending = vec![path.to_string()];
            while let Some(dir) = pending.pop() {
                for entry in list_on(&*channel, &dir).await? {
                    let child = join_remote_path(&dir, &entry.name);
                    if entry.entry_type == EntryType::Directory {
                        pending.push(child);
                    } else {
                        files.push(child);
                    }
                }
                dirs.push(dir);
            }

            for file in &files {
                channel.remove_file(file).await?;
            }
            for dir in dirs.iter().rev() {
                channel.remove_dir(dir).await?;
            }
            info!(
                "Removed {} ({} files, {} directories)",
                path,
                files.len(),
                dirs.len()
            );
            Ok(())
        })
        .await
    }
}

/// Make `root` a directory: create it when missing, follow a symlink to one.
async fn ensure_remote_dir(channel: &dyn RemoteChannel, root: &str) -> Result<(), SftpError> {
    let is_dir = match exists_on(channel, root).await? {
        None => {
            mkdir_on(channel, root, true).await?;
            true
        }
        Some(EntryType::Directory) => true,
        Some(EntryType::Symlink) => {
            target_type(channel, root).await? == Some(EntryType::Directory)
        }
        Some(_) => false,
    };
    if is_dir {
        Ok(())
    } else {
        Err(SftpError::bad_path(format!(
            "Bad path: {} is not a directory",
            root
        )))
    }
}

async fn read_local_dir(
    dir: &Path,
    opts: &SyncOptions,
) -> Result<vec::IntoIter<LocalEntry>, SftpError> {
    let label = dir.display().to_string();
    let mut reader = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| SftpError::io_at(&e, &label))?;

    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| SftpError::io_at(&e, &label))?
    {
        // Symlinks are not followed
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| SftpError::io_at(&e, &label))?;
        let path = entry.path();
        if !opts.accepts(&path.to_string_lossy(), file_type.is_dir()) {
            continue;
        }
        entries.push(LocalEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: file_type.is_dir(),
            is_file: file_type.is_file(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries.into_iter())
}

async fn read_remote_dir(
    channel: &dyn RemoteChannel,
    dir: &str,
    opts: &SyncOptions,
) -> Result<vec::IntoIter<RemoteEntry>, SftpError> {
    let mut entries = list_on(channel, dir).await?;
    entries.retain(|entry| {
        opts.accepts(
            &join_remote_path(dir, &entry.name),
            entry.entry_type == EntryType::Directory,
        )
    });
    Ok(entries.into_iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::error::{ErrorCode, ErrorKind};
    use crate::sftp::types::glob_filter;
    use crate::testing::connected_client;
    use std::fs;
    use tempfile::TempDir;

    fn local_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("README.md"), b"readme").unwrap();
        fs::write(root.join("src/main.rs"), b"fn main() {}").unwrap();
        fs::write(root.join("src/nested/notes.txt"), b"notes").unwrap();
        fs::write(root.join("src/nested/skip.tmp"), b"tmp").unwrap();
        tmp
    }

    #[tokio::test]
    async fn test_upload_dir_creates_destination_and_copies_tree() {
        let (client, _, channel) = connected_client().await;
        let tmp = local_tree();
        let mut events = client.subscribe();

        let count = client
            .upload_dir(tmp.path(), "backup/site", &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(count, 4);
        assert_eq!(channel.file("/home/user/backup/site/README.md").unwrap(), b"readme");
        assert_eq!(
            channel.file("/home/user/backup/site/src/nested/notes.txt").unwrap(),
            b"notes"
        );
        assert!(channel.is_dir("/home/user/backup/site/src/nested"));

        // Depth-first in name order
        let mut uploaded = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Upload { destination, .. } = event {
                uploaded.push(destination);
            }
        }
        assert_eq!(
            uploaded,
            vec![
                "/home/user/backup/site/README.md",
                "/home/user/backup/site/src/main.rs",
                "/home/user/backup/site/src/nested/notes.txt",
                "/home/user/backup/site/src/nested/skip.tmp",
            ]
        );
    }

    #[tokio::test]
    async fn test_upload_dir_with_filter() {
        let (client, _, channel) = connected_client().await;
        let tmp = local_tree();
        let opts = SyncOptions {
            filter: Some(glob_filter("*.txt").unwrap()),
            ..Default::default()
        };

        let count = client.upload_dir(tmp.path(), "/up", &opts).await.unwrap();
        assert_eq!(count, 1);
        assert!(channel.file("/up/src/nested/notes.txt").is_some());
        assert!(!channel.contains("/up/README.md"));
        assert!(!channel.contains("/up/src/nested/skip.tmp"));
    }

    #[tokio::test]
    async fn test_upload_dir_filter_can_prune_directories() {
        let (client, _, channel) = connected_client().await;
        let tmp = local_tree();
        let opts = SyncOptions::default()
            .with_filter(|path, is_dir| !(is_dir && path.ends_with("nested")));

        let count = client.upload_dir(tmp.path(), "/up", &opts).await.unwrap();
        assert_eq!(count, 2);
        assert!(!channel.contains("/up/src/nested"));
    }

    #[tokio::test]
    async fn test_upload_dir_fast() {
        let (client, _, channel) = connected_client().await;
        let tmp = local_tree();

        let count = client
            .upload_dir(tmp.path(), "/fast", &SyncOptions::default().fast())
            .await
            .unwrap();
        assert_eq!(count, 4);
        assert_eq!(channel.file("/fast/src/main.rs").unwrap(), b"fn main() {}");
    }

    #[tokio::test]
    async fn test_upload_dir_rejects_bad_source_and_destination() {
        let (client, _, channel) = connected_client().await;
        let tmp = local_tree();

        let err = client
            .upload_dir(&tmp.path().join("README.md"), "/up", &SyncOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadPath);
        assert_eq!(err.op(), Some("upload_dir"));
        assert!(channel.log().is_empty());

        channel.add_file("/taken", b"");
        let err = client
            .upload_dir(tmp.path(), "/taken", &SyncOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadPath);
    }

    #[tokio::test]
    async fn test_upload_dir_destination_symlink_must_reach_directory() {
        let (client, _, channel) = connected_client().await;
        let tmp = local_tree();
        channel.add_file("/plain", b"");
        channel.add_symlink("/to-file", "/plain");

        let err = client
            .upload_dir(tmp.path(), "/to-file", &SyncOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadPath);
        assert!(channel.calls("open-write").is_empty());
    }

    #[tokio::test]
    async fn test_download_dir() {
        let (client, _, channel) = connected_client().await;
        channel.add_dir("/srv");
        channel.add_dir("/srv/logs");
        channel.add_file("/srv/index.html", b"<html>");
        channel.add_file("/srv/logs/app.log", b"started");
        channel.add_socket("/srv/control.sock");
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("mirror");
        let mut events = client.subscribe();

        let count = client
            .download_dir("/srv", &dest, &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(fs::read(dest.join("index.html")).unwrap(), b"<html>");
        assert_eq!(fs::read(dest.join("logs/app.log")).unwrap(), b"started");
        assert!(!dest.join("control.sock").exists());

        let mut sources = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Download { source, .. } = event {
                sources.push(source);
            }
        }
        assert_eq!(sources, vec!["/srv/index.html", "/srv/logs/app.log"]);
    }

    #[tokio::test]
    async fn test_download_dir_fast_with_filter() {
        let (client, _, channel) = connected_client().await;
        channel.add_dir("/srv");
        channel.add_file("/srv/a.txt", b"a");
        channel.add_file("/srv/b.bin", b"b");
        let tmp = TempDir::new().unwrap();
        let opts = SyncOptions::default()
            .with_filter(|path, _| path.ends_with(".txt"))
            .fast();

        let count = client.download_dir("/srv", tmp.path(), &opts).await.unwrap();
        assert_eq!(count, 1);
        assert!(tmp.path().join("a.txt").exists());
        assert!(!tmp.path().join("b.bin").exists());
    }

    #[tokio::test]
    async fn test_download_dir_filter_can_prune_directories() {
        let (client, _, channel) = connected_client().await;
        channel.add_dir("/srv");
        channel.add_dir("/srv/cache");
        channel.add_dir("/srv/cache/deep");
        channel.add_file("/srv/keep.txt", b"keep");
        channel.add_file("/srv/cache/a.txt", b"a");
        channel.add_file("/srv/cache/deep/b.txt", b"b");
        let tmp = TempDir::new().unwrap();
        let mut events = client.subscribe();
        let opts = SyncOptions::default()
            .with_filter(|path, is_dir| !(is_dir && path.ends_with("/cache")));

        let count = client.download_dir("/srv", tmp.path(), &opts).await.unwrap();
        assert_eq!(count, 1);
        assert!(tmp.path().join("keep.txt").exists());
        assert!(!tmp.path().join("cache").exists());
        assert!(channel
            .calls("readdir")
            .iter()
            .all(|path| !path.starts_with("/srv/cache")));

        let mut sources = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Download { source, .. } = event {
                sources.push(source);
            }
        }
        assert_eq!(sources, vec!["/srv/keep.txt"]);
    }

    #[tokio::test]
    async fn test_upload_dir_reports_every_file_of_a_large_tree() {
        let (client, _, channel) = connected_client().await;
        let tmp = TempDir::new().unwrap();
        for i in 0..300 {
            fs::write(tmp.path().join(format!("f{:03}.dat", i)), b"x").unwrap();
        }
        let mut events = client.subscribe();

        let count = client
            .upload_dir(tmp.path(), "/bulk", &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(count, 300);
        assert!(channel.file("/bulk/f299.dat").is_some());

        let mut uploaded = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::Upload { .. }) {
                uploaded += 1;
            }
        }
        assert_eq!(uploaded, 300);
    }

    #[tokio::test]
    async fn test_download_dir_bad_paths() {
        let (client, _, channel) = connected_client().await;
        channel.add_file("/file", b"");
        let tmp = TempDir::new().unwrap();

        let err = client
            .download_dir("/file", tmp.path(), &SyncOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadPath);

        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let err = client
            .download_dir("/home", &blocker, &SyncOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadPath);
        assert_eq!(err.op(), Some("download_dir"));
    }

    #[tokio::test]
    async fn test_rmdir_requires_directory() {
        let (client, _, channel) = connected_client().await;
        channel.add_file("/home/user/f", b"");

        let err = client.rmdir("/home/user/missing", false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadPath);
        let err = client.rmdir("/home/user/f", true).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadPath);
        assert!(channel.calls("rm").is_empty());
        assert!(channel.calls("rmdir").is_empty());
    }

    #[tokio::test]
    async fn test_rmdir_non_recursive() {
        let (client, _, channel) = connected_client().await;
        channel.add_dir("/home/user/empty");
        channel.add_dir("/home/user/full");
        channel.add_file("/home/user/full/x", b"");

        client.rmdir("/home/user/empty", false).await.unwrap();
        assert!(!channel.contains("/home/user/empty"));

        let err = client.rmdir("/home/user/full", false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Failure);
        assert_eq!(err.op(), Some("rmdir"));
    }

    #[tokio::test]
    async fn test_rmdir_recursive_files_first_then_deepest_dirs() {
        let (client, _, channel) = connected_client().await;
        channel.add_dir("/t");
        channel.add_dir("/t/a");
        channel.add_dir("/t/a/b");
        channel.add_dir("/t/c");
        channel.add_file("/t/top.txt", b"");
        channel.add_file("/t/a/b/deep.txt", b"");
        channel.add_file("/t/c/side.txt", b"");
        channel.add_symlink("/t/a/link", "/home/user");

        client.rmdir("/t", true).await.unwrap();
        assert!(!channel.contains("/t"));
        assert!(channel.is_dir("/home/user"));

        let log = channel.log();
        let last_rm = log.iter().rposition(|l| l.starts_with("rm ")).unwrap();
        let first_rmdir = log.iter().position(|l| l.starts_with("rmdir ")).unwrap();
        assert!(last_rm < first_rmdir);

        let rmdirs = channel.calls("rmdir");
        assert_eq!(rmdirs.last().unwrap(), "/t");
        let pos = |p: &str| rmdirs.iter().position(|d| d == p).unwrap();
        assert!(pos("/t/a/b") < pos("/t/a"));
        assert_eq!(rmdirs.len(), 4);
    }
}
