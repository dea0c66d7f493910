//! Local filesystem checks run before any remote call
//!
//! Every failure here is a BadPath error naming the local path.

use std::fs::Metadata;
use std::io;
use std::path::Path;

use super::error::SftpError;

fn bad(path: &Path, reason: &str) -> SftpError {
    SftpError::bad_path(format!("Bad path: {} {}", path.display(), reason))
}

/// `path` must be an existing, readable regular file.
pub(crate) async fn check_local_readable(path: &Path) -> Result<Metadata, SftpError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(bad(path, "does not exist")),
        Err(e) => return Err(bad(path, &e.to_string())),
    };
    if !meta.is_file() {
        return Err(bad(path, "is not a regular file"));
    }
    tokio::fs::File::open(path)
        .await
        .map_err(|_| bad(path, "permission denied"))?;
    Ok(meta)
}

/// `path` must be writable: an existing non-directory that is not read-only,
/// or a new name inside a writable directory.
pub(crate) async fn check_local_writable(path: &Path) -> Result<(), SftpError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Err(bad(path, "is a directory")),
        Ok(meta) if meta.permissions().readonly() => Err(bad(path, "permission denied")),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            match tokio::fs::metadata(parent).await {
                Ok(meta) if !meta.is_dir() => Err(bad(parent, "is not a directory")),
                Ok(meta) if meta.permissions().readonly() => {
                    Err(bad(parent, "permission denied"))
                }
                Ok(_) => Ok(()),
                Err(_) => Err(bad(parent, "does not exist")),
            }
        }
        Err(e) => Err(bad(path, &e.to_string())),
    }
}

/// Make sure `path` is a writable directory, creating it when absent.
pub(crate) async fn ensure_local_dir(path: &Path) -> Result<(), SftpError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_dir() => Err(bad(path, "is not a directory")),
        Ok(meta) if meta.permissions().readonly() => Err(bad(path, "permission denied")),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| bad(path, &e.to_string())),
        Err(e) => Err(bad(path, &e.to_string())),
    }
}
