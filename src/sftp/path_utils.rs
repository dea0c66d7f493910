//! Remote path utilities
//!
//! Remote SFTP paths always use `/` as separator, even when the server runs
//! on Windows. These helpers never touch the network; anything needing the
//! server's view of a path goes through `SftpClient::real_path`.

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.is_empty() {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Lexically collapse `.`, `..` and repeated separators.
///
/// `..` above the root of an absolute path stays at the root; on a relative
/// path it is kept, since only the server can resolve it.
pub fn normalize_remote_path(path: &str) -> String {
    let absolute = is_absolute_remote_path(path);
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&"..") | None if !absolute => parts.push(".."),
                Some(_) => {
                    parts.pop();
                }
                None => {}
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Resolve `path` against the remote working directory `cwd`.
///
/// `~` and `~/...` are taken relative to `cwd`, which SFTP servers start in
/// the login user's home directory.
pub fn resolve_remote_path(cwd: &str, path: &str) -> String {
    let rest = if path == "~" {
        ""
    } else if let Some(rest) = path.strip_prefix("~/") {
        rest
    } else {
        path
    };

    if is_absolute_remote_path(rest) {
        normalize_remote_path(rest)
    } else {
        normalize_remote_path(&join_remote_path(cwd, rest))
    }
}

/// Split a normalized path into its parent directory and final component.
///
/// Returns `None` for the root and for single relative components.
pub fn split_remote_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Some((parent, name))
}
