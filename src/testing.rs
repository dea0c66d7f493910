//! In-memory channel and scripted transport for unit tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::time::Instant;

use crate::client::SftpClient;
use crate::session::{Connector, EventSink, Transport, TransportEvent};
use crate::sftp::channel::{RemoteChannel, RemoteReader, RemoteWriter};
use crate::sftp::error::{ErrorCode, SftpError};
use crate::sftp::path_utils::{resolve_remote_path, split_remote_parent};
use crate::sftp::types::{format_longname, RawDirEntry, RemoteAttrs, WriteMode};
use crate::ssh::{AuthMethod, ConnectConfig, SshError};

pub(crate) const HOME: &str = "/home/user";

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFSOCK: u32 = 0o140000;
const MTIME: u32 = 1_700_000_000;

#[derive(Debug, Clone)]
enum Node {
    Dir { mode: u32 },
    File { data: Vec<u8>, mode: u32 },
    Symlink { target: String },
    Socket,
}

impl Node {
    fn attrs(&self) -> RemoteAttrs {
        let (permissions, size) = match self {
            Node::Dir { mode } => (S_IFDIR | mode, 4096),
            Node::File { data, mode } => (S_IFREG | mode, data.len() as u64),
            Node::Symlink { target } => (S_IFLNK | 0o777, target.len() as u64),
            Node::Socket => (S_IFSOCK | 0o755, 0),
        };
        RemoteAttrs {
            size: Some(size),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(permissions),
            atime: Some(MTIME),
            mtime: Some(MTIME),
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }
}

type Tree = Arc<Mutex<BTreeMap<String, Node>>>;

fn no_such_file(path: &str) -> SftpError {
    SftpError::new(ErrorCode::NoSuchFile, format!("No such file: {}", path))
}

fn failure(msg: String) -> SftpError {
    SftpError::new(ErrorCode::Failure, msg)
}

/// SFTP-v3-like filesystem kept in memory. Every remote call is logged.
pub(crate) struct MemoryChannel {
    nodes: Tree,
    log: Mutex<Vec<String>>,
    denied: Mutex<HashSet<String>>,
    hang_listings: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        for dir in ["/", "/home", HOME] {
            nodes.insert(dir.to_string(), Node::Dir { mode: 0o755 });
        }
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
            log: Mutex::new(Vec::new()),
            denied: Mutex::new(HashSet::new()),
            hang_listings: AtomicBool::new(false),
        }
    }

    fn resolve(path: &str) -> String {
        resolve_remote_path(HOME, path)
    }

    fn record(&self, op: &str, path: &str) {
        self.log.lock().push(format!("{} {}", op, path));
    }

    pub fn add_dir(&self, path: &str) {
        self.nodes
            .lock()
            .insert(Self::resolve(path), Node::Dir { mode: 0o755 });
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.nodes.lock().insert(
            Self::resolve(path),
            Node::File {
                data: data.to_vec(),
                mode: 0o644,
            },
        );
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.nodes.lock().insert(
            Self::resolve(path),
            Node::Symlink {
                target: target.to_string(),
            },
        );
    }

    pub fn add_socket(&self, path: &str) {
        self.nodes.lock().insert(Self::resolve(path), Node::Socket);
    }

    /// Creating entries inside `dir` fails with permission denied.
    pub fn deny_writes_in(&self, dir: &str) {
        self.denied.lock().insert(Self::resolve(dir));
    }

    pub fn hang_listings(&self) {
        self.hang_listings.store(true, Ordering::SeqCst);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(&Self::resolve(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.nodes
            .lock()
            .get(&Self::resolve(path))
            .is_some_and(Node::is_dir)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.lock().contains_key(&Self::resolve(path))
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.nodes
            .lock()
            .get(&Self::resolve(path))
            .and_then(|n| n.attrs().permissions)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// Logged calls of one kind, paths only.
    pub fn calls(&self, op: &str) -> Vec<String> {
        let prefix = format!("{} ", op);
        self.log
            .lock()
            .iter()
            .filter_map(|line| line.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    fn check_parent(&self, path: &str) -> Result<(), SftpError> {
        let (parent, _) = split_remote_parent(path).ok_or_else(|| no_such_file(path))?;
        match self.nodes.lock().get(parent) {
            Some(node) if node.is_dir() => {}
            _ => return Err(no_such_file(path)),
        }
        if self.denied.lock().contains(parent) {
            return Err(SftpError::new(
                ErrorCode::PermissionDenied,
                "Permission denied",
            ));
        }
        Ok(())
    }

    fn follow(&self, path: &str) -> Result<(String, Node), SftpError> {
        let nodes = self.nodes.lock();
        let mut current = path.to_string();
        for _ in 0..8 {
            match nodes.get(&current) {
                Some(Node::Symlink { target }) => current = resolve_remote_path(HOME, target),
                Some(node) => return Ok((current, node.clone())),
                None => return Err(no_such_file(path)),
            }
        }
        Err(failure(format!("Too many levels of symbolic links: {}", path)))
    }
}

#[async_trait]
impl RemoteChannel for MemoryChannel {
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        let p = Self::resolve(path);
        self.record("realpath", &p);
        self.follow(&p).map(|(resolved, _)| resolved)
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, SftpError> {
        let p = Self::resolve(path);
        self.record("stat", &p);
        self.follow(&p).map(|(_, node)| node.attrs())
    }

    async fn lstat(&self, path: &str) -> Result<RemoteAttrs, SftpError> {
        let p = Self::resolve(path);
        self.record("lstat", &p);
        self.nodes
            .lock()
            .get(&p)
            .map(Node::attrs)
            .ok_or_else(|| no_such_file(&p))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RawDirEntry>, SftpError> {
        let p = Self::resolve(path);
        self.record("readdir", &p);
        if self.hang_listings.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (dir, node) = self.follow(&p)?;
        if !node.is_dir() {
            return Err(failure(format!("Not a directory: {}", p)));
        }

        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        let nodes = self.nodes.lock();
        let mut entries = vec![
            RawDirEntry {
                filename: ".".to_string(),
                longname: format_longname(".", &node.attrs()),
                attrs: node.attrs(),
            },
            RawDirEntry {
                filename: "..".to_string(),
                longname: format_longname("..", &node.attrs()),
                attrs: node.attrs(),
            },
        ];
        for (key, child) in nodes.range(prefix.clone()..) {
            let Some(name) = key.strip_prefix(&prefix) else {
                break;
            };
            if name.is_empty() || name.contains('/') {
                continue;
            }
            let attrs = child.attrs();
            entries.push(RawDirEntry {
                filename: name.to_string(),
                longname: format_longname(name, &attrs),
                attrs,
            });
        }
        Ok(entries)
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        let p = Self::resolve(path);
        self.record("mkdir", &p);
        self.check_parent(&p)?;
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&p) {
            return Err(failure(format!("File exists: {}", p)));
        }
        nodes.insert(p, Node::Dir { mode: 0o755 });
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        let p = Self::resolve(path);
        self.record("rmdir", &p);
        let mut nodes = self.nodes.lock();
        match nodes.get(&p) {
            None => return Err(no_such_file(&p)),
            Some(node) if !node.is_dir() => {
                return Err(failure(format!("Not a directory: {}", p)))
            }
            Some(_) => {}
        }
        let prefix = format!("{}/", p);
        if nodes.keys().any(|k| k.starts_with(&prefix)) {
            return Err(failure(format!("Directory not empty: {}", p)));
        }
        nodes.remove(&p);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        let p = Self::resolve(path);
        self.record("rm", &p);
        let mut nodes = self.nodes.lock();
        match nodes.get(&p) {
            None => Err(no_such_file(&p)),
            Some(node) if node.is_dir() => Err(failure(format!("Is a directory: {}", p))),
            Some(_) => {
                nodes.remove(&p);
                Ok(())
            }
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        let (from, to) = (Self::resolve(from), Self::resolve(to));
        self.record("rename", &format!("{} {}", from, to));
        if self.nodes.lock().contains_key(&to) {
            return Err(failure(format!("File exists: {}", to)));
        }
        self.move_tree(&from, &to)
    }

    async fn posix_rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        let (from, to) = (Self::resolve(from), Self::resolve(to));
        self.record("posix-rename", &format!("{} {}", from, to));
        self.move_tree(&from, &to)
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let p = Self::resolve(path);
        self.record("chmod", &p);
        match self.nodes.lock().get_mut(&p) {
            Some(Node::Dir { mode: m }) | Some(Node::File { mode: m, .. }) => {
                *m = mode & 0o7777;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(no_such_file(&p)),
        }
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, SftpError> {
        let p = Self::resolve(path);
        self.record("open-read", &p);
        match self.follow(&p)? {
            (_, Node::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                Ok(Box::new(io::Cursor::new(data[start..].to_vec())))
            }
            _ => Err(failure(format!("Not a regular file: {}", p))),
        }
    }

    async fn open_write(
        &self,
        path: &str,
        mode: WriteMode,
        offset: u64,
    ) -> Result<RemoteWriter, SftpError> {
        let p = Self::resolve(path);
        self.record("open-write", &p);
        self.check_parent(&p)?;
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&p) {
            Some(Node::File { data, .. }) => {
                if mode == WriteMode::Truncate {
                    data.clear();
                }
            }
            Some(_) => return Err(failure(format!("Not a regular file: {}", p))),
            None => {
                nodes.insert(
                    p.clone(),
                    Node::File {
                        data: Vec::new(),
                        mode: 0o644,
                    },
                );
            }
        }
        let position = match mode {
            WriteMode::Append => None,
            _ => Some(offset),
        };
        Ok(Box::new(MemoryWriter {
            nodes: self.nodes.clone(),
            path: p,
            position,
        }))
    }
}

impl MemoryChannel {
    fn move_tree(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.check_parent(to)?;
        let mut nodes = self.nodes.lock();
        let node = nodes.remove(from).ok_or_else(|| no_such_file(from))?;
        let prefix = format!("{}/", from);
        let children: Vec<String> = nodes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in children {
            if let Some(child) = nodes.remove(&key) {
                nodes.insert(format!("{}/{}", to, &key[prefix.len()..]), child);
            }
        }
        nodes.insert(to.to_string(), node);
        Ok(())
    }
}

/// Writes straight into the shared tree.
struct MemoryWriter {
    nodes: Tree,
    path: String,
    /// `None` appends
    position: Option<u64>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut nodes = this.nodes.lock();
        let Some(Node::File { data, .. }) = nodes.get_mut(&this.path) else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                "remote file vanished",
            )));
        };
        let start = this.position.map_or(data.len(), |p| p as usize);
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        if let Some(position) = this.position.as_mut() {
            *position += buf.len() as u64;
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Connector whose attempts fail according to a script, then succeed.
pub(crate) struct MockConnector {
    failures: Mutex<VecDeque<SshError>>,
    attempts: Mutex<Vec<Instant>>,
    channel: Arc<MemoryChannel>,
    fail_channel: bool,
    first_dial_delay: Option<Duration>,
    sink: Mutex<Option<EventSink>>,
    shutdowns: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(channel: Arc<MemoryChannel>) -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            channel,
            fail_channel: false,
            first_dial_delay: None,
            sink: Mutex::new(None),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(self, failures: Vec<SshError>) -> Self {
        *self.failures.lock() = failures.into();
        self
    }

    pub fn with_channel_failure(mut self) -> Self {
        self.fail_channel = true;
        self
    }

    /// The first dial takes `delay` before answering.
    pub fn with_slow_first_dial(mut self, delay: Duration) -> Self {
        self.first_dial_delay = Some(delay);
        self
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Raise a signal on the most recent transport.
    pub fn emit(&self, event: TransportEvent) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _config: &ConnectConfig,
        sink: EventSink,
    ) -> Result<Arc<dyn Transport>, SshError> {
        let first = {
            let mut attempts = self.attempts.lock();
            attempts.push(Instant::now());
            attempts.len() == 1
        };
        if let (true, Some(delay)) = (first, self.first_dial_delay) {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        *self.sink.lock() = Some(sink.clone());
        sink.emit(TransportEvent::Ready);
        Ok(Arc::new(MockTransport {
            sink,
            channel: self.channel.clone(),
            fail_channel: self.fail_channel,
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

pub(crate) struct MockTransport {
    sink: EventSink,
    channel: Arc<MemoryChannel>,
    fail_channel: bool,
    shutdowns: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new(sink: EventSink) -> Arc<Self> {
        Arc::new(Self {
            sink,
            channel: Arc::new(MemoryChannel::new()),
            fail_channel: false,
            shutdowns: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_channel(&self) -> Result<Arc<dyn RemoteChannel>, SshError> {
        if self.fail_channel {
            return Err(SshError::ChannelError("subsystem request refused".into()));
        }
        Ok(self.channel.clone())
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.sink.emit(TransportEvent::Close);
    }
}

pub(crate) fn test_config() -> ConnectConfig {
    ConnectConfig::new("sftp.test", "tester", AuthMethod::password("secret"))
}

/// A client already connected to a fresh [`MemoryChannel`].
pub(crate) async fn connected_client() -> (SftpClient, Arc<MockConnector>, Arc<MemoryChannel>) {
    let channel = Arc::new(MemoryChannel::new());
    let connector = Arc::new(MockConnector::new(channel.clone()));
    let client = SftpClient::with_connector(connector.clone());
    client
        .connect(&test_config())
        .await
        .expect("mock connect succeeds");
    channel.clear_log();
    (client, connector, channel)
}
