//! In-memory file channel
//!
//! Stands in for a remote SFTP session: a tree of files and directories held
//! in memory, with knobs for latency, per-path fault injection, mid-stream read
//! failures and disconnects. Writes land in the tree as they happen, so a
//! failed stream leaves its partial data behind exactly like a real server.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use super::channel::{EntryInfo, EntryKind, FileChannel, ReadStream, WriteSink};
use super::error::ChannelError;
use super::path_utils::{file_name, join_remote_path, parent_path};

type FileData = Arc<Mutex<Vec<u8>>>;

enum Node {
    Dir,
    File(FileData),
}

/// Channel operation a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    List,
    Stat,
    OpenRead,
    OpenWrite,
    Delete,
    Mkdir,
    Rename,
}

/// Error produced by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NotFound,
    PermissionDenied,
    Io,
    Disconnect,
}

impl FaultKind {
    fn to_error(self, path: &str) -> ChannelError {
        match self {
            FaultKind::NotFound => ChannelError::NotFound(path.to_string()),
            FaultKind::PermissionDenied => ChannelError::PermissionDenied(path.to_string()),
            FaultKind::Io => ChannelError::Io(io::Error::other(format!("injected fault: {}", path))),
            FaultKind::Disconnect => ChannelError::Disconnected(path.to_string()),
        }
    }
}

pub struct MemoryChannel {
    id: String,
    local: bool,
    multiplexing: bool,
    latency: Option<Duration>,
    read_delay: Option<Duration>,
    connected: AtomicBool,
    nodes: Mutex<BTreeMap<String, Node>>,
    faults: Mutex<HashMap<(FaultOp, String), FaultKind>>,
    read_failures: Mutex<HashMap<String, usize>>,
    operations: Mutex<Vec<(FaultOp, String)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Holds one slot of the in-flight count until dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl MemoryChannel {
    /// Empty remote endpoint containing only `/`
    pub fn new(id: impl Into<String>) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            id: id.into(),
            local: false,
            multiplexing: false,
            latency: None,
            read_delay: None,
            connected: AtomicBool::new(true),
            nodes: Mutex::new(nodes),
            faults: Mutex::new(HashMap::new()),
            read_failures: Mutex::new(HashMap::new()),
            operations: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Present this channel as the local disk
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn with_multiplexing(mut self, multiplexing: bool) -> Self {
        self.multiplexing = multiplexing;
        self
    }

    /// Delay applied to every channel operation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delay applied to every chunk read from an open stream
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Create a directory and any missing parents
    pub fn add_dir(&self, path: &str) {
        let path = normalize(path);
        let mut nodes = self.nodes.lock();
        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join_remote_path(&current, part);
            nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    /// Create (or replace) a file, creating missing parents
    pub fn add_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        let path = normalize(path);
        if let Some(parent) = parent_path(&path) {
            self.add_dir(&parent);
        }
        self.nodes
            .lock()
            .insert(path, Node::File(Arc::new(Mutex::new(contents.into()))));
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.lock().clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().contains_key(&normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.lock().get(&normalize(path)), Some(Node::Dir))
    }

    /// Make `op` on `path` fail with `kind`
    pub fn inject_fault(&self, op: FaultOp, path: &str, kind: FaultKind) {
        self.faults.lock().insert((op, normalize(path)), kind);
    }

    /// Streams opened on `path` fail after `chunks` successful reads
    pub fn fail_read_after(&self, path: &str, chunks: usize) {
        self.read_failures.lock().insert(normalize(path), chunks);
    }

    /// Every subsequent operation fails with `Disconnected`
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Number of channel operations issued so far
    pub fn op_count(&self) -> usize {
        self.operations.lock().len()
    }

    /// Operations in the order they were issued
    pub fn operations(&self) -> Vec<(FaultOp, String)> {
        self.operations.lock().clone()
    }

    /// Most operations ever in progress at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: FaultOp, path: &str) -> Result<String, ChannelError> {
        let path = normalize(path);
        self.operations.lock().push((op, path.clone()));
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _slot = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::Disconnected(format!("{}: {}", self.id, path)));
        }
        if let Some(kind) = self.faults.lock().get(&(op, path.clone())) {
            return Err(kind.to_error(&path));
        }
        Ok(path)
    }

    fn entry_info(path: &str, node: &Node) -> EntryInfo {
        let (kind, size, mode) = match node {
            Node::Dir => (EntryKind::Directory, 0, 0o755),
            Node::File(data) => (EntryKind::File, data.lock().len() as u64, 0o644),
        };
        EntryInfo {
            name: file_name(path).to_string(),
            path: path.to_string(),
            kind,
            size,
            mode,
        }
    }

    fn child_keys(nodes: &BTreeMap<String, Node>, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.len() > prefix.len() && !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn require_dir(nodes: &BTreeMap<String, Node>, path: &str) -> Result<(), ChannelError> {
        match nodes.get(path) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(ChannelError::Other(format!("Not a directory: {}", path))),
            None => Err(ChannelError::NotFound(path.to_string())),
        }
    }
}

#[async_trait]
impl FileChannel for MemoryChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn supports_multiplexing(&self) -> bool {
        self.multiplexing
    }

    async fn ping(&self) -> Result<(), ChannelError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChannelError::Disconnected(self.id.clone()))
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<EntryInfo>, ChannelError> {
        let path = self.enter(FaultOp::List, path).await?;
        let nodes = self.nodes.lock();
        Self::require_dir(&nodes, &path)?;
        Ok(Self::child_keys(&nodes, &path)
            .iter()
            .filter_map(|key| nodes.get(key).map(|node| Self::entry_info(key, node)))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<EntryInfo, ChannelError> {
        let path = self.enter(FaultOp::Stat, path).await?;
        let nodes = self.nodes.lock();
        match nodes.get(&path) {
            Some(node) => Ok(Self::entry_info(&path, node)),
            None => Err(ChannelError::NotFound(path)),
        }
    }

    async fn open_read(&self, path: &str) -> Result<ReadStream, ChannelError> {
        let path = self.enter(FaultOp::OpenRead, path).await?;
        let data = match self.nodes.lock().get(&path) {
            Some(Node::File(data)) => data.lock().clone(),
            Some(Node::Dir) => {
                return Err(ChannelError::Other(format!("Is a directory: {}", path)));
            }
            None => return Err(ChannelError::NotFound(path)),
        };
        let fail_after = self.read_failures.lock().get(&path).copied();
        Ok(Box::new(MemoryReader {
            data,
            pos: 0,
            reads: 0,
            fail_after,
            delay: self.read_delay,
            sleep: None,
        }))
    }

    async fn open_write(&self, path: &str) -> Result<WriteSink, ChannelError> {
        let path = self.enter(FaultOp::OpenWrite, path).await?;
        let mut nodes = self.nodes.lock();
        let parent = parent_path(&path).ok_or_else(|| ChannelError::Other("Cannot write to /".into()))?;
        Self::require_dir(&nodes, &parent)?;
        let data = match nodes.get(&path) {
            Some(Node::Dir) => {
                return Err(ChannelError::Other(format!("Is a directory: {}", path)));
            }
            Some(Node::File(existing)) => {
                existing.lock().clear();
                existing.clone()
            }
            None => {
                let data: FileData = Arc::new(Mutex::new(Vec::new()));
                nodes.insert(path, Node::File(data.clone()));
                data
            }
        };
        Ok(Box::new(MemoryWriter { data }))
    }

    async fn delete(&self, path: &str) -> Result<(), ChannelError> {
        let path = self.enter(FaultOp::Delete, path).await?;
        if path == "/" {
            return Err(ChannelError::PermissionDenied(path));
        }
        let mut nodes = self.nodes.lock();
        match nodes.get(&path) {
            None => return Err(ChannelError::NotFound(path)),
            Some(Node::Dir) if !Self::child_keys(&nodes, &path).is_empty() => {
                return Err(ChannelError::NotEmpty(path));
            }
            Some(_) => {}
        }
        nodes.remove(&path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), ChannelError> {
        let path = self.enter(FaultOp::Mkdir, path).await?;
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&path) {
            return Err(ChannelError::AlreadyExists(path));
        }
        let parent = parent_path(&path).ok_or_else(|| ChannelError::AlreadyExists("/".into()))?;
        Self::require_dir(&nodes, &parent)?;
        nodes.insert(path, Node::Dir);
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), ChannelError> {
        let old_path = self.enter(FaultOp::Rename, old_path).await?;
        let new_path = normalize(new_path);
        let mut nodes = self.nodes.lock();
        if !nodes.contains_key(&old_path) {
            return Err(ChannelError::NotFound(old_path));
        }
        if matches!(nodes.get(&new_path), Some(Node::Dir)) {
            return Err(ChannelError::AlreadyExists(new_path));
        }
        let parent = parent_path(&new_path).ok_or_else(|| ChannelError::AlreadyExists("/".into()))?;
        Self::require_dir(&nodes, &parent)?;

        let prefix = format!("{}/", old_path);
        let moved: Vec<String> = nodes
            .keys()
            .filter(|k| **k == old_path || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = nodes.remove(&key) {
                let new_key = format!("{}{}", new_path, &key[old_path.len()..]);
                nodes.insert(new_key, node);
            }
        }
        Ok(())
    }
}

struct MemoryReader {
    data: Vec<u8>,
    pos: usize,
    reads: usize,
    fail_after: Option<usize>,
    delay: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Some(delay) = this.delay {
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
            ready!(sleep.as_mut().poll(cx));
            this.sleep = None;
        }
        if let Some(limit) = this.fail_after {
            if this.reads >= limit {
                return Poll::Ready(Err(io::Error::other("injected read failure")));
            }
        }
        let remaining = &this.data[this.pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        this.pos += n;
        this.reads += 1;
        Poll::Ready(Ok(()))
    }
}

struct MemoryWriter {
    data: FileData,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.data.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_list_is_sorted_and_shallow() {
        let ch = MemoryChannel::new("s1");
        ch.add_file("/data/b.txt", b"bb".to_vec());
        ch.add_file("/data/a.txt", b"a".to_vec());
        ch.add_file("/data/sub/c.txt", b"ccc".to_vec());

        let entries = ch.list("/data").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert!(entries[2].is_dir());
        assert_eq!(entries[1].size, 2);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let ch = MemoryChannel::new("s1");
        ch.add_dir("/out");

        let mut sink = ch.open_write("/out/x.bin").await.unwrap();
        sink.write_all(b"hello").await.unwrap();
        sink.shutdown().await.unwrap();

        let mut stream = ch.open_read("/out/x.bin").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn test_open_write_requires_parent() {
        let ch = MemoryChannel::new("s1");
        assert!(matches!(
            ch.open_write("/missing/x").await,
            Err(ChannelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_non_empty_dir_fails() {
        let ch = MemoryChannel::new("s1");
        ch.add_file("/d/f", b"x".to_vec());

        assert!(matches!(ch.delete("/d").await, Err(ChannelError::NotEmpty(_))));
        ch.delete("/d/f").await.unwrap();
        ch.delete("/d").await.unwrap();
        assert!(!ch.exists("/d"));
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let ch = MemoryChannel::new("s1");
        ch.add_file("/a/x/f.txt", b"1".to_vec());

        ch.rename("/a/x", "/a/y").await.unwrap();
        assert!(!ch.exists("/a/x/f.txt"));
        assert_eq!(ch.read_file("/a/y/f.txt").unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_injected_fault_and_disconnect() {
        let ch = MemoryChannel::new("s1");
        ch.add_file("/f", b"x".to_vec());
        ch.inject_fault(FaultOp::Delete, "/f", FaultKind::PermissionDenied);

        assert!(matches!(
            ch.delete("/f").await,
            Err(ChannelError::PermissionDenied(_))
        ));

        ch.disconnect();
        assert!(ch.ping().await.is_err());
        assert!(ch.stat("/f").await.unwrap_err().is_disconnect());
    }

    #[tokio::test]
    async fn test_records_operations_in_order() {
        let ch = MemoryChannel::new("s1");
        ch.add_file("/d/f", b"x".to_vec());

        ch.list("/d/").await.unwrap();
        ch.stat("/d/f").await.unwrap();
        assert!(ch.delete("/missing").await.is_err());

        assert_eq!(
            ch.operations(),
            vec![
                (FaultOp::List, "/d".to_string()),
                (FaultOp::Stat, "/d/f".to_string()),
                (FaultOp::Delete, "/missing".to_string()),
            ]
        );
        assert_eq!(ch.op_count(), 3);
        assert_eq!(ch.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_read_fails_after_chunks() {
        let ch = MemoryChannel::new("s1");
        ch.add_file("/big", vec![7u8; 64]);
        ch.fail_read_after("/big", 2);

        let mut stream = ch.open_read("/big").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 16);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 16);
        assert!(stream.read(&mut buf).await.is_err());
    }
}
