//! File channel abstraction
//!
//! A `FileChannel` is the per-endpoint capability the engine drives: the local
//! filesystem or one remote SFTP session. Every operation is single-item and
//! atomic from the engine's point of view.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::ChannelError;

/// Byte source returned by [`FileChannel::open_read`]
pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;

/// Byte sink returned by [`FileChannel::open_write`]
pub type WriteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Entry type as reported by the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Result of `stat` / one row of `list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    /// File name (not full path)
    pub name: String,
    /// Full path
    pub path: String,
    pub kind: EntryKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Unix permission bits
    pub mode: u32,
}

impl EntryInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

#[async_trait]
pub trait FileChannel: Send + Sync {
    /// Stable identifier of the endpoint (session id, or "local")
    fn id(&self) -> &str;

    /// Whether this channel is the orchestrating process's own disk
    fn is_local(&self) -> bool {
        false
    }

    /// Whether concurrent item operations may share this channel.
    ///
    /// Channels that return false are driven strictly one item at a time.
    fn supports_multiplexing(&self) -> bool {
        false
    }

    /// Liveness check issued once before a job touches any item
    async fn ping(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<EntryInfo>, ChannelError>;

    async fn stat(&self, path: &str) -> Result<EntryInfo, ChannelError>;

    async fn open_read(&self, path: &str) -> Result<ReadStream, ChannelError>;

    /// Create or truncate `path` for writing
    async fn open_write(&self, path: &str) -> Result<WriteSink, ChannelError>;

    /// Remove a file or an empty directory
    async fn delete(&self, path: &str) -> Result<(), ChannelError>;

    async fn mkdir(&self, path: &str) -> Result<(), ChannelError>;

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), ChannelError>;
}
