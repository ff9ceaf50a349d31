//! Per-item work shared by the bulk executor and the remote-to-remote
//! coordinator: the chunk pump, destination directory creation and recursive
//! removal.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::cancellation::{check_transfer_control, TransferControl};
use super::channel::FileChannel;
use super::error::{ChannelError, TransferError};
use super::job::JobRecord;
use super::path_utils::{join_remote_path, parent_path};
use super::types::TransferItem;
use crate::config::{ConflictPolicy, TransferConfig};

/// Enumerated items on their way to the executor or coordinator, with their
/// index in the job
pub(crate) type ItemFeed = mpsc::Receiver<(usize, TransferItem)>;

/// Feed holding exactly `items`, already closed
#[cfg(test)]
pub(crate) fn feed_of(items: Vec<(usize, TransferItem)>) -> ItemFeed {
    let (tx, rx) = mpsc::channel(items.len().max(1));
    for item in items {
        let _ = tx.try_send(item);
    }
    rx
}

/// What a successfully processed item did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemOutcome {
    Transferred(u64),
    Created,
    Skipped,
    Removed,
}

/// Copy knobs taken from [`TransferConfig`]
#[derive(Debug, Clone, Copy)]
pub(crate) struct CopySettings {
    pub chunk_size: usize,
    pub io_timeout: Duration,
    pub conflict: ConflictPolicy,
}

impl From<&TransferConfig> for CopySettings {
    fn from(config: &TransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_len(),
            io_timeout: config.io_timeout(),
            conflict: config.conflict_policy,
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, ChannelError>
where
    F: Future<Output = Result<T, ChannelError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ChannelError::Timeout(what.to_string()))?
}

async fn io_with_timeout<T, F>(limit: Duration, path: &str, fut: F) -> Result<T, ChannelError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(|e| ChannelError::from_io(e, path)),
        Err(_) => Err(ChannelError::Timeout(path.to_string())),
    }
}

/// Destination directories known to exist for one job
///
/// Directories are created top-down before anything is written into them;
/// each path is checked at most once per job.
pub(crate) struct DirectoryTracker {
    known: Mutex<HashSet<String>>,
}

impl DirectoryTracker {
    pub fn new() -> Self {
        Self {
            known: Mutex::new(HashSet::new()),
        }
    }

    pub async fn ensure(&self, channel: &dyn FileChannel, path: &str) -> Result<(), ChannelError> {
        let mut missing = Vec::new();
        let mut current = Some(path.trim_end_matches('/').to_string());
        while let Some(dir) = current {
            if dir.is_empty() || dir == "/" || self.known.lock().contains(&dir) {
                break;
            }
            current = parent_path(&dir);
            missing.push(dir);
        }

        for dir in missing.into_iter().rev() {
            match channel.stat(&dir).await {
                Ok(info) if info.is_dir() => {}
                Ok(_) => {
                    return Err(ChannelError::AlreadyExists(format!(
                        "{} exists and is not a directory",
                        dir
                    )))
                }
                Err(ChannelError::NotFound(_)) => match channel.mkdir(&dir).await {
                    // another worker got there first
                    Ok(()) | Err(ChannelError::AlreadyExists(_)) => {
                        debug!("Created directory {} on {}", dir, channel.id());
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
            self.known.lock().insert(dir);
        }
        Ok(())
    }
}

/// Copy one item from `source` to `destination`.
///
/// Files are streamed in `chunk_size` pieces; cancellation is checked and the
/// task yields before every chunk. A failure mid-stream leaves whatever was
/// already written at the destination.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn copy_item(
    job: &JobRecord,
    index: usize,
    item: &TransferItem,
    source: &dyn FileChannel,
    destination: &dyn FileChannel,
    directories: &DirectoryTracker,
    settings: CopySettings,
    control: &TransferControl,
) -> Result<ItemOutcome, TransferError> {
    check_transfer_control(control)?;

    if item.is_dir() {
        directories
            .ensure(destination, &item.destination_path)
            .await?;
        return Ok(ItemOutcome::Created);
    }
    if let Some(parent) = parent_path(&item.destination_path) {
        directories.ensure(destination, &parent).await?;
    }

    if settings.conflict != ConflictPolicy::Overwrite {
        match destination.stat(&item.destination_path).await {
            Ok(_) if settings.conflict == ConflictPolicy::Skip => {
                debug!("Skipping existing {}", item.destination_path);
                return Ok(ItemOutcome::Skipped);
            }
            Ok(_) => return Err(TransferError::Conflict(item.destination_path.clone())),
            Err(ChannelError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let src = item.source_path.as_str();
    let dst = item.destination_path.as_str();
    let limit = settings.io_timeout;

    let mut reader = with_timeout(limit, src, source.open_read(src)).await?;
    let mut writer = with_timeout(limit, dst, destination.open_write(dst)).await?;

    let mut buffer = vec![0u8; settings.chunk_size];
    let mut transferred: u64 = 0;
    loop {
        check_transfer_control(control)?;

        let n = io_with_timeout(limit, src, reader.read(&mut buffer)).await?;
        if n == 0 {
            break;
        }
        io_with_timeout(limit, dst, writer.write_all(&buffer[..n])).await?;
        transferred += n as u64;
        job.add_bytes(index, n as u64);
        trace!("{}: {} bytes", item.relative_path, transferred);

        tokio::task::yield_now().await;
    }

    io_with_timeout(limit, dst, writer.flush()).await?;
    io_with_timeout(limit, dst, writer.shutdown()).await?;
    Ok(ItemOutcome::Transferred(transferred))
}

/// Delete a file, or a directory tree children-first
pub(crate) async fn remove_item(
    channel: &dyn FileChannel,
    item: &TransferItem,
    control: &TransferControl,
) -> Result<ItemOutcome, TransferError> {
    check_transfer_control(control)?;
    if item.is_dir() {
        let removed = remove_tree(channel, &item.source_path, control).await?;
        debug!("Removed {} entries under {}", removed, item.source_path);
    } else {
        channel.delete(&item.source_path).await?;
    }
    Ok(ItemOutcome::Removed)
}

fn remove_tree<'a>(
    channel: &'a dyn FileChannel,
    path: &'a str,
    control: &'a TransferControl,
) -> BoxFuture<'a, Result<u64, TransferError>> {
    Box::pin(async move {
        check_transfer_control(control)?;
        let info = channel.stat(path).await?;
        let mut removed = 0u64;

        if info.is_dir() {
            let entries = channel.list(path).await?;
            for entry in entries.iter().filter(|e| e.name != "." && e.name != "..") {
                let child = join_remote_path(path, &entry.name);
                removed += remove_tree(channel, &child, control).await?;
            }
        }
        channel.delete(path).await?;
        Ok(removed + 1)
    })
}

/// Liveness check of every endpoint before a job touches any item
pub(crate) async fn ping_channels(channels: &[&dyn FileChannel]) -> Result<(), TransferError> {
    for channel in channels {
        if let Err(e) = channel.ping().await {
            warn!("Channel {} unavailable: {}", channel.id(), e);
            return Err(TransferError::ChannelUnavailable(format!(
                "{}: {}",
                channel.id(),
                e
            )));
        }
    }
    Ok(())
}

/// First structural error seen while a job's items run
pub(crate) struct AbortSignal {
    reason: Mutex<Option<String>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            reason: Mutex::new(None),
        }
    }

    pub fn trip(&self, reason: String) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            warn!("Aborting remaining items: {}", reason);
            *slot = Some(reason);
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.reason.lock().is_some()
    }

    pub fn into_error(self) -> Option<TransferError> {
        self.reason.into_inner().map(TransferError::Aborted)
    }
}

/// Record the result of one item on the job
pub(crate) fn settle_item(
    job: &JobRecord,
    index: usize,
    result: Result<ItemOutcome, TransferError>,
    abort: &AbortSignal,
) {
    match result {
        Ok(outcome) => {
            debug!("Job {} item {} finished: {:?}", job.id(), index, outcome);
            job.complete_item(index, outcome == ItemOutcome::Skipped);
        }
        Err(e) if e.is_cancelled() => job.interrupt_item(index),
        Err(e) => {
            if e.is_structural() {
                abort.trip(e.to_string());
            }
            job.fail_item(index, e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::memory::{FaultKind, FaultOp, MemoryChannel};
    use crate::transfer::progress::ProgressReporter;
    use crate::transfer::types::{TransferJob, TransferKind};
    use std::sync::Arc;

    fn settings(conflict: ConflictPolicy) -> CopySettings {
        CopySettings {
            chunk_size: 4,
            io_timeout: Duration::from_secs(5),
            conflict,
        }
    }

    fn job_with(item: TransferItem) -> JobRecord {
        let job = TransferJob::new(
            "j".into(),
            TransferKind::RemoteToRemote,
            "s1".into(),
            Some("s2".into()),
        );
        let record = JobRecord::new(job, Arc::new(ProgressReporter::new())).unwrap();
        record.start();
        record.set_items(vec![item]);
        record.begin_item(0);
        record
    }

    #[tokio::test]
    async fn test_copy_streams_in_chunks_and_creates_parents() {
        let src = MemoryChannel::new("s1");
        let dst = MemoryChannel::new("s2");
        src.add_file("/a/f.bin", b"0123456789".to_vec());
        let item = TransferItem::file("/a/f.bin", "/x/y/f.bin", "f.bin", Some(10));
        let job = job_with(item.clone());

        let outcome = copy_item(
            &job,
            0,
            &item,
            &src,
            &dst,
            &DirectoryTracker::new(),
            settings(ConflictPolicy::Overwrite),
            &TransferControl::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, ItemOutcome::Transferred(10));
        assert!(dst.is_dir("/x/y"));
        assert_eq!(dst.read_file("/x/y/f.bin").unwrap(), b"0123456789");
        assert_eq!(job.snapshot().items[0].bytes_transferred, 10);
    }

    #[tokio::test]
    async fn test_conflict_policies() {
        let src = MemoryChannel::new("s1");
        let dst = MemoryChannel::new("s2");
        src.add_file("/f", b"new".to_vec());
        dst.add_file("/f", b"old".to_vec());
        let item = TransferItem::file("/f", "/f", "f", Some(3));
        let job = job_with(item.clone());
        let dirs = DirectoryTracker::new();
        let control = TransferControl::new();

        let skipped = copy_item(&job, 0, &item, &src, &dst, &dirs, settings(ConflictPolicy::Skip), &control)
            .await
            .unwrap();
        assert_eq!(skipped, ItemOutcome::Skipped);
        assert_eq!(dst.read_file("/f").unwrap(), b"old");

        let failed = copy_item(&job, 0, &item, &src, &dst, &dirs, settings(ConflictPolicy::Fail), &control).await;
        assert!(matches!(failed, Err(TransferError::Conflict(_))));

        copy_item(&job, 0, &item, &src, &dst, &dirs, settings(ConflictPolicy::Overwrite), &control)
            .await
            .unwrap();
        assert_eq!(dst.read_file("/f").unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_cancelled_before_stream() {
        let src = MemoryChannel::new("s1");
        let dst = MemoryChannel::new("s2");
        src.add_file("/f", b"data".to_vec());
        let item = TransferItem::file("/f", "/g", "f", Some(4));
        let job = job_with(item.clone());
        let control = TransferControl::new();
        control.cancel();

        let result = copy_item(&job, 0, &item, &src, &dst, &DirectoryTracker::new(), settings(ConflictPolicy::Overwrite), &control).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(!dst.exists("/g"));
    }

    #[tokio::test]
    async fn test_ensure_rejects_file_in_the_way() {
        let dst = MemoryChannel::new("s2");
        dst.add_file("/x", b"file".to_vec());
        let result = DirectoryTracker::new().ensure(&dst, "/x/y").await;
        assert!(matches!(result, Err(ChannelError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_remove_tree_children_first() {
        let ch = MemoryChannel::new("s1");
        ch.add_file("/d/a", b"1".to_vec());
        ch.add_file("/d/sub/b", b"2".to_vec());
        let item = TransferItem::directory("/d", "/d", "d");

        let outcome = remove_item(&ch, &item, &TransferControl::new()).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Removed);
        assert!(!ch.exists("/d"));
        assert!(ch.exists("/"));
    }

    #[tokio::test]
    async fn test_ping_reports_unavailable_channel() {
        let up = MemoryChannel::new("s1");
        let down = MemoryChannel::new("s2");
        down.disconnect();

        assert!(ping_channels(&[&up]).await.is_ok());
        let err = ping_channels(&[&up, &down]).await.unwrap_err();
        assert!(matches!(err, TransferError::ChannelUnavailable(ref m) if m.starts_with("s2")));
    }

    #[test]
    fn test_settle_item_trips_abort_on_disconnect() {
        let item = TransferItem::file("/f", "/f", "f", None);
        let job = job_with(item);
        let abort = AbortSignal::new();

        settle_item(
            &job,
            0,
            Err(ChannelError::Disconnected("s1".into()).into()),
            &abort,
        );
        assert!(abort.is_tripped());
        assert_eq!(job.snapshot().items_failed, 1);
        assert!(matches!(abort.into_error(), Some(TransferError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_remove_fault_surfaces() {
        let ch = MemoryChannel::new("s1");
        ch.add_file("/f", b"1".to_vec());
        ch.inject_fault(FaultOp::Delete, "/f", FaultKind::PermissionDenied);
        let item = TransferItem::file("/f", "/f", "f", None);

        let err = remove_item(&ch, &item, &TransferControl::new()).await.unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
    }
}
