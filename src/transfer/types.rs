//! Transfer data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::TransferError;

/// Kind of bulk operation a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferKind {
    Delete,
    Download,
    Upload,
    RemoteToRemote,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Delete => "delete",
            TransferKind::Download => "download",
            TransferKind::Upload => "upload",
            TransferKind::RemoteToRemote => "remote-to-remote",
        }
    }
}

/// Job lifecycle state
///
/// `Pending -> Running -> {Completed | Failed | Cancelled}`; terminal states
/// are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_advance_to(&self, next: JobState) -> bool {
        match self {
            JobState::Pending => next == JobState::Running,
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Directory,
}

/// Per-item state: `Queued -> InProgress -> {Done | Error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
    Queued,
    InProgress,
    Done,
    Error,
}

impl ItemState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ItemState::Done | ItemState::Error)
    }
}

/// One file or directory unit of work within a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    pub source_path: String,
    /// Equal to `source_path` for deletes
    pub destination_path: String,
    /// Path relative to the selection root, used as the progress label
    pub relative_path: String,
    pub kind: ItemKind,
    pub size: Option<u64>,
    pub state: ItemState,
    pub error: Option<String>,
    pub bytes_transferred: u64,
    /// Left untouched because the destination already existed
    #[serde(default)]
    pub skipped: bool,
}

impl TransferItem {
    pub fn file(
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        relative_path: impl Into<String>,
        size: Option<u64>,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            relative_path: relative_path.into(),
            kind: ItemKind::File,
            size,
            state: ItemState::Queued,
            error: None,
            bytes_transferred: 0,
            skipped: false,
        }
    }

    pub fn directory(
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        relative_path: impl Into<String>,
    ) -> Self {
        Self {
            kind: ItemKind::Directory,
            size: None,
            ..Self::file(source_path, destination_path, relative_path, None)
        }
    }

    /// Item that failed before any work could start (e.g. unreadable directory)
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.state = ItemState::Error;
        self.error = Some(error.into());
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ItemKind::Directory
    }
}

/// A failed item as reported in [`JobResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub index: usize,
    pub path: String,
    pub error: String,
}

/// Outcome counts of a batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResult {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<ItemFailure>,
}

/// One user-initiated batch and its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: String,
    pub kind: TransferKind,
    pub source_channel: String,
    pub destination_channel: Option<String>,
    pub items: Vec<TransferItem>,
    /// False while the selection is still being expanded into `items`
    #[serde(default)]
    pub enumeration_complete: bool,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Reason for a `Failed` (or `Cancelled`) terminal state
    pub failure_reason: Option<String>,
    pub items_completed: usize,
    pub items_failed: usize,
}

impl TransferJob {
    pub fn new(
        id: String,
        kind: TransferKind,
        source_channel: String,
        destination_channel: Option<String>,
    ) -> Self {
        Self {
            id,
            kind,
            source_channel,
            destination_channel,
            items: Vec::new(),
            enumeration_complete: false,
            state: JobState::Pending,
            created_at: Utc::now(),
            finished_at: None,
            failure_reason: None,
            items_completed: 0,
            items_failed: 0,
        }
    }

    pub fn items_total(&self) -> usize {
        self.items.len()
    }

    /// Sum of known item sizes, `None` if any file size is unknown
    pub fn bytes_total(&self) -> Option<u64> {
        self.items
            .iter()
            .filter(|item| !item.is_dir())
            .map(|item| item.size)
            .sum()
    }

    pub fn result(&self) -> JobResult {
        let errors = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.state == ItemState::Error)
            .map(|(index, item)| ItemFailure {
                index,
                path: item.source_path.clone(),
                error: item.error.clone().unwrap_or_default(),
            })
            .collect();
        JobResult {
            succeeded: self.items_completed,
            failed: self.items_failed,
            errors,
        }
    }
}

/// Kind-specific part of a progress snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProgressDetail {
    Delete,
    Download {
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    },
    Upload {
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    },
    RemoteToRemote {
        bytes_transferred: u64,
        bytes_total: Option<u64>,
        source_channel: String,
        destination_channel: String,
    },
}

impl ProgressDetail {
    /// Initial detail for a job; copy kinds require a destination channel.
    pub fn for_job(
        kind: TransferKind,
        source_channel: &str,
        destination_channel: Option<&str>,
    ) -> Result<Self, TransferError> {
        let require_destination = || {
            destination_channel.map(str::to_string).ok_or_else(|| {
                TransferError::InvalidRequest(format!(
                    "{} requires a destination channel",
                    kind.as_str()
                ))
            })
        };
        Ok(match kind {
            TransferKind::Delete => ProgressDetail::Delete,
            TransferKind::Download => {
                require_destination()?;
                ProgressDetail::Download {
                    bytes_transferred: 0,
                    bytes_total: None,
                }
            }
            TransferKind::Upload => {
                require_destination()?;
                ProgressDetail::Upload {
                    bytes_transferred: 0,
                    bytes_total: None,
                }
            }
            TransferKind::RemoteToRemote => ProgressDetail::RemoteToRemote {
                bytes_transferred: 0,
                bytes_total: None,
                source_channel: source_channel.to_string(),
                destination_channel: require_destination()?,
            },
        })
    }

    pub fn kind(&self) -> TransferKind {
        match self {
            ProgressDetail::Delete => TransferKind::Delete,
            ProgressDetail::Download { .. } => TransferKind::Download,
            ProgressDetail::Upload { .. } => TransferKind::Upload,
            ProgressDetail::RemoteToRemote { .. } => TransferKind::RemoteToRemote,
        }
    }

    pub fn bytes_transferred(&self) -> Option<u64> {
        match self {
            ProgressDetail::Delete => None,
            ProgressDetail::Download {
                bytes_transferred, ..
            }
            | ProgressDetail::Upload {
                bytes_transferred, ..
            }
            | ProgressDetail::RemoteToRemote {
                bytes_transferred, ..
            } => Some(*bytes_transferred),
        }
    }

    pub fn bytes_total(&self) -> Option<u64> {
        match self {
            ProgressDetail::Delete => None,
            ProgressDetail::Download { bytes_total, .. }
            | ProgressDetail::Upload { bytes_total, .. }
            | ProgressDetail::RemoteToRemote { bytes_total, .. } => *bytes_total,
        }
    }

    pub(crate) fn add_bytes(&mut self, delta: u64) {
        match self {
            ProgressDetail::Delete => {}
            ProgressDetail::Download {
                bytes_transferred, ..
            }
            | ProgressDetail::Upload {
                bytes_transferred, ..
            }
            | ProgressDetail::RemoteToRemote {
                bytes_transferred, ..
            } => *bytes_transferred += delta,
        }
    }

    pub(crate) fn rewind_bytes(&mut self, delta: u64) {
        match self {
            ProgressDetail::Delete => {}
            ProgressDetail::Download {
                bytes_transferred, ..
            }
            | ProgressDetail::Upload {
                bytes_transferred, ..
            }
            | ProgressDetail::RemoteToRemote {
                bytes_transferred, ..
            } => *bytes_transferred = bytes_transferred.saturating_sub(delta),
        }
    }

    pub(crate) fn set_bytes_total(&mut self, total: Option<u64>) {
        match self {
            ProgressDetail::Delete => {}
            ProgressDetail::Download { bytes_total, .. }
            | ProgressDetail::Upload { bytes_total, .. }
            | ProgressDetail::RemoteToRemote { bytes_total, .. } => *bytes_total = total,
        }
    }
}

/// Immutable point-in-time progress of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    /// Strictly increasing per job, starting at 1
    pub sequence: u64,
    pub items_completed: usize,
    pub items_failed: usize,
    /// Grows while the selection is still being enumerated
    pub items_total: usize,
    /// Set once enumeration has finished and `items_total` is fixed
    #[serde(default)]
    pub total_final: bool,
    /// 0-100; stays at 0 until `total_final`
    pub percentage: f64,
    pub current_item: Option<String>,
    pub status: JobState,
    pub detail: ProgressDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Completed share of a job as a percentage (0 when total is 0)
pub fn percentage(completed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        ((completed as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
    }
}

/// Constants for transfer operations
pub mod constants {
    /// Default chunk size for streamed items (256 KB)
    pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

    /// Smallest accepted chunk size
    pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

    /// Largest accepted chunk size (8 MB)
    pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

    /// Default number of concurrent items on multiplexing channels
    pub const DEFAULT_WORKERS: usize = 4;

    /// Upper bound for concurrent items
    pub const MAX_WORKERS: usize = 16;

    /// Channel I/O timeout to prevent zombie transfers (5 minutes)
    pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 300;

    /// Enumerated items buffered ahead of the executor or coordinator
    pub const ITEM_QUEUE_DEPTH: usize = 32;

    /// How long terminal jobs stay queryable (10 minutes)
    pub const DEFAULT_JOB_RETENTION_SECS: u64 = 600;
}
