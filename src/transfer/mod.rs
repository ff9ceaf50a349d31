//! Transfer orchestration
//!
//! Bulk delete, download, upload and remote-to-remote copy over
//! [`FileChannel`]s, with per-item progress and cooperative cancellation.

pub mod cancellation;
pub mod channel;
pub mod coordinator;
pub mod enumerator;
pub mod error;
pub mod executor;
mod job;
pub mod local;
pub mod manager;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod path_utils;
mod pipeline;
pub mod progress;
pub mod retry;
pub mod types;


pub use cancellation::{CancellationRegistry, CancellationToken, TransferControl};
pub use channel::{EntryInfo, EntryKind, FileChannel, ReadStream, WriteSink};
pub use coordinator::RemoteToRemoteTransferCoordinator;
pub use enumerator::ItemEnumerator;
pub use error::{ChannelError, TransferError};
pub use executor::{BulkOperation, BulkOperationExecutor};
pub use local::{LocalChannel, LOCAL_CHANNEL_ID};
pub use manager::{JobHandle, TransferManager};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{FaultKind, FaultOp, MemoryChannel};
pub use progress::{ProgressReporter, ProgressSubscription, ProgressUpdate};
pub use retry::RetryConfig;
pub use types::{
    ItemFailure, ItemKind, ItemState, JobResult, JobState, ProgressDetail, ProgressSnapshot,
    TransferItem, TransferJob, TransferKind,
};
