//! Bulk operation executor
//!
//! Runs a homogeneous batch (delete, download or upload) over a job's queued
//! items with bounded concurrency. Item failures are recorded on the item and
//! the batch continues; only a disconnect ends it early.

use futures_util::future;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::cancellation::TransferControl;
use super::channel::FileChannel;
use super::error::TransferError;
use super::job::JobRecord;
use super::pipeline::{
    copy_item, remove_item, settle_item, AbortSignal, CopySettings, DirectoryTracker, ItemFeed,
    ItemOutcome,
};
use super::retry::{run_with_retry, RetryConfig};
use super::types::{JobResult, TransferItem};
use crate::config::TransferConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkOperation {
    Delete,
    Download,
    Upload,
}

pub struct BulkOperationExecutor {
    config: TransferConfig,
}

/// Everything one batch shares between its concurrent items
struct Batch<'a> {
    job: &'a JobRecord,
    operation: BulkOperation,
    source: &'a dyn FileChannel,
    destination: Option<&'a dyn FileChannel>,
    directories: DirectoryTracker,
    settings: CopySettings,
    retry: &'a RetryConfig,
    control: &'a TransferControl,
    abort: AbortSignal,
}

impl Batch<'_> {
    fn should_stop(&self) -> bool {
        self.control.is_cancelled() || self.abort.is_tripped()
    }

    async fn run_item(&self, index: usize, item: TransferItem) {
        // Items not started once the batch is stopping stay queued.
        if self.should_stop() {
            return;
        }
        tokio::task::yield_now().await;
        if self.should_stop() || !self.job.begin_item(index) {
            return;
        }

        let item = &item;
        let result = run_with_retry(
            &item.relative_path,
            self.retry,
            self.control,
            move || async move {
                self.job.reset_bytes(index);
                self.apply(index, item).await
            },
        )
        .await;
        settle_item(self.job, index, result, &self.abort);
    }

    async fn apply(&self, index: usize, item: &TransferItem) -> Result<ItemOutcome, TransferError> {
        match (self.operation, self.destination) {
            (BulkOperation::Delete, _) => remove_item(self.source, item, self.control).await,
            (_, Some(destination)) => {
                copy_item(
                    self.job,
                    index,
                    item,
                    self.source,
                    destination,
                    &self.directories,
                    self.settings,
                    self.control,
                )
                .await
            }
            (operation, None) => Err(TransferError::InvalidRequest(format!(
                "{:?} requires a destination channel",
                operation
            ))),
        }
    }
}

impl BulkOperationExecutor {
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    /// Concurrent items for a batch: the configured worker count when every
    /// involved channel multiplexes, otherwise one.
    pub fn worker_count(
        &self,
        source: &dyn FileChannel,
        destination: Option<&dyn FileChannel>,
    ) -> usize {
        let multiplexing = source.supports_multiplexing()
            && destination.map_or(true, |d| d.supports_multiplexing());
        if multiplexing {
            self.config.worker_count()
        } else {
            1
        }
    }

    pub(crate) async fn execute(
        &self,
        job: &JobRecord,
        operation: BulkOperation,
        source: &dyn FileChannel,
        destination: Option<&dyn FileChannel>,
        feed: ItemFeed,
        control: &TransferControl,
    ) -> Result<JobResult, TransferError> {
        if operation != BulkOperation::Delete && destination.is_none() {
            return Err(TransferError::InvalidRequest(format!(
                "{:?} requires a destination channel",
                operation
            )));
        }

        let workers = self.worker_count(source, destination);
        info!(
            "Job {}: {:?} on {} ({} workers)",
            job.id(),
            operation,
            source.id(),
            workers
        );

        let batch = Batch {
            job,
            operation,
            source,
            destination,
            directories: DirectoryTracker::new(),
            settings: CopySettings::from(&self.config),
            retry: &self.config.retry,
            control,
            abort: AbortSignal::new(),
        };

        {
            let batch = &batch;
            // Stop pulling once the batch is stopping; the feed is dropped on
            // return, which ends enumeration.
            stream::unfold(feed, |mut feed| async move {
                feed.recv().await.map(|next| (next, feed))
            })
            .take_while(|_| future::ready(!batch.should_stop()))
            .map(|(index, item)| batch.run_item(index, item))
            .buffer_unordered(workers)
            .collect::<Vec<()>>()
            .await;
        }

        if let Some(error) = batch.abort.into_error() {
            return Err(error);
        }
        let result = job.result();
        debug!(
            "Job {} batch done: {} succeeded, {} failed",
            job.id(),
            result.succeeded,
            result.failed
        );
        Ok(result)
    }
}
