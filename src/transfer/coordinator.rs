//! Remote-to-remote transfer coordinator
//!
//! Streams items from one remote channel to another through a fixed-size
//! buffer, never through a local file. At most one item is in flight per
//! (source, destination) channel pair across all jobs; unrelated pairs run
//! freely.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::cancellation::TransferControl;
use super::channel::FileChannel;
use super::error::TransferError;
use super::job::JobRecord;
use super::pipeline::{
    copy_item, settle_item, AbortSignal, CopySettings, DirectoryTracker, ItemFeed,
};
use super::retry::run_with_retry;
use super::types::JobResult;
use crate::config::TransferConfig;

type PairKey = (String, String);

pub struct RemoteToRemoteTransferCoordinator {
    config: TransferConfig,
    pair_locks: DashMap<PairKey, Arc<Mutex<()>>>,
}

impl RemoteToRemoteTransferCoordinator {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            pair_locks: DashMap::new(),
        }
    }

    /// Both endpoints must be remote and distinct
    pub fn validate_endpoints(
        source: &dyn FileChannel,
        destination: &dyn FileChannel,
    ) -> Result<(), TransferError> {
        if source.is_local() || destination.is_local() {
            return Err(TransferError::InvalidRequest(
                "remote-to-remote transfer requires two remote channels".to_string(),
            ));
        }
        if source.id() == destination.id() {
            return Err(TransferError::InvalidRequest(format!(
                "source and destination are the same channel: {}",
                source.id()
            )));
        }
        Ok(())
    }

    pub(crate) fn pair_lock(&self, source_id: &str, destination_id: &str) -> Arc<Mutex<()>> {
        self.pair_locks
            .entry((source_id.to_string(), destination_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the pair's lock once no job holds a reference to it
    fn release_pair(&self, key: &PairKey) {
        self.pair_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn active_pairs(&self) -> usize {
        self.pair_locks.len()
    }

    pub(crate) async fn transfer(
        &self,
        job: &JobRecord,
        source: &dyn FileChannel,
        destination: &dyn FileChannel,
        mut feed: ItemFeed,
        control: &TransferControl,
    ) -> Result<JobResult, TransferError> {
        Self::validate_endpoints(source, destination)?;

        let key = (source.id().to_string(), destination.id().to_string());
        let lock = self.pair_lock(&key.0, &key.1);
        info!("Job {}: remote transfer {} -> {}", job.id(), key.0, key.1);

        let directories = DirectoryTracker::new();
        let settings = CopySettings::from(&self.config);
        let abort = AbortSignal::new();

        while let Some((index, item)) = feed.recv().await {
            if control.is_cancelled() || abort.is_tripped() {
                break;
            }
            tokio::task::yield_now().await;

            let _pair = tokio::select! {
                guard = lock.lock() => guard,
                _ = control.cancelled() => break,
            };
            if !job.begin_item(index) {
                continue;
            }

            let item = &item;
            let directories = &directories;
            let result = run_with_retry(
                &item.relative_path,
                &self.config.retry,
                control,
                move || async move {
                    job.reset_bytes(index);
                    copy_item(
                        job,
                        index,
                        item,
                        source,
                        destination,
                        directories,
                        settings,
                        control,
                    )
                    .await
                },
            )
            .await;
            settle_item(job, index, result, &abort);
        }

        drop(lock);
        self.release_pair(&key);

        if let Some(error) = abort.into_error() {
            return Err(error);
        }
        let result = job.result();
        debug!(
            "Job {} remote transfer done: {} succeeded, {} failed",
            job.id(),
            result.succeeded,
            result.failed
        );
        Ok(result)
    }
}
