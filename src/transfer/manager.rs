//! Transfer manager
//!
//! Public entry point of the engine. Each `start_*` call validates its input,
//! registers a job and a cancellation token, spawns the work and returns a
//! [`JobHandle`] right away. Progress is observed through
//! [`TransferManager::subscribe`]; the final job is read with
//! [`TransferManager::get_job`].

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cancellation::{check_transfer_control, CancellationRegistry, CancellationToken};
use super::channel::FileChannel;
use super::coordinator::RemoteToRemoteTransferCoordinator;
use super::enumerator::ItemEnumerator;
use super::error::TransferError;
use super::executor::{BulkOperation, BulkOperationExecutor};
use super::job::JobRecord;
use super::path_utils::{is_absolute_remote_path, is_valid_entry_name};
use super::pipeline::{ping_channels, ItemFeed};
use super::progress::{ProgressReporter, ProgressSubscription};
use super::types::{
    constants, ItemState, JobResult, JobState, ProgressSnapshot, TransferItem, TransferJob,
    TransferKind,
};
use crate::config::TransferConfig;

/// Handle returned by the `start_*` calls
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: String,
    state_rx: watch::Receiver<JobState>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        *self.state_rx.borrow()
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(mut self) -> JobState {
        let reached = self
            .state_rx
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state);
        // Err means the record was evicted; the last value seen is final.
        reached.unwrap_or_else(|_| *self.state_rx.borrow())
    }
}

/// What a spawned job works on
struct JobPlan {
    kind: TransferKind,
    source: Arc<dyn FileChannel>,
    source_dir: String,
    names: Vec<String>,
    destination: Option<(Arc<dyn FileChannel>, String)>,
}

impl JobPlan {
    fn destination_channel(&self) -> Option<&dyn FileChannel> {
        self.destination.as_ref().map(|(channel, _)| channel.as_ref())
    }
}

pub struct TransferManager {
    config: TransferConfig,
    jobs: DashMap<String, Arc<JobRecord>>,
    cancellations: CancellationRegistry,
    reporter: Arc<ProgressReporter>,
    executor: BulkOperationExecutor,
    coordinator: RemoteToRemoteTransferCoordinator,
}

impl TransferManager {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            executor: BulkOperationExecutor::new(config.clone()),
            coordinator: RemoteToRemoteTransferCoordinator::new(config.clone()),
            config,
            jobs: DashMap::new(),
            cancellations: CancellationRegistry::new(),
            reporter: Arc::new(ProgressReporter::new()),
        }
    }

    /// Build a manager from a JSON config file (defaults if it doesn't exist)
    pub async fn from_config_file(path: &Path) -> Result<Self, TransferError> {
        let config = TransferConfig::load(path)
            .await
            .map_err(|e| TransferError::Config(e.to_string()))?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Delete `names` inside `directory` (directories are removed recursively)
    pub fn start_bulk_delete(
        self: &Arc<Self>,
        channel: Arc<dyn FileChannel>,
        directory: &str,
        names: Vec<String>,
    ) -> Result<JobHandle, TransferError> {
        validate_selection(channel.as_ref(), directory, &names)?;
        self.launch(JobPlan {
            kind: TransferKind::Delete,
            source: channel,
            source_dir: directory.to_string(),
            names,
            destination: None,
        })
    }

    /// Copy `names` from a remote directory into a local one
    pub fn start_bulk_download(
        self: &Arc<Self>,
        remote: Arc<dyn FileChannel>,
        remote_dir: &str,
        names: Vec<String>,
        local: Arc<dyn FileChannel>,
        local_dir: &str,
    ) -> Result<JobHandle, TransferError> {
        if remote.is_local() || !local.is_local() {
            return Err(TransferError::InvalidRequest(
                "download requires a remote source and the local destination".to_string(),
            ));
        }
        validate_selection(remote.as_ref(), remote_dir, &names)?;
        validate_directory(local.as_ref(), local_dir)?;
        self.launch(JobPlan {
            kind: TransferKind::Download,
            source: remote,
            source_dir: remote_dir.to_string(),
            names,
            destination: Some((local, local_dir.to_string())),
        })
    }

    /// Copy `names` from a local directory into a remote one
    pub fn start_bulk_upload(
        self: &Arc<Self>,
        local: Arc<dyn FileChannel>,
        local_dir: &str,
        names: Vec<String>,
        remote: Arc<dyn FileChannel>,
        remote_dir: &str,
    ) -> Result<JobHandle, TransferError> {
        if !local.is_local() || remote.is_local() {
            return Err(TransferError::InvalidRequest(
                "upload requires the local source and a remote destination".to_string(),
            ));
        }
        validate_selection(local.as_ref(), local_dir, &names)?;
        validate_directory(remote.as_ref(), remote_dir)?;
        self.launch(JobPlan {
            kind: TransferKind::Upload,
            source: local,
            source_dir: local_dir.to_string(),
            names,
            destination: Some((remote, remote_dir.to_string())),
        })
    }

    /// Stream `names` from one remote session to another
    pub fn start_remote_to_remote_transfer(
        self: &Arc<Self>,
        source: Arc<dyn FileChannel>,
        source_dir: &str,
        names: Vec<String>,
        destination: Arc<dyn FileChannel>,
        destination_dir: &str,
    ) -> Result<JobHandle, TransferError> {
        RemoteToRemoteTransferCoordinator::validate_endpoints(
            source.as_ref(),
            destination.as_ref(),
        )?;
        validate_selection(source.as_ref(), source_dir, &names)?;
        validate_directory(destination.as_ref(), destination_dir)?;
        self.launch(JobPlan {
            kind: TransferKind::RemoteToRemote,
            source,
            source_dir: source_dir.to_string(),
            names,
            destination: Some((destination, destination_dir.to_string())),
        })
    }

    fn launch(self: &Arc<Self>, plan: JobPlan) -> Result<JobHandle, TransferError> {
        let job = TransferJob::new(
            Uuid::new_v4().to_string(),
            plan.kind,
            plan.source.id().to_string(),
            plan.destination_channel().map(|c| c.id().to_string()),
        );
        let record = Arc::new(JobRecord::new(job, self.reporter.clone())?);
        let id = record.id().to_string();
        let token = self.cancellations.register(&id)?;
        let state_rx = record.subscribe_state();
        self.jobs.insert(id.clone(), record.clone());

        info!(
            "Started {} job {} on {} ({} selected)",
            plan.kind.as_str(),
            id,
            plan.source.id(),
            plan.names.len()
        );
        tokio::spawn(self.clone().run(record, plan, token));
        Ok(JobHandle { id, state_rx })
    }

    async fn run(self: Arc<Self>, record: Arc<JobRecord>, plan: JobPlan, token: CancellationToken) {
        record.start();
        let outcome = self.drive(&record, &plan, &token).await;
        self.finalize(&record, outcome);
        self.schedule_eviction(record.id());
    }

    /// Enumerate and execute concurrently: items flow to the executor (or
    /// coordinator) through a bounded queue as the walk produces them.
    async fn drive(
        &self,
        record: &JobRecord,
        plan: &JobPlan,
        token: &CancellationToken,
    ) -> Result<JobResult, TransferError> {
        let mut channels = vec![plan.source.as_ref()];
        channels.extend(plan.destination_channel());
        ping_channels(&channels).await?;

        let enumerator = match &plan.destination {
            None => ItemEnumerator::shallow(plan.source.clone(), &plan.source_dir, &plan.names),
            Some((_, destination_dir)) => ItemEnumerator::recursive(
                plan.source.clone(),
                &plan.source_dir,
                &plan.names,
                destination_dir,
            ),
        };
        let (items, feed) = mpsc::channel(constants::ITEM_QUEUE_DEPTH);

        let (enumerated, outcome) = tokio::join!(
            Self::enumerate(record, enumerator, items, token),
            self.execute(record, plan, feed, token),
        );
        enumerated.and(outcome)
    }

    async fn enumerate(
        record: &JobRecord,
        mut enumerator: ItemEnumerator,
        items: mpsc::Sender<(usize, TransferItem)>,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        while let Some(item) = enumerator.next().await {
            check_transfer_control(token)?;
            let queued = item.state == ItemState::Queued;
            let index = record.append_item(item.clone());
            if queued && items.send((index, item)).await.is_err() {
                // Consumer stopped early; the rest is settled at finalization.
                break;
            }
        }
        record.seal_items();
        debug!("Job {} enumerated {} items", record.id(), enumerator.produced());
        Ok(())
    }

    async fn execute(
        &self,
        record: &JobRecord,
        plan: &JobPlan,
        feed: ItemFeed,
        token: &CancellationToken,
    ) -> Result<JobResult, TransferError> {
        let source = plan.source.as_ref();
        let destination = plan.destination_channel();
        let operation = match plan.kind {
            TransferKind::Delete => BulkOperation::Delete,
            TransferKind::Download => BulkOperation::Download,
            TransferKind::Upload => BulkOperation::Upload,
            TransferKind::RemoteToRemote => {
                let destination = destination.ok_or_else(|| {
                    TransferError::InvalidRequest(
                        "remote-to-remote transfer requires a destination".to_string(),
                    )
                })?;
                return self
                    .coordinator
                    .transfer(record, source, destination, feed, token)
                    .await;
            }
        };
        self.executor
            .execute(record, operation, source, destination, feed, token)
            .await
    }

    /// Release the job's token and publish its terminal state.
    ///
    /// The state is decided while the token is being removed, so a `cancel`
    /// that returned true is reflected in it and one that returned false
    /// found the job already terminal.
    fn finalize(&self, record: &JobRecord, outcome: Result<JobResult, TransferError>) {
        let settle = |cancelled| self.settle(record, cancelled, &outcome);
        let state = match self.cancellations.release_with(record.id(), settle) {
            Some(state) => state,
            None => self.settle(record, false, &outcome),
        };

        let result = record.result();
        info!(
            "{} job {} {:?}: {} succeeded, {} failed",
            record.kind().as_str(),
            record.id(),
            state,
            result.succeeded,
            result.failed
        );
    }

    fn settle(
        &self,
        record: &JobRecord,
        cancelled: bool,
        outcome: &Result<JobResult, TransferError>,
    ) -> JobState {
        // A cancel that arrived after every item finished changes nothing.
        let interrupted =
            cancelled && (record.was_interrupted() || record.has_unfinished_items());
        record.seal_items();

        let (state, reason) = match outcome {
            Err(e) if e.is_cancelled() => {
                record.fail_remaining("cancelled");
                (JobState::Cancelled, None)
            }
            _ if interrupted => {
                record.fail_remaining("cancelled");
                (JobState::Cancelled, None)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Job {} failed: {}", record.id(), reason);
                record.fail_remaining(&reason);
                (JobState::Failed, Some(reason))
            }
            Ok(_) => {
                // items left queued by an early stop still count as failures
                record.fail_remaining("not processed");
                let result = record.result();
                let total = result.succeeded + result.failed;
                if self.config.failure_policy.is_failure(result.failed, total) {
                    let reason = format!("{} of {} items failed", result.failed, total);
                    (JobState::Failed, Some(reason))
                } else {
                    (JobState::Completed, None)
                }
            }
        };
        record.finish(state, reason);
        state
    }

    fn schedule_eviction(self: &Arc<Self>, job_id: &str) {
        let retention = self.config.job_retention();
        let manager: Weak<Self> = Arc::downgrade(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(manager) = manager.upgrade() {
                if manager.evict(&job_id) {
                    debug!("Evicted finished job {}", job_id);
                }
            }
        });
    }

    fn evict(&self, job_id: &str) -> bool {
        let removed = self
            .jobs
            .remove_if(job_id, |_, record| record.state().is_terminal())
            .is_some();
        if removed {
            self.reporter.forget(job_id);
        }
        removed
    }

    /// Request cancellation. False if the job is unknown or already terminal.
    pub fn cancel(&self, job_id: &str) -> bool {
        self.cancellations.cancel(job_id)
    }

    /// Cancel every live job, returning how many were signalled
    pub fn cancel_all(&self) -> usize {
        self.cancellations.cancel_all()
    }

    pub fn subscribe(&self, job_id: &str) -> Result<ProgressSubscription, TransferError> {
        self.reporter.subscribe(job_id)
    }

    pub fn unsubscribe(&self, job_id: &str) -> bool {
        self.reporter.unsubscribe(job_id)
    }

    pub fn get_job(&self, job_id: &str) -> Option<TransferJob> {
        self.jobs.get(job_id).map(|record| record.snapshot())
    }

    /// Last snapshot published for a job
    pub fn latest_progress(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.reporter.latest(job_id)
    }

    /// All jobs still held, oldest first
    pub fn list_jobs(&self) -> Vec<TransferJob> {
        let mut jobs: Vec<TransferJob> = self.jobs.iter().map(|r| r.value().snapshot()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Drop a finished job before its retention window ends
    pub fn remove_job(&self, job_id: &str) -> Result<TransferJob, TransferError> {
        let record = self
            .jobs
            .get(job_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| TransferError::JobNotFound(job_id.to_string()))?;
        if !record.state().is_terminal() {
            return Err(TransferError::InvalidRequest(format!(
                "job {} is still running",
                job_id
            )));
        }
        self.evict(job_id);
        Ok(record.snapshot())
    }

    /// Jobs that have not reached a terminal state
    pub fn active_count(&self) -> usize {
        self.cancellations.registered_count()
    }
}

fn validate_directory(channel: &dyn FileChannel, directory: &str) -> Result<(), TransferError> {
    if directory.is_empty() {
        return Err(TransferError::InvalidRequest(format!(
            "empty directory for channel {}",
            channel.id()
        )));
    }
    if !channel.is_local() && !is_absolute_remote_path(directory) {
        return Err(TransferError::InvalidRequest(format!(
            "remote directory must be absolute: {}",
            directory
        )));
    }
    Ok(())
}

fn validate_selection(
    channel: &dyn FileChannel,
    directory: &str,
    names: &[String],
) -> Result<(), TransferError> {
    validate_directory(channel, directory)?;
    if names.is_empty() {
        return Err(TransferError::InvalidRequest(
            "no items selected".to_string(),
        ));
    }
    let mut seen = HashSet::with_capacity(names.len());
    for name in names {
        if !is_valid_entry_name(name) {
            return Err(TransferError::InvalidRequest(format!(
                "invalid entry name: {:?}",
                name
            )));
        }
        if !seen.insert(name.as_str()) {
            return Err(TransferError::InvalidRequest(format!(
                "duplicate entry name: {}",
                name
            )));
        }
    }
    Ok(())
}
