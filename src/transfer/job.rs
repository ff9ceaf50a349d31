//! Live job state
//!
//! A `JobRecord` owns one `TransferJob` behind a mutex. Every mutation reports
//! to the [`ProgressReporter`] while the job lock is held, so snapshots of a job
//! are published in the same order its counters change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::error::TransferError;
use super::progress::{ProgressReporter, ProgressUpdate};
use super::types::{
    ItemState, JobResult, JobState, ProgressDetail, TransferItem, TransferJob, TransferKind,
};

pub(crate) struct JobRecord {
    id: String,
    kind: TransferKind,
    job: Mutex<TransferJob>,
    state_tx: watch::Sender<JobState>,
    reporter: Arc<ProgressReporter>,
    /// An item was cut short by cancellation
    interrupted: AtomicBool,
}

impl JobRecord {
    pub fn new(job: TransferJob, reporter: Arc<ProgressReporter>) -> Result<Self, TransferError> {
        let detail = ProgressDetail::for_job(
            job.kind,
            &job.source_channel,
            job.destination_channel.as_deref(),
        )?;
        reporter.track(&job.id, detail);
        let (state_tx, _) = watch::channel(job.state);
        Ok(Self {
            id: job.id.clone(),
            kind: job.kind,
            job: Mutex::new(job),
            state_tx,
            reporter,
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        self.job.lock().state
    }

    pub fn snapshot(&self) -> TransferJob {
        self.job.lock().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    pub fn result(&self) -> JobResult {
        self.job.lock().result()
    }

    /// `Pending -> Running`
    pub fn start(&self) -> bool {
        let mut job = self.job.lock();
        if !job.state.can_advance_to(JobState::Running) {
            return false;
        }
        job.state = JobState::Running;
        self.reporter
            .report(&self.id, ProgressUpdate::new().status(JobState::Running));
        self.state_tx.send_replace(JobState::Running);
        true
    }

    /// Add one enumerated item and return its index. An item that already
    /// failed during enumeration is counted as failed right away.
    pub fn append_item(&self, item: TransferItem) -> usize {
        let mut job = self.job.lock();
        let failed = item.state == ItemState::Error;
        job.items.push(item);
        let index = job.items.len() - 1;

        let mut update = ProgressUpdate::new().items_total(job.items.len());
        if failed {
            job.items_failed += 1;
            update = update.failed(1);
        }
        self.reporter.report(&self.id, update);
        index
    }

    /// Fix the item list once enumeration has ended
    pub fn seal_items(&self) {
        let mut job = self.job.lock();
        if job.enumeration_complete {
            return;
        }
        job.enumeration_complete = true;
        let update = ProgressUpdate::new()
            .items_total(job.items_total())
            .total_final()
            .bytes_total(job.bytes_total());
        self.reporter.report(&self.id, update);
    }

    #[cfg(test)]
    pub fn set_items(&self, items: Vec<TransferItem>) {
        for item in items {
            self.append_item(item);
        }
        self.seal_items();
    }

    /// Items still waiting to run, with their index
    #[cfg(test)]
    pub fn queued_items(&self) -> Vec<(usize, TransferItem)> {
        self.job
            .lock()
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.state == ItemState::Queued)
            .map(|(index, item)| (index, item.clone()))
            .collect()
    }

    /// Enumeration still open, or some item not yet `Done` or `Error`
    pub fn has_unfinished_items(&self) -> bool {
        let job = self.job.lock();
        !job.enumeration_complete || job.items.iter().any(|item| !item.state.is_finished())
    }

    /// `Queued -> InProgress`; false if the item is not queued
    pub fn begin_item(&self, index: usize) -> bool {
        let mut job = self.job.lock();
        let Some(item) = job.items.get_mut(index) else {
            return false;
        };
        if item.state != ItemState::Queued {
            return false;
        }
        item.state = ItemState::InProgress;
        let label = item.relative_path.clone();
        debug!("Job {} item {} started: {}", self.id, index, label);
        self.reporter
            .report(&self.id, ProgressUpdate::new().current_item(label));
        true
    }

    pub fn add_bytes(&self, index: usize, delta: u64) {
        let mut job = self.job.lock();
        if let Some(item) = job.items.get_mut(index) {
            item.bytes_transferred += delta;
            self.reporter
                .report(&self.id, ProgressUpdate::new().bytes(delta));
        }
    }

    /// Forget the bytes of a failed attempt before it is retried
    pub fn reset_bytes(&self, index: usize) {
        let mut job = self.job.lock();
        if let Some(item) = job.items.get_mut(index) {
            let sent = std::mem::take(&mut item.bytes_transferred);
            if sent > 0 {
                self.reporter
                    .report(&self.id, ProgressUpdate::new().rewind_bytes(sent));
            }
        }
    }

    /// `InProgress -> Done`
    pub fn complete_item(&self, index: usize, skipped: bool) {
        let mut job = self.job.lock();
        let Some(item) = job.items.get_mut(index) else {
            return;
        };
        if item.state.is_finished() {
            return;
        }
        item.state = ItemState::Done;
        item.skipped = skipped;
        job.items_completed += 1;
        self.reporter
            .report(&self.id, ProgressUpdate::new().completed(1));
    }

    /// `InProgress | Queued -> Error`
    pub fn fail_item(&self, index: usize, error: impl Into<String>) {
        let mut job = self.job.lock();
        let Some(item) = job.items.get_mut(index) else {
            return;
        };
        if item.state.is_finished() {
            return;
        }
        let error = error.into();
        warn!("Job {} item {} failed: {}", self.id, item.source_path, error);
        item.state = ItemState::Error;
        item.error = Some(error);
        job.items_failed += 1;
        self.reporter
            .report(&self.id, ProgressUpdate::new().failed(1));
    }

    /// Fail an item whose work was stopped by cancellation
    pub fn interrupt_item(&self, index: usize) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.fail_item(index, "cancelled");
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Mark every unfinished item as failed with `reason`
    pub fn fail_remaining(&self, reason: &str) -> usize {
        let mut job = self.job.lock();
        let mut count = 0;
        for item in job.items.iter_mut().filter(|item| !item.state.is_finished()) {
            item.state = ItemState::Error;
            item.error = Some(reason.to_string());
            count += 1;
        }
        if count > 0 {
            job.items_failed += count;
            self.reporter
                .report(&self.id, ProgressUpdate::new().failed(count));
        }
        count
    }

    /// Move to a terminal state and publish the terminal snapshot
    pub fn finish(&self, state: JobState, reason: Option<String>) -> bool {
        let mut job = self.job.lock();
        if !state.is_terminal() || !job.state.can_advance_to(state) {
            warn!(
                "Job {} cannot move from {:?} to {:?}",
                self.id, job.state, state
            );
            return false;
        }
        job.state = state;
        job.finished_at = Some(Utc::now());
        job.failure_reason = reason.clone();

        let mut update = ProgressUpdate::new().status(state);
        if let Some(reason) = reason {
            update = update.error(reason);
        }
        self.reporter.report(&self.id, update);
        self.state_tx.send_replace(state);
        true
    }
}
