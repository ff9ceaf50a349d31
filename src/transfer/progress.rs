//! Progress reporting
//!
//! Merges partial updates into per-job running totals and pushes immutable
//! [`ProgressSnapshot`]s to every subscriber of that job. Publication never
//! blocks: each subscriber owns an unbounded channel, and a dropped receiver is
//! pruned on the next report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::error::TransferError;
use super::types::{percentage, JobState, ProgressDetail, ProgressSnapshot};

/// Partial update merged by [`ProgressReporter::report`]
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    items_completed: usize,
    items_failed: usize,
    bytes_added: u64,
    bytes_rewound: u64,
    items_total: Option<usize>,
    total_final: bool,
    bytes_total: Option<Option<u64>>,
    current_item: Option<String>,
    status: Option<JobState>,
    error: Option<String>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(mut self, delta: usize) -> Self {
        self.items_completed += delta;
        self
    }

    pub fn failed(mut self, delta: usize) -> Self {
        self.items_failed += delta;
        self
    }

    pub fn bytes(mut self, delta: u64) -> Self {
        self.bytes_added += delta;
        self
    }

    /// Take back bytes counted by an attempt that is about to be retried
    pub fn rewind_bytes(mut self, delta: u64) -> Self {
        self.bytes_rewound += delta;
        self
    }

    pub fn items_total(mut self, total: usize) -> Self {
        self.items_total = Some(total);
        self
    }

    /// The item total will not change any more
    pub fn total_final(mut self) -> Self {
        self.total_final = true;
        self
    }

    pub fn bytes_total(mut self, total: Option<u64>) -> Self {
        self.bytes_total = Some(total);
        self
    }

    pub fn current_item(mut self, label: impl Into<String>) -> Self {
        self.current_item = Some(label.into());
        self
    }

    pub fn status(mut self, status: JobState) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error(mut self, reason: impl Into<String>) -> Self {
        self.error = Some(reason.into());
        self
    }
}

/// Receiving end of a progress subscription
///
/// Yields every snapshot published after subscribing, in emission order, and
/// `None` once the job's terminal snapshot has been delivered.
#[derive(Debug)]
pub struct ProgressSubscription {
    id: u64,
    job_id: String,
    rx: mpsc::UnboundedReceiver<ProgressSnapshot>,
}

impl ProgressSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn recv(&mut self) -> Option<ProgressSnapshot> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressSnapshot> {
        self.rx.try_recv().ok()
    }

    /// Drain everything until the terminal snapshot
    pub async fn collect(mut self) -> Vec<ProgressSnapshot> {
        let mut snapshots = Vec::new();
        while let Some(snapshot) = self.rx.recv().await {
            snapshots.push(snapshot);
        }
        snapshots
    }
}

struct JobProgress {
    latest: ProgressSnapshot,
    subscribers: Vec<(u64, mpsc::UnboundedSender<ProgressSnapshot>)>,
    closed: bool,
}

impl JobProgress {
    fn merge(&mut self, update: ProgressUpdate) {
        let snapshot = &mut self.latest;
        if let Some(total) = update.items_total {
            if !snapshot.total_final {
                snapshot.items_total = snapshot.items_total.max(total);
            }
        }
        if update.total_final {
            snapshot.total_final = true;
        }
        if let Some(total) = update.bytes_total {
            snapshot.detail.set_bytes_total(total);
        }
        snapshot.items_completed += update.items_completed;
        snapshot.items_failed += update.items_failed;
        snapshot.detail.rewind_bytes(update.bytes_rewound);
        snapshot.detail.add_bytes(update.bytes_added);
        if update.current_item.is_some() {
            snapshot.current_item = update.current_item;
        }
        if let Some(status) = update.status {
            snapshot.status = status;
        }
        if update.error.is_some() {
            snapshot.error = update.error;
        }
        // A growing total would make the percentage go backwards.
        if snapshot.total_final {
            snapshot.percentage = percentage(snapshot.items_completed, snapshot.items_total);
        }
        snapshot.sequence += 1;
    }
}

/// Per-job progress fan-out
pub struct ProgressReporter {
    jobs: DashMap<String, Arc<Mutex<JobProgress>>>,
    next_subscriber: AtomicU64,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Start tracking a job. Nothing is published until the first report.
    pub fn track(&self, job_id: &str, detail: ProgressDetail) {
        let latest = ProgressSnapshot {
            job_id: job_id.to_string(),
            sequence: 0,
            items_completed: 0,
            items_failed: 0,
            items_total: 0,
            total_final: false,
            percentage: 0.0,
            current_item: None,
            status: JobState::Pending,
            detail,
            error: None,
        };
        self.jobs.insert(
            job_id.to_string(),
            Arc::new(Mutex::new(JobProgress {
                latest,
                subscribers: Vec::new(),
                closed: false,
            })),
        );
    }

    fn entry(&self, job_id: &str) -> Option<Arc<Mutex<JobProgress>>> {
        self.jobs.get(job_id).map(|e| e.value().clone())
    }

    /// Merge `update` into the job's totals and publish the new snapshot.
    ///
    /// Returns `None` for unknown jobs and for jobs whose terminal snapshot was
    /// already published.
    pub fn report(&self, job_id: &str, update: ProgressUpdate) -> Option<ProgressSnapshot> {
        let entry = self.entry(job_id)?;
        let mut progress = entry.lock();
        if progress.closed {
            trace!("Dropping progress report for finished job {}", job_id);
            return None;
        }

        progress.merge(update);
        let snapshot = progress.latest.clone();
        progress
            .subscribers
            .retain(|(_, tx)| tx.send(snapshot.clone()).is_ok());

        if snapshot.is_terminal() {
            progress.closed = true;
            // Dropping the senders ends every subscription after this snapshot.
            progress.subscribers.clear();
            debug!(
                "Progress closed for job {} ({:?}, {}/{} done, {} failed)",
                job_id,
                snapshot.status,
                snapshot.items_completed,
                snapshot.items_total,
                snapshot.items_failed
            );
        }
        Some(snapshot)
    }

    /// Attach a new subscriber.
    ///
    /// A subscription to a job that already published its terminal snapshot
    /// is returned closed: it yields no events.
    pub fn subscribe(&self, job_id: &str) -> Result<ProgressSubscription, TransferError> {
        let entry = self
            .entry(job_id)
            .ok_or_else(|| TransferError::JobNotFound(job_id.to_string()))?;
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut progress = entry.lock();
        if !progress.closed {
            progress.subscribers.push((id, tx));
        }
        Ok(ProgressSubscription {
            id,
            job_id: job_id.to_string(),
            rx,
        })
    }

    /// Detach every subscriber of a job. Returns false for unknown jobs.
    pub fn unsubscribe(&self, job_id: &str) -> bool {
        match self.entry(job_id) {
            Some(entry) => {
                entry.lock().subscribers.clear();
                true
            }
            None => false,
        }
    }

    /// Detach a single subscription
    pub fn unsubscribe_one(&self, job_id: &str, subscription_id: u64) -> bool {
        let Some(entry) = self.entry(job_id) else {
            return false;
        };
        let mut progress = entry.lock();
        let before = progress.subscribers.len();
        progress.subscribers.retain(|(id, _)| *id != subscription_id);
        progress.subscribers.len() != before
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.entry(job_id)
            .map(|e| e.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Last published (or initial) snapshot of a job
    pub fn latest(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.entry(job_id).map(|e| e.lock().latest.clone())
    }

    /// Stop tracking a job
    pub fn forget(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter_with(job_id: &str, detail: ProgressDetail) -> ProgressReporter {
        let reporter = ProgressReporter::new();
        reporter.track(job_id, detail);
        reporter
    }

    #[tokio::test]
    async fn test_merges_deltas_into_totals() {
        let reporter = reporter_with(
            "j1",
            ProgressDetail::Download {
                bytes_transferred: 0,
                bytes_total: None,
            },
        );
        let mut sub = reporter.subscribe("j1").unwrap();

        reporter.report(
            "j1",
            ProgressUpdate::new()
                .items_total(4)
                .total_final()
                .bytes_total(Some(100)),
        );
        reporter.report("j1", ProgressUpdate::new().bytes(40).current_item("a.txt"));
        let snap = reporter
            .report("j1", ProgressUpdate::new().completed(1).bytes(10))
            .unwrap();

        assert_eq!(snap.items_completed, 1);
        assert_eq!(snap.percentage, 25.0);
        assert_eq!(snap.detail.bytes_transferred(), Some(50));
        assert_eq!(snap.detail.bytes_total(), Some(100));
        assert_eq!(snap.current_item.as_deref(), Some("a.txt"));

        let sequences: Vec<u64> = (0..3).filter_map(|_| sub.try_recv()).map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_percentage_waits_for_final_total() {
        let reporter = reporter_with("j1", ProgressDetail::Delete);

        reporter.report("j1", ProgressUpdate::new().items_total(1));
        let snap = reporter
            .report("j1", ProgressUpdate::new().completed(1))
            .unwrap();
        assert_eq!(snap.percentage, 0.0);
        assert!(!snap.total_final);

        let snap = reporter
            .report("j1", ProgressUpdate::new().items_total(4))
            .unwrap();
        assert_eq!(snap.items_total, 4);
        assert_eq!(snap.percentage, 0.0);

        let snap = reporter
            .report("j1", ProgressUpdate::new().items_total(4).total_final())
            .unwrap();
        assert!(snap.total_final);
        assert_eq!(snap.percentage, 25.0);

        // the total is frozen once final
        let snap = reporter
            .report("j1", ProgressUpdate::new().items_total(9))
            .unwrap();
        assert_eq!(snap.items_total, 4);
    }

    #[tokio::test]
    async fn test_rewind_bytes_saturates() {
        let reporter = reporter_with(
            "j1",
            ProgressDetail::Upload {
                bytes_transferred: 0,
                bytes_total: None,
            },
        );
        reporter.report("j1", ProgressUpdate::new().bytes(30));
        let snap = reporter
            .report("j1", ProgressUpdate::new().rewind_bytes(50))
            .unwrap();
        assert_eq!(snap.detail.bytes_transferred(), Some(0));
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_snapshot() {
        let reporter = reporter_with("j1", ProgressDetail::Delete);
        let a = reporter.subscribe("j1").unwrap();
        let b = reporter.subscribe("j1").unwrap();

        reporter.report(
            "j1",
            ProgressUpdate::new()
                .items_total(2)
                .total_final()
                .status(JobState::Running),
        );
        reporter.report("j1", ProgressUpdate::new().completed(1));
        reporter.report("j1", ProgressUpdate::new().completed(1).status(JobState::Completed));

        let a = a.collect().await;
        let b = b.collect().await;
        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 3);
        assert!(a.last().unwrap().is_terminal());
        assert_eq!(b[2].percentage, 100.0);
    }

    #[tokio::test]
    async fn test_reports_after_terminal_are_ignored() {
        let reporter = reporter_with("j1", ProgressDetail::Delete);
        reporter.report("j1", ProgressUpdate::new().status(JobState::Cancelled));

        assert!(reporter.report("j1", ProgressUpdate::new().completed(1)).is_none());
        assert_eq!(reporter.latest("j1").unwrap().items_completed, 0);

        let mut late = reporter.subscribe("j1").unwrap();
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let reporter = reporter_with("j1", ProgressDetail::Delete);
        let sub = reporter.subscribe("j1").unwrap();
        let _kept = reporter.subscribe("j1").unwrap();
        drop(sub);

        reporter.report("j1", ProgressUpdate::new().status(JobState::Running));
        assert_eq!(reporter.subscriber_count("j1"), 1);
    }

    #[test]
    fn test_unknown_job() {
        let reporter = ProgressReporter::new();
        assert!(matches!(
            reporter.subscribe("nope"),
            Err(TransferError::JobNotFound(_))
        ));
        assert!(reporter.report("nope", ProgressUpdate::new()).is_none());
        assert!(!reporter.unsubscribe("nope"));
    }

    #[test]
    fn test_unsubscribe_one() {
        let reporter = reporter_with("j1", ProgressDetail::Delete);
        let a = reporter.subscribe("j1").unwrap();
        let _b = reporter.subscribe("j1").unwrap();

        assert!(reporter.unsubscribe_one("j1", a.id()));
        assert!(!reporter.unsubscribe_one("j1", a.id()));
        assert_eq!(reporter.subscriber_count("j1"), 1);
        assert!(reporter.unsubscribe("j1"));
        assert_eq!(reporter.subscriber_count("j1"), 0);
    }
}
