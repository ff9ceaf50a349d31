//! Cancellation tokens and the per-manager cancellation registry

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::TransferError;

/// Transfer control signal
///
/// Backed by a watch channel: a `cancel()` is visible to every receiver at
/// its next checkpoint.
#[derive(Debug)]
pub struct TransferControl {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Get a receiver for waiting on cancellation
    pub fn subscribe_cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    /// Resolves once the transfer is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // The sender lives in `self`, so wait_for only fails if we are torn down.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Token handed to the executor / coordinator for one job.
pub type CancellationToken = Arc<TransferControl>;

/// Checkpoint helper for cancellation between items and chunks
pub fn check_transfer_control(control: &TransferControl) -> Result<(), TransferError> {
    if control.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    Ok(())
}

/// Maps live job ids to their cancellation tokens.
pub struct CancellationRegistry {
    controls: DashMap<String, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            controls: DashMap::new(),
        }
    }

    /// Register a job and get its token. A live duplicate id is rejected.
    pub fn register(&self, job_id: &str) -> Result<CancellationToken, TransferError> {
        match self.controls.entry(job_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!("Cancellation token already registered: {}", job_id);
                Err(TransferError::DuplicateJob(job_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let control = Arc::new(TransferControl::new());
                slot.insert(control.clone());
                debug!("Registered cancellation token: {}", job_id);
                Ok(control)
            }
        }
    }

    /// Request cancellation of a live job.
    ///
    /// Returns false when the job is unknown or already released (terminal).
    /// Repeated calls on a live job return true and have no further effect.
    pub fn cancel(&self, job_id: &str) -> bool {
        if let Some(control) = self.controls.get(job_id) {
            if !control.is_cancelled() {
                control.cancel();
                info!("Cancelled transfer: {}", job_id);
            }
            true
        } else {
            debug!("Transfer not live for cancel: {}", job_id);
            false
        }
    }

    /// Drop the token and run `finish` with its final cancel flag.
    ///
    /// `finish` runs under the entry's write lock, so a concurrent `cancel`
    /// either lands before it (and is seen) or returns false after it.
    /// None when the job is not registered.
    pub fn release_with<R>(&self, job_id: &str, finish: impl FnOnce(bool) -> R) -> Option<R> {
        let mut finished = None;
        self.controls.remove_if(job_id, |_, control| {
            finished = Some(finish(control.is_cancelled()));
            true
        });
        if finished.is_some() {
            debug!("Released cancellation token: {}", job_id);
        }
        finished
    }

    pub fn registered_count(&self) -> usize {
        self.controls.len()
    }

    /// Cancel all live jobs
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.controls.iter() {
            if !entry.value().is_cancelled() {
                entry.value().cancel();
                count += 1;
            }
        }
        info!("Cancelled {} live transfers", count);
        count
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
