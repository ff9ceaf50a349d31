//! Per-item retry logic
//!
//! Retries transient channel failures with exponential backoff. Cancellation
//! interrupts the backoff sleep.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::cancellation::TransferControl;
use super::error::TransferError;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = single attempt)
    pub max_retries: usize,

    /// Initial backoff duration in milliseconds
    pub initial_backoff_ms: u64,

    /// Backoff multiplier for each retry
    pub backoff_multiplier: f64,

    /// Maximum backoff duration in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set custom backoff parameters
    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.backoff_multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }
}

/// Backoff delay for a given retry attempt (exponential, capped)
pub fn calculate_backoff(attempt: usize, config: &RetryConfig) -> Duration {
    let delay_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64);

    Duration::from_millis(delay_ms.max(0.0) as u64)
}

pub fn is_retryable_error(error: &TransferError) -> bool {
    match error {
        TransferError::Channel(e) => e.is_retryable(),
        _ => false,
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or attempts
/// are exhausted.
pub async fn run_with_retry<T, F, Fut>(
    label: &str,
    config: &RetryConfig,
    control: &TransferControl,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_retries && is_retryable_error(&e) => {
                let delay = calculate_backoff(attempt, config);
                attempt += 1;
                info!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    label,
                    attempt,
                    config.max_retries + 1,
                    delay,
                    e
                );

                let mut cancel_rx = control.subscribe_cancellation();
                if *cancel_rx.borrow() {
                    return Err(TransferError::Cancelled);
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            debug!("{} cancelled during backoff", label);
                            return Err(TransferError::Cancelled);
                        }
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::error::ChannelError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_calculate_backoff() {
        let config = RetryConfig::default();

        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(500));
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(10, &config), Duration::from_millis(30_000));
    }

    #[test]
    fn test_is_retryable_error() {
        assert!(is_retryable_error(&TransferError::Channel(ChannelError::Timeout(
            "read".into()
        ))));
        assert!(!is_retryable_error(&TransferError::Channel(
            ChannelError::PermissionDenied("/root".into())
        )));
        assert!(!is_retryable_error(&TransferError::Cancelled));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let config = RetryConfig::new(2).with_backoff(1, 1.0, 1);
        let control = TransferControl::new();
        let calls = AtomicUsize::new(0);

        let result = run_with_retry("item", &config, &control, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TransferError::Channel(ChannelError::Timeout("x".into())))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let config = RetryConfig::new(3).with_backoff(1, 1.0, 1);
        let control = TransferControl::new();
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = run_with_retry("item", &config, &control, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransferError::Channel(ChannelError::NotFound("/x".into()))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let config = RetryConfig::new(5).with_backoff(60_000, 1.0, 60_000);
        let control = TransferControl::new();
        control.cancel();

        let result: Result<(), _> = run_with_retry("item", &config, &control, || async {
            Err(TransferError::Channel(ChannelError::Timeout("x".into())))
        })
        .await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
    }
}
