//! OxideTerm transfer engine
//!
//! Bulk file operations (delete, download, upload, session-to-session copy)
//! orchestrated over per-session file channels, with per-item progress,
//! partial-failure accounting and cooperative cancellation.

pub mod config;
pub mod transfer;

pub use config::{ConfigError, TransferConfig};
pub use transfer::{
    FileChannel, JobHandle, ProgressSnapshot, TransferError, TransferJob, TransferManager,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// Honors `RUST_LOG`, defaults to `info`. Safe to call more than once; later
/// calls are ignored when a global subscriber is already installed.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
