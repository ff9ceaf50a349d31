//! Transfer error types

use std::io;

use thiserror::Error;

/// Failure of a single channel operation.
///
/// The engine treats these as item-scoped, except for disconnects which abort
/// the remainder of the job.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Channel disconnected: {0}")]
    Disconnected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Channel error: {0}")]
    Other(String),
}

impl ChannelError {
    /// Map an I/O error raised while operating on `path`.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ChannelError::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => ChannelError::PermissionDenied(path.to_string()),
            io::ErrorKind::AlreadyExists => ChannelError::AlreadyExists(path.to_string()),
            io::ErrorKind::TimedOut => ChannelError::Timeout(path.to_string()),
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => {
                ChannelError::Disconnected(format!("{}: {}", path, err))
            }
            _ => ChannelError::Io(err),
        }
    }

    /// The underlying session is gone; no further item can succeed.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ChannelError::Disconnected(_))
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelError::Io(_) | ChannelError::Timeout(_))
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    #[error("Destination already exists: {0}")]
    Conflict(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transfer aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Config error: {0}")]
    Config(String),
}

impl TransferError {
    /// Errors that end the whole job rather than a single item.
    pub fn is_structural(&self) -> bool {
        match self {
            TransferError::InvalidRequest(_)
            | TransferError::ChannelUnavailable(_)
            | TransferError::DuplicateJob(_)
            | TransferError::Aborted(_) => true,
            TransferError::Channel(e) => e.is_disconnect(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

// Serialized as its display string for IPC consumers
impl serde::Serialize for TransferError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_maps_kinds() {
        let err = ChannelError::from_io(io::Error::from(io::ErrorKind::NotFound), "/a");
        assert!(matches!(err, ChannelError::NotFound(ref p) if p == "/a"));

        let err = ChannelError::from_io(io::Error::from(io::ErrorKind::BrokenPipe), "/a");
        assert!(err.is_disconnect());

        let err = ChannelError::from_io(io::Error::other("boom"), "/a");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_structural_classification() {
        assert!(TransferError::ChannelUnavailable("x".into()).is_structural());
        assert!(TransferError::Channel(ChannelError::Disconnected("x".into())).is_structural());
        assert!(!TransferError::Channel(ChannelError::NotFound("x".into())).is_structural());
        assert!(!TransferError::Cancelled.is_structural());
    }

    #[test]
    fn test_serializes_as_message() {
        let json = serde_json::to_string(&TransferError::JobNotFound("j1".into())).unwrap();
        assert_eq!(json, "\"Job not found: j1\"");
    }
}
