//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// `StorageError` is the umbrella type surfaced to callers. Backend internals
/// (a 404 on an existence check, single retry attempts) never show up here;
/// only failures that survived the retry policy do.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Inconsistent or incomplete configuration, e.g. an access key without a
    /// secret key.
    #[error("Storage configuration error: {0}")]
    Config(String),

    /// A URI did not have the shape the addressing style expects.
    #[error("Addressing error: {0}")]
    Addressing(String),

    /// The remote service answered successfully but broke the response contract.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Network or HTTP failure that is fatal after retries.
    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    Transport {
        operation: String,
        attempts: u32,
        message: String,
    },

    /// The source body of a streamed copy was truncated mid-transfer.
    #[error("Copy interrupted: {0}")]
    CopyInterrupted(String),

    /// One or more segments of a chunked upload failed.
    #[error("Upload {upload_id} failed for {} segment(s): {}", failures.len(), failures.join("; "))]
    SegmentUpload {
        upload_id: String,
        failures: Vec<String>,
    },

    /// Artifact extraction did not produce the data to store.
    #[error("Artifact extraction failed: {0}")]
    Extraction(String),

    /// Local storage failed after remote storage had already failed.
    #[error("{local} (remote storage had failed first: {suppressed})")]
    LocalFallbackFailed {
        #[source]
        local: Box<StorageError>,
        suppressed: Box<StorageError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn addressing(msg: impl Into<String>) -> Self {
        Self::Addressing(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn transport(operation: impl Into<String>, attempts: u32, msg: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            attempts,
            message: msg.into(),
        }
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }

    /// Chain a remote failure onto the local failure that followed it.
    pub fn with_suppressed(local: StorageError, remote: StorageError) -> Self {
        Self::LocalFallbackFailed {
            local: Box::new(local),
            suppressed: Box::new(remote),
        }
    }

    /// The remote failure recorded on a failed local fallback, if any.
    pub fn suppressed(&self) -> Option<&StorageError> {
        match self {
            StorageError::LocalFallbackFailed { suppressed, .. } => Some(suppressed),
            _ => None,
        }
    }

    /// Check if error is worth another attempt at the transport level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transport { .. } | StorageError::Io(_))
    }

    /// True for failures caused by the job's configuration rather than the
    /// remote service.
    pub fn is_config_error(&self) -> bool {
        matches!(self, StorageError::Config(_))
    }
}

impl From<mpf_models::ModelError> for StorageError {
    fn from(e: mpf_models::ModelError) -> Self {
        Self::Config(e.to_string())
    }
}
