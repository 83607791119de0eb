use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::store::StoreError;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    /// Network trouble; retrying later may succeed.
    Transient,
    /// The bytes on disk cannot be trusted.
    Integrity,
    /// Local failure the manager cannot repair before the next reconcile.
    Fatal,
    Cancelled,
}

/// Failure of a model acquisition operation.
///
/// `Clone` so that callers sharing one in-flight download all receive the
/// same outcome; io sources are held behind `Arc` for that reason.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("request to {url} failed: {message}")]
    Http {
        url: String,
        message: String,
        timed_out: bool,
    },
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("failed to move {from:?} to {to:?}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("model state could not be persisted: {0}")]
    Store(#[source] Arc<StoreError>),
    #[error("model components missing (primary ok: {primary_ok}, secondary ok: {secondary_ok})")]
    Incomplete { primary_ok: bool, secondary_ok: bool },
    #[error("asset is {actual} bytes, expected {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("not enough free space: need {required} bytes, {available} available")]
    InsufficientStorage { required: u64, available: u64 },
    #[error("download worker stopped before reporting a result")]
    Interrupted,
    #[error("download cancelled")]
    Cancelled,
}

impl ModelError {
    pub fn kind(&self) -> ModelErrorKind {
        match self {
            ModelError::Http { .. } => ModelErrorKind::Transient,
            // missing or forbidden objects stay that way until the config changes
            ModelError::Status { status, .. } => match status {
                408 | 429 | 500..=599 => ModelErrorKind::Transient,
                _ => ModelErrorKind::Fatal,
            },
            ModelError::Incomplete { .. }
            | ModelError::SizeMismatch { .. }
            | ModelError::Truncated { .. }
            | ModelError::ChecksumMismatch { .. } => ModelErrorKind::Integrity,
            ModelError::Io { .. }
            | ModelError::Rename { .. }
            | ModelError::Store(_)
            | ModelError::InsufficientStorage { .. }
            | ModelError::Interrupted => ModelErrorKind::Fatal,
            ModelError::Cancelled => ModelErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ModelErrorKind::Transient
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        ModelError::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }
}

impl From<StoreError> for ModelError {
    fn from(error: StoreError) -> Self {
        ModelError::Store(Arc::new(error))
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(error: reqwest::Error) -> Self {
        ModelError::Http {
            url: error
                .url()
                .map(|url| url.to_string())
                .unwrap_or_default(),
            message: error.to_string(),
            timed_out: error.is_timeout(),
        }
    }
}
