use thiserror::Error;

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error taxonomy for the tenant data-protection core.
///
/// `PermissionDenied` and `TenantMismatch` always fail closed and are never
/// retried. `KeyUnavailable` and `DeletionFailed` are transient and retried a
/// bounded number of times before being surfaced. `IntegrityViolation` marks
/// tampered or corrupted material and must never be retried.
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("permission denied: {msg}")]
    PermissionDenied { msg: String },

    #[error("tenant mismatch: caller tenant '{caller_tenant}' cannot access data owned by tenant '{record_tenant}'")]
    TenantMismatch {
        caller_tenant: String,
        record_tenant: String,
    },

    #[error("key service unavailable: {msg}")]
    KeyUnavailable {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("integrity violation: {msg}")]
    IntegrityViolation { msg: String },

    #[error("retention policy error: {msg}")]
    RetentionPolicy { msg: String },

    #[error("deletion failed: {msg}")]
    DeletionFailed {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("could not find resource")]
    NotFound {
        msg: String,
        lookup_id: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("invalid request")]
    InvalidRequest {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("repository error")]
    Repository {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("serde json error")]
    SerdeSerializationError {
        #[from]
        #[source]
        source: serde_json::Error,
    },

    #[error("io error")]
    IoError {
        #[from]
        #[source]
        source: std::io::Error,
    },

    #[error("tokio channel error")]
    TokioChannelError {
        #[source]
        source: DynError,
    },

    #[error("unknown error")]
    Unknown(
        #[from]
        anyhow::Error,
    ),
}

impl CommonError {
    /// Whether a bounded retry with backoff is appropriate for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommonError::KeyUnavailable { .. }
                | CommonError::DeletionFailed { .. }
                | CommonError::Repository { .. }
        )
    }

    pub fn key_unavailable(msg: impl Into<String>) -> Self {
        CommonError::KeyUnavailable {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        CommonError::IntegrityViolation { msg: msg.into() }
    }
}

impl<T: Send + Sync + 'static + std::fmt::Debug> From<tokio::sync::broadcast::error::SendError<T>>
    for CommonError
{
    fn from(e: tokio::sync::broadcast::error::SendError<T>) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}
