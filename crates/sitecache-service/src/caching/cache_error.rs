use std::any::Any;

use bytes::Bytes;
use thiserror::Error;

use crate::storage::StorageError;

/// An error returned by the cache engine.
///
/// The error is [`Clone`], since the outcome of a single recreation is handed to every caller
/// that was coalesced onto it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The recreation found nothing to cache.
    ///
    /// This is expected for unknown pages and is never logged as an error.
    #[error("not found")]
    NotFound,
    /// The key is not usable as a cache key.
    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),
    /// The recreation callback returned an error.
    ///
    /// The attached string contains the rendered error.
    #[error("recreation failed: {0}")]
    RecreationFailed(String),
    /// The recreation callback panicked.
    ///
    /// The attached string contains the panic message, if it had one.
    #[error("recreation panicked: {0}")]
    Panicked(String),
    /// The storage engine failed to read or write.
    #[error("storage error: {0}")]
    Storage(String),
    /// The engine was shut down before the recreation could run.
    #[error("cache engine is shut down")]
    Shutdown,
}

impl From<StorageError> for CacheError {
    #[track_caller]
    fn from(err: StorageError) -> Self {
        let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "Cache storage failure");
        Self::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        Self::RecreationFailed(format!("{err:#}"))
    }
}

impl CacheError {
    /// Converts the payload of a caught panic.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        Self::Panicked(message)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Short name used to tag metrics.
    pub(crate) fn metric_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidKey(_) => "invalid_key",
            Self::RecreationFailed(_) => "failed",
            Self::Panicked(_) => "panicked",
            Self::Storage(_) => "storage",
            Self::Shutdown => "shutdown",
        }
    }
}

/// The result of a cache lookup or recreation.
pub type CacheResult<T = Bytes> = Result<T, CacheError>;
