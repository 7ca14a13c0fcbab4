use serde::{Deserialize, Serialize};
use std::fmt;

/// How a single provider call failed. Retry and fallback branch on this,
/// never on the detail text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// The provider is rate limiting us; move on to the next model.
    QuotaExceeded,
    /// Network hiccup or provider-side 5xx; worth retrying the same model.
    Transient,
    /// The call did not finish within the collaborator's own deadline.
    Timeout,
    /// Malformed request, policy rejection and the like.
    NonRetryable,
}

impl ProviderErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QuotaExceeded => "provider quota exceeded",
            Self::Transient => "transient provider error",
            Self::Timeout => "provider timeout",
            Self::NonRetryable => "non-retryable provider error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub detail: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn quota_exceeded(detail: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::QuotaExceeded, detail)
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, detail)
    }

    pub fn non_retryable(detail: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NonRetryable, detail)
    }
}

/// Terminal reason a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    #[error("unknown character: {name}")]
    UnknownCharacter { name: String },

    #[error("quota exhausted, retry after {retry_after_secs}s")]
    QuotaExhausted { retry_after_secs: u64 },

    #[error("all models exhausted: {last_error}")]
    AllModelsExhausted { last_error: String },

    #[error("storage error: {detail}")]
    Storage { detail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// A state file exists but cannot be understood. Never treated as empty:
    /// resetting quota state could overrun the provider's real limits.
    #[error("state file {path} is corrupt: {detail}")]
    Corruption { path: String, detail: String },

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("job {job_id} has no versions")]
    UnknownJob { job_id: String },

    #[error("job {job_id} has no version {index} (latest is {latest})")]
    VersionOutOfRange {
        job_id: String,
        index: u32,
        latest: u32,
    },
}
