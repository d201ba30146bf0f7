use thiserror::Error;

use crate::database::StoreError;

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<StoreError> for AuditError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Timeout(elapsed) => {
                Self::StoreUnavailable(format!("store call timed out after {:?}", elapsed))
            }
            other => Self::Store(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    /// Entry content could not be canonicalized; nothing was logged.
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Write conflict on chain tail after {attempts} attempts")]
    WriteConflict { attempts: u32 },

    #[error("Audit store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Integrity violation: {broken_links} broken link(s) across {total_checked} entries")]
    IntegrityViolation {
        broken_links: usize,
        total_checked: u64,
    },

    #[error("Audit store error: {0}")]
    Store(String),

    #[error("Fallback buffer error: {0}")]
    Fallback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Append task interrupted: {0}")]
    Interrupted(String),
}

impl AuditError {
    /// Outage-class errors are the ones the fallback buffer absorbs.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn fallback(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Fallback(format!("{}: {}", context, err))
    }
}

pub type AuditResult<T> = Result<T, AuditError>;
