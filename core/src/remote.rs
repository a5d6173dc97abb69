use async_trait::async_trait;
use thiserror::Error;

use crate::record::SyncRecord;

/// Failure of a remote call, split by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Network, timeout, or server-side hiccup. Worth retrying.
    #[error("{0}")]
    Transient(String),
    /// The backend rejected the payload (validation, permission).
    #[error("{0}")]
    Permanent(String),
}

impl SyncError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Remote table holding one record per authenticated identity.
///
/// The identity is implicit: adapters carry their own credentials. `upsert`
/// must be idempotent (insert if absent, else replace the row with the same id).
#[async_trait]
pub trait RemoteStore<R: SyncRecord>: Send + Sync {
    /// Fetch the caller's record. `Ok(None)` means the caller has no row yet.
    async fn fetch_one(&self) -> Result<Option<R>, SyncError>;

    async fn upsert(&self, record: &R) -> Result<(), SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_is_message() {
        let err = SyncError::transient("connection refused");
        assert_eq!(err.to_string(), "connection refused");
        assert!(err.is_transient());
        assert!(!SyncError::permanent("bad payload").is_transient());
    }
}
