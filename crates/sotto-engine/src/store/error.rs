//! Store error type.

use thiserror::Error;

/// Errors raised by the message store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A batch commit failed; nothing in the batch was applied.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// A persisted value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying storage access failed.
    #[error("storage i/o error: {0}")]
    Io(String),
}

impl StoreError {
    /// True if retrying the same operation may succeed.
    ///
    /// Commit failures are the only transient case: the batch was rejected
    /// atomically and can be rebuilt and retried. Serialization failures
    /// indicate corrupt rows and never heal on their own.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::CommitFailed(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_failures_are_transient() {
        assert!(StoreError::CommitFailed("disk full".to_string()).is_transient());
        assert!(!StoreError::Serialization("bad row".to_string()).is_transient());
    }
}
