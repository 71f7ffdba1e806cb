/*!
 * Error Types
 * Centralized error handling with thiserror and serde support
 */

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the blocking lock primitives
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum SyncError {
    /// An exit was attempted while the lock was not held in the matching
    /// mode. For [`SpinRwLock`](crate::sync::SpinRwLock) the state word may
    /// be inconsistent afterwards; callers must treat this as a programming
    /// bug, not a recoverable condition.
    #[error("lock released while not held in the requested mode")]
    InvalidRelease,

    /// A `try_enter_*`/`enter_*` call was given a `taken` flag that was
    /// already true on entry. Distinct from `InvalidArgument` only in
    /// message.
    #[error("lock flag already set on entry: {0}")]
    AlreadyHeld(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Completion errors delivered through an async lock receipt
#[derive(Error, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum AsyncLockError {
    /// The request was canceled before a grant could land.
    #[error("lock request canceled before grant")]
    Canceled,

    /// The lock was torn down while the request was still pending.
    #[error("lock disposed while request was pending")]
    Disposed,
}

/// Cache errors
/// Note: `Build` carries an arbitrary caller error and does not support
/// Serialize
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The build closure failed. The same error value is re-raised to every
    /// waiter for the entry until the key is explicitly removed.
    #[error("cached value build failed: {0}")]
    Build(Arc<dyn std::error::Error + Send + Sync>),
}

/// Stored for waiters when a build closure panics instead of returning
#[derive(Error, Debug)]
#[error("cached value build panicked")]
pub struct BuildPanicked;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::AlreadyHeld("try_enter_read".into());
        assert!(err.to_string().contains("already set"));
        assert_eq!(
            SyncError::InvalidRelease.to_string(),
            "lock released while not held in the requested mode"
        );
    }

    #[test]
    fn test_cache_error_preserves_source_text() {
        let source: Arc<dyn std::error::Error + Send + Sync> =
            Arc::new(std::io::Error::new(std::io::ErrorKind::Other, "backend down"));
        let err = CacheError::Build(source);
        assert!(err.to_string().contains("backend down"));
    }

    #[test]
    fn test_async_lock_error_eq() {
        assert_eq!(AsyncLockError::Canceled, AsyncLockError::Canceled);
        assert_ne!(AsyncLockError::Canceled, AsyncLockError::Disposed);
    }
}
