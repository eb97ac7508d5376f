//! Destination-scoped serialization locks
//!
//! A transform run holds the lock named after its primary destination for its
//! whole duration. Waiting is unbounded. The lock is released when the
//! [`LockHandle`] is dropped, on success and failure alike.

pub mod memory;
#[cfg(feature = "postgres-backend")]
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InProcessLockManager;
#[cfg(feature = "postgres-backend")]
pub use postgres::PgAdvisoryLockManager;

/// Errors raised while acquiring a lock
#[derive(Error, Debug)]
pub enum LockError {
    /// No connection was available to hold the lock
    #[error("Cannot obtain a connection for lock '{resource}': {reason}")]
    Connection { resource: String, reason: String },

    /// The pool holding lock connections could not be built
    #[error("Cannot create the lock connection pool: {0}")]
    Pool(String),

    /// The lock request itself failed
    #[error("Failed to acquire lock '{resource}': {reason}")]
    Acquire { resource: String, reason: String },
}

/// Result type for lock operations
pub type LockResult<T> = Result<T, LockError>;

/// Something that releases a lock when dropped
pub trait LockGuard: Send {}

/// A held lock. Dropping it releases the lock.
pub struct LockHandle {
    resource: String,
    _guard: Box<dyn LockGuard>,
}

impl LockHandle {
    pub fn new(resource: impl Into<String>, guard: Box<dyn LockGuard>) -> Self {
        Self {
            resource: resource.into(),
            _guard: guard,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        tracing::debug!(resource = %self.resource, "Releasing lock");
    }
}

/// Exclusive named locks
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Block until the named lock is held
    async fn acquire(&self, resource: &str) -> LockResult<LockHandle>;
}
