//! Lock manager for a single process

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{LockGuard, LockHandle, LockManager, LockResult};

impl LockGuard for OwnedMutexGuard<()> {}

/// One async mutex per resource name
#[derive(Debug, Default, Clone)]
pub struct InProcessLockManager {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl InProcessLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, resource: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(resource.to_lowercase())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}

#[async_trait]
impl LockManager for InProcessLockManager {
    async fn acquire(&self, resource: &str) -> LockResult<LockHandle> {
        let mutex = self.mutex_for(resource);
        tracing::debug!(resource, "Waiting for lock");
        let guard = mutex.lock_owned().await;
        tracing::debug!(resource, "Lock acquired");
        Ok(LockHandle::new(resource, Box::new(guard)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_resource_is_exclusive() {
        let manager = InProcessLockManager::new();
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let holders = Arc::clone(&holders);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _handle = manager.acquire("lock_sales").await.unwrap();
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_resources_do_not_block() {
        let manager = InProcessLockManager::new();
        let _a = manager.acquire("lock_sales").await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), manager.acquire("lock_orders")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let manager = InProcessLockManager::new();
        let first = manager.acquire("LOCK_SALES").await.unwrap();
        assert_eq!(first.resource(), "LOCK_SALES");
        drop(first);
        let again = tokio::time::timeout(Duration::from_secs(1), manager.acquire("lock_sales")).await;
        assert!(again.is_ok());
    }
}
