//! PostgreSQL session advisory locks

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use sha2::{Digest, Sha256};

use super::{LockError, LockGuard, LockHandle, LockManager, LockResult};
use crate::store::postgres::create_pool;

/// Locks held with `pg_advisory_lock` on a dedicated pooled connection.
///
/// A held lock pins its connection until release, so the lock pool must not
/// be the store's pool: a transform holding the lock still needs store
/// connections for its own work.
#[derive(Clone)]
pub struct PgAdvisoryLockManager {
    pool: Pool,
}

impl PgAdvisoryLockManager {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool of its own; `pool_size` bounds how many locks this
    /// process can hold at once
    pub fn connect(url: &str, pool_size: usize) -> LockResult<Self> {
        create_pool(url, pool_size)
            .map(Self::new)
            .map_err(LockError::Pool)
    }
}

/// Advisory lock key: the first eight bytes of SHA-256 of the name
pub fn advisory_key(resource: &str) -> i64 {
    let digest = Sha256::digest(resource.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[async_trait]
impl LockManager for PgAdvisoryLockManager {
    async fn acquire(&self, resource: &str) -> LockResult<LockHandle> {
        let client = self.pool.get().await.map_err(|e| LockError::Connection {
            resource: resource.to_string(),
            reason: e.to_string(),
        })?;
        let key = advisory_key(resource);

        tracing::debug!(resource, key, "Waiting for advisory lock");
        client
            .execute("SELECT pg_advisory_lock($1)", &[&key])
            .await
            .map_err(|e| LockError::Acquire {
                resource: resource.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(resource, key, "Advisory lock acquired");

        Ok(LockHandle::new(
            resource,
            Box::new(AdvisoryGuard {
                client: Some(client),
                key,
            }),
        ))
    }
}

struct AdvisoryGuard {
    client: Option<Object>,
    key: i64,
}

impl LockGuard for AdvisoryGuard {}

impl Drop for AdvisoryGuard {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        let key = self.key;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client
                        .execute("SELECT pg_advisory_unlock($1)", &[&key])
                        .await
                    {
                        tracing::warn!(key, error = %e, "Advisory unlock failed, discarding connection");
                        drop(Object::take(client));
                    }
                });
            }
            Err(_) => {
                // Session locks die with the connection
                drop(Object::take(client));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_bad_url() {
        assert!(matches!(
            PgAdvisoryLockManager::connect("postgresql://etl@localhost:notaport/warehouse", 2),
            Err(LockError::Pool(_))
        ));
    }

    #[test]
    fn test_advisory_key_is_stable() {
        assert_eq!(advisory_key("lock_sales"), advisory_key("lock_sales"));
        assert_ne!(advisory_key("lock_sales"), advisory_key("lock_orders"));
    }
}
