//! Per-table reader/writer locks.
//!
//! Consistent reads share a table's lock; a rebuild takes it exclusively.
//! Acquisition is bounded by a timeout and the guard is released on every
//! exit path, including errors, panics and cancellation of the future.
//! A table's entry is dropped from the registry once nothing holds it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::error::TableError;
use crate::observability;

/// Named reader/writer locks keyed by table id.
#[derive(Default)]
pub struct TableLockRegistry {
    locks: DashMap<i64, Arc<RwLock<()>>>,
}

impl TableLockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, table_id: i64) -> Arc<RwLock<()>> {
        self.locks.entry(table_id).or_default().clone()
    }

    /// Number of tables with a live lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Runs `f` while holding the table's lock in shared mode.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::LockUnavailable`] when the lock is not acquired
    /// within `timeout`, otherwise whatever `f` returns.
    pub async fn run_with_read_lock<T, F, Fut>(
        &self,
        table_id: i64,
        timeout: Duration,
        f: F,
    ) -> Result<T, TableError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TableError>>,
    {
        // Dropped in reverse order: guard, then lock, then the prune.
        let _prune = PruneOnDrop {
            registry: self,
            table_id,
        };
        let lock = self.lock_for(table_id);
        let Ok(_guard) = tokio::time::timeout(timeout, lock.read()).await else {
            return Err(lock_timeout(table_id, timeout, "read"));
        };
        f().await
    }

    /// Runs `f` while holding the table's lock exclusively.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::LockUnavailable`] when the lock is not acquired
    /// within `timeout`, otherwise whatever `f` returns.
    pub async fn run_with_exclusive_lock<T, F, Fut>(
        &self,
        table_id: i64,
        timeout: Duration,
        f: F,
    ) -> Result<T, TableError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TableError>>,
    {
        // Dropped in reverse order: guard, then lock, then the prune.
        let _prune = PruneOnDrop {
            registry: self,
            table_id,
        };
        let lock = self.lock_for(table_id);
        let Ok(_guard) = tokio::time::timeout(timeout, lock.write()).await else {
            return Err(lock_timeout(table_id, timeout, "write"));
        };
        f().await
    }
}

/// Removes the table's entry when the map holds the only reference left.
struct PruneOnDrop<'a> {
    registry: &'a TableLockRegistry,
    table_id: i64,
}

impl Drop for PruneOnDrop<'_> {
    fn drop(&mut self) {
        self.registry
            .locks
            .remove_if(&self.table_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn lock_timeout(table_id: i64, timeout: Duration, mode: &'static str) -> TableError {
    observability::record_read_lock_timeout();
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    tracing::warn!(table_id, timeout_ms, mode, "timed out waiting for table lock");
    TableError::LockUnavailable {
        table_id,
        timeout_ms,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn readers_share_the_lock() {
        let registry = Arc::new(TableLockRegistry::new());
        let inner = registry.clone();
        let value = registry
            .run_with_read_lock(1, SHORT, || async move {
                inner
                    .run_with_read_lock(1, SHORT, || async { Ok(7) })
                    .await
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn writer_blocks_readers_until_timeout() {
        let registry = Arc::new(TableLockRegistry::new());
        let inner = registry.clone();
        let err = registry
            .run_with_exclusive_lock(1, SHORT, || async move {
                inner.run_with_read_lock(1, SHORT, || async { Ok(()) }).await
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TableError::LockUnavailable {
                table_id: 1,
                timeout_ms: 20
            }
        ));
    }

    #[tokio::test]
    async fn tables_do_not_contend() {
        let registry = Arc::new(TableLockRegistry::new());
        let inner = registry.clone();
        registry
            .run_with_exclusive_lock(1, SHORT, || async move {
                inner.run_with_exclusive_lock(2, SHORT, || async { Ok(()) }).await
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lock_is_released_after_an_error() {
        let registry = TableLockRegistry::new();
        let calls = AtomicU32::new(0);
        let err = registry
            .run_with_exclusive_lock(3, SHORT, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TableError::Validation("bad".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::Validation(_)));

        registry
            .run_with_exclusive_lock(3, SHORT, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn entries_are_pruned_once_released() {
        let registry = Arc::new(TableLockRegistry::new());
        for table_id in 0..50 {
            registry
                .run_with_read_lock(table_id, SHORT, || async { Ok(()) })
                .await
                .unwrap();
        }
        registry
            .run_with_exclusive_lock(7, SHORT, || async {
                Err::<(), _>(TableError::Validation("bad".to_string()))
            })
            .await
            .unwrap_err();
        assert!(registry.is_empty());

        let inner = registry.clone();
        registry
            .run_with_exclusive_lock(1, SHORT, || async move {
                let err = inner
                    .run_with_read_lock(1, SHORT, || async { Ok(()) })
                    .await
                    .unwrap_err();
                assert!(matches!(err, TableError::LockUnavailable { .. }));
                assert_eq!(inner.len(), 1);
                Ok(())
            })
            .await
            .unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancelled_wait_is_pruned() {
        let registry = Arc::new(TableLockRegistry::new());
        let inner = registry.clone();
        registry
            .run_with_exclusive_lock(4, SHORT, || async move {
                let waiting = inner.run_with_read_lock(4, Duration::from_secs(60), || async { Ok(()) });
                let timed_out = tokio::time::timeout(SHORT, waiting).await;
                assert!(timed_out.is_err());
                Ok(())
            })
            .await
            .unwrap();
        assert!(registry.is_empty());
    }
}
