use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::OwnedMutexGuard;

use crate::error::StoreError;

/// Per-run advisory locks, simulating the row-level lock a transactional
/// store would hold on the `run_id` principal key. One process, one lock
/// table; cross-replica consensus is explicitly out of scope.
#[derive(Default)]
pub struct RunLeaseTable {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RunLeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, run_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire the lease for `run_id`, waiting up to `timeout`. Fails with
    /// `LeaseBusy` on contention past the timeout.
    pub async fn acquire(&self, run_id: &str, timeout: Duration) -> Result<RunLease, StoreError> {
        let lock = self.lock_for(run_id);
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(RunLease(guard)),
            Err(_) => Err(StoreError::LeaseBusy {
                run_id: run_id.to_string(),
            }),
        }
    }
}

/// RAII handle for a held run lease. Concrete (not generic) so that `Store`,
/// which returns this from `acquire_run_lease`, stays object-safe.
pub struct RunLease(#[allow(dead_code)] OwnedMutexGuard<()>);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_times_out_while_first_holds_lease() {
        let table = RunLeaseTable::new();
        let guard = table.acquire("run_1", Duration::from_millis(50)).await.unwrap();
        let err = table
            .acquire("run_1", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseBusy { .. }));
        drop(guard);
        assert!(table.acquire("run_1", Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn different_runs_do_not_contend() {
        let table = RunLeaseTable::new();
        let _g1 = table.acquire("run_a", Duration::from_millis(50)).await.unwrap();
        assert!(table.acquire("run_b", Duration::from_millis(50)).await.is_ok());
    }
}
