//! Per-batch leases
//!
//! A lease is an exclusive, time-bounded claim on one batch id. Chunk
//! commits, statistics folds, status changes, rollback and delete each hold
//! one for the duration of that single operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{ImportError, ImportResult};

/// Holds leased batches' locks; entries are created on first use
#[derive(Debug)]
pub struct LeaseManager {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

/// Proof of exclusive access to one batch; released on drop
#[derive(Debug)]
pub struct BatchLease {
    batch_id: Uuid,
    purpose: &'static str,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl BatchLease {
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Fail unless this lease covers `batch_id`
    pub fn ensure_covers(&self, batch_id: Uuid) -> ImportResult<()> {
        if self.batch_id == batch_id {
            Ok(())
        } else {
            Err(ImportError::InvalidInput(format!(
                "lease for batch {} used on batch {}",
                self.batch_id, batch_id
            )))
        }
    }
}

impl Drop for BatchLease {
    fn drop(&mut self) {
        let held_ms = self.acquired_at.elapsed().as_millis();
        if held_ms > 2000 {
            tracing::warn!(
                batch_id = %self.batch_id,
                purpose = self.purpose,
                held_ms,
                "Batch lease held for extended period"
            );
        } else {
            tracing::trace!(batch_id = %self.batch_id, purpose = self.purpose, held_ms, "Batch lease released");
        }
    }
}

impl LeaseManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock_for(&self, batch_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(batch_id).or_default().clone()
    }

    /// Acquire the lease, waiting at most the configured timeout
    pub async fn acquire(&self, batch_id: Uuid, purpose: &'static str) -> ImportResult<BatchLease> {
        self.acquire_within(batch_id, purpose, self.timeout).await
    }

    pub async fn acquire_within(
        &self,
        batch_id: Uuid,
        purpose: &'static str,
        timeout: Duration,
    ) -> ImportResult<BatchLease> {
        let lock = self.lock_for(batch_id);
        let started = Instant::now();

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                let wait_ms = started.elapsed().as_millis();
                if wait_ms > 1000 {
                    tracing::info!(batch_id = %batch_id, purpose, wait_ms, "Slow batch lease acquisition");
                }
                Ok(BatchLease {
                    batch_id,
                    purpose,
                    acquired_at: Instant::now(),
                    _guard: guard,
                })
            }
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(batch_id = %batch_id, purpose, waited_ms, "Batch lease acquisition timed out");
                Err(ImportError::LockTimeout { batch_id, waited_ms })
            }
        }
    }

    /// Drop the lock entry of a batch nobody holds or waits for
    pub fn forget(&self, batch_id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(&batch_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&batch_id);
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
