//! Monitored transactions
//!
//! Chunk commits and rollbacks hold a write transaction; long holds starve the
//! other batches, so acquisition wait and hold time are logged.
//!
//! Transactions open with `BEGIN IMMEDIATE`: the write lock is taken up front
//! and a busy database is waited out by the connection's busy timeout instead
//! of failing later when a read turns into a write.

use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Instant;

use crate::error::{ImportError, ImportResult};

/// Transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction<'c> {
    tx: Option<Transaction<'c, Sqlite>>,
    caller: &'static str,
    acquired_at: Instant,
}

fn consumed() -> ImportError {
    ImportError::storage("transaction already consumed")
}

impl<'c> MonitoredTransaction<'c> {
    /// Commit and log hold time
    pub async fn commit(mut self) -> ImportResult<()> {
        let tx = self.tx.take().ok_or_else(consumed)?;
        tx.commit().await?;
        self.log_release("commit");
        Ok(())
    }

    /// Roll back and log hold time
    pub async fn rollback(mut self) -> ImportResult<()> {
        let tx = self.tx.take().ok_or_else(consumed)?;
        tx.rollback().await?;
        self.log_release("rollback");
        Ok(())
    }

    pub fn inner_mut(&mut self) -> ImportResult<&mut Transaction<'c, Sqlite>> {
        self.tx.as_mut().ok_or_else(consumed)
    }

    fn log_release(&self, how: &'static str) {
        let held_ms = self.acquired_at.elapsed().as_millis();
        if held_ms > 2000 {
            tracing::warn!(
                caller = self.caller,
                held_ms,
                how,
                "LONG TRANSACTION - write lock held for extended period"
            );
        } else {
            tracing::debug!(caller = self.caller, held_ms, how, "Transaction released");
        }
    }
}

impl<'c> Drop for MonitoredTransaction<'c> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            // sqlx rolls back an unfinished transaction on drop
            self.log_release("drop");
        }
    }
}

/// Begin a write transaction, logging how long the lock took to obtain
pub async fn begin_monitored(
    pool: &SqlitePool,
    caller: &'static str,
) -> ImportResult<MonitoredTransaction<'static>> {
    let start = Instant::now();
    let tx = pool.begin_with("BEGIN IMMEDIATE").await?;
    let wait_ms = start.elapsed().as_millis();

    if wait_ms > 1000 {
        tracing::warn!(
            caller,
            wait_ms,
            "SLOW WRITE LOCK ACQUISITION - another batch holds the database"
        );
    } else {
        tracing::debug!(caller, wait_ms, "Write transaction started");
    }

    Ok(MonitoredTransaction {
        tx: Some(tx),
        caller,
        acquired_at: Instant::now(),
    })
}
