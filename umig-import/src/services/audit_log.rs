//! Append-only audit trail access

use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::db::audit;
use crate::error::ImportResult;
use crate::models::{AuditEntry, NewAuditEntry};
use crate::utils::retry_on_lock;

#[derive(Debug, Clone)]
pub struct AuditLog {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl AuditLog {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self { pool, max_lock_wait_ms }
    }

    /// Write one entry outside any other transaction
    pub async fn record(&self, entry: NewAuditEntry) -> ImportResult<i64> {
        let audit_id = retry_on_lock("audit.record", self.max_lock_wait_ms, || async {
            audit::append(&self.pool, &entry).await
        })
        .await?;

        tracing::debug!(
            batch_id = %entry.batch_id,
            kind = %entry.kind,
            actor = %entry.actor,
            "Audit: {}",
            entry.summary
        );
        Ok(audit_id)
    }

    /// Write several entries in one transaction
    pub async fn record_many(&self, entries: &[NewAuditEntry]) -> ImportResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        retry_on_lock("audit.record_many", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
            for entry in entries {
                audit::append(&mut *tx, entry).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Write one entry as part of the caller's transaction
    pub async fn record_in(&self, conn: &mut SqliteConnection, entry: &NewAuditEntry) -> ImportResult<i64> {
        audit::append(conn, entry).await
    }

    /// Entries of a batch ordered by timestamp
    pub async fn trail(&self, batch_id: Uuid) -> ImportResult<Vec<AuditEntry>> {
        audit::list_for_batch(&self.pool, batch_id).await
    }
}
