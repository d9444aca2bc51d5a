//! Promotion Engine
//!
//! Moves validated records into the master tables. One chunk is one
//! `BEGIN IMMEDIATE` transaction; each record runs inside its own savepoint so
//! a uniqueness or reference conflict rejects that record only. Any other
//! failure aborts the whole chunk and nothing of it is committed. A chunk that
//! hits a lock held by another batch is retried as a whole.
//!
//! Rollback removes every master row carrying the batch id (children before
//! parents), purges staging and marks the batch `ROLLED_BACK`, all in one
//! transaction.

use chrono::Utc;
use serde_json::json;
use sqlx::{Connection, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::lease::LeaseManager;
use crate::db::schema::MASTER_DELETE_ORDER;
use crate::db::{audit, batches, master, staging};
use crate::error::{ImportError, ImportResult};
use crate::models::{
    AuditEventKind, BatchStatus, NewAuditEntry, PromotionResult, RecordError, RollbackRecord,
    RollbackResult, ValidatedRecord,
};
use crate::utils::{begin_monitored, retry_on_lock};

pub struct PromotionEngine {
    pool: SqlitePool,
    leases: Arc<LeaseManager>,
    max_lock_wait_ms: u64,
}

impl PromotionEngine {
    pub fn new(pool: SqlitePool, leases: Arc<LeaseManager>, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            leases,
            max_lock_wait_ms,
        }
    }

    /// Commit one chunk of validated records under the batch lease
    ///
    /// Returns `Err` only when the chunk as a whole could not be committed;
    /// per-record conflicts are counted in the result.
    pub async fn promote(
        &self,
        batch_id: Uuid,
        source: &str,
        actor: &str,
        records: &[ValidatedRecord],
    ) -> ImportResult<PromotionResult> {
        if records.is_empty() {
            return Ok(PromotionResult::default());
        }
        if let Some(foreign) = records.iter().map(|v| v.staged()).find(|s| s.batch_id != batch_id) {
            return Err(ImportError::InvalidInput(format!(
                "staged record {} belongs to batch {}",
                foreign.staged_id, foreign.batch_id
            )));
        }

        let _lease = self.leases.acquire(batch_id, "chunk commit").await?;
        let result = retry_on_lock("promotion.commit_chunk", self.max_lock_wait_ms, || {
            self.commit_chunk(batch_id, source, actor, records)
        })
        .await?;

        tracing::debug!(
            batch_id = %batch_id,
            succeeded = result.succeeded,
            failed = result.failed,
            "Chunk promoted"
        );
        Ok(result)
    }

    async fn commit_chunk(
        &self,
        batch_id: Uuid,
        source: &str,
        actor: &str,
        records: &[ValidatedRecord],
    ) -> ImportResult<PromotionResult> {
        let mut result = PromotionResult::default();
        let mut tx = begin_monitored(&self.pool, "promotion_engine::promote").await?;

        for validated in records {
            let record = validated.record();
            let entity = record.entity_type();
            let staged = validated.staged();

            let mut savepoint = (&mut **tx.inner_mut()?).begin().await?;
            match master::insert_entity(&mut savepoint, batch_id, record).await {
                Ok(rows) => {
                    staging::mark_promoted(&mut savepoint, staged.staged_id).await?;
                    audit::append(
                        &mut *savepoint,
                        &NewAuditEntry::new(
                            batch_id,
                            AuditEventKind::RecordPromoted,
                            actor,
                            format!("Promoted {} '{}'", entity, record.natural_key()),
                        )
                        .with_detail(json!({
                            "staged_id": staged.staged_id,
                            "source": source,
                            "position": validated.position(),
                            "rows": rows,
                        })),
                    )
                    .await?;
                    savepoint.commit().await?;
                    result.succeeded += 1;
                }
                Err(ImportError::Conflict(message)) => {
                    savepoint.rollback().await?;
                    audit::append(
                        &mut **tx.inner_mut()?,
                        &NewAuditEntry::new(
                            batch_id,
                            AuditEventKind::RecordRejected,
                            actor,
                            format!("Rejected {} '{}': {}", entity, record.natural_key(), message),
                        )
                        .with_detail(json!({
                            "staged_id": staged.staged_id,
                            "source": source,
                            "position": validated.position(),
                            "code": "CONFLICT_ERROR",
                        })),
                    )
                    .await?;
                    tracing::debug!(batch_id = %batch_id, position = validated.position(), "Conflict: {}", message);
                    result.failed += 1;
                    result.errors.push(RecordError::conflict(
                        source,
                        validated.position().to_string(),
                        entity,
                        message,
                    ));
                }
                // Savepoint and transaction roll back on drop
                Err(other) => return Err(other),
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    /// Reverse everything a finished batch promoted and staged
    ///
    /// Repeating the call on a `ROLLED_BACK` batch deletes nothing and returns
    /// the stored action list with `already_rolled_back` set.
    pub async fn rollback(&self, batch_id: Uuid, reason: Option<&str>, actor: &str) -> ImportResult<RollbackResult> {
        let lease = self.leases.acquire(batch_id, "rollback").await?;
        let outcome = self.rollback_leased(batch_id, reason, actor).await;
        drop(lease);
        self.leases.forget(batch_id);
        outcome
    }

    async fn rollback_leased(&self, batch_id: Uuid, reason: Option<&str>, actor: &str) -> ImportResult<RollbackResult> {
        let batch = batches::load_batch(&self.pool, batch_id)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("batch {}", batch_id)))?;

        match batch.status {
            BatchStatus::RolledBack => {
                let previous = batch.rollback.ok_or_else(|| {
                    ImportError::storage(format!("batch {} is ROLLED_BACK without a rollback record", batch_id))
                })?;
                tracing::info!(batch_id = %batch_id, "Rollback repeated; nothing to do");
                return Ok(RollbackResult {
                    batch_id,
                    actions: previous.actions,
                    records_deleted: previous.records_deleted,
                    rolled_back_at: previous.rolled_back_at,
                    already_rolled_back: true,
                });
            }
            BatchStatus::InProgress => {
                return Err(ImportError::InvalidTransition {
                    batch_id,
                    from: batch.status,
                    to: BatchStatus::RolledBack,
                });
            }
            BatchStatus::Completed | BatchStatus::Failed => {}
        }

        let (record, purged) = retry_on_lock("promotion.rollback", self.max_lock_wait_ms, || {
            self.delete_batch_rows(batch_id, batch.status, reason, actor)
        })
        .await?;

        tracing::info!(
            batch_id = %batch_id,
            records_deleted = record.records_deleted,
            staged_purged = purged,
            actor,
            "Batch rolled back"
        );

        Ok(RollbackResult {
            batch_id,
            actions: record.actions,
            records_deleted: record.records_deleted,
            rolled_back_at: record.rolled_back_at,
            already_rolled_back: false,
        })
    }

    /// Delete master and staged rows and record the rollback in one transaction
    async fn delete_batch_rows(
        &self,
        batch_id: Uuid,
        previous: BatchStatus,
        reason: Option<&str>,
        actor: &str,
    ) -> ImportResult<(RollbackRecord, u64)> {
        let mut tx = begin_monitored(&self.pool, "promotion_engine::rollback").await?;
        let mut actions = Vec::new();
        let mut deleted = BTreeMap::new();
        let mut total = 0u64;

        for (table, _) in MASTER_DELETE_ORDER {
            let removed = master::delete_for_batch(&mut **tx.inner_mut()?, table, batch_id).await?;
            if removed > 0 {
                actions.push(format!("Deleted {} {}", removed, table));
                deleted.insert(table, removed);
                total += removed;
            }
        }

        let purged = staging::purge(&mut **tx.inner_mut()?, batch_id).await?;
        if purged > 0 {
            actions.push(format!("Purged {} staged records", purged));
        }
        actions.push(format!("Status changed from {} to {}", previous, BatchStatus::RolledBack));

        let record = RollbackRecord {
            actions,
            records_deleted: total,
            reason: reason.map(str::to_string),
            rolled_back_by: actor.to_string(),
            rolled_back_at: Utc::now(),
        };

        if !batches::record_rollback(&mut **tx.inner_mut()?, batch_id, previous, &record).await? {
            return Err(ImportError::InvalidTransition {
                batch_id,
                from: previous,
                to: BatchStatus::RolledBack,
            });
        }

        audit::append(
            &mut **tx.inner_mut()?,
            &NewAuditEntry::new(
                batch_id,
                AuditEventKind::RollbackExecuted,
                actor,
                format!("Deleted {} records.", total),
            )
            .with_detail(json!({
                "actions": record.actions,
                "deleted": deleted,
                "staged_purged": purged,
                "previous_status": previous,
                "reason": reason,
            })),
        )
        .await?;

        tx.commit().await?;
        Ok((record, purged))
    }
}
