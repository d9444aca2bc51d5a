//! Batch Tracker
//!
//! Authoritative record of import batches. Status changes follow the
//! processing graph (`IN_PROGRESS -> COMPLETED | FAILED -> ROLLED_BACK`) and
//! are applied compare-and-set, so a lost race leaves the batch untouched and
//! reports `InvalidTransition`.
//!
//! Every mutating operation requires the batch lease. Callers that already
//! hold it pass it in; administrative entry points acquire it themselves.

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use super::audit_log::AuditLog;
use super::lease::{BatchLease, LeaseManager};
use crate::db::{batches, staging};
use crate::error::{ImportError, ImportResult};
use crate::models::{
    AuditEventKind, BatchFilter, BatchStatistics, BatchStatus, ImportBatch, ImportKind,
    ImportStatistics, NewAuditEntry, RecordError,
};
use crate::utils::retry_on_lock;

/// Reason recorded on batches found `IN_PROGRESS` at startup
pub const INTERRUPTED_REASON: &str = "interrupted by service restart";

pub struct BatchTracker {
    pool: SqlitePool,
    leases: Arc<LeaseManager>,
    audit: AuditLog,
    max_lock_wait_ms: u64,
}

fn audit_kind_for(status: BatchStatus) -> AuditEventKind {
    match status {
        BatchStatus::Completed => AuditEventKind::BatchCompleted,
        BatchStatus::RolledBack => AuditEventKind::RollbackExecuted,
        BatchStatus::Failed | BatchStatus::InProgress => AuditEventKind::BatchFailed,
    }
}

impl BatchTracker {
    pub fn new(pool: SqlitePool, leases: Arc<LeaseManager>, audit: AuditLog, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            leases,
            audit,
            max_lock_wait_ms,
        }
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    /// Create an `IN_PROGRESS` batch and write BATCH_STARTED
    pub async fn create_batch(&self, kind: ImportKind, source: &str, actor: &str) -> ImportResult<ImportBatch> {
        let batch = ImportBatch::new(kind, source.to_string(), actor.to_string());

        retry_on_lock("batches.create", self.max_lock_wait_ms, || async {
            batches::insert_batch(&self.pool, &batch).await
        })
        .await?;

        self.audit
            .record(
                NewAuditEntry::new(
                    batch.batch_id,
                    AuditEventKind::BatchStarted,
                    actor,
                    format!("{} import of '{}' started", kind, source),
                )
                .with_detail(json!({ "kind": kind, "source": source })),
            )
            .await?;

        tracing::info!(batch_id = %batch.batch_id, kind = %kind, source, actor, "Import batch created");
        Ok(batch)
    }

    pub async fn get(&self, batch_id: Uuid) -> ImportResult<ImportBatch> {
        batches::load_batch(&self.pool, batch_id)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("batch {}", batch_id)))
    }

    /// Newest first
    pub async fn list(&self, filter: &BatchFilter, limit: u32) -> ImportResult<Vec<ImportBatch>> {
        batches::list_batches(&self.pool, filter, limit).await
    }

    pub async fn statistics(&self) -> ImportResult<ImportStatistics> {
        batches::aggregate_statistics(&self.pool).await
    }

    /// Overwrite the counters with folded totals (`IN_PROGRESS` only)
    pub async fn update_statistics(
        &self,
        lease: &BatchLease,
        batch_id: Uuid,
        statistics: &BatchStatistics,
        errors: &[RecordError],
    ) -> ImportResult<()> {
        lease.ensure_covers(batch_id)?;
        if !statistics.is_consistent() {
            return Err(ImportError::InvalidInput(format!(
                "inconsistent statistics: {} succeeded + {} failed != {} processed",
                statistics.succeeded, statistics.failed, statistics.processed
            )));
        }

        let batch = self.get(batch_id).await?;
        if batch.status != BatchStatus::InProgress {
            return Err(ImportError::InvalidInput(format!(
                "statistics of batch {} are frozen (status {})",
                batch_id, batch.status
            )));
        }

        retry_on_lock("batches.update_statistics", self.max_lock_wait_ms, || async {
            batches::update_statistics(&self.pool, batch_id, statistics, errors).await
        })
        .await
    }

    /// Move along the processing graph and write the matching audit entry
    pub async fn transition(
        &self,
        lease: &BatchLease,
        batch_id: Uuid,
        status: BatchStatus,
        reason: Option<&str>,
        actor: &str,
    ) -> ImportResult<ImportBatch> {
        lease.ensure_covers(batch_id)?;
        if status == BatchStatus::RolledBack {
            // Reached only through rollback, which also deletes master data
            return Err(ImportError::InvalidTransition {
                batch_id,
                from: self.get(batch_id).await?.status,
                to: status,
            });
        }

        let batch = self.get(batch_id).await?;
        if !batch.status.can_transition_to(status) {
            return Err(ImportError::InvalidTransition {
                batch_id,
                from: batch.status,
                to: status,
            });
        }

        let ended_at = Some(Utc::now());
        let applied = retry_on_lock("batches.transition", self.max_lock_wait_ms, || async {
            batches::update_status(&self.pool, batch_id, batch.status, status, ended_at, reason).await
        })
        .await?;
        if !applied {
            let current = self.get(batch_id).await?;
            return Err(ImportError::InvalidTransition {
                batch_id,
                from: current.status,
                to: status,
            });
        }

        let summary = match reason {
            Some(reason) => format!("Batch {}: {}", status, reason),
            None => format!("Batch {}", status),
        };
        self.audit
            .record(
                NewAuditEntry::new(batch_id, audit_kind_for(status), actor, summary).with_detail(json!({
                    "from": batch.status,
                    "to": status,
                    "reason": reason,
                })),
            )
            .await?;

        tracing::info!(batch_id = %batch_id, from = %batch.status, to = %status, "Batch status changed");
        self.get(batch_id).await
    }

    /// Administrative status change
    ///
    /// Allowed edges are the processing graph plus `COMPLETED <-> FAILED`.
    /// `ROLLED_BACK` can neither be left nor entered here. Same-status is a
    /// no-op. Supplied statistics must be self-consistent and replace the
    /// stored counters.
    pub async fn override_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        statistics: Option<BatchStatistics>,
        actor: &str,
        reason: Option<&str>,
    ) -> ImportResult<ImportBatch> {
        let lease = self.leases.acquire(batch_id, "status override").await?;
        let outcome = self.override_leased(batch_id, status, statistics, actor, reason).await;
        drop(lease);
        self.leases.forget(batch_id);
        outcome
    }

    async fn override_leased(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        statistics: Option<BatchStatistics>,
        actor: &str,
        reason: Option<&str>,
    ) -> ImportResult<ImportBatch> {
        let batch = self.get(batch_id).await?;

        if !batch.status.can_override_to(status) {
            return Err(ImportError::InvalidTransition {
                batch_id,
                from: batch.status,
                to: status,
            });
        }
        if batch.status == status && statistics.is_none() {
            return Ok(batch);
        }
        if let Some(stats) = &statistics {
            if !stats.is_consistent() {
                return Err(ImportError::Validation(format!(
                    "inconsistent statistics: {} succeeded + {} failed != {} processed",
                    stats.succeeded, stats.failed, stats.processed
                )));
            }
        }

        let ended_at = (status.is_finished() && batch.ended_at.is_none()).then(Utc::now);
        let applied = retry_on_lock("batches.override_status", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
            if let Some(stats) = &statistics {
                batches::update_statistics(&mut *tx, batch_id, stats, &batch.errors).await?;
            }
            let applied = batches::update_status(&mut *tx, batch_id, batch.status, status, ended_at, reason).await?;
            if applied {
                tx.commit().await?;
            }
            Ok(applied)
        })
        .await?;
        if !applied {
            return Err(ImportError::InvalidTransition {
                batch_id,
                from: self.get(batch_id).await?.status,
                to: status,
            });
        }

        self.audit
            .record(
                NewAuditEntry::new(
                    batch_id,
                    AuditEventKind::StatusOverridden,
                    actor,
                    format!("Status overridden from {} to {}", batch.status, status),
                )
                .with_detail(json!({
                    "from": batch.status,
                    "to": status,
                    "statistics": statistics,
                    "reason": reason,
                })),
            )
            .await?;

        tracing::warn!(batch_id = %batch_id, from = %batch.status, to = %status, actor, "Batch status overridden");
        self.get(batch_id).await
    }

    /// Hard-delete the tracking record of a rolled-back batch
    ///
    /// Audit entries are kept.
    pub async fn delete(&self, batch_id: Uuid, actor: &str) -> ImportResult<()> {
        let lease = self.leases.acquire(batch_id, "delete").await?;
        let batch = self.get(batch_id).await?;
        if batch.status != BatchStatus::RolledBack {
            return Err(ImportError::Conflict(format!(
                "batch {} is {}; only ROLLED_BACK batches can be deleted",
                batch_id, batch.status
            )));
        }

        retry_on_lock("batches.delete", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
            staging::purge(&mut *tx, batch_id).await?;
            batches::delete_batch(&mut *tx, batch_id).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        self.audit
            .record(NewAuditEntry::new(
                batch_id,
                AuditEventKind::BatchDeleted,
                actor,
                format!("Batch record of '{}' deleted", batch.source),
            ))
            .await?;

        drop(lease);
        self.leases.forget(batch_id);
        tracing::info!(batch_id = %batch_id, actor, "Batch deleted");
        Ok(())
    }

    /// Fail every batch left `IN_PROGRESS` by a previous process
    ///
    /// Must run before the orchestrator accepts work. Staging of those
    /// batches is purged; promoted rows stay until the batch is rolled back.
    pub async fn fail_interrupted(&self, actor: &str) -> ImportResult<Vec<Uuid>> {
        let stale = batches::batch_ids_with_status(&self.pool, BatchStatus::InProgress).await?;

        for batch_id in &stale {
            {
                let lease = self.leases.acquire(*batch_id, "startup recovery").await?;
                self.transition(&lease, *batch_id, BatchStatus::Failed, Some(INTERRUPTED_REASON), actor)
                    .await?;
            }
            self.leases.forget(*batch_id);
            retry_on_lock("staging.purge", self.max_lock_wait_ms, || async {
                staging::purge(&self.pool, *batch_id).await
            })
            .await?;
            tracing::warn!(batch_id = %batch_id, "Interrupted batch marked FAILED");
        }
        Ok(stale)
    }
}
