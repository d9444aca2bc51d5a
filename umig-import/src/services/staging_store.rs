//! Staging Store
//!
//! Durable, append-only holding area for raw records of a batch. Writes go
//! through `retry_on_lock` so a busy database delays staging instead of
//! failing the chunk outright.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::staging;
use crate::error::{ImportError, ImportResult};
use crate::models::{EntityType, RawRecord, StagedRecord, StagedRecordRef, ValidationOutcome};
use crate::utils::retry_on_lock;

#[derive(Debug, Clone)]
pub struct StagingStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl StagingStore {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self { pool, max_lock_wait_ms }
    }

    /// Append one record
    pub async fn stage(
        &self,
        batch_id: Uuid,
        entity_type: EntityType,
        source: &str,
        raw: &RawRecord,
    ) -> ImportResult<StagedRecordRef> {
        let staged_id = retry_on_lock("staging.stage", self.max_lock_wait_ms, || async {
            let mut conn = self.pool.acquire().await?;
            staging::insert_record(&mut conn, batch_id, entity_type, source, raw).await
        })
        .await?;

        Ok(StagedRecordRef { staged_id, batch_id })
    }

    /// Append a whole chunk in one transaction
    ///
    /// Either every record is staged or none is; the returned records are in
    /// input order with `Pending` outcomes.
    pub async fn stage_chunk(
        &self,
        batch_id: Uuid,
        entity_type: EntityType,
        source: &str,
        records: Vec<RawRecord>,
    ) -> ImportResult<Vec<StagedRecord>> {
        let ids = retry_on_lock("staging.stage_chunk", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
            let mut ids = Vec::with_capacity(records.len());
            for raw in &records {
                ids.push(staging::insert_record(&mut tx, batch_id, entity_type, source, raw).await?);
            }
            tx.commit().await?;
            Ok(ids)
        })
        .await?;

        tracing::trace!(batch_id = %batch_id, staged = ids.len(), "Chunk staged");

        Ok(ids
            .into_iter()
            .zip(records)
            .map(|(staged_id, raw)| StagedRecord {
                staged_id,
                batch_id,
                entity_type,
                source: source.to_string(),
                raw,
                outcome: ValidationOutcome::Pending,
            })
            .collect())
    }

    pub async fn list_pending(&self, batch_id: Uuid) -> ImportResult<Vec<StagedRecord>> {
        staging::list_pending(&self.pool, batch_id).await
    }

    pub async fn get(&self, record: StagedRecordRef) -> ImportResult<StagedRecord> {
        staging::load_record(&self.pool, record.staged_id)
            .await?
            .filter(|staged| staged.batch_id == record.batch_id)
            .ok_or_else(|| ImportError::NotFound(format!("staged record {}", record.staged_id)))
    }

    pub async fn mark_outcome(&self, record: StagedRecordRef, outcome: &ValidationOutcome) -> ImportResult<()> {
        self.mark_outcomes(&[(record, outcome.clone())]).await
    }

    /// Record validation outcomes of a chunk in one transaction
    pub async fn mark_outcomes(&self, outcomes: &[(StagedRecordRef, ValidationOutcome)]) -> ImportResult<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        retry_on_lock("staging.mark_outcomes", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
            for (record, outcome) in outcomes {
                if !staging::set_outcome(&mut tx, record.staged_id, outcome).await? {
                    return Err(ImportError::NotFound(format!("staged record {}", record.staged_id)));
                }
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Remove every staged record of the batch; safe to repeat
    pub async fn purge(&self, batch_id: Uuid) -> ImportResult<u64> {
        let removed = retry_on_lock("staging.purge", self.max_lock_wait_ms, || async {
            staging::purge(&self.pool, batch_id).await
        })
        .await?;

        if removed > 0 {
            tracing::debug!(batch_id = %batch_id, removed, "Purged staged records");
        }
        Ok(removed)
    }

    pub async fn count(&self, batch_id: Uuid) -> ImportResult<u64> {
        staging::count_for_batch(&self.pool, batch_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{batches, init_database_pool};
    use crate::models::{ImportBatch, ImportKind};
    use tempfile::TempDir;

    async fn store_with_batch() -> (TempDir, StagingStore, Uuid) {
        let dir = TempDir::new().unwrap();
        let pool = init_database_pool(&dir.path().join("staging.db")).await.unwrap();
        let batch = ImportBatch::new(ImportKind::CsvImport, "teams.csv".into(), "tester".into());
        batches::insert_batch(&pool, &batch).await.unwrap();
        (dir, StagingStore::new(pool, 1000), batch.batch_id)
    }

    fn row(line: u64, name: &str) -> RawRecord {
        RawRecord::Csv {
            line,
            columns: vec!["team_name".into()],
            values: vec![name.into()],
        }
    }

    #[tokio::test]
    async fn test_outcomes_leave_pending_list() {
        let (_dir, store, batch_id) = store_with_batch().await;
        let first = store.stage(batch_id, EntityType::Team, "teams.csv", &row(2, "Ops")).await.unwrap();
        let staged = store
            .stage_chunk(batch_id, EntityType::Team, "teams.csv", vec![row(3, "Dev"), row(4, "")])
            .await
            .unwrap();
        assert_eq!(staged.len(), 2);
        assert_eq!(store.list_pending(batch_id).await.unwrap().len(), 3);

        store.mark_outcome(first, &ValidationOutcome::Valid).await.unwrap();
        let rejected = ValidationOutcome::Invalid {
            reason: "team_name is required".into(),
        };
        store.mark_outcome(staged[1].reference(), &rejected).await.unwrap();

        let pending = store.list_pending(batch_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].raw, row(3, "Dev"));
        assert_eq!(store.get(staged[1].reference()).await.unwrap().outcome, rejected);
    }

    #[tokio::test]
    async fn test_get_checks_owning_batch() {
        let (_dir, store, batch_id) = store_with_batch().await;
        let staged = store.stage(batch_id, EntityType::Team, "teams.csv", &row(2, "Ops")).await.unwrap();

        let foreign = StagedRecordRef {
            staged_id: staged.staged_id,
            batch_id: Uuid::new_v4(),
        };
        assert!(matches!(store.get(foreign).await, Err(ImportError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_purge_is_repeatable() {
        let (_dir, store, batch_id) = store_with_batch().await;
        store
            .stage_chunk(batch_id, EntityType::Team, "teams.csv", vec![row(2, "A"), row(3, "B")])
            .await
            .unwrap();
        assert_eq!(store.count(batch_id).await.unwrap(), 2);

        assert_eq!(store.purge(batch_id).await.unwrap(), 2);
        assert_eq!(store.purge(batch_id).await.unwrap(), 0);
        assert_eq!(store.count(batch_id).await.unwrap(), 0);
    }
}
