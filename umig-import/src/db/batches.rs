//! Import batch persistence

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteExecutor};
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp};
use crate::error::{ImportError, ImportResult};
use crate::models::{
    BatchFilter, BatchStatistics, BatchStatus, ImportBatch, ImportKind, ImportStatistics,
    RecordError, RollbackRecord,
};

const BATCH_COLUMNS: &str = r#"
    batch_id, source, kind, status, actor, started_at, ended_at,
    records_processed, records_succeeded, records_failed,
    errors, status_reason, rollback
"#;

pub async fn insert_batch<'e>(executor: impl SqliteExecutor<'e>, batch: &ImportBatch) -> ImportResult<()> {
    let errors = serde_json::to_string(&batch.errors)?;
    let rollback = batch.rollback.as_ref().map(serde_json::to_string).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO import_batches (
            batch_id, source, kind, status, actor, started_at, ended_at,
            records_processed, records_succeeded, records_failed,
            errors, status_reason, rollback
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(batch.batch_id.to_string())
    .bind(&batch.source)
    .bind(batch.kind.as_str())
    .bind(batch.status.as_str())
    .bind(&batch.actor)
    .bind(format_timestamp(&batch.started_at))
    .bind(batch.ended_at.as_ref().map(format_timestamp))
    .bind(batch.statistics.processed as i64)
    .bind(batch.statistics.succeeded as i64)
    .bind(batch.statistics.failed as i64)
    .bind(errors)
    .bind(&batch.status_reason)
    .bind(rollback)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn load_batch<'e>(
    executor: impl SqliteExecutor<'e>,
    batch_id: Uuid,
) -> ImportResult<Option<ImportBatch>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM import_batches WHERE batch_id = ?",
        BATCH_COLUMNS
    ))
    .bind(batch_id.to_string())
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(batch_from_row).transpose()
}

/// Newest first
pub async fn list_batches<'e>(
    executor: impl SqliteExecutor<'e>,
    filter: &BatchFilter,
    limit: u32,
) -> ImportResult<Vec<ImportBatch>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM import_batches
        WHERE (?1 IS NULL OR actor = ?1)
          AND (?2 IS NULL OR status = ?2)
          AND (?3 IS NULL OR kind = ?3)
        ORDER BY started_at DESC
        LIMIT ?4
        "#,
        BATCH_COLUMNS
    ))
    .bind(filter.actor.as_deref())
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.kind.map(|k| k.as_str()))
    .bind(limit as i64)
    .fetch_all(executor)
    .await?;

    rows.iter().map(batch_from_row).collect()
}

/// Batch ids currently in `status`
pub async fn batch_ids_with_status<'e>(
    executor: impl SqliteExecutor<'e>,
    status: BatchStatus,
) -> ImportResult<Vec<Uuid>> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT batch_id FROM import_batches WHERE status = ? ORDER BY started_at")
            .bind(status.as_str())
            .fetch_all(executor)
            .await?;

    ids.iter().map(|id| parse_uuid(id)).collect()
}

/// Overwrite counters and reported errors with the folded totals
pub async fn update_statistics<'e>(
    executor: impl SqliteExecutor<'e>,
    batch_id: Uuid,
    statistics: &BatchStatistics,
    errors: &[RecordError],
) -> ImportResult<()> {
    let errors = serde_json::to_string(errors)?;
    let result = sqlx::query(
        r#"
        UPDATE import_batches
        SET records_processed = ?, records_succeeded = ?, records_failed = ?, errors = ?
        WHERE batch_id = ?
        "#,
    )
    .bind(statistics.processed as i64)
    .bind(statistics.succeeded as i64)
    .bind(statistics.failed as i64)
    .bind(errors)
    .bind(batch_id.to_string())
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ImportError::NotFound(format!("batch {}", batch_id)));
    }
    Ok(())
}

/// Compare-and-set status change
///
/// Returns false when the batch was no longer in `expected`.
pub async fn update_status<'e>(
    executor: impl SqliteExecutor<'e>,
    batch_id: Uuid,
    expected: BatchStatus,
    status: BatchStatus,
    ended_at: Option<DateTime<Utc>>,
    reason: Option<&str>,
) -> ImportResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_batches
        SET status = ?, ended_at = COALESCE(?, ended_at), status_reason = ?
        WHERE batch_id = ? AND status = ?
        "#,
    )
    .bind(status.as_str())
    .bind(ended_at.as_ref().map(format_timestamp))
    .bind(reason)
    .bind(batch_id.to_string())
    .bind(expected.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark rolled back and keep the action list for repeat calls
pub async fn record_rollback<'e>(
    executor: impl SqliteExecutor<'e>,
    batch_id: Uuid,
    expected: BatchStatus,
    rollback: &RollbackRecord,
) -> ImportResult<bool> {
    let record = serde_json::to_string(rollback)?;
    let result = sqlx::query(
        r#"
        UPDATE import_batches
        SET status = 'ROLLED_BACK', rollback = ?
        WHERE batch_id = ? AND status = ?
        "#,
    )
    .bind(record)
    .bind(batch_id.to_string())
    .bind(expected.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn delete_batch<'e>(executor: impl SqliteExecutor<'e>, batch_id: Uuid) -> ImportResult<bool> {
    let result = sqlx::query("DELETE FROM import_batches WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .execute(executor)
        .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn aggregate_statistics<'e>(executor: impl SqliteExecutor<'e>) -> ImportResult<ImportStatistics> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(status = 'IN_PROGRESS'), 0) AS in_progress,
            COALESCE(SUM(status = 'COMPLETED'), 0) AS completed,
            COALESCE(SUM(status = 'FAILED'), 0) AS failed,
            COALESCE(SUM(status = 'ROLLED_BACK'), 0) AS rolled_back,
            COALESCE(SUM(records_processed), 0) AS processed,
            COALESCE(SUM(records_succeeded), 0) AS succeeded,
            COALESCE(SUM(records_failed), 0) AS records_failed,
            MAX(started_at) AS last_import_at
        FROM import_batches
        "#,
    )
    .fetch_one(executor)
    .await?;

    let processed = row.get::<i64, _>("processed") as u64;
    let succeeded = row.get::<i64, _>("succeeded") as u64;
    let last_import_at: Option<String> = row.get("last_import_at");

    Ok(ImportStatistics {
        total_batches: row.get::<i64, _>("total") as u64,
        in_progress: row.get::<i64, _>("in_progress") as u64,
        completed: row.get::<i64, _>("completed") as u64,
        failed: row.get::<i64, _>("failed") as u64,
        rolled_back: row.get::<i64, _>("rolled_back") as u64,
        records_processed: processed,
        records_succeeded: succeeded,
        records_failed: row.get::<i64, _>("records_failed") as u64,
        success_rate: if processed == 0 {
            0.0
        } else {
            succeeded as f64 / processed as f64
        },
        last_import_at: last_import_at
            .map(|s| parse_timestamp("last_import_at", &s))
            .transpose()?,
    })
}

fn parse_uuid(value: &str) -> ImportResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| ImportError::storage(format!("Invalid batch id '{}': {}", value, e)))
}

fn batch_from_row(row: &SqliteRow) -> ImportResult<ImportBatch> {
    let batch_id: String = row.get("batch_id");
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let started_at: String = row.get("started_at");
    let ended_at: Option<String> = row.get("ended_at");
    let errors: String = row.get("errors");
    let rollback: Option<String> = row.get("rollback");

    Ok(ImportBatch {
        batch_id: parse_uuid(&batch_id)?,
        source: row.get("source"),
        kind: kind.parse::<ImportKind>().map_err(ImportError::storage)?,
        status: status.parse::<BatchStatus>().map_err(ImportError::storage)?,
        actor: row.get("actor"),
        started_at: parse_timestamp("started_at", &started_at)?,
        ended_at: ended_at
            .map(|s| parse_timestamp("ended_at", &s))
            .transpose()?,
        statistics: BatchStatistics {
            processed: row.get::<i64, _>("records_processed") as u64,
            succeeded: row.get::<i64, _>("records_succeeded") as u64,
            failed: row.get::<i64, _>("records_failed") as u64,
        },
        errors: serde_json::from_str(&errors)?,
        status_reason: row.get("status_reason"),
        rollback: rollback.map(|r| serde_json::from_str(&r)).transpose()?,
    })
}
