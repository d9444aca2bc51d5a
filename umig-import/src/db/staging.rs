//! Staging table access

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqliteExecutor};
use uuid::Uuid;

use super::format_timestamp;
use crate::error::{ImportError, ImportResult};
use crate::models::{EntityType, RawRecord, StagedRecord, ValidationOutcome};

/// Append one record; returns its staged id
pub async fn insert_record(
    conn: &mut SqliteConnection,
    batch_id: Uuid,
    entity_type: EntityType,
    source: &str,
    raw: &RawRecord,
) -> ImportResult<i64> {
    let raw = serde_json::to_string(raw)?;
    let result = sqlx::query(
        r#"
        INSERT INTO staging_records (batch_id, entity_type, source, raw, outcome, staged_at)
        VALUES (?, ?, ?, ?, 'PENDING', ?)
        "#,
    )
    .bind(batch_id.to_string())
    .bind(entity_type.as_str())
    .bind(source)
    .bind(raw)
    .bind(format_timestamp(&Utc::now()))
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Records still awaiting validation, in staging order
pub async fn list_pending<'e>(
    executor: impl SqliteExecutor<'e>,
    batch_id: Uuid,
) -> ImportResult<Vec<StagedRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT staged_id, batch_id, entity_type, source, raw, outcome, reason
        FROM staging_records
        WHERE batch_id = ? AND outcome = 'PENDING' AND promoted = 0
        ORDER BY staged_id
        "#,
    )
    .bind(batch_id.to_string())
    .fetch_all(executor)
    .await?;

    rows.iter().map(staged_from_row).collect()
}

pub async fn load_record<'e>(
    executor: impl SqliteExecutor<'e>,
    staged_id: i64,
) -> ImportResult<Option<StagedRecord>> {
    let row = sqlx::query(
        r#"
        SELECT staged_id, batch_id, entity_type, source, raw, outcome, reason
        FROM staging_records
        WHERE staged_id = ?
        "#,
    )
    .bind(staged_id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(staged_from_row).transpose()
}

/// Record a validation outcome; returns false if the row is gone
pub async fn set_outcome(
    conn: &mut SqliteConnection,
    staged_id: i64,
    outcome: &ValidationOutcome,
) -> ImportResult<bool> {
    let result = sqlx::query("UPDATE staging_records SET outcome = ?, reason = ? WHERE staged_id = ?")
        .bind(outcome.label())
        .bind(outcome.reason())
        .bind(staged_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Logical delete after promotion; only VALID rows qualify
pub async fn mark_promoted(conn: &mut SqliteConnection, staged_id: i64) -> ImportResult<()> {
    let result = sqlx::query(
        "UPDATE staging_records SET promoted = 1 WHERE staged_id = ? AND outcome = 'VALID'",
    )
    .bind(staged_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != 1 {
        return Err(ImportError::storage(format!(
            "staged record {} is not VALID and cannot be promoted",
            staged_id
        )));
    }
    Ok(())
}

/// Remove every staged row of the batch; returns rows removed (0 on repeat)
pub async fn purge<'e>(executor: impl SqliteExecutor<'e>, batch_id: Uuid) -> ImportResult<u64> {
    let result = sqlx::query("DELETE FROM staging_records WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

pub async fn count_for_batch<'e>(executor: impl SqliteExecutor<'e>, batch_id: Uuid) -> ImportResult<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM staging_records WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .fetch_one(executor)
        .await?;

    Ok(count as u64)
}

fn staged_from_row(row: &SqliteRow) -> ImportResult<StagedRecord> {
    let batch_id: String = row.get("batch_id");
    let entity_type: String = row.get("entity_type");
    let raw: String = row.get("raw");
    let outcome: String = row.get("outcome");

    Ok(StagedRecord {
        staged_id: row.get("staged_id"),
        batch_id: Uuid::parse_str(&batch_id)
            .map_err(|e| ImportError::storage(format!("Invalid batch id '{}': {}", batch_id, e)))?,
        entity_type: entity_type.parse().map_err(ImportError::storage)?,
        source: row.get("source"),
        raw: serde_json::from_str(&raw)?,
        outcome: ValidationOutcome::from_parts(&outcome, row.get("reason")).map_err(ImportError::storage)?,
    })
}
