//! Audit log persistence (insert and read only)

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqliteExecutor};
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp};
use crate::error::{ImportError, ImportResult};
use crate::models::{AuditEntry, NewAuditEntry};

pub async fn append<'e>(executor: impl SqliteExecutor<'e>, entry: &NewAuditEntry) -> ImportResult<i64> {
    let detail = serde_json::to_string(&entry.detail)?;
    let result = sqlx::query(
        r#"
        INSERT INTO import_audit (batch_id, kind, actor, timestamp, summary, detail)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.batch_id.to_string())
    .bind(entry.kind.as_str())
    .bind(&entry.actor)
    .bind(format_timestamp(&Utc::now()))
    .bind(&entry.summary)
    .bind(detail)
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Entries of one batch by wall-clock time (insertion order breaks ties)
pub async fn list_for_batch<'e>(executor: impl SqliteExecutor<'e>, batch_id: Uuid) -> ImportResult<Vec<AuditEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT audit_id, batch_id, kind, actor, timestamp, summary, detail
        FROM import_audit
        WHERE batch_id = ?
        ORDER BY timestamp, audit_id
        "#,
    )
    .bind(batch_id.to_string())
    .fetch_all(executor)
    .await?;

    rows.iter().map(entry_from_row).collect()
}

fn entry_from_row(row: &SqliteRow) -> ImportResult<AuditEntry> {
    let batch_id: String = row.get("batch_id");
    let kind: String = row.get("kind");
    let timestamp: String = row.get("timestamp");
    let detail: String = row.get("detail");

    Ok(AuditEntry {
        audit_id: row.get("audit_id"),
        batch_id: Uuid::parse_str(&batch_id)
            .map_err(|e| ImportError::storage(format!("Invalid batch id '{}': {}", batch_id, e)))?,
        kind: kind.parse().map_err(ImportError::storage)?,
        actor: row.get("actor"),
        timestamp: parse_timestamp("timestamp", &timestamp)?,
        summary: row.get("summary"),
        detail: serde_json::from_str(&detail)?,
    })
}
