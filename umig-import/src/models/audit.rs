//! Audit trail entries (append-only)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    BatchStarted,
    BatchQueued,
    BatchAdmitted,
    RecordPromoted,
    RecordRejected,
    ChunkFailed,
    BatchCompleted,
    BatchFailed,
    BatchCancelled,
    StatusOverridden,
    RollbackExecuted,
    BatchDeleted,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::BatchStarted => "BATCH_STARTED",
            AuditEventKind::BatchQueued => "BATCH_QUEUED",
            AuditEventKind::BatchAdmitted => "BATCH_ADMITTED",
            AuditEventKind::RecordPromoted => "RECORD_PROMOTED",
            AuditEventKind::RecordRejected => "RECORD_REJECTED",
            AuditEventKind::ChunkFailed => "CHUNK_FAILED",
            AuditEventKind::BatchCompleted => "BATCH_COMPLETED",
            AuditEventKind::BatchFailed => "BATCH_FAILED",
            AuditEventKind::BatchCancelled => "BATCH_CANCELLED",
            AuditEventKind::StatusOverridden => "STATUS_OVERRIDDEN",
            AuditEventKind::RollbackExecuted => "ROLLBACK_EXECUTED",
            AuditEventKind::BatchDeleted => "BATCH_DELETED",
        }
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "BATCH_STARTED" => AuditEventKind::BatchStarted,
            "BATCH_QUEUED" => AuditEventKind::BatchQueued,
            "BATCH_ADMITTED" => AuditEventKind::BatchAdmitted,
            "RECORD_PROMOTED" => AuditEventKind::RecordPromoted,
            "RECORD_REJECTED" => AuditEventKind::RecordRejected,
            "CHUNK_FAILED" => AuditEventKind::ChunkFailed,
            "BATCH_COMPLETED" => AuditEventKind::BatchCompleted,
            "BATCH_FAILED" => AuditEventKind::BatchFailed,
            "BATCH_CANCELLED" => AuditEventKind::BatchCancelled,
            "STATUS_OVERRIDDEN" => AuditEventKind::StatusOverridden,
            "ROLLBACK_EXECUTED" => AuditEventKind::RollbackExecuted,
            "BATCH_DELETED" => AuditEventKind::BatchDeleted,
            other => return Err(format!("unknown audit event kind '{}'", other)),
        };
        Ok(kind)
    }
}

/// Immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: i64,
    pub batch_id: Uuid,
    pub kind: AuditEventKind,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    /// One-line summary ("Deleted 25 records.")
    pub summary: String,
    pub detail: serde_json::Value,
}

/// Audit entry before it is written
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub batch_id: Uuid,
    pub kind: AuditEventKind,
    pub actor: String,
    pub summary: String,
    pub detail: serde_json::Value,
}

impl NewAuditEntry {
    pub fn new(batch_id: Uuid, kind: AuditEventKind, actor: &str, summary: impl Into<String>) -> Self {
        Self {
            batch_id,
            kind,
            actor: actor.to_string(),
            summary: summary.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_parse_back() {
        let kinds = [
            AuditEventKind::BatchStarted,
            AuditEventKind::RecordPromoted,
            AuditEventKind::RecordRejected,
            AuditEventKind::RollbackExecuted,
            AuditEventKind::BatchDeleted,
        ];
        for kind in kinds {
            assert_eq!(kind.as_str().parse::<AuditEventKind>().unwrap(), kind);
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }
}
