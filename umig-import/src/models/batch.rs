//! Import batch lifecycle
//!
//! Status graph:
//! IN_PROGRESS → COMPLETED | FAILED, COMPLETED | FAILED → ROLLED_BACK.
//! ROLLED_BACK is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::RecordError;

/// Batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Created at submission; staging, validation and promotion may be running
    InProgress,
    /// All chunks processed within the acceptance threshold
    Completed,
    /// Fatal error, threshold exceeded, or cancelled
    Failed,
    /// Promoted and staged data removed; terminal
    RolledBack,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::RolledBack => "ROLLED_BACK",
        }
    }

    /// Processing has ended (rollback may still follow)
    pub fn is_finished(&self) -> bool {
        !matches!(self, BatchStatus::InProgress)
    }

    /// Transition allowed by the processing/rollback graph
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::InProgress, BatchStatus::Completed)
                | (BatchStatus::InProgress, BatchStatus::Failed)
                | (BatchStatus::Completed, BatchStatus::RolledBack)
                | (BatchStatus::Failed, BatchStatus::RolledBack)
        )
    }

    /// Transition allowed for an administrative status override
    ///
    /// Adds COMPLETED ↔ FAILED and same-status no-ops to the graph. ROLLED_BACK
    /// is never reachable by override because it implies deleted master data.
    pub fn can_override_to(&self, next: BatchStatus) -> bool {
        if *self == BatchStatus::RolledBack || next == BatchStatus::RolledBack {
            return false;
        }
        if *self == next {
            return true;
        }
        self.can_transition_to(next)
            || matches!(
                (self, next),
                (BatchStatus::Completed, BatchStatus::Failed)
                    | (BatchStatus::Failed, BatchStatus::Completed)
            )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IN_PROGRESS" => Ok(BatchStatus::InProgress),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            "ROLLED_BACK" => Ok(BatchStatus::RolledBack),
            other => Err(format!("unknown batch status '{}'", other)),
        }
    }
}

/// What kind of import created the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportKind {
    JsonImport,
    CsvImport,
    MasterPlan,
}

impl ImportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKind::JsonImport => "JSON_IMPORT",
            ImportKind::CsvImport => "CSV_IMPORT",
            ImportKind::MasterPlan => "MASTER_PLAN",
        }
    }
}

impl fmt::Display for ImportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "JSON_IMPORT" => Ok(ImportKind::JsonImport),
            "CSV_IMPORT" => Ok(ImportKind::CsvImport),
            "MASTER_PLAN" => Ok(ImportKind::MasterPlan),
            other => Err(format!("unknown import kind '{}'", other)),
        }
    }
}

/// Record counters of one batch
///
/// `succeeded + failed == processed` holds after every fold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl BatchStatistics {
    pub fn new(succeeded: u64, failed: u64) -> Self {
        Self {
            processed: succeeded + failed,
            succeeded,
            failed,
        }
    }

    /// Fold another set of counts into this one
    pub fn absorb(&mut self, other: &BatchStatistics) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }

    /// Fraction of processed records that failed (0.0 when nothing was processed)
    pub fn failure_ratio(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.failed as f64 / self.processed as f64
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.succeeded + self.failed == self.processed
    }
}

/// Rollback bookkeeping stored on the batch so repeated rollbacks can answer
/// with the original action list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub actions: Vec<String>,
    pub records_deleted: u64,
    pub reason: Option<String>,
    pub rolled_back_by: String,
    pub rolled_back_at: DateTime<Utc>,
}

/// Import batch (authoritative record held by the batch tracker)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBatch {
    pub batch_id: Uuid,
    /// Filename or logical source name
    pub source: String,
    pub kind: ImportKind,
    pub status: BatchStatus,
    /// Resolved identity of the submitting user
    pub actor: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub statistics: BatchStatistics,
    /// Row-level errors reported back to the caller (bounded)
    pub errors: Vec<RecordError>,
    /// Why the batch failed or was overridden
    pub status_reason: Option<String>,
    pub rollback: Option<RollbackRecord>,
}

impl ImportBatch {
    /// New batch in IN_PROGRESS with a fresh id
    pub fn new(kind: ImportKind, source: String, actor: String) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            source,
            kind,
            status: BatchStatus::InProgress,
            actor,
            started_at: Utc::now(),
            ended_at: None,
            statistics: BatchStatistics::default(),
            errors: Vec::new(),
            status_reason: None,
            rollback: None,
        }
    }

    /// Processing duration so far (or total when finished)
    pub fn elapsed_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Filter for history queries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchFilter {
    pub actor: Option<String>,
    pub status: Option<BatchStatus>,
    pub kind: Option<ImportKind>,
}

/// Aggregate counters across all batches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportStatistics {
    pub total_batches: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub rolled_back: u64,
    pub records_processed: u64,
    pub records_succeeded: u64,
    pub records_failed: u64,
    /// succeeded / processed across all batches (0.0 when nothing was processed)
    pub success_rate: f64,
    pub last_import_at: Option<DateTime<Utc>>,
}
