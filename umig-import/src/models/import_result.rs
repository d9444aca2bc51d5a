//! Import results and row-level errors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::{BatchStatistics, BatchStatus};
use super::staged::EntityType;

/// Row-level error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordErrorCode {
    /// Field or shape rule failed
    ValidationError,
    /// Uniqueness or reference violation at promotion
    ConflictError,
    /// Chunk could not be staged or committed
    StorageError,
    /// Row could not be tokenized
    ParseError,
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorSeverity {
    /// Reported, record still imported
    Warning,
    /// Record skipped, import continues
    Skip,
    /// Batch cannot continue
    Critical,
}

/// Error attached to one input record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    /// File or logical source the record came from
    pub source: String,
    /// Location inside the source ("line 4", "record 2", "chunk 3")
    pub position: String,
    pub entity: Option<EntityType>,
    pub code: RecordErrorCode,
    pub message: String,
    pub severity: ErrorSeverity,
}

impl RecordError {
    pub fn validation(source: &str, position: String, entity: EntityType, message: String) -> Self {
        Self {
            source: source.to_string(),
            position,
            entity: Some(entity),
            code: RecordErrorCode::ValidationError,
            message,
            severity: ErrorSeverity::Skip,
        }
    }

    pub fn unparseable(source: &str, position: String, entity: EntityType, message: String) -> Self {
        Self {
            code: RecordErrorCode::ParseError,
            ..Self::validation(source, position, entity, message)
        }
    }

    pub fn conflict(source: &str, position: String, entity: EntityType, message: String) -> Self {
        Self {
            source: source.to_string(),
            position,
            entity: Some(entity),
            code: RecordErrorCode::ConflictError,
            message,
            severity: ErrorSeverity::Skip,
        }
    }

    pub fn storage(source: &str, position: String, entity: Option<EntityType>, message: String) -> Self {
        Self {
            source: source.to_string(),
            position,
            entity,
            code: RecordErrorCode::StorageError,
            message,
            severity: ErrorSeverity::Skip,
        }
    }

    pub fn warning(source: &str, position: String, message: String) -> Self {
        Self {
            source: source.to_string(),
            position,
            entity: None,
            code: RecordErrorCode::ValidationError,
            message,
            severity: ErrorSeverity::Warning,
        }
    }
}

/// Result of promoting one chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromotionResult {
    pub succeeded: u64,
    pub failed: u64,
    pub errors: Vec<RecordError>,
}

/// Result of a rollback request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub batch_id: Uuid,
    pub actions: Vec<String>,
    pub records_deleted: u64,
    pub rolled_back_at: DateTime<Utc>,
    /// True when the batch was already rolled back and nothing was deleted
    pub already_rolled_back: bool,
}

/// What one chunk contributed to its batch
///
/// Workers hand these back to the batch run, which folds them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    pub records: usize,
    pub statistics: BatchStatistics,
    pub errors: Vec<RecordError>,
    /// Staging or commit failed for the whole chunk
    pub storage_failure: Option<String>,
    pub duration_ms: u64,
}

/// Per-input counters for multi-file and CSV "all" imports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceResult {
    pub source: String,
    pub entity: Option<EntityType>,
    pub statistics: BatchStatistics,
    pub error_count: u64,
}

/// Response to a single-source import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResponse {
    pub success: bool,
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub statistics: BatchStatistics,
    pub errors: Vec<RecordError>,
    pub warnings: Vec<RecordError>,
    /// Failure or cancellation reason for FAILED batches
    pub reason: Option<String>,
}

/// Response to a multi-file JSON import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchImportResponse {
    pub success: bool,
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub files_processed: usize,
    pub overall_statistics: BatchStatistics,
    pub file_results: Vec<SourceResult>,
    pub errors: Vec<RecordError>,
    pub reason: Option<String>,
}

/// Response to a CSV import (single entity or "all")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvImportResponse {
    pub success: bool,
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub records_processed: u64,
    pub records_imported: u64,
    pub records_skipped: u64,
    pub errors: Vec<RecordError>,
    pub entity_results: Vec<SourceResult>,
    pub reason: Option<String>,
}
