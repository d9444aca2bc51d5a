//! Data models for the import pipeline

pub mod audit;
pub mod batch;
pub mod entities;
pub mod import_result;
pub mod parameters;
pub mod request;
pub mod staged;

pub use audit::{AuditEntry, AuditEventKind, NewAuditEntry};
pub use batch::{
    BatchFilter, BatchStatistics, BatchStatus, ImportBatch, ImportKind, ImportStatistics,
    RollbackRecord,
};
pub use entities::{
    ApplicationRecord, EntityRecord, EnvironmentRecord, InstructionRecord, PlanRecord, StepRecord,
    TeamRecord, UserRecord, ValidatedRecord,
};
pub use import_result::{
    BatchImportResponse, ChunkOutcome, CsvImportResponse, ErrorSeverity, ImportResponse,
    PromotionResult, RecordError, RecordErrorCode, RollbackResult, SourceResult,
};
pub use parameters::{ImportParameters, PARAMETER_KEYS};
pub use request::{ImportRequest, InputReader, SourceFormat, SourceInput};
pub use staged::{CsvSchema, EntityType, RawRecord, StagedRecord, StagedRecordRef, ValidationOutcome};
