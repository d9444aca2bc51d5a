//! Import pipeline services
//!
//! Staging, validation, promotion and batch tracking, driven by the chunk
//! processor and the orchestrator. `ImportService` is the public facade.

pub mod audit_log;
pub mod batch_tracker;
pub mod chunk_processor;
pub mod chunk_sizer;
pub mod import_service;
pub mod lease;
pub mod orchestrator;
pub mod progress;
pub mod promotion_engine;
pub mod staging_store;
pub mod validator;

pub use audit_log::AuditLog;
pub use batch_tracker::{BatchTracker, INTERRUPTED_REASON};
pub use chunk_processor::{ChunkProcessor, RunOutcome};
pub use chunk_sizer::{AdaptiveChunkSizer, FixedMemoryGauge, MemoryGauge, SizeDecision, SystemMemoryGauge};
pub use import_service::{ImportService, SubmitOptions, SYSTEM_ACTOR};
pub use lease::{BatchLease, LeaseManager};
pub use orchestrator::{
    ActiveImportSummary, CancelOutcome, Orchestrator, OrchestratorSnapshot, QueuedImportSummary,
    RunReport, Submission,
};
pub use progress::{PerformanceSnapshot, ProgressEntry, ProgressRegistry, ProgressReport};
pub use promotion_engine::PromotionEngine;
pub use staging_store::StagingStore;
