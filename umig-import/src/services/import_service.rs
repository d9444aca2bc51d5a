//! Import service
//!
//! Entry point for every import contract. Wires the staging store, tracker,
//! promotion engine, chunk processor and orchestrator together and turns run
//! reports into caller-facing responses.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use umig_common::events::{EventBus, ImportEvent};
use uuid::Uuid;

use super::audit_log::AuditLog;
use super::batch_tracker::{BatchTracker, INTERRUPTED_REASON};
use super::chunk_processor::ChunkProcessor;
use super::chunk_sizer::{MemoryGauge, SystemMemoryGauge};
use super::lease::LeaseManager;
use super::orchestrator::{CancelOutcome, Orchestrator, OrchestratorSnapshot, RunReport, Submission};
use super::progress::{ProgressRegistry, ProgressReport};
use super::promotion_engine::PromotionEngine;
use super::staging_store::StagingStore;
use crate::error::{ImportError, ImportResult};
use crate::models::{
    AuditEntry, BatchFilter, BatchImportResponse, BatchStatistics, BatchStatus, CsvImportResponse,
    EntityType, ImportBatch, ImportKind, ImportParameters, ImportRequest, ImportResponse,
    ImportStatistics, RollbackResult, SourceFormat, SourceInput,
};

/// Actor recorded for actions taken by the service itself
pub const SYSTEM_ACTOR: &str = "system";

/// Per-submission options
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    pub priority: i32,
    pub max_failure_ratio: Option<f64>,
}

#[derive(Clone)]
pub struct ImportService {
    params: Arc<ImportParameters>,
    tracker: Arc<BatchTracker>,
    audit: AuditLog,
    progress: Arc<ProgressRegistry>,
    orchestrator: Orchestrator,
}

impl ImportService {
    pub fn new(pool: SqlitePool, params: ImportParameters, bus: EventBus) -> ImportResult<Self> {
        Self::with_gauge(pool, params, bus, Arc::new(SystemMemoryGauge::new()))
    }

    /// Build with a specific memory gauge
    pub fn with_gauge(
        pool: SqlitePool,
        params: ImportParameters,
        bus: EventBus,
        gauge: Arc<dyn MemoryGauge>,
    ) -> ImportResult<Self> {
        params.validate().map_err(ImportError::InvalidInput)?;
        let params = Arc::new(params);
        let max_wait = params.db_max_lock_wait_ms;

        let leases = Arc::new(LeaseManager::new(params.lease_timeout()));
        let audit = AuditLog::new(pool.clone(), max_wait);
        let tracker = Arc::new(BatchTracker::new(pool.clone(), Arc::clone(&leases), audit.clone(), max_wait));
        let staging = StagingStore::new(pool.clone(), max_wait);
        let engine = Arc::new(PromotionEngine::new(pool, leases, max_wait));
        let progress = Arc::new(ProgressRegistry::new(bus, params.progress_history));
        let processor = Arc::new(ChunkProcessor::new(
            staging,
            audit.clone(),
            Arc::clone(&engine),
            Arc::clone(&progress),
            gauge,
            Arc::clone(&params),
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&params),
            Arc::clone(&tracker),
            engine,
            processor,
            Arc::clone(&progress),
            audit.clone(),
        );

        Ok(Self {
            params,
            tracker,
            audit,
            progress,
            orchestrator,
        })
    }

    pub fn parameters(&self) -> &ImportParameters {
        &self.params
    }

    pub fn event_bus(&self) -> &EventBus {
        self.progress.bus()
    }

    /// Mark batches left `IN_PROGRESS` by a previous process as `FAILED`
    pub async fn recover_interrupted(&self) -> ImportResult<Vec<Uuid>> {
        let recovered = self.tracker.fail_interrupted(SYSTEM_ACTOR).await?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), reason = INTERRUPTED_REASON, "Recovered interrupted batches");
        }
        Ok(recovered)
    }

    /// Hand a request to the orchestrator without waiting for it
    pub async fn submit(&self, request: ImportRequest) -> ImportResult<Submission> {
        self.orchestrator.submit(request).await
    }

    async fn run(&self, request: ImportRequest) -> ImportResult<Arc<RunReport>> {
        self.orchestrator.submit(request).await?.wait().await
    }

    /// Import one JSON document of steps
    pub async fn import_json(
        &self,
        source: &str,
        content: String,
        actor: &str,
        options: SubmitOptions,
    ) -> ImportResult<ImportResponse> {
        let request = request(ImportKind::JsonImport, source, actor, options)
            .with_input(SourceInput::from_text(source, SourceFormat::JsonSteps, content));
        let report = self.run(request).await?;
        Ok(single_response(&report))
    }

    /// Import several JSON step documents as one batch
    pub async fn import_json_batch(
        &self,
        files: Vec<(String, String)>,
        actor: &str,
        options: SubmitOptions,
    ) -> ImportResult<BatchImportResponse> {
        if files.is_empty() {
            return Err(ImportError::InvalidInput("no files supplied".into()));
        }
        let source = format!("json batch ({} files)", files.len());
        let request = files.into_iter().fold(
            request(ImportKind::JsonImport, &source, actor, options),
            |request, (name, content)| request.with_input(SourceInput::from_text(name, SourceFormat::JsonSteps, content)),
        );
        let report = self.run(request).await?;

        let batch = &report.batch;
        let mut errors = report.errors.clone();
        errors.extend(report.warnings.iter().cloned());
        Ok(BatchImportResponse {
            success: batch.status == BatchStatus::Completed,
            batch_id: batch.batch_id,
            status: batch.status,
            files_processed: report.sources.len(),
            overall_statistics: batch.statistics,
            file_results: report.sources.clone(),
            errors,
            reason: batch.status_reason.clone(),
        })
    }

    /// Import a JSON document of master plans
    pub async fn import_master_plan(
        &self,
        source: &str,
        content: String,
        actor: &str,
        options: SubmitOptions,
    ) -> ImportResult<ImportResponse> {
        let request = request(ImportKind::MasterPlan, source, actor, options)
            .with_input(SourceInput::from_text(source, SourceFormat::JsonPlans, content));
        let report = self.run(request).await?;
        Ok(single_response(&report))
    }

    /// Import CSV text for one entity
    pub async fn import_csv(
        &self,
        entity: EntityType,
        source: &str,
        content: String,
        actor: &str,
        options: SubmitOptions,
    ) -> ImportResult<CsvImportResponse> {
        ensure_csv_entity(entity)?;
        let request = request(ImportKind::CsvImport, source, actor, options)
            .with_input(SourceInput::from_text(source, SourceFormat::Csv(entity), content));
        let report = self.run(request).await?;
        Ok(csv_response(&report))
    }

    /// Import CSV text for several entities in dependency order
    pub async fn import_csv_all(
        &self,
        files: BTreeMap<EntityType, String>,
        actor: &str,
        options: SubmitOptions,
    ) -> ImportResult<CsvImportResponse> {
        if files.is_empty() {
            return Err(ImportError::InvalidInput("no CSV content supplied".into()));
        }
        for entity in files.keys() {
            ensure_csv_entity(*entity)?;
        }

        let mut files = files;
        let mut request = request(ImportKind::CsvImport, "csv all", actor, options);
        for entity in EntityType::CSV_IMPORT_ORDER {
            if let Some(content) = files.remove(&entity) {
                request = request.with_input(SourceInput::from_text(
                    format!("{}.csv", entity.plural()),
                    SourceFormat::Csv(entity),
                    content,
                ));
            }
        }
        let report = self.run(request).await?;
        Ok(csv_response(&report))
    }

    pub async fn history(&self, filter: &BatchFilter, limit: u32) -> ImportResult<Vec<ImportBatch>> {
        self.tracker.list(filter, limit).await
    }

    pub async fn batch(&self, batch_id: Uuid) -> ImportResult<ImportBatch> {
        self.tracker.get(batch_id).await
    }

    pub async fn statistics(&self) -> ImportResult<ImportStatistics> {
        self.tracker.statistics().await
    }

    /// Manual status override
    ///
    /// Refused while the orchestrator still owns the batch.
    pub async fn update_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        statistics: Option<BatchStatistics>,
        actor: &str,
        reason: Option<&str>,
    ) -> ImportResult<ImportBatch> {
        if self.orchestrator.is_tracked(batch_id).await {
            return Err(ImportError::Conflict(format!(
                "batch {} is queued or running; cancel it first",
                batch_id
            )));
        }
        let before = self.tracker.get(batch_id).await?.status;
        let batch = self
            .tracker
            .override_status(batch_id, status, statistics, actor, reason)
            .await?;
        if batch.status != before {
            self.progress.record(ImportEvent::BatchStatusChanged {
                batch_id,
                old_status: before.to_string(),
                new_status: batch.status.to_string(),
                actor: actor.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(batch)
    }

    pub async fn rollback(&self, batch_id: Uuid, reason: Option<&str>, actor: &str) -> ImportResult<RollbackResult> {
        self.orchestrator.rollback(batch_id, reason, actor).await
    }

    /// Hard-delete a rolled back batch
    pub async fn delete_batch(&self, batch_id: Uuid, actor: &str) -> ImportResult<()> {
        self.tracker.delete(batch_id, actor).await?;
        self.progress.forget(batch_id);
        Ok(())
    }

    pub async fn cancel(&self, batch_id: Uuid, actor: &str) -> ImportResult<CancelOutcome> {
        self.orchestrator.cancel(batch_id, actor).await
    }

    /// Journal entries after `after_seq`
    pub async fn progress(&self, batch_id: Uuid, after_seq: u64) -> ImportResult<ProgressReport> {
        if let Some(report) = self.progress.report(batch_id, after_seq) {
            return Ok(report);
        }
        // Known batch whose journal is gone (evicted or from an earlier run)
        let batch = self.tracker.get(batch_id).await?;
        Ok(ProgressReport {
            batch_id,
            entries: Vec::new(),
            last_seq: 0,
            oldest_seq: 0,
            finished: batch.status.is_finished(),
            performance: Default::default(),
        })
    }

    pub async fn audit_trail(&self, batch_id: Uuid) -> ImportResult<Vec<AuditEntry>> {
        self.tracker.get(batch_id).await?;
        self.audit.trail(batch_id).await
    }

    pub async fn orchestrator_status(&self) -> OrchestratorSnapshot {
        self.orchestrator.snapshot().await
    }

    /// Cancel queued and running imports and wait for them to stop
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown(SYSTEM_ACTOR).await;
    }
}

fn request(kind: ImportKind, source: &str, actor: &str, options: SubmitOptions) -> ImportRequest {
    ImportRequest::new(kind, source, actor)
        .with_priority(options.priority)
        .with_max_failure_ratio(options.max_failure_ratio)
}

fn ensure_csv_entity(entity: EntityType) -> ImportResult<()> {
    match entity {
        EntityType::Plan => Err(ImportError::Unsupported(
            "CSV import of master plans is not supported".into(),
        )),
        other if other.csv_schema().is_none() => Err(ImportError::Unsupported(format!(
            "CSV import of {} is not supported",
            other.plural()
        ))),
        _ => Ok(()),
    }
}

fn single_response(report: &RunReport) -> ImportResponse {
    let batch = &report.batch;
    ImportResponse {
        success: batch.status == BatchStatus::Completed,
        batch_id: batch.batch_id,
        status: batch.status,
        statistics: batch.statistics,
        errors: report.errors.clone(),
        warnings: report.warnings.clone(),
        reason: batch.status_reason.clone(),
    }
}

fn csv_response(report: &RunReport) -> CsvImportResponse {
    let batch = &report.batch;
    let mut errors = report.errors.clone();
    errors.extend(report.warnings.iter().cloned());
    CsvImportResponse {
        success: batch.status == BatchStatus::Completed,
        batch_id: batch.batch_id,
        status: batch.status,
        records_processed: batch.statistics.processed,
        records_imported: batch.statistics.succeeded,
        records_skipped: batch.statistics.failed,
        errors,
        entity_results: report.sources.clone(),
        reason: batch.status_reason.clone(),
    }
}
