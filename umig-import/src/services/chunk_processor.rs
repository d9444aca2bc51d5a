//! Chunked Streaming Processor
//!
//! Runs one admitted batch: inputs are parsed incrementally on the blocking
//! pool, cut into chunks sized by `AdaptiveChunkSizer`, and each chunk is
//! staged, validated and promoted by its own task. At most `chunk_fan_out`
//! chunk tasks of a batch run at once.
//!
//! Workers never touch the batch counters. Each returns a `ChunkOutcome` and
//! the task that owns the run folds it into the accumulator, then writes the
//! absolute totals under the batch lease. Inputs are processed in order and
//! all chunks of one input finish before the next input starts, so later
//! inputs can reference records of earlier ones.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use umig_common::events::ImportEvent;
use uuid::Uuid;

use super::audit_log::AuditLog;
use super::batch_tracker::BatchTracker;
use super::chunk_sizer::{AdaptiveChunkSizer, MemoryGauge};
use super::promotion_engine::PromotionEngine;
use super::progress::ProgressRegistry;
use super::staging_store::StagingStore;
use super::validator;
use crate::error::{ImportError, ImportResult};
use crate::models::{
    AuditEventKind, BatchStatistics, BatchStatus, ChunkOutcome, EntityType, ErrorSeverity,
    ImportBatch, ImportParameters, NewAuditEntry, PromotionResult, RawRecord, RecordError,
    RecordErrorCode, SourceInput, SourceResult, ValidatedRecord, ValidationOutcome,
};
use crate::parsing::{open_source, read_chunk, BoxedRecordSource};

/// Attempts at a chunk commit when the batch lease is busy
const PROMOTE_ATTEMPTS: u32 = 3;

/// Result of one batch run, handed back to the orchestrator
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub statistics: BatchStatistics,
    pub errors: Vec<RecordError>,
    pub warnings: Vec<RecordError>,
    pub sources: Vec<SourceResult>,
    pub chunks: usize,
    /// Errors beyond `max_reported_errors` (counted, not listed)
    pub suppressed_errors: u64,
    /// Batch-fatal condition; the batch must end `FAILED`
    pub fatal: Option<String>,
    pub cancelled: bool,
}

impl RunOutcome {
    /// Terminal status for this run and the reason recorded with it
    pub fn verdict(&self, max_failure_ratio: f64, cancel_reason: Option<&str>) -> (BatchStatus, Option<String>) {
        if let Some(fatal) = &self.fatal {
            return (BatchStatus::Failed, Some(fatal.clone()));
        }
        if self.cancelled {
            let reason = cancel_reason.unwrap_or("cancelled");
            return (BatchStatus::Failed, Some(reason.to_string()));
        }
        let ratio = self.statistics.failure_ratio();
        if ratio > max_failure_ratio {
            return (
                BatchStatus::Failed,
                Some(format!(
                    "failure ratio {:.3} ({} of {} records) exceeds the accepted maximum {:.3}",
                    ratio, self.statistics.failed, self.statistics.processed, max_failure_ratio
                )),
            );
        }
        (BatchStatus::Completed, None)
    }
}

/// Owner-side fold of chunk outcomes
struct RunAccumulator {
    outcome: RunOutcome,
    max_errors: usize,
    max_chunk_failures: u32,
    consecutive_failures: u32,
}

impl RunAccumulator {
    fn new(params: &ImportParameters) -> Self {
        Self {
            outcome: RunOutcome::default(),
            max_errors: params.max_reported_errors,
            max_chunk_failures: params.max_chunk_failures.max(1),
            consecutive_failures: 0,
        }
    }

    fn begin_source(&mut self, name: &str, entity: EntityType) {
        self.outcome.sources.push(SourceResult {
            source: name.to_string(),
            entity: Some(entity),
            statistics: BatchStatistics::default(),
            error_count: 0,
        });
    }

    fn push_error(&mut self, error: RecordError) {
        if self.outcome.errors.len() < self.max_errors {
            self.outcome.errors.push(error);
        } else {
            self.outcome.suppressed_errors += 1;
        }
    }

    fn warn(&mut self, source: &str, message: String) {
        self.outcome
            .warnings
            .push(RecordError::warning(source, "header".to_string(), message));
    }

    /// Record a batch-fatal condition (the first one wins)
    fn fail(&mut self, source: &str, position: &str, err: &ImportError) {
        let code = match err {
            ImportError::ParseFraming(_) => RecordErrorCode::ParseError,
            _ => RecordErrorCode::StorageError,
        };
        self.outcome.errors.push(RecordError {
            source: source.to_string(),
            position: position.to_string(),
            entity: self.outcome.sources.last().and_then(|s| s.entity),
            code,
            message: err.to_string(),
            severity: ErrorSeverity::Critical,
        });
        if let Some(current) = self.outcome.sources.last_mut() {
            current.error_count += 1;
        }
        if self.outcome.fatal.is_none() {
            self.outcome.fatal = Some(format!("{}: {}", source, err));
        }
    }

    /// Fold one chunk; returns true when the run must stop
    fn absorb(&mut self, chunk: ChunkOutcome) -> bool {
        self.outcome.statistics.absorb(&chunk.statistics);
        self.outcome.chunks += 1;
        if let Some(current) = self.outcome.sources.last_mut() {
            current.statistics.absorb(&chunk.statistics);
            current.error_count += chunk.errors.len() as u64;
        }
        for error in chunk.errors {
            self.push_error(error);
        }

        match chunk.storage_failure {
            None => {
                self.consecutive_failures = 0;
                false
            }
            Some(failure) => {
                self.consecutive_failures += 1;
                if chunk.chunk_index == 0 {
                    self.outcome
                        .fatal
                        .get_or_insert_with(|| format!("first chunk failed: {}", failure));
                } else if self.consecutive_failures >= self.max_chunk_failures {
                    let failures = self.consecutive_failures;
                    self.outcome
                        .fatal
                        .get_or_insert_with(|| format!("{} consecutive chunks failed, last: {}", failures, failure));
                }
                self.outcome.fatal.is_some()
            }
        }
    }

    fn finish(mut self) -> RunOutcome {
        if self.outcome.suppressed_errors > 0 {
            let message = format!(
                "{} additional errors not listed (limit {})",
                self.outcome.suppressed_errors, self.max_errors
            );
            self.outcome
                .warnings
                .push(RecordError::warning("batch", "errors".to_string(), message));
        }
        self.outcome
    }
}

/// Stage, validate and promote one chunk
#[derive(Clone)]
struct ChunkWorker {
    staging: StagingStore,
    audit: AuditLog,
    engine: Arc<PromotionEngine>,
    batch_id: Uuid,
    actor: String,
}

impl ChunkWorker {
    async fn process(
        self,
        chunk_index: usize,
        source: String,
        entity: EntityType,
        records: Vec<RawRecord>,
    ) -> ChunkOutcome {
        let started = Instant::now();
        let count = records.len();
        let mut outcome = ChunkOutcome {
            chunk_index,
            records: count,
            ..ChunkOutcome::default()
        };

        let staged = match self.staging.stage_chunk(self.batch_id, entity, &source, records).await {
            Ok(staged) => staged,
            Err(e) => return self.failed(outcome, &source, entity, format!("staging failed: {}", e), started).await,
        };

        let mut outcomes = Vec::with_capacity(staged.len());
        let mut rejections = Vec::new();
        let mut valid: Vec<ValidatedRecord> = Vec::with_capacity(staged.len());
        for record in &staged {
            match validator::check(record) {
                Ok(validated) => {
                    outcomes.push((record.reference(), ValidationOutcome::Valid));
                    valid.push(validated);
                }
                Err(reason) => {
                    let position = record.raw.position_label();
                    let unparseable = matches!(record.raw, RawRecord::Unparseable { .. });
                    rejections.push(
                        NewAuditEntry::new(
                            self.batch_id,
                            AuditEventKind::RecordRejected,
                            &self.actor,
                            format!("Rejected {} at {}: {}", entity, position, reason),
                        )
                        .with_detail(json!({
                            "staged_id": record.staged_id,
                            "source": source,
                            "position": position,
                            "code": if unparseable { "PARSE_ERROR" } else { "VALIDATION_ERROR" },
                        })),
                    );
                    outcome.errors.push(if unparseable {
                        RecordError::unparseable(&source, position, entity, reason.clone())
                    } else {
                        RecordError::validation(&source, position, entity, reason.clone())
                    });
                    outcomes.push((record.reference(), ValidationOutcome::Invalid { reason }));
                }
            }
        }
        let invalid = (count - valid.len()) as u64;

        if let Err(e) = self.staging.mark_outcomes(&outcomes).await {
            outcome.errors.clear();
            return self.failed(outcome, &source, entity, format!("recording validation failed: {}", e), started).await;
        }
        if let Err(e) = self.audit.record_many(&rejections).await {
            tracing::warn!(batch_id = %self.batch_id, chunk_index, "Failed to audit rejected records: {}", e);
        }

        match self.promote(&source, &valid).await {
            Ok(PromotionResult { succeeded, failed, errors }) => {
                outcome.statistics = BatchStatistics::new(succeeded, failed + invalid);
                outcome.errors.extend(errors);
                outcome.duration_ms = started.elapsed().as_millis() as u64;
                outcome
            }
            Err(e) => {
                // Validation errors stay reported; the valid records were not committed
                let message = format!("{} records not committed: {}", valid.len(), e);
                self.failed(outcome, &source, entity, message, started).await
            }
        }
    }

    async fn promote(&self, source: &str, valid: &[ValidatedRecord]) -> ImportResult<PromotionResult> {
        let mut attempt = 1;
        loop {
            match self.engine.promote(self.batch_id, source, &self.actor, valid).await {
                Err(e @ ImportError::LockTimeout { .. }) if attempt < PROMOTE_ATTEMPTS => {
                    tracing::warn!(batch_id = %self.batch_id, attempt, "Chunk commit waiting on lease: {}", e);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Whole chunk counted as failed with one chunk-level error
    async fn failed(
        &self,
        mut outcome: ChunkOutcome,
        source: &str,
        entity: EntityType,
        message: String,
        started: Instant,
    ) -> ChunkOutcome {
        tracing::warn!(
            batch_id = %self.batch_id,
            chunk_index = outcome.chunk_index,
            records = outcome.records,
            "Chunk failed: {}",
            message
        );

        let entry = NewAuditEntry::new(
            self.batch_id,
            AuditEventKind::ChunkFailed,
            &self.actor,
            format!("Chunk {} of {} failed", outcome.chunk_index, source),
        )
        .with_detail(json!({
            "chunk_index": outcome.chunk_index,
            "records": outcome.records,
            "message": message,
        }));
        if let Err(e) = self.audit.record(entry).await {
            tracing::warn!(batch_id = %self.batch_id, "Failed to audit chunk failure: {}", e);
        }

        outcome.statistics = BatchStatistics::new(0, outcome.records as u64);
        outcome.errors.push(RecordError::storage(
            source,
            format!("chunk {}", outcome.chunk_index),
            Some(entity),
            message.clone(),
        ));
        outcome.storage_failure = Some(message);
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        outcome
    }
}

/// Run a chunk on its own task; a crashed task becomes a failed chunk
fn dispatch(
    worker: ChunkWorker,
    chunk_index: usize,
    source: String,
    entity: EntityType,
    records: Vec<RawRecord>,
) -> BoxFuture<'static, ChunkOutcome> {
    let count = records.len();
    let handle = tokio::spawn(worker.process(chunk_index, source.clone(), entity, records));
    async move {
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("chunk worker failed: {}", e);
                ChunkOutcome {
                    chunk_index,
                    records: count,
                    statistics: BatchStatistics::new(0, count as u64),
                    errors: vec![RecordError::storage(
                        &source,
                        format!("chunk {}", chunk_index),
                        Some(entity),
                        message.clone(),
                    )],
                    storage_failure: Some(message),
                    duration_ms: 0,
                }
            }
        }
    }
    .boxed()
}

async fn open_blocking(input: SourceInput) -> ImportResult<BoxedRecordSource> {
    tokio::task::spawn_blocking(move || open_source(input.format, input.reader))
        .await
        .map_err(|e| ImportError::storage(format!("parser task failed: {}", e)))?
}

async fn read_blocking(
    mut source: BoxedRecordSource,
    max: usize,
) -> ImportResult<(BoxedRecordSource, ImportResult<Vec<RawRecord>>)> {
    tokio::task::spawn_blocking(move || {
        let chunk = read_chunk(source.as_mut(), max);
        (source, chunk)
    })
    .await
    .map_err(|e| ImportError::storage(format!("parser task failed: {}", e)))
}

pub struct ChunkProcessor {
    staging: StagingStore,
    audit: AuditLog,
    engine: Arc<PromotionEngine>,
    progress: Arc<ProgressRegistry>,
    gauge: Arc<dyn MemoryGauge>,
    params: Arc<ImportParameters>,
}

impl ChunkProcessor {
    pub fn new(
        staging: StagingStore,
        audit: AuditLog,
        engine: Arc<PromotionEngine>,
        progress: Arc<ProgressRegistry>,
        gauge: Arc<dyn MemoryGauge>,
        params: Arc<ImportParameters>,
    ) -> Self {
        Self {
            staging,
            audit,
            engine,
            progress,
            gauge,
            params,
        }
    }

    pub fn staging(&self) -> &StagingStore {
        &self.staging
    }

    /// Process every input of an admitted batch
    ///
    /// Never returns an error: fatal conditions end up in `RunOutcome::fatal`
    /// so the caller can still record them on the batch.
    pub async fn run(
        &self,
        batch: &ImportBatch,
        inputs: Vec<SourceInput>,
        cancel: &CancellationToken,
        tracker: &BatchTracker,
    ) -> RunOutcome {
        let batch_id = batch.batch_id;
        let fan_out = self.params.chunk_fan_out.max(1);
        let mut acc = RunAccumulator::new(&self.params);
        let mut sizer = AdaptiveChunkSizer::new(&self.params);
        let run_started = Instant::now();
        let mut next_chunk = 0usize;

        let worker = ChunkWorker {
            staging: self.staging.clone(),
            audit: self.audit.clone(),
            engine: Arc::clone(&self.engine),
            batch_id,
            actor: batch.actor.clone(),
        };

        self.progress.update_performance(batch_id, |p| {
            p.started_at = Some(Utc::now());
            p.current_chunk_size = sizer.current();
        });

        for input in inputs {
            if cancel.is_cancelled() {
                acc.outcome.cancelled = true;
                break;
            }

            let name = input.name.clone();
            let format = input.format;
            let entity = format.entity();
            acc.begin_source(&name, entity);
            tracing::debug!(batch_id = %batch_id, source = %name, entity = %entity, "Processing input");

            let mut source = match open_blocking(input).await {
                Ok(source) => source,
                Err(e) => {
                    acc.fail(&name, "header", &e);
                    break;
                }
            };
            for warning in source.warnings() {
                acc.warn(&name, warning);
            }

            let mut in_flight: FuturesUnordered<BoxFuture<'static, ChunkOutcome>> = FuturesUnordered::new();
            loop {
                if acc.outcome.fatal.is_some() {
                    break;
                }
                if cancel.is_cancelled() {
                    acc.outcome.cancelled = true;
                    break;
                }

                let decision = sizer.next_size(self.gauge.as_ref());
                if decision.changed() {
                    self.progress.record(ImportEvent::ChunkSizeAdjusted {
                        batch_id,
                        previous: decision.previous,
                        current: decision.current,
                        memory_headroom: decision.headroom.unwrap_or(1.0),
                        timestamp: Utc::now(),
                    });
                }
                self.progress.update_performance(batch_id, |p| {
                    p.current_chunk_size = decision.current;
                    p.memory_headroom = decision.headroom;
                    p.chunk_size_adjustments = sizer.adjustments();
                });

                let (returned, chunk) = match read_blocking(source, decision.current.max(1)).await {
                    Ok(read) => read,
                    Err(e) => {
                        acc.fail(&name, "input", &e);
                        break;
                    }
                };
                source = returned;

                let records = match chunk {
                    Ok(records) => records,
                    Err(e) => {
                        acc.fail(&name, &format!("chunk {}", next_chunk), &e);
                        break;
                    }
                };
                if records.is_empty() {
                    break;
                }
                // A cancel that arrived while reading still stops this chunk
                if cancel.is_cancelled() {
                    acc.outcome.cancelled = true;
                    break;
                }

                while in_flight.len() >= fan_out {
                    if let Some(done) = in_flight.next().await {
                        self.fold(&mut acc, done, batch_id, tracker, run_started).await;
                    }
                }
                if acc.outcome.fatal.is_some() {
                    break;
                }

                in_flight.push(dispatch(worker.clone(), next_chunk, name.clone(), entity, records));
                next_chunk += 1;
            }

            while let Some(done) = in_flight.next().await {
                self.fold(&mut acc, done, batch_id, tracker, run_started).await;
            }
            if acc.outcome.fatal.is_some() || acc.outcome.cancelled {
                break;
            }
        }

        let outcome = acc.finish();
        tracing::info!(
            batch_id = %batch_id,
            chunks = outcome.chunks,
            processed = outcome.statistics.processed,
            succeeded = outcome.statistics.succeeded,
            failed = outcome.statistics.failed,
            cancelled = outcome.cancelled,
            fatal = ?outcome.fatal,
            "Batch run finished"
        );
        outcome
    }

    /// Fold one outcome, publish progress and persist running totals
    async fn fold(
        &self,
        acc: &mut RunAccumulator,
        chunk: ChunkOutcome,
        batch_id: Uuid,
        tracker: &BatchTracker,
        run_started: Instant,
    ) {
        let event = ImportEvent::ChunkCompleted {
            batch_id,
            chunk_index: chunk.chunk_index,
            chunk_size: chunk.records,
            processed: chunk.statistics.processed,
            succeeded: chunk.statistics.succeeded,
            failed: chunk.statistics.failed,
            duration_ms: chunk.duration_ms,
            timestamp: Utc::now(),
        };
        let duration_ms = chunk.duration_ms;

        let stop = acc.absorb(chunk);
        if stop {
            tracing::error!(batch_id = %batch_id, fatal = ?acc.outcome.fatal, "Stopping batch run");
        }

        self.progress.record(event);
        let totals = acc.outcome.statistics;
        let chunks = acc.outcome.chunks as u64;
        self.progress.update_performance(batch_id, |p| {
            p.chunks_completed = chunks;
            p.records_processed = totals.processed;
            p.last_chunk_duration_ms = duration_ms;
            let secs = run_started.elapsed().as_secs_f64();
            p.records_per_second = if secs > 0.0 { totals.processed as f64 / secs } else { 0.0 };
        });

        match tracker.leases().acquire(batch_id, "statistics fold").await {
            Ok(lease) => {
                if let Err(e) = tracker
                    .update_statistics(&lease, batch_id, &totals, &acc.outcome.errors)
                    .await
                {
                    tracing::warn!(batch_id = %batch_id, "Failed to persist running statistics: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!(batch_id = %batch_id, "Skipped statistics write: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: usize, succeeded: u64, failed: u64, failure: Option<&str>) -> ChunkOutcome {
        ChunkOutcome {
            chunk_index: index,
            records: (succeeded + failed) as usize,
            statistics: BatchStatistics::new(succeeded, failed),
            errors: (0..failed)
                .map(|i| RecordError::validation("t.csv", format!("line {}", i), EntityType::Team, "bad".into()))
                .collect(),
            storage_failure: failure.map(str::to_string),
            duration_ms: 1,
        }
    }

    fn accumulator(max_errors: usize, max_chunk_failures: u32) -> RunAccumulator {
        let params = ImportParameters {
            max_reported_errors: max_errors,
            max_chunk_failures,
            ..ImportParameters::default()
        };
        let mut acc = RunAccumulator::new(&params);
        acc.begin_source("t.csv", EntityType::Team);
        acc
    }

    #[test]
    fn test_fold_is_commutative() {
        let chunks = vec![chunk(0, 5, 1, None), chunk(1, 3, 0, None), chunk(2, 0, 2, None)];

        let mut forward = accumulator(100, 3);
        for c in chunks.clone() {
            forward.absorb(c);
        }
        let mut reverse = accumulator(100, 3);
        for c in chunks.into_iter().rev() {
            reverse.absorb(c);
        }

        let (a, b) = (forward.finish(), reverse.finish());
        assert_eq!(a.statistics, b.statistics);
        assert_eq!(a.statistics, BatchStatistics::new(8, 3));
        assert_eq!(a.sources[0].error_count, 3);
        assert!(a.statistics.is_consistent());
    }

    #[test]
    fn test_error_list_is_capped() {
        let mut acc = accumulator(2, 3);
        acc.absorb(chunk(0, 0, 5, None));
        let outcome = acc.finish();
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.suppressed_errors, 3);
        assert!(outcome.warnings[0].message.contains("3 additional errors"));
    }

    #[test]
    fn test_first_chunk_failure_is_fatal() {
        let mut acc = accumulator(10, 3);
        assert!(!acc.absorb(chunk(1, 0, 4, Some("disk full"))));
        assert!(acc.absorb(chunk(0, 0, 4, Some("disk full"))));
        assert!(acc.outcome.fatal.as_deref().unwrap().contains("first chunk"));
    }

    #[test]
    fn test_repeated_chunk_failures_are_fatal() {
        let mut acc = accumulator(10, 2);
        assert!(!acc.absorb(chunk(3, 0, 1, Some("locked"))));
        assert!(!acc.absorb(chunk(4, 2, 0, None)));
        assert!(!acc.absorb(chunk(5, 0, 1, Some("locked"))));
        assert!(acc.absorb(chunk(6, 0, 1, Some("locked"))));
        assert!(acc.outcome.fatal.as_deref().unwrap().contains("2 consecutive"));
    }

    #[test]
    fn test_verdict() {
        let mut outcome = RunOutcome {
            statistics: BatchStatistics::new(0, 1),
            ..RunOutcome::default()
        };
        assert_eq!(outcome.verdict(1.0, None), (BatchStatus::Completed, None));

        let (status, reason) = outcome.verdict(0.5, None);
        assert_eq!(status, BatchStatus::Failed);
        assert!(reason.unwrap().contains("exceeds"));

        outcome.cancelled = true;
        assert_eq!(
            outcome.verdict(1.0, Some("cancelled by ops")),
            (BatchStatus::Failed, Some("cancelled by ops".to_string()))
        );

        outcome.fatal = Some("teams.csv: bad header".into());
        assert_eq!(outcome.verdict(1.0, None).1.as_deref(), Some("teams.csv: bad header"));
    }
}
