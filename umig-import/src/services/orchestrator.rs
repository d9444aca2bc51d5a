//! Orchestrator
//!
//! Admission control across batches. At most `max_concurrent_imports`
//! batches run at once; further submissions wait in a priority queue
//! (higher priority first, then submission order). A submission is refused
//! with `QueueFull` once `active + waiting` reaches `queue_capacity`.
//!
//! Each admitted batch runs on its own task with its own chunk fan-out, so
//! a failing batch never stalls the others.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use umig_common::events::ImportEvent;
use uuid::Uuid;

use super::audit_log::AuditLog;
use super::batch_tracker::BatchTracker;
use super::chunk_processor::{ChunkProcessor, RunOutcome};
use super::progress::{PerformanceSnapshot, ProgressRegistry};
use super::promotion_engine::PromotionEngine;
use crate::error::{ImportError, ImportResult};
use crate::models::{
    AuditEventKind, BatchStatus, ImportBatch, ImportParameters, ImportRequest, NewAuditEntry,
    RecordError, RollbackResult, SourceResult,
};

/// Lease attempts when recording the end of a run
const FINALIZE_ATTEMPTS: u32 = 3;

/// Final state of a batch run as seen by the submitter
#[derive(Debug, Clone)]
pub struct RunReport {
    pub batch: ImportBatch,
    pub errors: Vec<RecordError>,
    pub warnings: Vec<RecordError>,
    pub sources: Vec<SourceResult>,
}

type ReportSlot = Option<Arc<RunReport>>;

/// Handle returned by `submit`
#[derive(Debug)]
pub struct Submission {
    pub batch_id: Uuid,
    pub queued: bool,
    done: watch::Receiver<ReportSlot>,
}

impl Submission {
    /// Wait for the batch to reach a terminal status
    pub async fn wait(mut self) -> ImportResult<Arc<RunReport>> {
        wait_for_report(&mut self.done, self.batch_id).await
    }
}

async fn wait_for_report(done: &mut watch::Receiver<ReportSlot>, batch_id: Uuid) -> ImportResult<Arc<RunReport>> {
    let slot = done
        .wait_for(Option::is_some)
        .await
        .map_err(|_| ImportError::storage(format!("run of batch {} ended without a report", batch_id)))?;
    slot.clone()
        .ok_or_else(|| ImportError::storage(format!("run of batch {} ended without a report", batch_id)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Was waiting; removed and marked `FAILED`
    RemovedFromQueue,
    /// Was running; stops after its in-flight chunks
    StopRequested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveImportSummary {
    pub batch_id: Uuid,
    pub source: String,
    pub actor: String,
    pub admitted_at: Option<DateTime<Utc>>,
    pub cancelling: bool,
    pub performance: Option<PerformanceSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedImportSummary {
    pub batch_id: Uuid,
    pub source: String,
    pub actor: String,
    pub priority: i32,
    /// 1-based admission order
    pub position: usize,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSnapshot {
    pub max_concurrent_imports: usize,
    pub queue_capacity: usize,
    pub active: Vec<ActiveImportSummary>,
    pub queued: Vec<QueuedImportSummary>,
    /// Batches with a live lease entry
    pub tracked_leases: usize,
}

/// Everything needed to start a batch run
struct Admission {
    batch: ImportBatch,
    request: ImportRequest,
    cancel: CancellationToken,
    done: watch::Sender<ReportSlot>,
    priority: i32,
    seq: u64,
    queued_at: Instant,
    queued_at_wall: DateTime<Utc>,
}

impl PartialEq for Admission {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Admission {}

impl PartialOrd for Admission {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Admission {
    /// Max-heap order: higher priority, then earlier submission
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Tracked {
    source: String,
    actor: String,
    cancel: CancellationToken,
    cancel_reason: Option<String>,
    done: watch::Receiver<ReportSlot>,
    admitted_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct AdmissionState {
    active: HashSet<Uuid>,
    waiting: BinaryHeap<Admission>,
    tracked: HashMap<Uuid, Tracked>,
    /// Accepted submissions whose batch record is still being created
    reserved: usize,
    next_seq: u64,
}

impl AdmissionState {
    fn held(&self) -> usize {
        self.active.len() + self.waiting.len() + self.reserved
    }

    fn remove_waiting(&mut self, batch_id: Uuid) -> Option<Admission> {
        let mut items = std::mem::take(&mut self.waiting).into_vec();
        let found = items
            .iter()
            .position(|a| a.batch.batch_id == batch_id)
            .map(|idx| items.swap_remove(idx));
        self.waiting = items.into();
        found
    }
}

struct Inner {
    params: Arc<ImportParameters>,
    tracker: Arc<BatchTracker>,
    engine: Arc<PromotionEngine>,
    processor: Arc<ChunkProcessor>,
    progress: Arc<ProgressRegistry>,
    audit: AuditLog,
    state: Mutex<AdmissionState>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        params: Arc<ImportParameters>,
        tracker: Arc<BatchTracker>,
        engine: Arc<PromotionEngine>,
        processor: Arc<ChunkProcessor>,
        progress: Arc<ProgressRegistry>,
        audit: AuditLog,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                params,
                tracker,
                engine,
                processor,
                progress,
                audit,
                state: Mutex::new(AdmissionState::default()),
            }),
        }
    }

    /// Admit or queue a request
    ///
    /// Refused requests create no batch record.
    pub async fn submit(&self, request: ImportRequest) -> ImportResult<Submission> {
        if request.inputs.is_empty() {
            return Err(ImportError::InvalidInput("import request has no inputs".into()));
        }
        if let Some(ratio) = request.max_failure_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ImportError::InvalidInput(format!(
                    "max_failure_ratio must be within 0..=1, got {}",
                    ratio
                )));
            }
        }

        let inner = &self.inner;
        let capacity = inner.params.queue_capacity;
        {
            let mut state = inner.state.lock().await;
            if state.held() >= capacity {
                tracing::warn!(
                    source = %request.source,
                    actor = %request.actor,
                    active = state.active.len(),
                    waiting = state.waiting.len(),
                    "Import rejected: queue full"
                );
                drop(state);
                inner.progress.record(ImportEvent::SubmissionRejected {
                    source: request.source.clone(),
                    actor: request.actor.clone(),
                    reason: format!("queue full ({} requests held)", capacity),
                    timestamp: Utc::now(),
                });
                return Err(ImportError::QueueFull { capacity });
            }
            state.reserved += 1;
        }

        // The reserved slot keeps capacity accounted while the record is written
        let batch = match inner
            .tracker
            .create_batch(request.kind, &request.source, &request.actor)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                inner.state.lock().await.reserved -= 1;
                return Err(e);
            }
        };
        let batch_id = batch.batch_id;
        inner.progress.record(ImportEvent::BatchSubmitted {
            batch_id,
            source: request.source.clone(),
            kind: request.kind.to_string(),
            actor: request.actor.clone(),
            priority: request.priority,
            timestamp: Utc::now(),
        });

        let (done_tx, done_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let actor = request.actor.clone();
        let priority = request.priority;

        let mut state = inner.state.lock().await;
        state.reserved -= 1;
        state.tracked.insert(
            batch_id,
            Tracked {
                source: request.source.clone(),
                actor: request.actor.clone(),
                cancel: cancel.clone(),
                cancel_reason: None,
                done: done_rx.clone(),
                admitted_at: None,
            },
        );

        state.next_seq += 1;
        let admission = Admission {
            priority,
            seq: state.next_seq,
            batch,
            request,
            cancel,
            done: done_tx,
            queued_at: Instant::now(),
            queued_at_wall: Utc::now(),
        };

        let queued = state.active.len() >= inner.params.max_concurrent_imports;
        if !queued {
            inner.start(&mut state, admission);
            return Ok(Submission {
                batch_id,
                queued,
                done: done_rx,
            });
        }

        let position = state.waiting.iter().filter(|a| a.priority >= priority).count() + 1;
        state.waiting.push(admission);
        drop(state);

        if let Err(e) = inner
            .audit
            .record(
                NewAuditEntry::new(
                    batch_id,
                    AuditEventKind::BatchQueued,
                    &actor,
                    format!("Queued at position {}", position),
                )
                .with_detail(json!({ "position": position, "priority": priority })),
            )
            .await
        {
            tracing::warn!(batch_id = %batch_id, "Failed to audit queueing: {}", e);
        }
        inner.progress.record(ImportEvent::BatchQueued {
            batch_id,
            position,
            timestamp: Utc::now(),
        });
        tracing::info!(batch_id = %batch_id, position, priority, "Import queued");

        Ok(Submission {
            batch_id,
            queued,
            done: done_rx,
        })
    }

    /// Stop a queued or running batch
    pub async fn cancel(&self, batch_id: Uuid, actor: &str) -> ImportResult<CancelOutcome> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if let Some(admission) = state.remove_waiting(batch_id) {
            state.tracked.remove(&batch_id);
            drop(state);

            inner.record_cancel(batch_id, actor, "queued").await;
            let reason = format!("cancelled before admission by {}", actor);
            let report = inner
                .finalize(&admission.batch, &RunOutcome::default(), BatchStatus::Failed, Some(reason))
                .await;
            inner.tracker.leases().forget(batch_id);
            let _ = admission.done.send(Some(Arc::new(report)));
            tracing::info!(batch_id = %batch_id, actor, "Queued import cancelled");
            return Ok(CancelOutcome::RemovedFromQueue);
        }

        if state.active.contains(&batch_id) {
            if let Some(tracked) = state.tracked.get_mut(&batch_id) {
                if tracked.cancel_reason.is_none() {
                    tracked.cancel_reason = Some(format!("cancelled by {}", actor));
                }
                tracked.cancel.cancel();
            }
            drop(state);

            inner.record_cancel(batch_id, actor, "running").await;
            tracing::info!(batch_id = %batch_id, actor, "Cancellation requested for running import");
            return Ok(CancelOutcome::StopRequested);
        }
        drop(state);

        let batch = inner.tracker.get(batch_id).await?;
        Err(ImportError::InvalidTransition {
            batch_id,
            from: batch.status,
            to: BatchStatus::Failed,
        })
    }

    /// Wait until the batch is no longer queued or running, then return it
    pub async fn wait(&self, batch_id: Uuid) -> ImportResult<ImportBatch> {
        let done = {
            let state = self.inner.state.lock().await;
            state.tracked.get(&batch_id).map(|t| t.done.clone())
        };
        if let Some(mut done) = done {
            wait_for_report(&mut done, batch_id).await?;
        }
        self.inner.tracker.get(batch_id).await
    }

    /// Roll back a batch, cancelling it first if it is still queued or running
    pub async fn rollback(&self, batch_id: Uuid, reason: Option<&str>, actor: &str) -> ImportResult<RollbackResult> {
        if self.is_tracked(batch_id).await {
            match self.cancel(batch_id, actor).await {
                // Finished between the check and the cancel
                Ok(_) | Err(ImportError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
            self.wait(batch_id).await?;
        }

        let result = self.inner.engine.rollback(batch_id, reason, actor).await?;
        if !result.already_rolled_back {
            self.inner.progress.record(ImportEvent::BatchRolledBack {
                batch_id,
                records_deleted: result.records_deleted,
                actor: actor.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(result)
    }

    /// Queued or running
    pub async fn is_tracked(&self, batch_id: Uuid) -> bool {
        self.inner.state.lock().await.tracked.contains_key(&batch_id)
    }

    pub async fn snapshot(&self) -> OrchestratorSnapshot {
        let inner = &self.inner;
        let state = inner.state.lock().await;

        let mut active: Vec<ActiveImportSummary> = state
            .active
            .iter()
            .filter_map(|id| state.tracked.get(id).map(|t| (id, t)))
            .map(|(id, t)| ActiveImportSummary {
                batch_id: *id,
                source: t.source.clone(),
                actor: t.actor.clone(),
                admitted_at: t.admitted_at,
                cancelling: t.cancel.is_cancelled(),
                performance: inner.progress.performance(*id),
            })
            .collect();
        active.sort_by_key(|a| a.admitted_at);

        let mut waiting: Vec<&Admission> = state.waiting.iter().collect();
        waiting.sort_by(|a, b| b.cmp(a));
        let queued = waiting
            .into_iter()
            .enumerate()
            .map(|(idx, a)| QueuedImportSummary {
                batch_id: a.batch.batch_id,
                source: a.batch.source.clone(),
                actor: a.batch.actor.clone(),
                priority: a.priority,
                position: idx + 1,
                queued_at: a.queued_at_wall,
            })
            .collect();

        OrchestratorSnapshot {
            max_concurrent_imports: inner.params.max_concurrent_imports,
            queue_capacity: inner.params.queue_capacity,
            active,
            queued,
            tracked_leases: inner.tracker.leases().tracked(),
        }
    }

    /// Cancel everything and wait for running batches to stop
    pub async fn shutdown(&self, actor: &str) {
        let ids: Vec<Uuid> = {
            let state = self.inner.state.lock().await;
            state.tracked.keys().copied().collect()
        };
        if ids.is_empty() {
            return;
        }
        tracing::info!(batches = ids.len(), "Cancelling imports for shutdown");

        for batch_id in &ids {
            if let Err(e) = self.cancel(*batch_id, actor).await {
                tracing::debug!(batch_id = %batch_id, "Shutdown cancel skipped: {}", e);
            }
        }
        for batch_id in ids {
            if let Err(e) = self.wait(batch_id).await {
                tracing::warn!(batch_id = %batch_id, "Import did not stop cleanly: {}", e);
            }
        }
    }
}

impl Inner {
    /// Mark admitted and spawn the run; caller holds the state lock
    /// Mark a batch active and spawn its run; no I/O under the admission lock
    fn start(self: &Arc<Self>, state: &mut AdmissionState, admission: Admission) {
        let batch_id = admission.batch.batch_id;
        state.active.insert(batch_id);
        if let Some(tracked) = state.tracked.get_mut(&batch_id) {
            tracked.admitted_at = Some(Utc::now());
        }
        let active_imports = state.active.len();
        tokio::spawn(Arc::clone(self).run_batch(admission, active_imports));
    }

    async fn record_admission(&self, batch: &ImportBatch, waited_ms: u64, active_imports: usize) {
        let batch_id = batch.batch_id;
        if let Err(e) = self
            .audit
            .record(
                NewAuditEntry::new(
                    batch_id,
                    AuditEventKind::BatchAdmitted,
                    &batch.actor,
                    format!("Admitted after {} ms", waited_ms),
                )
                .with_detail(json!({ "waited_ms": waited_ms, "active_imports": active_imports })),
            )
            .await
        {
            tracing::warn!(batch_id = %batch_id, "Failed to audit admission: {}", e);
        }
        self.progress.record(ImportEvent::BatchAdmitted {
            batch_id,
            active_imports,
            waited_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(batch_id = %batch_id, active_imports, waited_ms, "Import admitted");
    }

    /// Whole life of an admitted batch
    fn run_batch(self: Arc<Self>, admission: Admission, active_imports: usize) -> BoxFuture<'static, ()> {
        async move {
            let waited_ms = admission.queued_at.elapsed().as_millis() as u64;
            let Admission {
                batch,
                request,
                cancel,
                done,
                ..
            } = admission;
            let batch_id = batch.batch_id;
            self.record_admission(&batch, waited_ms, active_imports).await;
            let max_failure_ratio = request.max_failure_ratio.unwrap_or(self.params.max_failure_ratio);

            let outcome = self
                .processor
                .run(&batch, request.inputs, &cancel, &self.tracker)
                .await;

            let cancel_reason = {
                let state = self.state.lock().await;
                state.tracked.get(&batch_id).and_then(|t| t.cancel_reason.clone())
            };
            let (status, reason) = outcome.verdict(max_failure_ratio, cancel_reason.as_deref());
            let report = self.finalize(&batch, &outcome, status, reason).await;

            self.complete(batch_id).await;
            let _ = done.send(Some(Arc::new(report)));
        }
        .boxed()
    }

    /// Persist final statistics and status; reports whatever was recorded
    async fn finalize(
        &self,
        batch: &ImportBatch,
        outcome: &RunOutcome,
        status: BatchStatus,
        reason: Option<String>,
    ) -> RunReport {
        let batch_id = batch.batch_id;
        let mut attempt = 1;
        let lease = loop {
            match self.tracker.leases().acquire(batch_id, "finish batch").await {
                Ok(lease) => break Some(lease),
                Err(e) if e.is_retryable() && attempt < FINALIZE_ATTEMPTS => attempt += 1,
                Err(e) => {
                    tracing::error!(batch_id = %batch_id, "Could not lease batch to record its end: {}", e);
                    break None;
                }
            }
        };

        if let Some(lease) = &lease {
            if let Err(e) = self
                .tracker
                .update_statistics(lease, batch_id, &outcome.statistics, &outcome.errors)
                .await
            {
                tracing::error!(batch_id = %batch_id, "Failed to record final statistics: {}", e);
            }
            if let Err(e) = self
                .tracker
                .transition(lease, batch_id, status, reason.as_deref(), &batch.actor)
                .await
            {
                tracing::error!(batch_id = %batch_id, to = %status, "Failed to record final status: {}", e);
            }
        }
        drop(lease);

        if status == BatchStatus::Failed {
            if let Err(e) = self.processor.staging().purge(batch_id).await {
                tracing::warn!(batch_id = %batch_id, "Failed to purge staging of failed batch: {}", e);
            }
        }

        let recorded = match self.tracker.get(batch_id).await {
            Ok(recorded) => recorded,
            Err(e) => {
                tracing::error!(batch_id = %batch_id, "Failed to reload batch: {}", e);
                let mut fallback = batch.clone();
                fallback.status = status;
                fallback.statistics = outcome.statistics;
                fallback.status_reason = reason.clone();
                fallback
            }
        };

        self.progress.record(ImportEvent::BatchFinished {
            batch_id,
            status: recorded.status.to_string(),
            processed: recorded.statistics.processed,
            succeeded: recorded.statistics.succeeded,
            failed: recorded.statistics.failed,
            reason: recorded.status_reason.clone(),
            duration_ms: recorded.elapsed_ms(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            batch_id = %batch_id,
            status = %recorded.status,
            processed = recorded.statistics.processed,
            succeeded = recorded.statistics.succeeded,
            failed = recorded.statistics.failed,
            "Import finished"
        );

        RunReport {
            batch: recorded,
            errors: outcome.errors.clone(),
            warnings: outcome.warnings.clone(),
            sources: outcome.sources.clone(),
        }
    }

    /// Release the slot of a finished batch and admit waiting ones
    async fn complete(self: &Arc<Self>, batch_id: Uuid) {
        let mut state = self.state.lock().await;
        state.active.remove(&batch_id);
        state.tracked.remove(&batch_id);
        self.tracker.leases().forget(batch_id);

        while state.active.len() < self.params.max_concurrent_imports {
            let Some(next) = state.waiting.pop() else {
                break;
            };
            self.start(&mut state, next);
        }
    }

    async fn record_cancel(&self, batch_id: Uuid, actor: &str, phase: &str) {
        if let Err(e) = self
            .audit
            .record(
                NewAuditEntry::new(
                    batch_id,
                    AuditEventKind::BatchCancelled,
                    actor,
                    format!("Cancellation requested while {}", phase),
                )
                .with_detail(json!({ "phase": phase })),
            )
            .await
        {
            tracing::warn!(batch_id = %batch_id, "Failed to audit cancellation: {}", e);
        }
        self.progress.record(ImportEvent::BatchCancelRequested {
            batch_id,
            actor: actor.to_string(),
            timestamp: Utc::now(),
        });
    }
}
