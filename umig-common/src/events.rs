//! Import event types and EventBus
//!
//! Events are broadcast on the EventBus for live listeners (SSE) and are also
//! appended to the per-batch progress journal so callers can poll for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Import lifecycle events
///
/// Status and kind values are carried as their wire strings (`IN_PROGRESS`,
/// `CSV_IMPORT`, ...) so this crate stays independent of the import models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ImportEvent {
    /// A submission was accepted and its batch record created
    BatchSubmitted {
        batch_id: Uuid,
        source: String,
        kind: String,
        actor: String,
        priority: i32,
        timestamp: DateTime<Utc>,
    },

    /// Concurrency cap reached; the batch waits in the priority queue
    BatchQueued {
        batch_id: Uuid,
        /// 1-based position in admission order at the time of queueing
        position: usize,
        timestamp: DateTime<Utc>,
    },

    /// The batch started processing
    BatchAdmitted {
        batch_id: Uuid,
        active_imports: usize,
        waited_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Submission refused because the queue is full (no batch was created)
    SubmissionRejected {
        source: String,
        actor: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// One chunk finished promotion (successfully or not)
    ChunkCompleted {
        batch_id: Uuid,
        chunk_index: usize,
        chunk_size: usize,
        processed: u64,
        succeeded: u64,
        failed: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Adaptive sizing changed the chunk size between chunks
    ChunkSizeAdjusted {
        batch_id: Uuid,
        previous: usize,
        current: usize,
        memory_headroom: f64,
        timestamp: DateTime<Utc>,
    },

    /// Cancellation was requested for an active or queued batch
    BatchCancelRequested {
        batch_id: Uuid,
        actor: String,
        timestamp: DateTime<Utc>,
    },

    /// The batch reached a terminal processing status
    BatchFinished {
        batch_id: Uuid,
        status: String,
        processed: u64,
        succeeded: u64,
        failed: u64,
        reason: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Batch status changed outside the processing run (administrative override)
    BatchStatusChanged {
        batch_id: Uuid,
        old_status: String,
        new_status: String,
        actor: String,
        timestamp: DateTime<Utc>,
    },

    /// Rollback removed the batch's promoted and staged data
    BatchRolledBack {
        batch_id: Uuid,
        records_deleted: u64,
        actor: String,
        timestamp: DateTime<Utc>,
    },
}

impl ImportEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            ImportEvent::BatchSubmitted { .. } => "BatchSubmitted",
            ImportEvent::BatchQueued { .. } => "BatchQueued",
            ImportEvent::BatchAdmitted { .. } => "BatchAdmitted",
            ImportEvent::SubmissionRejected { .. } => "SubmissionRejected",
            ImportEvent::ChunkCompleted { .. } => "ChunkCompleted",
            ImportEvent::ChunkSizeAdjusted { .. } => "ChunkSizeAdjusted",
            ImportEvent::BatchCancelRequested { .. } => "BatchCancelRequested",
            ImportEvent::BatchFinished { .. } => "BatchFinished",
            ImportEvent::BatchStatusChanged { .. } => "BatchStatusChanged",
            ImportEvent::BatchRolledBack { .. } => "BatchRolledBack",
        }
    }

    /// Batch the event belongs to (None for rejected submissions)
    pub fn batch_id(&self) -> Option<Uuid> {
        match self {
            ImportEvent::BatchSubmitted { batch_id, .. }
            | ImportEvent::BatchQueued { batch_id, .. }
            | ImportEvent::BatchAdmitted { batch_id, .. }
            | ImportEvent::ChunkCompleted { batch_id, .. }
            | ImportEvent::ChunkSizeAdjusted { batch_id, .. }
            | ImportEvent::BatchCancelRequested { batch_id, .. }
            | ImportEvent::BatchFinished { batch_id, .. }
            | ImportEvent::BatchStatusChanged { batch_id, .. }
            | ImportEvent::BatchRolledBack { batch_id, .. } => Some(*batch_id),
            ImportEvent::SubmissionRejected { .. } => None,
        }
    }
}

/// Broadcast bus for import events
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ImportEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ImportEvent,
    ) -> Result<usize, broadcast::error::SendError<ImportEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ImportEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
