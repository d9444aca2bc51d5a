//! Progress journal and performance snapshots
//!
//! Every lifecycle event is broadcast on the EventBus and appended to a
//! bounded per-batch journal, so callers without a live connection can poll
//! with `after_seq`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use umig_common::events::{EventBus, ImportEvent};
use uuid::Uuid;

/// Journals of finished batches kept before the oldest is evicted
const MAX_FINISHED_JOURNALS: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub seq: u64,
    pub event: ImportEvent,
}

/// Throughput figures of one batch run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub chunks_completed: u64,
    pub records_processed: u64,
    pub records_per_second: f64,
    pub current_chunk_size: usize,
    pub memory_headroom: Option<f64>,
    pub last_chunk_duration_ms: u64,
    pub chunk_size_adjustments: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub batch_id: Uuid,
    pub entries: Vec<ProgressEntry>,
    /// Highest sequence number recorded so far (0 when none)
    pub last_seq: u64,
    /// Entries older than this were dropped from the journal
    pub oldest_seq: u64,
    pub finished: bool,
    pub performance: PerformanceSnapshot,
}

#[derive(Debug, Default)]
struct BatchJournal {
    entries: VecDeque<ProgressEntry>,
    next_seq: u64,
    finished: bool,
    performance: PerformanceSnapshot,
}

#[derive(Debug, Default)]
struct Journals {
    batches: HashMap<Uuid, BatchJournal>,
    finished_order: VecDeque<Uuid>,
}

pub struct ProgressRegistry {
    bus: EventBus,
    capacity: usize,
    journals: Mutex<Journals>,
}

impl ProgressRegistry {
    pub fn new(bus: EventBus, capacity: usize) -> Self {
        Self {
            bus,
            capacity: capacity.max(1),
            journals: Mutex::new(Journals::default()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Journals> {
        self.journals.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the batch journal and broadcast
    ///
    /// Events without a batch (rejected submissions) are broadcast only.
    pub fn record(&self, event: ImportEvent) {
        if let Some(batch_id) = event.batch_id() {
            let mut journals = self.lock();
            let journal = journals.batches.entry(batch_id).or_default();
            journal.next_seq += 1;
            let seq = journal.next_seq;
            if journal.entries.len() >= self.capacity {
                journal.entries.pop_front();
            }
            let finished = matches!(
                event,
                ImportEvent::BatchFinished { .. }
                    | ImportEvent::BatchRolledBack { .. }
                    | ImportEvent::BatchStatusChanged { .. }
            );
            journal.entries.push_back(ProgressEntry {
                seq,
                event: event.clone(),
            });

            if finished && !journal.finished {
                journal.finished = true;
                journals.finished_order.push_back(batch_id);
                while journals.finished_order.len() > MAX_FINISHED_JOURNALS {
                    if let Some(evicted) = journals.finished_order.pop_front() {
                        journals.batches.remove(&evicted);
                    }
                }
            }
        }
        self.bus.emit_lossy(event);
    }

    /// Replace the performance snapshot of a batch
    pub fn update_performance(&self, batch_id: Uuid, update: impl FnOnce(&mut PerformanceSnapshot)) {
        let mut journals = self.lock();
        let journal = journals.batches.entry(batch_id).or_default();
        update(&mut journal.performance);
        journal.performance.updated_at = Some(Utc::now());
    }

    pub fn performance(&self, batch_id: Uuid) -> Option<PerformanceSnapshot> {
        self.lock().batches.get(&batch_id).map(|j| j.performance.clone())
    }

    /// Entries with `seq > after_seq`
    pub fn report(&self, batch_id: Uuid, after_seq: u64) -> Option<ProgressReport> {
        let journals = self.lock();
        let journal = journals.batches.get(&batch_id)?;
        Some(ProgressReport {
            batch_id,
            entries: journal
                .entries
                .iter()
                .filter(|entry| entry.seq > after_seq)
                .cloned()
                .collect(),
            last_seq: journal.next_seq,
            oldest_seq: journal.entries.front().map(|e| e.seq).unwrap_or(journal.next_seq),
            finished: journal.finished,
            performance: journal.performance.clone(),
        })
    }

    pub fn forget(&self, batch_id: Uuid) {
        let mut journals = self.lock();
        journals.batches.remove(&batch_id);
        journals.finished_order.retain(|id| *id != batch_id);
    }
}
