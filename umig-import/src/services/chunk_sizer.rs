//! Adaptive chunk sizing
//!
//! Chunk size shrinks when available memory falls below the low watermark and
//! grows gradually above the high watermark. Evaluated between chunks only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sysinfo::System;

use crate::models::ImportParameters;

/// Source of the available-memory fraction (0.0 to 1.0)
pub trait MemoryGauge: Send + Sync {
    /// `None` when the figure cannot be determined
    fn available_fraction(&self) -> Option<f64>;
}

/// Available over total physical memory, as reported by `sysinfo`
pub struct SystemMemoryGauge {
    system: Mutex<System>,
}

impl SystemMemoryGauge {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGauge for SystemMemoryGauge {
    fn available_fraction(&self) -> Option<f64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        memory_fraction(system.available_memory(), system.total_memory())
    }
}

fn memory_fraction(available: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((available as f64 / total as f64).clamp(0.0, 1.0))
}

/// Gauge returning a settable value
#[derive(Debug)]
pub struct FixedMemoryGauge {
    bits: AtomicU64,
}

impl FixedMemoryGauge {
    pub fn new(fraction: f64) -> Self {
        Self {
            bits: AtomicU64::new(fraction.to_bits()),
        }
    }

    pub fn set(&self, fraction: f64) {
        self.bits.store(fraction.to_bits(), Ordering::Relaxed);
    }
}

impl MemoryGauge for FixedMemoryGauge {
    fn available_fraction(&self) -> Option<f64> {
        Some(f64::from_bits(self.bits.load(Ordering::Relaxed)))
    }
}

/// Size decision for the next chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeDecision {
    pub previous: usize,
    pub current: usize,
    pub headroom: Option<f64>,
}

impl SizeDecision {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveChunkSizer {
    current: usize,
    min: usize,
    max: usize,
    low_watermark: f64,
    high_watermark: f64,
    growth_percent: u32,
    adjustments: u32,
}

impl AdaptiveChunkSizer {
    pub fn new(params: &ImportParameters) -> Self {
        Self {
            current: params.chunk_size.max(params.min_chunk_size).min(params.max_chunk_size),
            min: params.min_chunk_size,
            max: params.max_chunk_size,
            low_watermark: params.memory_low_watermark,
            high_watermark: params.memory_high_watermark,
            growth_percent: params.chunk_growth_percent,
            adjustments: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn adjustments(&self) -> u32 {
        self.adjustments
    }

    /// Decide the size of the next chunk from the current headroom
    ///
    /// Unknown headroom counts as ample.
    pub fn next_size(&mut self, gauge: &dyn MemoryGauge) -> SizeDecision {
        let previous = self.current;
        let headroom = gauge.available_fraction();
        let effective = headroom.unwrap_or(1.0);

        if effective < self.low_watermark {
            self.current = (self.current / 2).max(self.min);
        } else if effective > self.high_watermark {
            let step = (self.current * self.growth_percent as usize / 100).max(1);
            self.current = (self.current + step).min(self.max);
        }

        if self.current != previous {
            self.adjustments += 1;
        }
        SizeDecision {
            previous,
            current: self.current,
            headroom,
        }
    }
}
