//! Import tuning parameters
//!
//! Concurrency limits, chunk sizing and failure thresholds. Resolved once at
//! startup (see `crate::config`) and shared read-only afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportParameters {
    /// Batches allowed to process at once (default: 3)
    #[serde(default = "default_max_concurrent_imports")]
    pub max_concurrent_imports: usize,

    /// Requests held by the orchestrator, active plus waiting (default: 10)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Initial records per chunk (default: 1000)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    /// Chunks in flight per batch (default: 4)
    #[serde(default = "default_chunk_fan_out")]
    pub chunk_fan_out: usize,

    /// Shrink chunks when available memory fraction drops below this
    #[serde(default = "default_memory_low_watermark")]
    pub memory_low_watermark: f64,

    /// Grow chunks when available memory fraction is above this
    #[serde(default = "default_memory_high_watermark")]
    pub memory_high_watermark: f64,

    /// Growth step in percent when memory is ample (default: 25)
    #[serde(default = "default_chunk_growth_percent")]
    pub chunk_growth_percent: u32,

    /// Per-batch lease acquisition timeout (default: 5000ms)
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    /// Consecutive failed chunks that fail the whole batch (default: 3)
    #[serde(default = "default_max_chunk_failures")]
    pub max_chunk_failures: u32,

    /// Highest failed/processed ratio still reported as COMPLETED (default: 1.0)
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,

    /// Row errors kept on the batch record (default: 500)
    #[serde(default = "default_max_reported_errors")]
    pub max_reported_errors: usize,

    /// Retry window for "database is locked" (default: 5000ms)
    #[serde(default = "default_db_max_lock_wait_ms")]
    pub db_max_lock_wait_ms: u64,

    /// Progress journal entries kept per batch (default: 256)
    #[serde(default = "default_progress_history")]
    pub progress_history: usize,
}

/// Keys accepted in the settings table, `[import]` and `UMIG_IMPORT_*`
pub const PARAMETER_KEYS: [&str; 15] = [
    "max_concurrent_imports",
    "queue_capacity",
    "chunk_size",
    "min_chunk_size",
    "max_chunk_size",
    "chunk_fan_out",
    "memory_low_watermark",
    "memory_high_watermark",
    "chunk_growth_percent",
    "lease_timeout_ms",
    "max_chunk_failures",
    "max_failure_ratio",
    "max_reported_errors",
    "db_max_lock_wait_ms",
    "progress_history",
];

fn default_max_concurrent_imports() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    10
}

fn default_chunk_size() -> usize {
    1000
}

fn default_min_chunk_size() -> usize {
    100
}

fn default_max_chunk_size() -> usize {
    5000
}

fn default_chunk_fan_out() -> usize {
    4
}

fn default_memory_low_watermark() -> f64 {
    0.15
}

fn default_memory_high_watermark() -> f64 {
    0.40
}

fn default_chunk_growth_percent() -> u32 {
    25
}

fn default_lease_timeout_ms() -> u64 {
    5000
}

fn default_max_chunk_failures() -> u32 {
    3
}

fn default_max_failure_ratio() -> f64 {
    1.0
}

fn default_max_reported_errors() -> usize {
    500
}

fn default_db_max_lock_wait_ms() -> u64 {
    5000
}

fn default_progress_history() -> usize {
    256
}

impl Default for ImportParameters {
    fn default() -> Self {
        Self {
            max_concurrent_imports: default_max_concurrent_imports(),
            queue_capacity: default_queue_capacity(),
            chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            chunk_fan_out: default_chunk_fan_out(),
            memory_low_watermark: default_memory_low_watermark(),
            memory_high_watermark: default_memory_high_watermark(),
            chunk_growth_percent: default_chunk_growth_percent(),
            lease_timeout_ms: default_lease_timeout_ms(),
            max_chunk_failures: default_max_chunk_failures(),
            max_failure_ratio: default_max_failure_ratio(),
            max_reported_errors: default_max_reported_errors(),
            db_max_lock_wait_ms: default_db_max_lock_wait_ms(),
            progress_history: default_progress_history(),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("invalid value '{}' for {}", value, key))
}

impl ImportParameters {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    /// Set one parameter from its string form (settings table / env)
    pub fn set_from_str(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "max_concurrent_imports" => self.max_concurrent_imports = parse_value(key, value)?,
            "queue_capacity" => self.queue_capacity = parse_value(key, value)?,
            "chunk_size" => self.chunk_size = parse_value(key, value)?,
            "min_chunk_size" => self.min_chunk_size = parse_value(key, value)?,
            "max_chunk_size" => self.max_chunk_size = parse_value(key, value)?,
            "chunk_fan_out" => self.chunk_fan_out = parse_value(key, value)?,
            "memory_low_watermark" => self.memory_low_watermark = parse_value(key, value)?,
            "memory_high_watermark" => self.memory_high_watermark = parse_value(key, value)?,
            "chunk_growth_percent" => self.chunk_growth_percent = parse_value(key, value)?,
            "lease_timeout_ms" => self.lease_timeout_ms = parse_value(key, value)?,
            "max_chunk_failures" => self.max_chunk_failures = parse_value(key, value)?,
            "max_failure_ratio" => self.max_failure_ratio = parse_value(key, value)?,
            "max_reported_errors" => self.max_reported_errors = parse_value(key, value)?,
            "db_max_lock_wait_ms" => self.db_max_lock_wait_ms = parse_value(key, value)?,
            "progress_history" => self.progress_history = parse_value(key, value)?,
            other => return Err(format!("unknown import parameter '{}'", other)),
        }
        Ok(())
    }

    /// All parameters as (key, string value) pairs, in `PARAMETER_KEYS` order
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("max_concurrent_imports", self.max_concurrent_imports.to_string()),
            ("queue_capacity", self.queue_capacity.to_string()),
            ("chunk_size", self.chunk_size.to_string()),
            ("min_chunk_size", self.min_chunk_size.to_string()),
            ("max_chunk_size", self.max_chunk_size.to_string()),
            ("chunk_fan_out", self.chunk_fan_out.to_string()),
            ("memory_low_watermark", self.memory_low_watermark.to_string()),
            ("memory_high_watermark", self.memory_high_watermark.to_string()),
            ("chunk_growth_percent", self.chunk_growth_percent.to_string()),
            ("lease_timeout_ms", self.lease_timeout_ms.to_string()),
            ("max_chunk_failures", self.max_chunk_failures.to_string()),
            ("max_failure_ratio", self.max_failure_ratio.to_string()),
            ("max_reported_errors", self.max_reported_errors.to_string()),
            ("db_max_lock_wait_ms", self.db_max_lock_wait_ms.to_string()),
            ("progress_history", self.progress_history.to_string()),
        ]
    }

    /// Reject combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_imports == 0 {
            return Err("max_concurrent_imports must be at least 1".into());
        }
        if self.queue_capacity < self.max_concurrent_imports {
            return Err(format!(
                "queue_capacity ({}) must be >= max_concurrent_imports ({})",
                self.queue_capacity, self.max_concurrent_imports
            ));
        }
        if self.min_chunk_size == 0 {
            return Err("min_chunk_size must be at least 1".into());
        }
        if self.min_chunk_size > self.chunk_size || self.chunk_size > self.max_chunk_size {
            return Err(format!(
                "chunk sizes must satisfy min ({}) <= initial ({}) <= max ({})",
                self.min_chunk_size, self.chunk_size, self.max_chunk_size
            ));
        }
        if self.chunk_fan_out == 0 {
            return Err("chunk_fan_out must be at least 1".into());
        }
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.memory_low_watermark) || !in_unit(self.memory_high_watermark) {
            return Err("memory watermarks must be between 0 and 1".into());
        }
        if self.memory_low_watermark >= self.memory_high_watermark {
            return Err(format!(
                "memory_low_watermark ({}) must be below memory_high_watermark ({})",
                self.memory_low_watermark, self.memory_high_watermark
            ));
        }
        if self.chunk_growth_percent == 0 {
            return Err("chunk_growth_percent must be at least 1".into());
        }
        if self.lease_timeout_ms == 0 {
            return Err("lease_timeout_ms must be at least 1".into());
        }
        if self.max_chunk_failures == 0 {
            return Err("max_chunk_failures must be at least 1".into());
        }
        if !in_unit(self.max_failure_ratio) {
            return Err("max_failure_ratio must be between 0 and 1".into());
        }
        if self.progress_history == 0 {
            return Err("progress_history must be at least 1".into());
        }
        Ok(())
    }
}
