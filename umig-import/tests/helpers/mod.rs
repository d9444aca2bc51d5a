//! Shared setup for umig-import integration tests

#![allow(dead_code)]

use sqlx::SqlitePool;
use std::io::{BufRead, Cursor, Read};
use std::sync::{Arc, Condvar, Mutex};
use tempfile::TempDir;
use umig_common::events::EventBus;
use umig_import::models::ImportParameters;
use umig_import::services::{FixedMemoryGauge, ImportService};

pub const ACTOR: &str = "tester";

/// Service over a fresh database in a temp dir
///
/// Keep the struct alive for the whole test; dropping it removes the database.
pub struct TestEnv {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub service: ImportService,
    pub gauge: Arc<FixedMemoryGauge>,
}

/// Small chunks so short inputs still span several chunks
pub fn test_parameters() -> ImportParameters {
    ImportParameters {
        chunk_size: 10,
        min_chunk_size: 2,
        max_chunk_size: 50,
        chunk_fan_out: 2,
        lease_timeout_ms: 2000,
        db_max_lock_wait_ms: 2000,
        ..ImportParameters::default()
    }
}

pub async fn test_env() -> TestEnv {
    test_env_with(test_parameters()).await
}

pub async fn test_env_with(params: ImportParameters) -> TestEnv {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("umig-import-test.db");
    let pool = umig_import::db::init_database_pool(&db_path)
        .await
        .expect("Failed to open test database");

    // Between the watermarks: chunk size stays put unless a test moves it
    let gauge = Arc::new(FixedMemoryGauge::new(0.25));
    let service = ImportService::with_gauge(pool.clone(), params, EventBus::new(1024), gauge.clone())
        .expect("Failed to build import service");

    TestEnv {
        dir,
        pool,
        service,
        gauge,
    }
}

/// Teams CSV with `count` rows named `{prefix}-{n}`
pub fn teams_csv(prefix: &str, count: usize) -> String {
    let mut csv = String::from("team_name,team_description,team_email\n");
    for n in 0..count {
        csv.push_str(&format!("{prefix}-{n},Team {n},team{n}@example.com\n"));
    }
    csv
}

/// Users CSV with `count` rows, all members of `team`
pub fn users_csv(prefix: &str, count: usize, team: &str) -> String {
    let mut csv = String::from("user_code,first_name,last_name,user_email,team_name\n");
    for n in 0..count {
        csv.push_str(&format!("{prefix}{n},First{n},Last{n},{prefix}.{n}@example.com,{team}\n"));
    }
    csv
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .expect("count query failed");
    count
}

/// Opens every reader created from it, once
///
/// Dropping the gate opens it so blocked parser threads never outlive a test.
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn open(&self) {
        let (open, signal) = &*self.state;
        *open.lock().unwrap() = true;
        signal.notify_all();
    }

    /// Reader over `text` that blocks until the gate opens
    pub fn reader(&self, text: impl Into<String>) -> Box<dyn BufRead + Send> {
        Box::new(GatedReader {
            inner: Cursor::new(text.into().into_bytes()),
            state: Arc::clone(&self.state),
            passed: false,
        })
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        self.open();
    }
}

struct GatedReader {
    inner: Cursor<Vec<u8>>,
    state: Arc<(Mutex<bool>, Condvar)>,
    passed: bool,
}

impl GatedReader {
    fn wait(&mut self) {
        if self.passed {
            return;
        }
        let (open, signal) = &*self.state;
        let mut guard = open.lock().unwrap();
        while !*guard {
            guard = signal.wait(guard).unwrap();
        }
        self.passed = true;
    }
}

impl Read for GatedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.wait();
        self.inner.read(buf)
    }
}

impl BufRead for GatedReader {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.wait();
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}
