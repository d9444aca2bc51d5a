//! Tests for database initialization
//!
//! The import services rely on foreign keys and WAL being active on every
//! pooled connection, not only on the first one.

use tempfile::TempDir;
use umig_common::db::{open_database, PoolSettings};

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("sub").join("umig.db");

    let pool = open_database(&db_path, &PoolSettings::default()).await;
    assert!(pool.is_ok(), "Database initialization failed: {:?}", pool.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("umig.db");

    let pool1 = open_database(&db_path, &PoolSettings::default()).await.unwrap();
    sqlx::query("INSERT INTO settings (key, value) VALUES ('marker', '1')")
        .execute(&pool1)
        .await
        .unwrap();
    pool1.close().await;

    let pool2 = open_database(&db_path, &PoolSettings::default()).await.unwrap();
    let value: String = sqlx::query_scalar("SELECT value FROM settings WHERE key = 'marker'")
        .fetch_one(&pool2)
        .await
        .unwrap();
    assert_eq!(value, "1");
}

#[tokio::test]
async fn test_pragmas_apply_to_every_connection() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("umig.db");
    let settings = PoolSettings {
        max_connections: 4,
        min_connections: 4,
        ..Default::default()
    };
    let pool = open_database(&db_path, &settings).await.unwrap();

    // Hold several connections at once so each one is checked
    let mut connections = Vec::new();
    for _ in 0..4 {
        connections.push(pool.acquire().await.unwrap());
    }

    for conn in connections.iter_mut() {
        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&mut **conn)
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&mut **conn)
            .await
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
    }
}
