//! Import parameters persisted in the settings table

use serial_test::serial;
use tempfile::TempDir;
use umig_common::config::TomlConfig;
use umig_import::config::{env_var_name, resolve_import_parameters};
use umig_import::db::settings::{load_parameter_overrides, save_import_parameters};
use umig_import::models::{ImportParameters, PARAMETER_KEYS};

async fn test_pool() -> (TempDir, sqlx::SqlitePool) {
    let dir = TempDir::new().unwrap();
    let pool = umig_import::db::init_database_pool(&dir.path().join("settings.db"))
        .await
        .unwrap();
    (dir, pool)
}

fn clear_env() {
    for key in PARAMETER_KEYS {
        std::env::remove_var(env_var_name(key));
    }
}

#[tokio::test]
async fn test_saved_parameters_load_back() {
    let (_dir, pool) = test_pool().await;
    let params = ImportParameters {
        chunk_size: 400,
        max_failure_ratio: 0.1,
        ..ImportParameters::default()
    };
    save_import_parameters(&pool, &params).await.unwrap();

    let stored = load_parameter_overrides(&pool).await.unwrap();
    assert_eq!(stored.len(), PARAMETER_KEYS.len());
    assert_eq!(stored.get("chunk_size").map(String::as_str), Some("400"));
}

#[tokio::test]
async fn test_invalid_parameters_are_not_saved() {
    let (_dir, pool) = test_pool().await;
    let params = ImportParameters {
        min_chunk_size: 2000,
        chunk_size: 1000,
        ..ImportParameters::default()
    };
    assert!(save_import_parameters(&pool, &params).await.is_err());
    assert!(load_parameter_overrides(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_settings_are_ignored() {
    let (_dir, pool) = test_pool().await;
    sqlx::query("INSERT INTO settings (key, value) VALUES ('import.turbo', '1'), ('theme', 'dark')")
        .execute(&pool)
        .await
        .unwrap();
    assert!(load_parameter_overrides(&pool).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_database_beats_env_beats_toml() {
    clear_env();
    let (_dir, pool) = test_pool().await;

    let mut toml_config = TomlConfig::default();
    toml_config.import = Some(toml::from_str("chunk_size = 500\nchunk_fan_out = 2\nqueue_capacity = 8").unwrap());
    std::env::set_var("UMIG_IMPORT_CHUNK_SIZE", "600");
    std::env::set_var("UMIG_IMPORT_CHUNK_FAN_OUT", "3");
    sqlx::query("INSERT INTO settings (key, value) VALUES ('import.chunk_size', '700')")
        .execute(&pool)
        .await
        .unwrap();

    let params = resolve_import_parameters(&pool, &toml_config).await.unwrap();
    clear_env();

    assert_eq!(params.chunk_size, 700);
    assert_eq!(params.chunk_fan_out, 3);
    assert_eq!(params.queue_capacity, 8);
    assert_eq!(params.max_concurrent_imports, 3);
}

#[tokio::test]
#[serial]
async fn test_inconsistent_resolution_is_rejected() {
    clear_env();
    let (_dir, pool) = test_pool().await;
    sqlx::query("INSERT INTO settings (key, value) VALUES ('import.queue_capacity', '1')")
        .execute(&pool)
        .await
        .unwrap();

    let err = resolve_import_parameters(&pool, &TomlConfig::default()).await.unwrap_err();
    assert!(err.to_string().contains("queue_capacity"), "{err}");
}
