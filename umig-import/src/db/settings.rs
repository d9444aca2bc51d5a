//! Import parameter persistence in the settings table
//!
//! Keys are stored with an `import.` prefix next to any other settings.

use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::error::{ImportError, ImportResult};
use crate::models::{ImportParameters, PARAMETER_KEYS};

const KEY_PREFIX: &str = "import.";

/// Raw values of every import parameter present in the table
pub async fn load_parameter_overrides(pool: &SqlitePool) -> ImportResult<HashMap<String, String>> {
    let rows: Vec<(String, Option<String>)> =
        sqlx::query_as("SELECT key, value FROM settings WHERE key LIKE 'import.%'")
            .fetch_all(pool)
            .await?;

    let mut overrides = HashMap::new();
    for (key, value) in rows {
        let Some(name) = key.strip_prefix(KEY_PREFIX) else {
            continue;
        };
        if !PARAMETER_KEYS.contains(&name) {
            tracing::warn!(key = %key, "Ignoring unknown import setting");
            continue;
        }
        if let Some(value) = value {
            overrides.insert(name.to_string(), value);
        }
    }

    tracing::debug!("Loaded {} import parameters from database", overrides.len());
    Ok(overrides)
}

/// Save all parameters (validated first)
pub async fn save_import_parameters(pool: &SqlitePool, params: &ImportParameters) -> ImportResult<()> {
    params.validate().map_err(ImportError::InvalidInput)?;

    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;
    for (key, value) in params.to_pairs() {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(format!("{}{}", KEY_PREFIX, key))
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    tracing::info!("Saved {} import parameters to database", PARAMETER_KEYS.len());
    Ok(())
}
