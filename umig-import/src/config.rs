//! Import parameter resolution
//!
//! Each parameter is resolved independently with Database → ENV → TOML →
//! default priority. Environment variables are `UMIG_IMPORT_<KEY>` with the
//! key upper-cased (`UMIG_IMPORT_CHUNK_SIZE`).

use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::{info, warn};
use umig_common::config::TomlConfig;

use crate::db::settings;
use crate::error::{ImportError, ImportResult};
use crate::models::{ImportParameters, PARAMETER_KEYS};

const ENV_PREFIX: &str = "UMIG_IMPORT_";

/// Environment variable name for a parameter key
pub fn env_var_name(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key.to_ascii_uppercase())
}

/// Resolve all import parameters and validate the result
pub async fn resolve_import_parameters(pool: &SqlitePool, toml_config: &TomlConfig) -> ImportResult<ImportParameters> {
    let mut params = ImportParameters::default();
    let mut sources: BTreeMap<&'static str, &'static str> = BTreeMap::new();

    // Lowest tier first so higher tiers overwrite
    if let Some(table) = &toml_config.import {
        for key in apply_toml(&mut params, table)? {
            sources.insert(key, "TOML");
        }
    }
    for key in apply_env(&mut params)? {
        sources.insert(key, "environment");
    }

    let stored = settings::load_parameter_overrides(pool).await?;
    for key in PARAMETER_KEYS {
        if let Some(value) = stored.get(key) {
            params
                .set_from_str(key, value)
                .map_err(|e| ImportError::InvalidInput(format!("settings table: {}", e)))?;
            sources.insert(key, "database");
        }
    }

    params
        .validate()
        .map_err(|e| ImportError::InvalidInput(format!("import parameters: {}", e)))?;

    for (key, source) in &sources {
        info!(parameter = key, source, "Import parameter override");
    }
    Ok(params)
}

/// Apply a TOML `[import]` table; returns the keys it set
pub fn apply_toml(params: &mut ImportParameters, table: &toml::Table) -> ImportResult<Vec<&'static str>> {
    let mut applied = Vec::new();
    for (key, value) in table {
        let Some(known) = PARAMETER_KEYS.iter().find(|k| **k == key.as_str()) else {
            warn!(key = %key, "Ignoring unknown [import] key in TOML config");
            continue;
        };
        let text = match value {
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::String(s) => s.clone(),
            other => {
                return Err(ImportError::InvalidInput(format!(
                    "TOML [import] {}: expected a number, got {}",
                    key,
                    other.type_str()
                )))
            }
        };
        params
            .set_from_str(known, &text)
            .map_err(|e| ImportError::InvalidInput(format!("TOML [import]: {}", e)))?;
        applied.push(*known);
    }
    Ok(applied)
}

/// Apply `UMIG_IMPORT_*` variables; returns the keys they set
pub fn apply_env(params: &mut ImportParameters) -> ImportResult<Vec<&'static str>> {
    let mut applied = Vec::new();
    for key in PARAMETER_KEYS {
        let name = env_var_name(key);
        let Ok(value) = std::env::var(&name) else {
            continue;
        };
        if value.trim().is_empty() {
            continue;
        }
        params
            .set_from_str(key, &value)
            .map_err(|e| ImportError::InvalidInput(format!("{}: {}", name, e)))?;
        applied.push(key);
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in PARAMETER_KEYS {
            std::env::remove_var(env_var_name(key));
        }
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("chunk_size"), "UMIG_IMPORT_CHUNK_SIZE");
    }

    #[test]
    fn test_apply_toml() {
        let table: toml::Table = toml::from_str(
            r#"
            chunk_size = 500
            max_failure_ratio = 0.25
            queue_capacity = "12"
            unknown_knob = 1
            "#,
        )
        .unwrap();
        let mut params = ImportParameters::default();
        let mut applied = apply_toml(&mut params, &table).unwrap();
        applied.sort();

        assert_eq!(applied, vec!["chunk_size", "max_failure_ratio", "queue_capacity"]);
        assert_eq!(params.chunk_size, 500);
        assert_eq!(params.max_failure_ratio, 0.25);
        assert_eq!(params.queue_capacity, 12);
    }

    #[test]
    fn test_apply_toml_rejects_wrong_type() {
        let table: toml::Table = toml::from_str("chunk_fan_out = true").unwrap();
        let mut params = ImportParameters::default();
        assert!(apply_toml(&mut params, &table).is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_toml() {
        clear_env();
        std::env::set_var("UMIG_IMPORT_CHUNK_SIZE", "750");

        let table: toml::Table = toml::from_str("chunk_size = 500").unwrap();
        let mut params = ImportParameters::default();
        apply_toml(&mut params, &table).unwrap();
        let applied = apply_env(&mut params).unwrap();

        assert_eq!(applied, vec!["chunk_size"]);
        assert_eq!(params.chunk_size, 750);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_env_value() {
        clear_env();
        std::env::set_var("UMIG_IMPORT_MAX_CONCURRENT_IMPORTS", "three");
        let mut params = ImportParameters::default();
        let err = apply_env(&mut params).unwrap_err();
        assert!(err.to_string().contains("UMIG_IMPORT_MAX_CONCURRENT_IMPORTS"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_blank_env_value_ignored() {
        clear_env();
        std::env::set_var("UMIG_IMPORT_CHUNK_FAN_OUT", "  ");
        let mut params = ImportParameters::default();
        assert!(apply_env(&mut params).unwrap().is_empty());
        assert_eq!(params.chunk_fan_out, 4);
        clear_env();
    }
}
