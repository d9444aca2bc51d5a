//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the TOML file looked up in the configuration directories
pub const CONFIG_FILE_NAME: &str = "umig-import.toml";

/// Name of the SQLite database file inside the root folder
pub const DATABASE_FILE_NAME: &str = "umig-import.db";

/// Contents of `umig-import.toml`
///
/// Every section is optional; missing values fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Folder holding the database
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Import tuning overrides, parsed by the import crate
    #[serde(default)]
    pub import: Option<toml::Table>,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5780
}

/// Load the TOML configuration
///
/// With an explicit path the file must exist. Without one the platform
/// config directories are searched and a missing file yields defaults.
pub fn load_toml_config(explicit_path: Option<&Path>) -> Result<TomlConfig> {
    let path = match explicit_path {
        Some(path) => {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            path.to_path_buf()
        }
        None => match find_config_file() {
            Some(path) => path,
            None => {
                tracing::debug!("No {} found, using defaults", CONFIG_FILE_NAME);
                return Ok(TomlConfig::default());
            }
        },
    };

    let content = std::fs::read_to_string(&path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    tracing::info!(path = %path.display(), "Loaded TOML configuration");
    Ok(config)
}

/// Write configuration back to disk, creating parent directories
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Root folder resolution priority:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_config: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Create the root folder if missing and return the database path inside it
pub fn prepare_root_folder(root_folder: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(root_folder).map_err(|e| {
        Error::Config(format!(
            "Failed to create root folder {}: {}",
            root_folder.display(),
            e
        ))
    })?;
    Ok(root_folder.join(DATABASE_FILE_NAME))
}

/// Search user then system configuration directories
fn find_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("umig").join(CONFIG_FILE_NAME));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/umig").join(CONFIG_FILE_NAME);
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("umig"))
        .unwrap_or_else(|| PathBuf::from("./umig_data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_config() {
        let content = r#"
            root_folder = "/srv/umig"

            [logging]
            level = "debug"

            [server]
            port = 9000

            [import]
            max_concurrent_imports = 5
            chunk_size = 250
        "#;

        let config: TomlConfig = toml::from_str(content).unwrap();
        assert_eq!(config.root_folder, Some(PathBuf::from("/srv/umig")));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");

        let import = config.import.unwrap();
        assert_eq!(import.get("chunk_size").and_then(|v| v.as_integer()), Some(250));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert!(config.root_folder.is_none());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.server.port, 5780);
        assert!(config.import.is_none());
    }

    #[test]
    fn test_write_then_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = TomlConfig::default();
        config.root_folder = Some(PathBuf::from("/data/umig"));
        config.server.port = 6001;
        write_toml_config(&config, &path).unwrap();

        let loaded = load_toml_config(Some(&path)).unwrap();
        assert_eq!(loaded.root_folder, Some(PathBuf::from("/data/umig")));
        assert_eq!(loaded.server.port, 6001);
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let result = load_toml_config(Some(Path::new("/nonexistent/umig-import.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    #[serial]
    fn test_root_folder_priority() {
        let env_var = "UMIG_TEST_ROOT_FOLDER";
        let toml_config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };

        std::env::set_var(env_var, "/from/env");
        assert_eq!(
            resolve_root_folder(Some(Path::new("/from/cli")), env_var, &toml_config),
            PathBuf::from("/from/cli")
        );
        assert_eq!(
            resolve_root_folder(None, env_var, &toml_config),
            PathBuf::from("/from/env")
        );

        std::env::remove_var(env_var);
        assert_eq!(
            resolve_root_folder(None, env_var, &toml_config),
            PathBuf::from("/from/toml")
        );

        let fallback = resolve_root_folder(None, env_var, &TomlConfig::default());
        assert!(fallback.ends_with("umig") || fallback.ends_with("umig_data"));
    }

    #[test]
    fn test_prepare_root_folder_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");

        let db_path = prepare_root_folder(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(db_path, root.join(DATABASE_FILE_NAME));
    }
}
