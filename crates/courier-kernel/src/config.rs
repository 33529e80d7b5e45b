//! Configuration loading from `config.toml` with defaults.
//!
//! [`load_config`] never fails: unreadable or malformed files are logged and
//! replaced by defaults. [`load_config_strict`] is for hosts that treat a bad
//! configuration as a fatal startup error.

use courier_types::config::CourierConfig;
use courier_types::error::{CourierError, CourierResult};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";

/// Load configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> CourierConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return CourierConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<CourierConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                CourierConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            CourierConfig::default()
        }
    }
}

/// Load configuration, returning an error for a missing or malformed file.
pub fn load_config_strict(path: &Path) -> CourierResult<CourierConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config = toml::from_str::<CourierConfig>(&contents)
        .map_err(|e| CourierError::Config(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// `$COURIER_CONFIG`, else `<config dir>/courier/config.toml`, else `./courier.toml`.
pub fn default_config_path() -> PathBuf {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        if !explicit.is_empty() {
            return PathBuf::from(explicit);
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join("courier").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("courier.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::config::PublishStrategy;
    use courier_types::BehaviourMode;
    use std::io::Write;

    #[test]
    fn test_load_config_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
publisher = "concurrent"

[router]
behaviour = "implicit_remote"
local_types = ["Diag.PingRequest"]
"#
        )
        .unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.router.behaviour, BehaviourMode::ImplicitRemote);
        assert_eq!(config.publisher, PublishStrategy::Concurrent);
        assert!(config.router.local_types.contains("Diag.PingRequest"));
    }

    #[test]
    fn test_malformed_file_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "router = 42").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.router.behaviour, BehaviourMode::ImplicitLocal);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert_eq!(config.router.behaviour, BehaviourMode::ImplicitLocal);
        assert!(config.dedup.enabled);
    }

    #[test]
    fn test_strict_rejects_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[router\nbehaviour = 1").unwrap();
        let err = load_config_strict(file.path()).unwrap_err();
        assert!(matches!(err, CourierError::Config(_)));
    }

    #[test]
    fn test_strict_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_strict(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, CourierError::Io(_)));
    }
}
