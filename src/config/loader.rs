//! Layered configuration loading.
//! Built-in defaults, then an optional TOML file, then environment overrides
//! such as `FISCAL_AUDIT__DATABASE__URL`.

use ::config::{Config, ConfigError, Environment, File};
use std::env;
use std::path::Path;
use tracing::info;

use super::AppConfig;
use crate::error::AuditError;

pub const CONFIG_PATH_VAR: &str = "FISCAL_AUDIT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "fiscal-audit.toml";
pub const ENV_PREFIX: &str = "FISCAL_AUDIT";

impl From<ConfigError> for AuditError {
    fn from(err: ConfigError) -> Self {
        AuditError::Config(err.to_string())
    }
}

/// Resolve the file path from `FISCAL_AUDIT_CONFIG` and load.
pub fn load_from_env() -> Result<AppConfig, AuditError> {
    let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from_path(Path::new(&path))
}

pub fn load_from_path(path: &Path) -> Result<AppConfig, AuditError> {
    info!("Loading configuration (file: {:?})", path);

    let settings = Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::Severity;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = load_from_path(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.audit.verify_page_size, 500);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fiscal-audit.toml");
        fs::write(
            &path,
            r#"
[database]
url = "sqlite://audit-test.db"

[alerts]
min_severity = "CRITICAL"
webhook_url = "http://localhost:9999/hook"
"#,
        )
        .unwrap();

        let config = load_from_path(&path).unwrap();
        assert_eq!(config.database.url, "sqlite://audit-test.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.alerts.min_severity, Severity::Critical);
        assert_eq!(
            config.alerts.webhook_url.as_deref(),
            Some("http://localhost:9999/hook")
        );
    }

    #[test]
    fn test_unknown_severity_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fiscal-audit.toml");
        fs::write(&path, "[alerts]\nmin_severity = \"SEVERE\"\n").unwrap();

        assert!(matches!(load_from_path(&path), Err(AuditError::Config(_))));
    }
}
