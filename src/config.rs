pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::audit::entry::Severity;
use crate::audit::sequencer::AppendSettings;
use crate::error::AuditError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub audit: AuditSettings,
    pub fallback: FallbackSettings,
    pub alerts: AlertSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://fiscal-audit.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub store_timeout_ms: u64,
    pub max_append_retries: u32,
    pub retry_backoff_ms: u64,
    pub verify_page_size: u64,
    pub report_max_entries: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            store_timeout_ms: 2_000,
            max_append_retries: 5,
            retry_backoff_ms: 20,
            verify_page_size: 500,
            report_max_entries: 100_000,
        }
    }
}

impl AuditSettings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn append_settings(&self) -> AppendSettings {
        AppendSettings {
            store_timeout: self.store_timeout(),
            max_retries: self.max_append_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    pub buffer_path: PathBuf,
    pub reconcile_interval_secs: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            buffer_path: PathBuf::from("data/audit-fallback.jsonl"),
            reconcile_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
    pub min_severity: Severity,
    pub log_alerts: bool,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 3_000,
            min_severity: Severity::High,
            log_alerts: true,
        }
    }
}

impl AppConfig {
    /// Defaults, then the optional config file, then `FISCAL_AUDIT__*` overrides.
    pub fn load() -> Result<Self, AuditError> {
        let config = loader::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        let checks = [
            (self.audit.store_timeout_ms == 0, "audit.store_timeout_ms must be positive"),
            (self.audit.max_append_retries == 0, "audit.max_append_retries must be positive"),
            (self.audit.verify_page_size == 0, "audit.verify_page_size must be positive"),
            (self.audit.report_max_entries == 0, "audit.report_max_entries must be positive"),
            (self.alerts.timeout_ms == 0, "alerts.timeout_ms must be positive"),
            (self.fallback.reconcile_interval_secs == 0, "fallback.reconcile_interval_secs must be positive"),
            (self.database.max_connections == 0, "database.max_connections must be positive"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(AuditError::Config(reason.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alerts.min_severity, Severity::High);
        assert_eq!(config.audit.append_settings().max_retries, 5);
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut config = AppConfig::default();
        config.audit.store_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(AuditError::Config(_))));
    }
}
