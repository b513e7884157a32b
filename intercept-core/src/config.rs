//! Configuration types and utilities

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::logging::LoggingConfig;
use crate::store::DEFAULT_MAX_RECORDS;
use crate::trust::{TrustMode, TrustModeSelector};

/// Engine settings read once at startup. Everything here can still be
/// changed at runtime through the engines themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Traffic records kept before the oldest is evicted
    pub max_records: usize,
    pub mock_enabled: bool,
    pub breakpoints_enabled: bool,
    /// Process-wide trust mode
    pub trust_mode: TrustModeSelector,
    /// Hosts the trust mode applies to (host-scoped modes only)
    pub trusted_hosts: Vec<String>,
    /// Required for `allow_all` to relax anything
    pub acknowledge_insecure: bool,
    /// Directory for saved rules and environments
    pub persistence_dir: Option<PathBuf>,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            mock_enabled: true,
            breakpoints_enabled: true,
            trust_mode: TrustModeSelector::Strict,
            trusted_hosts: Vec::new(),
            acknowledge_insecure: false,
            persistence_dir: None,
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl InterceptorConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_records == 0 {
            return Err(CoreError::Configuration(
                "max_records must be at least 1".to_string(),
            ));
        }
        if self.admin.enabled && self.admin.port == 0 {
            return Err(CoreError::Configuration(
                "admin port must be set when the admin API is enabled".to_string(),
            ));
        }
        if matches!(self.trust_mode, TrustModeSelector::AllowAll) && !self.acknowledge_insecure {
            warn!("allow_all trust mode configured without acknowledge_insecure, strict validation stays in force");
        }
        self.logging.validate()
    }

    pub fn build_trust_mode(&self) -> TrustMode {
        self.trust_mode
            .into_mode(&self.trusted_hosts, self.acknowledge_insecure)
    }
}

/// Admin control API settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub listen_address: String,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: "127.0.0.1".to_string(),
            port: 9091,
        }
    }
}

impl AdminConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = InterceptorConfig::default();
        assert_eq!(config.max_records, 1000);
        assert!(config.mock_enabled);
        assert!(config.breakpoints_enabled);
        assert!(config.trust_mode.is_strict());
        assert!(!config.admin.enabled);
        assert_eq!(config.admin.bind_address(), "127.0.0.1:9091");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_record_cap_is_rejected() {
        let config = InterceptorConfig {
            max_records: 0,
            ..InterceptorConfig::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Configuration(_))));
    }

    #[test]
    fn test_invalid_log_level_is_rejected() {
        let mut config = InterceptorConfig::default();
        config.logging.level = "chatty".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_records": 50, "trust_mode": "allow_self_signed", "trusted_hosts": ["dev.local"]}}"#
        )
        .unwrap();

        let config = InterceptorConfig::load(file.path()).unwrap();
        assert_eq!(config.max_records, 50);
        assert!(config.mock_enabled);
        assert!(config.build_trust_mode().relaxes_for("dev.local"));
        assert!(!config.build_trust_mode().relaxes_for("prod.example.com"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = InterceptorConfig::load("/nonexistent/intercept.json");
        assert!(matches!(result, Err(CoreError::Configuration(_))));
    }

    #[test]
    fn test_allow_all_needs_acknowledgement() {
        let config = InterceptorConfig {
            trust_mode: TrustModeSelector::AllowAll,
            ..InterceptorConfig::default()
        };
        assert!(!config.build_trust_mode().relaxes_for("a.test"));

        let acknowledged = InterceptorConfig {
            acknowledge_insecure: true,
            ..config
        };
        assert!(acknowledged.build_trust_mode().relaxes_for("a.test"));
    }
}
