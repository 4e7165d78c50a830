//! Configuration management for the subscription converter service

use crate::error::{ConvertError, Result};
use crate::registry::ConverterRegistry;
use crate::vmess::{VmessConverter, VMESS_CONVERTER};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Address the HTTP server listens on (default: "127.0.0.1:10200")
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Snapshot file used to restore subscriptions after a restart
    /// (default: `<tmp>/clash-convert.db`)
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    /// Refresh interval in minutes for subscriptions registered over HTTP (default: 60)
    #[serde(default = "default_interval")]
    pub default_interval_minutes: i64,

    /// Timeout for subscription downloads in seconds (default: 30)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Optional Clash YAML template replacing the built-in one
    #[serde(default)]
    pub template_path: Option<String>,

    /// Whether to expose `/metrics` (default: true)
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Subscriptions registered at startup
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// A subscription registered at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub name: String,
    pub url: String,

    /// Converter identity (default: "vmess")
    #[serde(default = "default_converter")]
    pub converter: String,

    /// Refresh interval in minutes; zero disables auto-refresh (default: 60)
    #[serde(default = "default_interval")]
    pub interval: i64,
}

// Default value functions for serde
fn default_listen_address() -> String {
    "127.0.0.1:10200".to_string()
}

fn default_snapshot_path() -> String {
    std::env::temp_dir()
        .join("clash-convert.db")
        .to_string_lossy()
        .into_owned()
}

fn default_interval() -> i64 {
    60
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_converter() -> String {
    VMESS_CONVERTER.to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            listen_address: default_listen_address(),
            snapshot_path: default_snapshot_path(),
            default_interval_minutes: default_interval(),
            fetch_timeout_secs: default_fetch_timeout(),
            template_path: None,
            metrics_enabled: default_true(),
            subscriptions: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(AppConfig)` if loading and validation succeed
    /// * `Err(ConvertError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ConvertError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: AppConfig = serde_yaml::from_str(&content).map_err(|e| {
            ConvertError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must be a socket address
    /// - snapshot_path must not be empty
    /// - fetch_timeout_secs must be > 0
    /// - every startup subscription needs a name and an http(s) url,
    ///   and names must be unique
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.snapshot_path.trim().is_empty() {
            return Err(ConvertError::ConfigError(
                "snapshot_path must not be empty".to_string(),
            ));
        }

        if self.fetch_timeout_secs == 0 {
            return Err(ConvertError::ConfigError(
                "fetch_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for sub in &self.subscriptions {
            if sub.name.trim().is_empty() {
                return Err(ConvertError::ConfigError(
                    "subscription name must not be empty".to_string(),
                ));
            }
            if !seen.insert(sub.name.as_str()) {
                return Err(ConvertError::ConfigError(format!(
                    "duplicate subscription name '{}'",
                    sub.name
                )));
            }
            match url::Url::parse(&sub.url) {
                Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
                _ => {
                    return Err(ConvertError::ConfigError(format!(
                        "subscription '{}' has an invalid url '{}'",
                        sub.name, sub.url
                    )))
                }
            }
        }

        Ok(())
    }

    /// Parsed listen address
    ///
    /// Accepts the short `:port` form, which binds all interfaces.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let address = match self.listen_address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => self.listen_address.clone(),
        };
        address.parse().map_err(|e| {
            ConvertError::ConfigError(format!(
                "Invalid listen_address '{}': {}",
                self.listen_address, e
            ))
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.snapshot_path)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Build the converter registry, honouring `template_path`
    pub fn build_registry(&self) -> Result<ConverterRegistry> {
        match &self.template_path {
            Some(path) => {
                let registry = ConverterRegistry::new();
                registry.register(
                    VMESS_CONVERTER,
                    Arc::new(VmessConverter::from_template_file(path)?),
                );
                Ok(registry)
            }
            None => ConverterRegistry::with_defaults(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.listen_address, "127.0.0.1:10200");
        assert_eq!(config.default_interval_minutes, 60);
        assert_eq!(config.fetch_timeout_secs, 30);
        assert!(config.snapshot_path.ends_with("clash-convert.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_short_listen_form() {
        let config = AppConfig {
            listen_address: ":10200".to_string(),
            ..Default::default()
        };
        assert_eq!(config.listen_addr().unwrap().port(), 10200);
        assert!(config.listen_addr().unwrap().ip().is_unspecified());
    }

    #[test]
    fn test_invalid_listen_address() {
        let config = AppConfig {
            listen_address: "nowhere".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout() {
        let config = AppConfig {
            fetch_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_subscription_defaults_from_yaml() {
        let yaml = r#"
listen_address: "0.0.0.0:8080"
subscriptions:
  - name: home
    url: https://example.com/sub
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.subscriptions.len(), 1);
        assert_eq!(config.subscriptions[0].converter, "vmess");
        assert_eq!(config.subscriptions[0].interval, 60);
        assert!(config.metrics_enabled);
    }

    #[test]
    fn test_duplicate_subscription_names() {
        let sub = SubscriptionConfig {
            name: "a".to_string(),
            url: "https://example.com/sub".to_string(),
            converter: default_converter(),
            interval: 60,
        };
        let config = AppConfig {
            subscriptions: vec![sub.clone(), sub],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_subscription_url_must_be_http() {
        let config = AppConfig {
            subscriptions: vec![SubscriptionConfig {
                name: "a".to_string(),
                url: "ftp://example.com/sub".to_string(),
                converter: default_converter(),
                interval: 60,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_registry_with_custom_template() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("template.yaml");
        fs::write(&path, "port: 9999\nmode: Global\n").unwrap();

        let config = AppConfig {
            template_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let registry = config.build_registry().unwrap();
        let template = registry.require("vmess").unwrap().template().clone();
        assert_eq!(template.port, 9999);
        assert_eq!(template.mode, "Global");
    }

    #[test]
    fn test_from_file_missing() {
        assert!(AppConfig::from_file("/nonexistent/clash-subconvert.yaml").is_err());
    }
}
