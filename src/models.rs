//! Core data models: proxy descriptors, proxy groups and the Clash configuration document
//!
//! Field names and their declaration order are the Clash interop contract, so every
//! struct here is serialized exactly as declared.

use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Built-in Clash configuration used as the conversion template
pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/clash_template.yaml");

/// Name of the group synthesized when the template declares none
pub const DEFAULT_GROUP_NAME: &str = "Proxy";

/// Selection strategy of the synthesized group
pub const DEFAULT_GROUP_STRATEGY: &str = "select";

/// One remote proxy endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub server: String,
    pub port: u16,
    pub uuid: String,
    #[serde(rename = "alterId")]
    pub alter_id: u32,
    pub udp: bool,
    #[serde(rename = "skip-cert-verify")]
    pub skip_cert_verify: bool,
    #[serde(rename = "ws-path")]
    pub ws_path: String,
    #[serde(rename = "ws-headers")]
    pub ws_headers: BTreeMap<String, String>,
    pub cipher: String,
    pub tls: bool,
    pub password: String,
    pub plugin: String,
    #[serde(rename = "plugin-opts")]
    pub plugin_opts: BTreeMap<String, String>,
    pub network: String,
}

impl ProxyDescriptor {
    /// Serialize this descriptor as a standalone YAML document
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ConvertError::Serialization(e.to_string()))
    }
}

/// A named, ordered selection of proxies referenced by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub strategy: String,
    pub proxies: Vec<String>,
    pub url: String,
    pub interval: u32,
}

impl ProxyGroup {
    /// The default "Proxy" select group with no members
    pub fn default_select() -> Self {
        ProxyGroup {
            name: DEFAULT_GROUP_NAME.to_string(),
            strategy: DEFAULT_GROUP_STRATEGY.to_string(),
            proxies: Vec::new(),
            url: String::new(),
            interval: 0,
        }
    }
}

/// Full Clash client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// HTTP proxy port
    pub port: u16,
    /// SOCKS5 proxy port
    #[serde(rename = "socks-port")]
    pub socks_port: u16,
    /// Allow connections from the local network
    #[serde(rename = "allow-lan")]
    pub allow_lan: bool,
    /// Only honoured when allow-lan is true
    #[serde(rename = "bind-address")]
    pub bind_address: String,
    /// Rule / Global / Direct
    pub mode: String,
    /// silent / info / warning / error / debug
    #[serde(rename = "log-level")]
    pub log_level: String,
    #[serde(rename = "external-controller")]
    pub external_controller: String,
    #[serde(rename = "external-ui")]
    pub external_ui: String,
    pub secret: String,
    #[serde(rename = "Proxy")]
    pub proxies: Vec<ProxyDescriptor>,
    #[serde(rename = "Proxy Group")]
    pub proxy_groups: Vec<ProxyGroup>,
    #[serde(rename = "Rule")]
    pub rules: Vec<String>,
}

impl Configuration {
    /// Parse a configuration from Clash YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| {
            ConvertError::ConfigError(format!("Failed to parse configuration template: {}", e))
        })
    }

    /// Parse the built-in template
    pub fn default_template() -> Result<Self> {
        Self::from_yaml(DEFAULT_TEMPLATE)
    }

    /// Render the configuration as a Clash YAML document
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ConvertError::Serialization(e.to_string()))
    }

    /// Guarantee at least one proxy group exists
    pub fn ensure_default_group(&mut self) {
        if self.proxy_groups.is_empty() {
            self.proxy_groups.push(ProxyGroup::default_select());
        }
    }

    /// Append a descriptor and add its name to every group
    pub fn push_proxy(&mut self, proxy: ProxyDescriptor) {
        for group in &mut self.proxy_groups {
            group.proxies.push(proxy.name.clone());
        }
        self.proxies.push(proxy);
    }

    /// Names of all proxies in subscription order
    pub fn proxy_names(&self) -> Vec<&str> {
        self.proxies.iter().map(|p| p.name.as_str()).collect()
    }

    /// Apply user supplied listen overrides
    pub fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(port) = overrides.port.filter(|p| *p != 0) {
            self.port = port;
        }
        if let Some(port) = overrides.socks_port.filter(|p| *p != 0) {
            self.socks_port = port;
        }
        if let Some(allow_lan) = overrides.allow_lan {
            self.allow_lan = allow_lan;
        }
    }
}

/// Local listen settings a user may pin when registering a subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalOverrides {
    pub port: Option<u16>,
    pub socks_port: Option<u16>,
    pub allow_lan: Option<bool>,
}

impl GlobalOverrides {
    pub fn is_empty(&self) -> bool {
        self.port.is_none() && self.socks_port.is_none() && self.allow_lan.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proxy(name: &str) -> ProxyDescriptor {
        ProxyDescriptor {
            name: name.to_string(),
            proxy_type: "vmess".to_string(),
            server: "1.2.3.4".to_string(),
            port: 443,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_template_parses() {
        let config = Configuration::default_template().unwrap();
        assert_eq!(config.port, 7890);
        assert_eq!(config.socks_port, 7891);
        assert_eq!(config.mode, "Rule");
        assert!(config.proxies.is_empty());
        assert!(config.proxy_groups.is_empty());
        assert!(config.rules.contains(&"MATCH,Proxy".to_string()));
    }

    #[test]
    fn test_configuration_key_order() {
        let mut config = Configuration::default();
        config.ensure_default_group();
        config.push_proxy(sample_proxy("a"));
        let yaml = config.to_yaml().unwrap();

        let keys = [
            "port:",
            "socks-port:",
            "allow-lan:",
            "bind-address:",
            "mode:",
            "log-level:",
            "external-controller:",
            "external-ui:",
            "secret:",
            "Proxy:",
            "Proxy Group:",
            "Rule:",
        ];
        let mut last = 0;
        for key in keys {
            let pos = yaml
                .lines()
                .position(|l| l.starts_with(key))
                .unwrap_or_else(|| panic!("missing key {key} in\n{yaml}"));
            assert!(pos >= last, "key {key} out of order");
            last = pos;
        }
    }

    #[test]
    fn test_proxy_field_names() {
        let mut proxy = sample_proxy("node");
        proxy.ws_headers.insert("Host".to_string(), "h.example".to_string());
        let yaml = proxy.to_yaml().unwrap();
        for key in [
            "name:",
            "type:",
            "server:",
            "port:",
            "uuid:",
            "alterId:",
            "udp:",
            "skip-cert-verify:",
            "ws-path:",
            "ws-headers:",
            "cipher:",
            "tls:",
            "password:",
            "plugin:",
            "plugin-opts:",
            "network:",
        ] {
            assert!(yaml.contains(key), "missing {key} in\n{yaml}");
        }
        assert!(yaml.contains("Host: h.example"));
    }

    #[test]
    fn test_push_proxy_updates_every_group() {
        let mut config = Configuration::default();
        config.proxy_groups.push(ProxyGroup::default_select());
        config.proxy_groups.push(ProxyGroup {
            name: "Auto".to_string(),
            strategy: "url-test".to_string(),
            url: "http://www.gstatic.com/generate_204".to_string(),
            interval: 300,
            ..Default::default()
        });

        config.push_proxy(sample_proxy("a"));
        config.push_proxy(sample_proxy("b"));

        assert_eq!(config.proxy_names(), vec!["a", "b"]);
        for group in &config.proxy_groups {
            assert_eq!(group.proxies, vec!["a".to_string(), "b".to_string()]);
        }
    }

    #[test]
    fn test_ensure_default_group_only_when_empty() {
        let mut config = Configuration::default();
        config.ensure_default_group();
        config.ensure_default_group();
        assert_eq!(config.proxy_groups.len(), 1);
        assert_eq!(config.proxy_groups[0].name, DEFAULT_GROUP_NAME);
        assert_eq!(config.proxy_groups[0].strategy, DEFAULT_GROUP_STRATEGY);
    }

    #[test]
    fn test_apply_overrides_ignores_zero_ports() {
        let mut config = Configuration::default_template().unwrap();
        config.apply_overrides(&GlobalOverrides {
            port: Some(0),
            socks_port: Some(1080),
            allow_lan: Some(true),
        });
        assert_eq!(config.port, 7890);
        assert_eq!(config.socks_port, 1080);
        assert!(config.allow_lan);
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = Configuration::default_template().unwrap();
        config.ensure_default_group();
        config.push_proxy(sample_proxy("x"));
        let parsed = Configuration::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
