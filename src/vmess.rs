//! vmess subscription converter
//!
//! A vmess subscription is a base64 document whose decoded body holds one link per
//! line. Every `vmess://` link is itself base64-encoded JSON describing one server:
//!
//! ```text
//! vmess://eyJwcyI6Im5vZGUxIiwiYWRkIjoiMS4yLjMuNCIsInBvcnQiOiI0NDMiLC4uLn0=
//!          └── {"ps":"node1","add":"1.2.3.4","port":"443",...}
//! ```
//!
//! Lines using any other scheme are skipped. A single undecodable vmess line fails
//! the whole conversion.

use crate::error::{ConvertError, Result};
use crate::models::{Configuration, ProxyDescriptor};
use crate::registry::Converter;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

/// Scheme marker of vmess links
pub const VMESS_PREFIX: &str = "vmess://";

/// Converter identity registered for this pipeline
pub const VMESS_CONVERTER: &str = "vmess";

const LENIENT_PADDING: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT_PADDING);

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT_PADDING);

/// Decode base64 with or without padding, standard alphabet first, then URL-safe
fn decode_base64(input: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    STANDARD_LENIENT
        .decode(input)
        .or_else(|_| URL_SAFE_LENIENT.decode(input))
}

fn strip_whitespace(input: &str) -> String {
    input.chars().filter(|c| !c.is_whitespace()).collect()
}

/// JSON body of a vmess link
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VmessLink {
    ps: Option<String>,
    add: Option<String>,
    port: Option<Value>,
    id: Option<String>,
    aid: Option<Value>,
    #[serde(rename = "type")]
    cipher: Option<String>,
    tls: Option<String>,
    net: Option<String>,
    path: Option<String>,
    host: Option<String>,
    v: Option<Value>,
}

/// Coerce a number-or-string JSON field to an integer, 0 when it can't be read
fn coerce_int(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}

impl VmessLink {
    fn into_descriptor(self, line: &str) -> Result<ProxyDescriptor> {
        let server = self.add.unwrap_or_default().trim().to_string();
        if server.is_empty() {
            return Err(ConvertError::decoding(line, "missing server address"));
        }

        let raw_port = coerce_int(self.port.as_ref());
        let port = u16::try_from(raw_port).unwrap_or(0);
        if port == 0 {
            warn!("vmess link for server={} has no usable port: {}", server, raw_port);
        }
        let alter_id = u32::try_from(coerce_int(self.aid.as_ref())).unwrap_or(0);
        debug!(
            "Decoded vmess link server={} port={} version={}",
            server,
            port,
            coerce_int(self.v.as_ref())
        );

        let name = match self.ps.map(|ps| ps.trim().to_string()) {
            Some(ps) if !ps.is_empty() => ps,
            _ => format!("{}:{}", server, port),
        };

        let mut proxy = ProxyDescriptor {
            name,
            proxy_type: VMESS_CONVERTER.to_string(),
            server,
            port,
            uuid: self.id.unwrap_or_default(),
            alter_id,
            cipher: self.cipher.unwrap_or_default(),
            tls: self.tls.as_deref() == Some("tls"),
            ..Default::default()
        };

        if self.net.as_deref() == Some("ws") {
            proxy.network = "ws".to_string();
            proxy.ws_path = self.path.unwrap_or_default();
            proxy
                .ws_headers
                .insert("Host".to_string(), self.host.unwrap_or_default());
        }

        Ok(proxy)
    }
}

/// Decode one vmess link into a descriptor
///
/// The `vmess://` prefix is optional so a bare base64 body is accepted too.
pub fn convert_single(link: &str) -> Result<ProxyDescriptor> {
    let line = link.trim();
    let body = strip_whitespace(line.strip_prefix(VMESS_PREFIX).unwrap_or(line));

    let json = decode_base64(&body)
        .map_err(|e| ConvertError::decoding(line, format!("invalid base64: {}", e)))?;

    let parsed: VmessLink = serde_json::from_slice(&json)
        .map_err(|e| ConvertError::decoding(line, format!("invalid JSON: {}", e)))?;

    parsed.into_descriptor(line)
}

/// Converter for base64 vmess subscriptions
#[derive(Debug, Clone)]
pub struct VmessConverter {
    template: Configuration,
}

impl VmessConverter {
    /// Create a converter that builds every configuration from `template`
    pub fn new(template: Configuration) -> Self {
        VmessConverter { template }
    }

    /// Create a converter using the built-in Clash template
    pub fn with_default_template() -> Result<Self> {
        Ok(Self::new(Configuration::default_template()?))
    }

    /// Create a converter from a Clash YAML template on disk
    pub fn from_template_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConvertError::ConfigError(format!(
                "Failed to read template {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self::new(Configuration::from_yaml(&content)?))
    }

    /// Convert a raw subscription payload into a complete configuration
    pub fn convert_payload(&self, payload: &[u8]) -> Result<Configuration> {
        let text = String::from_utf8_lossy(payload);
        let body = strip_whitespace(&text);
        let decoded = decode_base64(&body)
            .map_err(|e| ConvertError::Encoding(format!("subscription is not base64: {}", e)))?;

        let mut config = self.template.clone();
        config.ensure_default_group();

        let mut skipped = 0usize;
        for raw in decoded.split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !line.starts_with(VMESS_PREFIX) {
                skipped += 1;
                continue;
            }
            config.push_proxy(convert_single(line)?);
        }

        debug!(
            "Converted subscription: proxies={} skipped={}",
            config.proxies.len(),
            skipped
        );
        Ok(config)
    }
}

impl Converter for VmessConverter {
    fn convert(&self, payload: &[u8]) -> Result<Configuration> {
        self.convert_payload(payload)
    }

    fn convert_single(&self, entry: &str) -> Result<ProxyDescriptor> {
        convert_single(entry)
    }

    fn template(&self) -> &Configuration {
        &self.template
    }
}
