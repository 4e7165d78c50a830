//! Converter registry
//!
//! Maps a converter identity (e.g. `"vmess"`) to the pipeline that understands that
//! subscription format. Lookups happen on every conversion; registration is rare.

use crate::error::{ConvertError, Result};
use crate::models::{Configuration, ProxyDescriptor};
use crate::vmess::{VmessConverter, VMESS_CONVERTER};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// A subscription format decoder
pub trait Converter: Send + Sync {
    /// Decode a whole subscription payload into a configuration
    fn convert(&self, payload: &[u8]) -> Result<Configuration>;

    /// Decode one subscription entry into a descriptor
    fn convert_single(&self, entry: &str) -> Result<ProxyDescriptor>;

    /// Template every converted configuration starts from
    fn template(&self) -> &Configuration;
}

/// Concurrency-safe mapping from converter identity to implementation
#[derive(Default)]
pub struct ConverterRegistry {
    converters: RwLock<HashMap<String, Arc<dyn Converter>>>,
}

impl ConverterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the vmess converter built from `template`
    pub fn with_template(template: Configuration) -> Self {
        let registry = Self::new();
        registry.register(VMESS_CONVERTER, Arc::new(VmessConverter::new(template)));
        registry
    }

    /// Create a registry holding the vmess converter with the built-in template
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::with_template(Configuration::default_template()?))
    }

    /// Register a converter, replacing any previous one with the same id
    pub fn register(&self, id: impl Into<String>, converter: Arc<dyn Converter>) {
        let id = id.into();
        info!("Registering converter: {}", id);
        self.converters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, converter);
    }

    /// Look up a converter by id
    pub fn lookup(&self, id: &str) -> Option<Arc<dyn Converter>> {
        self.converters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Look up a converter, reporting absence as `ConverterNotFound`
    pub fn require(&self, id: &str) -> Result<Arc<dyn Converter>> {
        self.lookup(id)
            .ok_or_else(|| ConvertError::ConverterNotFound(id.to_string()))
    }

    /// Whether a converter is registered under `id`
    pub fn contains(&self, id: &str) -> bool {
        self.lookup(id).is_some()
    }

    /// Registered converter ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .converters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedConverter {
        template: Configuration,
    }

    impl Converter for FixedConverter {
        fn convert(&self, _payload: &[u8]) -> Result<Configuration> {
            Ok(self.template.clone())
        }

        fn convert_single(&self, entry: &str) -> Result<ProxyDescriptor> {
            Ok(ProxyDescriptor {
                name: entry.to_string(),
                ..Default::default()
            })
        }

        fn template(&self) -> &Configuration {
            &self.template
        }
    }

    #[test]
    fn test_defaults_include_vmess() {
        let registry = ConverterRegistry::with_defaults().unwrap();
        assert!(registry.contains("vmess"));
        assert_eq!(registry.ids(), vec!["vmess".to_string()]);
    }

    #[test]
    fn test_unknown_converter() {
        let registry = ConverterRegistry::new();
        assert!(registry.lookup("ssr").is_none());
        match registry.require("ssr") {
            Err(ConvertError::ConverterNotFound(id)) => assert_eq!(id, "ssr"),
            _ => panic!("expected ConverterNotFound"),
        }
    }

    #[test]
    fn test_register_overwrites() {
        let registry = ConverterRegistry::with_defaults().unwrap();
        let mut template = Configuration::default();
        template.mode = "Global".to_string();
        registry.register("vmess", Arc::new(FixedConverter { template }));

        let converter = registry.require("vmess").unwrap();
        assert_eq!(converter.convert(b"ignored").unwrap().mode, "Global");
        assert_eq!(converter.convert_single("x").unwrap().name, "x");
        assert_eq!(registry.ids().len(), 1);
    }
}
