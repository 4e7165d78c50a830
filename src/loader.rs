//! Fetch-then-convert step shared by the refresh tasks and the on-demand read path

use crate::error::Result;
use crate::fetcher::SubscriptionSource;
use crate::metrics::ManagerMetrics;
use crate::models::Configuration;
use crate::registry::ConverterRegistry;
use std::sync::Arc;
use tracing::{debug, warn};

/// Downloads a subscription and runs it through the named converter
pub struct ConfigLoader {
    registry: Arc<ConverterRegistry>,
    source: Arc<dyn SubscriptionSource>,
    metrics: Arc<ManagerMetrics>,
}

impl ConfigLoader {
    pub fn new(
        registry: Arc<ConverterRegistry>,
        source: Arc<dyn SubscriptionSource>,
        metrics: Arc<ManagerMetrics>,
    ) -> Self {
        ConfigLoader {
            registry,
            source,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ConverterRegistry> {
        &self.registry
    }

    /// Fetch `url` and convert it with converter `converter_id`
    ///
    /// The converter is resolved before any network traffic, so an unknown id
    /// fails fast with `ConverterNotFound`.
    pub async fn load(&self, url: &str, converter_id: &str) -> Result<Configuration> {
        let converter = self.registry.require(converter_id)?;
        let body = self.source.fetch(url).await?;

        let config = converter.convert(&body).map_err(|e| {
            self.metrics.record_conversion_failure();
            warn!("Format conversion failed for url={}: {}", url, e);
            e
        })?;

        debug!(
            "Loaded url={} converter={} proxies={}",
            url,
            converter_id,
            config.proxies.len()
        );
        Ok(config)
    }
}
