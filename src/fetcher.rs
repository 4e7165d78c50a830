//! Subscription fetcher for downloading subscription documents from their source

use crate::error::{ConvertError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Anything that can produce the raw body of a subscription URL
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Fetches subscription documents with plain GET requests
///
/// Certificate validation is disabled: subscription hosts are frequently
/// self-signed.
pub struct SubscriptionFetcher {
    client: Client,
}

impl SubscriptionFetcher {
    /// Create a new SubscriptionFetcher with default settings
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a new SubscriptionFetcher with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ConvertError::fetch(format!("Failed to create HTTP client: {}", e)))?;

        Ok(SubscriptionFetcher { client })
    }

    /// Download the subscription body
    ///
    /// # Returns
    /// * `Ok(Bytes)` for any 2xx response
    /// * `Err(ConvertError::Fetch)` on transport failure or non-success status,
    ///   with the status code attached when there is one
    pub async fn fetch_subscription(&self, url: &str) -> Result<Bytes> {
        debug!("Fetching subscription url={}", url);

        let response = self.client.get(url).send().await.map_err(|e| {
            warn!("GET request failed for url={}: {}", url, e);
            ConvertError::fetch(format!("GET request failed: {}", e))
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            warn!("Failed to read response body for url={}: {}", url, e);
            ConvertError::fetch(format!("Failed to read response body: {}", e))
        })?;

        if !status.is_success() {
            warn!(
                "Subscription source returned error for url={}: status={} body={}",
                url,
                status,
                String::from_utf8_lossy(&body)
            );
            return Err(ConvertError::fetch_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("unexpected status"),
            ));
        }

        info!("Fetched subscription url={} size={}", url, body.len());
        Ok(body)
    }
}

#[async_trait]
impl SubscriptionSource for SubscriptionFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.fetch_subscription(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetcher_creation() {
        let fetcher = SubscriptionFetcher::new();
        assert!(fetcher.is_ok());
    }

    #[tokio::test]
    async fn test_fetcher_with_timeout() {
        let fetcher = SubscriptionFetcher::with_timeout(Duration::from_secs(5));
        assert!(fetcher.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let fetcher = SubscriptionFetcher::new().unwrap();
        let result = fetcher.fetch_subscription("not-a-valid-url").await;
        match result {
            Err(ConvertError::Fetch { status, .. }) => assert_eq!(status, None),
            other => panic!("expected fetch error, got {:?}", other),
        }
    }
}
