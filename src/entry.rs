//! Cache entries and their background refresh task

use crate::loader::ConfigLoader;
use crate::metrics::ManagerMetrics;
use crate::models::{Configuration, GlobalOverrides};
use crate::snapshot::EntrySnapshot;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Stable cache name for a subscription URL
pub fn subscription_name(url: &str) -> String {
    format!("{:016x}", xxh3_64(url.as_bytes()))
}

/// Download file name for a subscription URL
///
/// The last percent-decoded path segment without its extension, first letter
/// upper-cased.
/// Falls back to [`subscription_name`] when the URL has no usable path.
pub fn config_name(url: &str) -> String {
    let stem = url::Url::parse(url).ok().and_then(|parsed| {
        let path = urlencoding::decode(parsed.path())
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| parsed.path().to_string());
        Path::new(&path)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    });

    match stem {
        Some(stem) => {
            let mut chars = stem.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => subscription_name(url),
            }
        }
        None => subscription_name(url),
    }
}

/// Copy the user-pinned listen fields from the previous configuration
///
/// Exactly `port`, `socks-port` and `allow-lan` survive a refresh; everything
/// else comes from the upstream subscription.
pub fn carry_forward_overrides(previous: &Configuration, next: &mut Configuration) {
    next.port = previous.port;
    next.socks_port = previous.socks_port;
    next.allow_lan = previous.allow_lan;
}

/// One named subscription and its live state
#[derive(Debug)]
pub struct CacheEntry {
    name: String,
    config_name: String,
    url: String,
    converter: String,
    interval_minutes: i64,
    overrides: GlobalOverrides,
    config: RwLock<Option<Arc<Configuration>>>,
    cancel: CancellationToken,
}

impl CacheEntry {
    pub fn new(
        name: impl Into<String>,
        converter: impl Into<String>,
        url: impl Into<String>,
        interval_minutes: i64,
        overrides: GlobalOverrides,
        seed: Option<Configuration>,
        cancel: CancellationToken,
    ) -> Self {
        let url = url.into();
        let seed = seed.map(|mut config| {
            config.apply_overrides(&overrides);
            Arc::new(config)
        });
        CacheEntry {
            name: name.into(),
            config_name: config_name(&url),
            url,
            converter: converter.into(),
            interval_minutes,
            overrides,
            config: RwLock::new(seed),
            cancel,
        }
    }

    /// Rebuild an entry from its persisted record
    pub fn from_snapshot(record: EntrySnapshot, cancel: CancellationToken) -> Self {
        CacheEntry {
            name: record.name,
            config_name: record.config_name,
            url: record.url,
            converter: record.converter,
            interval_minutes: record.interval_minutes,
            overrides: record.overrides,
            config: RwLock::new(None),
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn converter(&self) -> &str {
        &self.converter
    }

    pub fn interval_minutes(&self) -> i64 {
        self.interval_minutes
    }

    pub fn overrides(&self) -> GlobalOverrides {
        self.overrides
    }

    /// Period of the refresh task, `None` when auto-refresh is disabled
    pub fn refresh_period(&self, unit: Duration) -> Option<Duration> {
        u32::try_from(self.interval_minutes)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| unit * n)
    }

    /// Currently cached configuration
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the cached configuration with a freshly converted one
    ///
    /// Carries the listen overrides forward from the previous configuration, or
    /// applies the registration overrides when this is the first one.
    pub fn apply_refresh(&self, mut next: Configuration) -> Arc<Configuration> {
        let mut slot = self.config.write().unwrap_or_else(PoisonError::into_inner);
        match slot.as_deref() {
            Some(previous) => carry_forward_overrides(previous, &mut next),
            None => next.apply_overrides(&self.overrides),
        }
        let next = Arc::new(next);
        *slot = Some(Arc::clone(&next));
        next
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Public, persistable state of this entry
    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            name: self.name.clone(),
            config_name: self.config_name.clone(),
            url: self.url.clone(),
            interval_minutes: self.interval_minutes,
            converter: self.converter.clone(),
            overrides: self.overrides,
        }
    }
}

/// Decrements the live task gauge when a refresh task ends, however it ends
pub(crate) struct RefreshTaskGuard {
    metrics: Arc<ManagerMetrics>,
}

impl RefreshTaskGuard {
    pub(crate) fn new(metrics: Arc<ManagerMetrics>) -> Self {
        metrics.refresh_task_started();
        RefreshTaskGuard { metrics }
    }
}

impl Drop for RefreshTaskGuard {
    fn drop(&mut self) {
        self.metrics.refresh_task_stopped();
    }
}

/// Periodically refresh `entry` until its token is cancelled
///
/// Failures keep the previous configuration and wait for the next tick. A fetch
/// that completes after cancellation is discarded.
pub(crate) async fn refresh_loop(
    entry: Arc<CacheEntry>,
    loader: Arc<ConfigLoader>,
    metrics: Arc<ManagerMetrics>,
    period: Duration,
    guard: RefreshTaskGuard,
) {
    let _guard = guard;
    let token = entry.cancellation_token().clone();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(
        "Refresh task started name={} url={} period={:?}",
        entry.name(),
        entry.url(),
        period
    );

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Automatic update has stopped name={} url={}", entry.name(), entry.url());
                return;
            }
            _ = ticker.tick() => {}
        }

        match loader.load(entry.url(), entry.converter()).await {
            Ok(config) => {
                if token.is_cancelled() {
                    info!(
                        "Discarding refresh result for cancelled entry name={}",
                        entry.name()
                    );
                    return;
                }
                entry.apply_refresh(config);
                metrics.record_refresh(true);
                info!("Update completed name={} url={}", entry.name(), entry.url());
            }
            Err(e) => {
                metrics.record_refresh(false);
                warn!(
                    "Failed to refresh subscription name={} url={}: {}",
                    entry.name(),
                    entry.url(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(interval: i64) -> CacheEntry {
        CacheEntry::new(
            "abc",
            "vmess",
            "https://example.com/sub/my-nodes.txt",
            interval,
            GlobalOverrides::default(),
            None,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_config_name_from_path() {
        assert_eq!(config_name("https://example.com/sub/my-nodes.txt"), "My-nodes");
        assert_eq!(config_name("https://example.com/api/v1/client"), "Client");
    }

    #[test]
    fn test_config_name_decodes_percent_encoded_path() {
        assert_eq!(config_name("https://sub.example.com/订阅.txt"), "订阅");
        assert_eq!(config_name("https://example.com/my%20nodes.yaml"), "My nodes");
    }

    #[test]
    fn test_config_name_falls_back_to_hash() {
        let url = "https://example.com/";
        assert_eq!(config_name(url), subscription_name(url));
        assert_eq!(subscription_name(url).len(), 16);
    }

    #[test]
    fn test_subscription_name_is_stable() {
        assert_eq!(
            subscription_name("https://a.example/sub"),
            subscription_name("https://a.example/sub")
        );
        assert_ne!(
            subscription_name("https://a.example/sub"),
            subscription_name("https://b.example/sub")
        );
    }

    #[test]
    fn test_refresh_period() {
        let unit = Duration::from_secs(60);
        assert_eq!(entry(0).refresh_period(unit), None);
        assert_eq!(entry(-5).refresh_period(unit), None);
        assert_eq!(entry(2).refresh_period(unit), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_apply_refresh_carries_forward_exactly_three_fields() {
        let entry = entry(60);
        let mut first = Configuration::default_template().unwrap();
        first.port = 1111;
        first.socks_port = 2222;
        first.allow_lan = true;
        first.mode = "Global".to_string();
        entry.apply_refresh(first);

        let mut next = Configuration::default_template().unwrap();
        next.mode = "Rule".to_string();
        next.log_level = "debug".to_string();
        let applied = entry.apply_refresh(next);

        assert_eq!(applied.port, 1111);
        assert_eq!(applied.socks_port, 2222);
        assert!(applied.allow_lan);
        assert_eq!(applied.mode, "Rule");
        assert_eq!(applied.log_level, "debug");
        assert_eq!(entry.configuration().unwrap(), applied);
    }

    #[test]
    fn test_first_refresh_applies_registration_overrides() {
        let entry = CacheEntry::new(
            "abc",
            "vmess",
            "https://example.com/sub",
            60,
            GlobalOverrides {
                port: Some(8080),
                socks_port: None,
                allow_lan: Some(true),
            },
            None,
            CancellationToken::new(),
        );
        let applied = entry.apply_refresh(Configuration::default_template().unwrap());
        assert_eq!(applied.port, 8080);
        assert_eq!(applied.socks_port, 7891);
        assert!(applied.allow_lan);
    }

    #[test]
    fn test_snapshot_round_trip_fields() {
        let entry = entry(60);
        let record = entry.snapshot();
        assert_eq!(record.name, "abc");
        assert_eq!(record.config_name, "My-nodes");
        assert_eq!(record.interval_minutes, 60);

        let restored = CacheEntry::from_snapshot(record.clone(), CancellationToken::new());
        assert_eq!(restored.snapshot(), record);
        assert!(restored.configuration().is_none());
    }

    #[test]
    fn test_cancel() {
        let entry = entry(60);
        assert!(!entry.is_cancelled());
        entry.cancel();
        assert!(entry.is_cancelled());
    }
}
