//! Subscription cache manager
//!
//! Holds every named subscription, drives one refresh task per entry and keeps the
//! on-disk snapshot in step with the registry.
//!
//! Replacing an entry cancels the previous entry's token, stores the new entry and
//! spawns its refresh task inside one critical section on the registry lock, so a
//! name never has two live refresh tasks.

use crate::entry::{refresh_loop, CacheEntry, RefreshTaskGuard};
use crate::error::{ConvertError, Result};
use crate::fetcher::SubscriptionSource;
use crate::loader::ConfigLoader;
use crate::metrics::ManagerMetrics;
use crate::models::{Configuration, GlobalOverrides, ProxyDescriptor};
use crate::registry::ConverterRegistry;
use crate::snapshot::{read_snapshot, EntrySnapshot, SnapshotWriter};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type EntryMap = Arc<Mutex<HashMap<String, Arc<CacheEntry>>>>;

/// Runtime options for [`CacheManager`]
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Snapshot file; `None` disables persistence
    pub snapshot_path: Option<PathBuf>,
    /// Length of one refresh interval unit (one minute in production)
    pub interval_unit: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            snapshot_path: None,
            interval_unit: Duration::from_secs(60),
        }
    }
}

impl ManagerOptions {
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn with_interval_unit(mut self, unit: Duration) -> Self {
        self.interval_unit = unit;
        self
    }
}

/// A subscription registration request
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub converter: String,
    pub url: String,
    /// Refresh interval in minutes; zero or negative disables auto-refresh
    pub interval_minutes: i64,
    /// Already converted configuration to serve until the first refresh
    pub seed: Option<Configuration>,
    pub overrides: GlobalOverrides,
}

impl Registration {
    pub fn new(
        name: impl Into<String>,
        converter: impl Into<String>,
        url: impl Into<String>,
        interval_minutes: i64,
    ) -> Self {
        Registration {
            name: name.into(),
            converter: converter.into(),
            url: url.into(),
            interval_minutes,
            seed: None,
            overrides: GlobalOverrides::default(),
        }
    }

    pub fn with_seed(mut self, seed: Configuration) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_overrides(mut self, overrides: GlobalOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Concurrent, name-keyed registry of subscription cache entries
pub struct CacheManager {
    entries: EntryMap,
    loader: Arc<ConfigLoader>,
    metrics: Arc<ManagerMetrics>,
    root: CancellationToken,
    interval_unit: Duration,
    writer: Mutex<Option<SnapshotWriter>>,
    closed: AtomicBool,
}

impl CacheManager {
    /// Create a manager, restoring entries from the snapshot file if one exists
    ///
    /// A missing, unreadable or corrupt snapshot is logged and treated as a fresh
    /// start.
    pub async fn start(
        registry: Arc<ConverterRegistry>,
        source: Arc<dyn SubscriptionSource>,
        options: ManagerOptions,
    ) -> Self {
        let metrics = Arc::new(ManagerMetrics::new());
        let loader = Arc::new(ConfigLoader::new(registry, source, Arc::clone(&metrics)));
        let entries: EntryMap = Arc::new(Mutex::new(HashMap::new()));

        let writer = options.snapshot_path.as_ref().map(|path| {
            let entries = Arc::clone(&entries);
            SnapshotWriter::spawn(
                path.clone(),
                move || collect_records(&entries),
                Arc::clone(&metrics),
            )
        });

        let manager = CacheManager {
            entries,
            loader,
            metrics,
            root: CancellationToken::new(),
            interval_unit: options.interval_unit,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        };

        if let Some(path) = &options.snapshot_path {
            manager.restore(path).await;
        }

        manager
    }

    async fn restore(&self, path: &Path) {
        let records = match read_snapshot(path).await {
            Ok(Some(records)) => records,
            Ok(None) => {
                debug!("No snapshot at {}, starting fresh", path.display());
                return;
            }
            Err(e) => {
                warn!("Ignoring snapshot {}: {}", path.display(), e);
                return;
            }
        };

        let mut restored = 0u64;
        for record in records {
            if !self.loader.registry().contains(&record.converter) {
                warn!(
                    "Skipping restored entry name={}: converter {} does not exist",
                    record.name, record.converter
                );
                continue;
            }
            let name = record.name.clone();
            let entry = Arc::new(CacheEntry::from_snapshot(record, self.root.child_token()));
            self.install(entry);
            restored += 1;
            info!("Restored subscription name={} from {}", name, path.display());
        }
        self.metrics.record_restored_entries(restored);
    }

    /// Register a subscription under `name`
    ///
    /// Replaces any entry with the same name, cancelling its refresh task first.
    pub fn register(
        &self,
        name: &str,
        converter_id: &str,
        url: &str,
        interval_minutes: i64,
        seed: Option<Configuration>,
    ) -> Result<()> {
        let mut registration = Registration::new(name, converter_id, url, interval_minutes);
        registration.seed = seed;
        self.register_with(registration)
    }

    /// Register a subscription from a full [`Registration`]
    pub fn register_with(&self, registration: Registration) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConvertError::ShutDown);
        }
        self.loader.registry().require(&registration.converter)?;

        let entry = Arc::new(CacheEntry::new(
            registration.name,
            registration.converter,
            registration.url,
            registration.interval_minutes,
            registration.overrides,
            registration.seed,
            self.root.child_token(),
        ));

        let replaced = self.install(Arc::clone(&entry));
        self.metrics.record_registration(replaced);
        info!(
            "Added subscription name={} converter={} url={} interval={}",
            entry.name(),
            entry.converter(),
            entry.url(),
            entry.interval_minutes()
        );
        if !entry.overrides().is_empty() {
            debug!("Listen overrides name={} {:?}", entry.name(), entry.overrides());
        }

        self.notify_snapshot();
        Ok(())
    }

    /// Cancel-old, store-new, spawn-refresh as one critical section
    fn install(&self, entry: Arc<CacheEntry>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let replaced = match entries.get(entry.name()) {
            Some(previous) => {
                previous.cancel();
                debug!("Cancelled previous entry name={}", previous.name());
                true
            }
            None => false,
        };
        entries.insert(entry.name().to_string(), Arc::clone(&entry));

        if let Some(period) = entry.refresh_period(self.interval_unit) {
            let guard = RefreshTaskGuard::new(Arc::clone(&self.metrics));
            tokio::spawn(refresh_loop(
                entry,
                Arc::clone(&self.loader),
                Arc::clone(&self.metrics),
                period,
                guard,
            ));
        }

        replaced
    }

    /// Current configuration for `name`
    ///
    /// If nothing is cached yet, fetches and converts synchronously and caches the
    /// result. Fetch or conversion errors are returned to the caller.
    pub async fn get(&self, name: &str) -> Result<Option<Arc<Configuration>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConvertError::ShutDown);
        }
        let entry = match self.entry(name) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        if let Some(config) = entry.configuration() {
            return Ok(Some(config));
        }

        self.metrics.record_on_demand_fetch();
        info!("No cached configuration for name={}, fetching", name);
        let config = self.loader.load(entry.url(), entry.converter()).await?;
        Ok(Some(entry.apply_refresh(config)))
    }

    /// Fetch and convert a subscription without registering it
    pub async fn fetch_and_convert(&self, url: &str, converter_id: &str) -> Result<Configuration> {
        self.loader.load(url, converter_id).await
    }

    /// Decode one subscription entry with the named converter
    pub fn convert_single(&self, converter_id: &str, entry: &str) -> Result<ProxyDescriptor> {
        self.loader.registry().require(converter_id)?.convert_single(entry)
    }

    /// Template configuration of the named converter
    pub fn template(&self, converter_id: &str) -> Result<Configuration> {
        Ok(self.loader.registry().require(converter_id)?.template().clone())
    }

    pub fn entry(&self, name: &str) -> Option<Arc<CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Public records of every entry, as they would be persisted
    pub fn snapshot_records(&self) -> Vec<EntrySnapshot> {
        collect_records(&self.entries)
    }

    pub fn metrics(&self) -> &Arc<ManagerMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ConverterRegistry> {
        self.loader.registry()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn notify_snapshot(&self) {
        if let Some(writer) = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            writer.notify();
        }
    }

    /// Stop every refresh task and flush any pending snapshot write
    ///
    /// Idempotent. Afterwards `register` and `get` return `ShutDown`.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.root.cancel();
        let count = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            for entry in entries.values() {
                entry.cancel();
            }
            entries.len()
        };
        info!("Cancelled {} refresh tasks", count);

        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            writer.shutdown().await;
        }

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Cache manager shut down");
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn collect_records(entries: &EntryMap) -> Vec<EntrySnapshot> {
    let mut records: Vec<EntrySnapshot> = entries
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .map(|entry| entry.snapshot())
        .collect();
    records.sort_by(|a, b| a.name.cmp(&b.name));
    records
}
