//! Clash Subscription Converter
//!
//! Converts base64 vmess subscriptions into Clash configuration documents and keeps
//! a name-keyed cache of them up to date in the background.
//!
//! # Overview
//!
//! A subscription is a URL serving a base64 payload whose decoded lines are
//! `vmess://<base64 JSON>` links. Each registered subscription becomes a cache
//! entry with its own refresh task; the set of registrations survives restarts
//! through a snapshot file.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use clash_subconvert::{CacheManager, ConverterRegistry, ManagerOptions, SubscriptionFetcher};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = CacheManager::start(
//!     Arc::new(ConverterRegistry::with_defaults()?),
//!     Arc::new(SubscriptionFetcher::new()?),
//!     ManagerOptions::default().with_snapshot_path("/tmp/clash-convert.db"),
//! )
//! .await;
//!
//! manager.register("home", "vmess", "https://example.com/sub", 60, None)?;
//! if let Some(config) = manager.get("home").await? {
//!     println!("{}", config.to_yaml()?);
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`VmessConverter`]: decodes a subscription payload into a [`Configuration`]
//! - [`ConverterRegistry`]: converters by identity
//! - [`SubscriptionFetcher`]: downloads subscription payloads
//! - [`CacheManager`]: entries, refresh tasks, snapshot persistence
//! - [`SubscriptionServer`]: HTTP front end

pub mod config;
pub mod entry;
pub mod error;
pub mod fetcher;
pub mod loader;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod vmess;

pub use config::{AppConfig, SubscriptionConfig};
pub use entry::{carry_forward_overrides, config_name, subscription_name, CacheEntry};
pub use error::{ConvertError, Result};
pub use fetcher::{SubscriptionFetcher, SubscriptionSource};
pub use loader::ConfigLoader;
pub use manager::{CacheManager, ManagerOptions, Registration};
pub use metrics::{ManagerMetrics, MetricsSnapshot};
pub use models::{Configuration, GlobalOverrides, ProxyDescriptor, ProxyGroup};
pub use registry::{Converter, ConverterRegistry};
pub use server::{format_prometheus_metrics, RequestHandler, SubscriptionServer};
pub use snapshot::{read_snapshot, write_snapshot, EntrySnapshot, SnapshotWriter};
pub use vmess::{convert_single, VmessConverter, VMESS_CONVERTER};
