//! Snapshot persistence of cache entries
//!
//! Only the public state of each entry is written: name, download name, source url,
//! refresh interval, converter id and listen overrides. Cached configurations are
//! never persisted; they are fetched again on first read after a restart.
//!
//! File layout: bincode-encoded [`SnapshotFile`], replaced atomically by writing a
//! sibling temp file and renaming it over the target.

use crate::error::{ConvertError, Result};
use crate::metrics::ManagerMetrics;
use crate::models::GlobalOverrides;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SNAPSHOT_VERSION: u32 = 1;

/// Persisted public state of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub name: String,
    pub config_name: String,
    pub url: String,
    pub interval_minutes: i64,
    pub converter: String,
    pub overrides: GlobalOverrides,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    entries: Vec<EntrySnapshot>,
}

/// Encode entries into the snapshot byte format
pub fn encode_snapshot(entries: &[EntrySnapshot]) -> Result<Vec<u8>> {
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        entries: entries.to_vec(),
    };
    bincode::serialize(&file)
        .map_err(|e| ConvertError::Persistence(format!("Failed to encode snapshot: {}", e)))
}

/// Decode entries from the snapshot byte format
pub fn decode_snapshot(data: &[u8]) -> Result<Vec<EntrySnapshot>> {
    let file: SnapshotFile = bincode::deserialize(data)
        .map_err(|e| ConvertError::Persistence(format!("Failed to decode snapshot: {}", e)))?;

    if file.version != SNAPSHOT_VERSION {
        return Err(ConvertError::Persistence(format!(
            "Unsupported snapshot version {}, expected {}",
            file.version, SNAPSHOT_VERSION
        )));
    }
    Ok(file.entries)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a snapshot file, replacing any previous one atomically
pub async fn write_snapshot(path: &Path, entries: &[EntrySnapshot]) -> Result<()> {
    let data = encode_snapshot(entries)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(|e| {
            ConvertError::Persistence(format!("Failed to create snapshot directory: {}", e))
        })?;
    }

    let tmp = temp_path(path);
    let mut file = fs::File::create(&tmp).await.map_err(|e| {
        ConvertError::Persistence(format!("Failed to create snapshot file: {}", e))
    })?;

    file.write_all(&data)
        .await
        .map_err(|e| ConvertError::Persistence(format!("Failed to write snapshot: {}", e)))?;

    file.sync_all()
        .await
        .map_err(|e| ConvertError::Persistence(format!("Failed to sync snapshot: {}", e)))?;
    drop(file);

    fs::rename(&tmp, path)
        .await
        .map_err(|e| ConvertError::Persistence(format!("Failed to replace snapshot: {}", e)))?;

    debug!("Wrote snapshot {} ({} entries)", path.display(), entries.len());
    Ok(())
}

/// Read a snapshot file
///
/// # Returns
/// * `Ok(None)` if the file does not exist
/// * `Ok(Some(entries))` if it was decoded
/// * `Err(ConvertError::Persistence)` if it exists but can't be read or decoded
pub async fn read_snapshot(path: &Path) -> Result<Option<Vec<EntrySnapshot>>> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConvertError::Persistence(format!(
                "Failed to read snapshot {}: {}",
                path.display(),
                e
            )))
        }
    };
    decode_snapshot(&data).map(Some)
}

/// Background task persisting entry state whenever it is signalled
///
/// Signals travel over a capacity-1 channel, so a burst of changes while a write
/// is in flight collapses into a single follow-up write.
pub struct SnapshotWriter {
    notify: mpsc::Sender<()>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl SnapshotWriter {
    /// Spawn the writer task
    ///
    /// `collect` is called once per write to gather the current entry records.
    pub fn spawn<F>(path: PathBuf, collect: F, metrics: Arc<ManagerMetrics>) -> Self
    where
        F: Fn() -> Vec<EntrySnapshot> + Send + Sync + 'static,
    {
        let (notify, rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(Self::writer_task(rx, stop.clone(), path, collect, metrics));
        SnapshotWriter {
            notify,
            stop,
            handle,
        }
    }

    /// Mark persisted state as stale; never blocks
    pub fn notify(&self) {
        match self.notify.try_send(()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("Snapshot write already pending, coalescing");
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!("Snapshot writer is no longer running");
            }
        }
    }

    /// Flush any pending write and wait for the task to exit
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            error!("Snapshot writer task failed: {}", e);
        }
    }

    async fn writer_task<F>(
        mut rx: mpsc::Receiver<()>,
        stop: CancellationToken,
        path: PathBuf,
        collect: F,
        metrics: Arc<ManagerMetrics>,
    ) where
        F: Fn() -> Vec<EntrySnapshot> + Send + Sync + 'static,
    {
        info!("Snapshot writer started path={}", path.display());

        loop {
            tokio::select! {
                biased;
                signal = rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    Self::persist(&path, &collect, &metrics).await;
                }
                _ = stop.cancelled() => {
                    if rx.try_recv().is_ok() {
                        Self::persist(&path, &collect, &metrics).await;
                    }
                    break;
                }
            }
        }

        info!("Snapshot writer stopped path={}", path.display());
    }

    async fn persist<F>(path: &Path, collect: &F, metrics: &ManagerMetrics)
    where
        F: Fn() -> Vec<EntrySnapshot>,
    {
        let entries = collect();
        match write_snapshot(path, &entries).await {
            Ok(()) => {
                metrics.record_snapshot_write(true);
                info!("Backup succeeded path={} entries={}", path.display(), entries.len());
            }
            Err(e) => {
                metrics.record_snapshot_write(false);
                error!("Backup failed path={}: {}", path.display(), e);
            }
        }
    }
}
