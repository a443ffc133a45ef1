//! Device Directory: the store of device records
//!
//! [`MemoryDirectory`] keeps records in process memory. When opened on a
//! path it also mirrors every mutation to a JSON snapshot and holds an
//! exclusive lock on a sibling `.lock` file, so only one pool at a time
//! can own the snapshot.
//!
//! Besides the records, the snapshot carries the per-token lease counters
//! and the ports handed out by the port allocator. Both outlive a single
//! pool instance, so a lease taken by one CLI run is counted by the next.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use devpool_core::prelude::*;
use devpool_core::{Device, DeviceFilter, DevicePatch};

/// Persistence contract consumed by the pool engine
#[trait_variant::make(DeviceDirectory: Send)]
pub trait LocalDeviceDirectory {
    async fn find(&self, filter: &DeviceFilter) -> Result<Vec<Device>>;

    async fn find_one(&self, filter: &DeviceFilter) -> Result<Option<Device>>;

    async fn find_by_token(&self, token: &str) -> Result<Option<Device>>;

    async fn insert_many(&self, devices: Vec<Device>) -> Result<()>;

    /// Delete every record matching `filter`, returning how many went away
    async fn delete_many(&self, filter: &DeviceFilter) -> Result<usize>;

    /// Patch the first record carrying `token`
    async fn update(&self, token: &str, patch: &DevicePatch) -> Result<Option<Device>>;

    /// Patch the record that `original` was read from
    async fn update_by_identity(
        &self,
        original: &Device,
        patch: &DevicePatch,
    ) -> Result<Option<Device>>;

    async fn drop_all(&self) -> Result<()>;

    /// Lease counters of the running instances, by token
    async fn usage_counts(&self) -> Result<HashMap<String, u32>>;

    async fn store_usage_counts(&self, counts: HashMap<String, u32>) -> Result<()>;

    /// Ports currently handed out by the port allocator
    async fn reserved_ports(&self) -> Result<BTreeSet<u16>>;

    async fn store_reserved_ports(&self, ports: BTreeSet<u16>) -> Result<()>;
}

/// Everything the directory stores
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolState {
    devices: Vec<Device>,
    #[serde(default)]
    usage: HashMap<String, u32>,
    #[serde(default)]
    reserved_ports: BTreeSet<u16>,
}

/// On-disk layouts; early snapshots held only the record list
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    State(PoolState),
    Records(Vec<Device>),
}

impl From<SnapshotFile> for PoolState {
    fn from(file: SnapshotFile) -> Self {
        match file {
            SnapshotFile::State(state) => state,
            SnapshotFile::Records(devices) => PoolState {
                devices,
                ..Default::default()
            },
        }
    }
}

/// Snapshot location plus the lock that guards it
#[derive(Debug)]
struct Snapshot {
    path: PathBuf,
    _lock: File,
}

/// In-process directory with an optional JSON snapshot
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    state: RwLock<PoolState>,
    snapshot: Option<Snapshot>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<Device>) -> Self {
        Self {
            state: RwLock::new(PoolState {
                devices,
                ..Default::default()
            }),
            snapshot: None,
        }
    }

    /// Open a snapshot-backed directory, waiting for the lock if needed
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = open_lock_file(&path)?;

        let lock = match lock.try_lock_exclusive() {
            Ok(()) => lock,
            Err(_) => {
                info!("Waiting for device directory lock on {}", path.display());
                tokio::task::spawn_blocking(move || lock.lock_exclusive().map(|_| lock))
                    .await
                    .map_err(|e| Error::directory(format!("lock task failed: {}", e)))??
            }
        };

        Self::load(path, lock)
    }

    /// Open a snapshot-backed directory, failing if another pool holds it
    pub fn try_open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = open_lock_file(&path)?;
        lock.try_lock_exclusive()
            .map_err(|_| Error::DirectoryLocked { path: path.clone() })?;

        Self::load(path, lock)
    }

    fn load(path: PathBuf, lock: File) -> Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
            if content.trim().is_empty() {
                PoolState::default()
            } else {
                serde_json::from_str::<SnapshotFile>(&content)
                    .map_err(|e| {
                        Error::directory(format!("corrupt snapshot {}: {}", path.display(), e))
                    })?
                    .into()
            }
        } else {
            PoolState::default()
        };

        debug!(
            "Loaded {} device records from {}",
            state.devices.len(),
            path.display()
        );

        Ok(Self {
            state: RwLock::new(state),
            snapshot: Some(Snapshot { path, _lock: lock }),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_ref().map(|s| s.path.as_path())
    }

    /// Write the snapshot; the caller holds the write guard
    fn persist(&self, state: &PoolState) -> Result<()> {
        let Some(ref snapshot) = self.snapshot else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(state)?;
        let tmp = snapshot.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(content.as_bytes())?;
            file.flush()?;
        }
        std::fs::rename(&tmp, &snapshot.path).context("Failed to replace device snapshot")?;

        trace!("Persisted {} device records", state.devices.len());
        Ok(())
    }

    /// Apply `change` to a copy of the state, persist it, then commit
    ///
    /// A failed write leaves both memory and disk as they were.
    async fn mutate<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut PoolState) -> T + Send,
        T: Send,
    {
        let mut state = self.state.write().await;
        if self.snapshot.is_none() {
            return Ok(change(&mut *state));
        }

        let mut next = (*state).clone();
        let output = change(&mut next);
        if next != *state {
            self.persist(&next)?;
            *state = next;
        }
        Ok(output)
    }

    async fn patch_where<F>(&self, predicate: F, patch: &DevicePatch) -> Result<Option<Device>>
    where
        F: Fn(&Device) -> bool + Send,
    {
        self.mutate(move |state| {
            let device = state.devices.iter_mut().find(|d| predicate(d))?;
            device.apply(patch);
            Some(device.clone())
        })
        .await
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let lock_path = path.with_extension("lock");
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| Error::directory(format!("cannot open {}: {}", lock_path.display(), e)))
}

impl DeviceDirectory for MemoryDirectory {
    async fn find(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        let state = self.state.read().await;
        Ok(state
            .devices
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn find_one(&self, filter: &DeviceFilter) -> Result<Option<Device>> {
        let state = self.state.read().await;
        Ok(state.devices.iter().find(|d| filter.matches(d)).cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Device>> {
        let state = self.state.read().await;
        Ok(state.devices.iter().find(|d| d.token == token).cloned())
    }

    async fn insert_many(&self, devices: Vec<Device>) -> Result<()> {
        self.mutate(|state| state.devices.extend(devices)).await
    }

    async fn delete_many(&self, filter: &DeviceFilter) -> Result<usize> {
        self.mutate(|state| {
            let before = state.devices.len();
            state.devices.retain(|d| !filter.matches(d));
            before - state.devices.len()
        })
        .await
    }

    async fn update(&self, token: &str, patch: &DevicePatch) -> Result<Option<Device>> {
        self.patch_where(|d| d.token == token, patch).await
    }

    async fn update_by_identity(
        &self,
        original: &Device,
        patch: &DevicePatch,
    ) -> Result<Option<Device>> {
        self.patch_where(|d| d.same_identity(original), patch).await
    }

    async fn drop_all(&self) -> Result<()> {
        self.mutate(|state| state.devices.clear()).await
    }

    async fn usage_counts(&self) -> Result<HashMap<String, u32>> {
        Ok(self.state.read().await.usage.clone())
    }

    async fn store_usage_counts(&self, counts: HashMap<String, u32>) -> Result<()> {
        self.mutate(|state| state.usage = counts).await
    }

    async fn reserved_ports(&self) -> Result<BTreeSet<u16>> {
        Ok(self.state.read().await.reserved_ports.clone())
    }

    async fn store_reserved_ports(&self, ports: BTreeSet<u16>) -> Result<()> {
        self.mutate(|state| state.reserved_ports = ports).await
    }
}
