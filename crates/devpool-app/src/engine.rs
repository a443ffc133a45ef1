//! Pool Engine
//!
//! Boot, lease, release, kill, orphan reclamation, usage-based eviction and
//! directory resynchronization. The engine itself does not serialize calls;
//! [`crate::pool::DevicePool`] runs every mutating method through the
//! [`crate::serializer::OperationSerializer`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use devpool_core::prelude::*;
use devpool_core::{
    now_millis, BootOptions, Device, DeviceFilter, DevicePatch, DeviceSignal, DeviceType,
    FieldMatch, Platform, Status, SubscribeRequest,
};
use devpool_daemon::{next_emulator_token, DeviceBackend, DeviceDirectory, ProcessProbe};

use crate::config::PoolConfig;
use crate::poller::PollGate;
use crate::ports::{PortAllocator, PortRequest};
use crate::registry::LiveHandleRegistry;
use crate::signals::TaggedSignal;
use crate::usage::UsageTracker;

pub struct PoolEngine<D, B, P> {
    directory: Arc<D>,
    backend: Arc<B>,
    probe: Arc<P>,
    config: PoolConfig,
    registry: LiveHandleRegistry,
    usage: UsageTracker,
    ports: tokio::sync::Mutex<PortAllocator>,
    poll_gate: PollGate,
    /// Bumped every time a record is marked `SHUTDOWN`
    shutdowns: AtomicU64,
    /// Responsiveness checks spawned by leases
    checks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D, B, P> PoolEngine<D, B, P>
where
    D: DeviceDirectory + Send + Sync + 'static,
    B: DeviceBackend + Send + Sync + 'static,
    P: ProcessProbe + 'static,
{
    /// Engine whose live handles report into `signal_queue`
    pub fn new(
        directory: Arc<D>,
        backend: Arc<B>,
        probe: Arc<P>,
        config: PoolConfig,
        signal_queue: mpsc::Sender<TaggedSignal>,
    ) -> Self {
        Self {
            directory,
            backend,
            probe,
            config,
            registry: LiveHandleRegistry::new(signal_queue),
            usage: UsageTracker::new(),
            ports: tokio::sync::Mutex::new(PortAllocator::new()),
            poll_gate: PollGate::new(),
            shutdowns: AtomicU64::new(0),
            checks: Mutex::new(Vec::new()),
        }
    }

    /// Load the lease counters and reserved ports kept by the directory
    pub async fn restore_state(&self) -> Result<()> {
        let counts = self.directory.usage_counts().await?;
        let reserved = self.directory.reserved_ports().await?;
        debug!(
            "Restored {} usage counters and {} reserved ports",
            counts.len(),
            reserved.len()
        );
        self.usage.restore(counts);
        *self.ports.lock().await = PortAllocator::with_reserved(reserved);
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &LiveHandleRegistry {
        &self.registry
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn poll_gate(&self) -> &PollGate {
        &self.poll_gate
    }

    /// Changes whenever a record is marked `SHUTDOWN`
    pub fn shutdown_epoch(&self) -> u64 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    async fn persist_usage(&self) -> Result<()> {
        self.directory.store_usage_counts(self.usage.counts()).await
    }

    async fn reset_usage(&self, token: &str) -> Result<()> {
        self.usage.reset(token);
        self.persist_usage().await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Boot
    // ─────────────────────────────────────────────────────────────────────

    /// Start up to `count` shut-down devices matching `filter`
    ///
    /// Devices the backend fails to start are logged and left out of the
    /// result.
    pub async fn boot(
        &self,
        filter: &DeviceFilter,
        count: usize,
        options: &BootOptions,
    ) -> Result<Vec<Device>> {
        let _suppress = self.poll_gate.suppress();

        let candidates = self
            .directory
            .find(&with_status(filter, Status::Shutdown))
            .await?;
        let count = count.max(1).min(candidates.len());
        if count == 0 {
            info!("Nothing to boot for {}", filter);
            return Ok(Vec::new());
        }

        let mut booted = Vec::with_capacity(count);
        for record in candidates.into_iter().take(count) {
            match self.start_record(&record, options).await {
                Ok(device) => booted.push(device),
                Err(e) => warn!(
                    token = %record.token,
                    name = %record.name,
                    "Skipping device that failed to boot: {}",
                    e
                ),
            }
        }
        Ok(booted)
    }

    /// Start one record and write the backend-reported state back
    async fn start_record(&self, record: &Device, options: &BootOptions) -> Result<Device> {
        let options = self.config.boot_options.union(options);
        info!(token = %record.token, name = %record.name, "Booting device");

        let handle = self.backend.start_device(record, &options).await?;
        let running = handle.device().clone();

        if running.token != record.token {
            debug!(
                "Device {} came up as {} (was {})",
                running.name, running.token, record.token
            );
            if let Some(stale) = self.registry.remove(&record.token).await {
                debug!("Dropped stale handle {:?}", stale);
            }
        }
        self.registry.insert(handle).await;
        self.reset_usage(&running.token).await?;

        let updated = self
            .directory
            .update_by_identity(record, &DevicePatch::from_running(&running))
            .await?;
        Ok(updated.unwrap_or(running))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lease / release
    // ─────────────────────────────────────────────────────────────────────

    /// Lease one device matching the request
    ///
    /// Returns `Ok(None)` when the pool is exhausted.
    pub async fn subscribe_for_device(&self, request: &SubscribeRequest) -> Result<Option<Device>> {
        let _suppress = self.poll_gate.suppress();

        let mut filter = request.filter.clone();
        filter.status = None;

        if request.restart {
            let booted = self
                .directory
                .find(&with_status(&filter, Status::Booted))
                .await?;
            for device in booted {
                info!(token = %device.token, "Restart requested, killing booted device");
                self.kill_device(&device).await?;
            }
        }

        let mut candidate = self
            .directory
            .find_one(&with_status(&filter, Status::Booted))
            .await?;

        if let Err(e) = self.reclaim_orphans(&filter.scope()).await {
            warn!("Orphan reclamation failed: {}", e);
        }

        if candidate.is_none() {
            let shutdown = self
                .directory
                .find_one(&with_status(&filter, Status::Shutdown))
                .await?;
            if let Some(record) = shutdown {
                match self.start_record(&record, &BootOptions::default()).await {
                    Ok(device) => candidate = Some(device),
                    Err(e) => warn!(name = %record.name, "Lease boot failed: {}", e),
                }
            }
        }

        let Some(device) = candidate else {
            info!("No device available for {}", filter);
            return Ok(None);
        };

        let patch = DevicePatch::lease(
            request.info.clone(),
            request.parent_process_pid,
            now_millis(),
        );
        let Some(leased) = self.directory.update_by_identity(&device, &patch).await? else {
            warn!(token = %device.token, "Leased record disappeared from the directory");
            return Ok(None);
        };

        let uses = self.usage.increment(&leased.token);
        if let Err(e) = self.persist_usage().await {
            warn!(token = %leased.token, "Failed to store usage count: {}", e);
        }
        info!(
            token = %leased.token,
            name = %leased.name,
            uses,
            "Leased device"
        );

        if leased.is_android_emulator() {
            self.spawn_responsiveness_check(leased.clone());
        }

        Ok(Some(leased))
    }

    /// Reboot a leased emulator that stopped answering, without blocking the lease
    fn spawn_responsiveness_check(&self, device: Device) {
        let backend = Arc::clone(&self.backend);
        let check = tokio::spawn(async move {
            if backend.is_emulator_responsive(&device).await {
                return;
            }
            warn!(token = %device.token, "Emulator is not responsive, rebooting");
            if let Err(e) = backend.reboot_emulator(&device).await {
                warn!(token = %device.token, "Emulator reboot failed: {}", e);
            }
        });

        let mut checks = self.checks.lock().unwrap_or_else(|e| e.into_inner());
        checks.retain(|c| !c.is_finished());
        checks.push(check);
    }

    /// Wait for every responsiveness check spawned so far
    pub async fn settle_checks(&self) {
        let pending = std::mem::take(&mut *self.checks.lock().unwrap_or_else(|e| e.into_inner()));
        for check in pending {
            if let Err(e) = check.await {
                warn!("Responsiveness check ended abnormally: {}", e);
            }
        }
    }

    /// Kill leased devices whose owning process has exited
    ///
    /// Returns how many devices were reclaimed.
    pub async fn reclaim_orphans(&self, scope: &DeviceFilter) -> Result<usize> {
        let busy = self
            .directory
            .find(&with_status(scope, Status::Busy))
            .await?;

        let mut reclaimed = 0;
        for device in busy {
            let Some(owner) = device.parent_process_pid else {
                continue;
            };
            if self.probe.is_process_alive(owner) {
                continue;
            }

            info!(
                token = %device.token,
                owner,
                "Reclaiming device leased by an exited process"
            );
            match self.kill_device(&device).await {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!(token = %device.token, "Failed to reclaim orphan: {}", e),
            }
        }
        Ok(reclaimed)
    }

    /// Return a leased device to the pool
    ///
    /// Returns the record as it was right after release, before eviction
    /// had a chance to kill it. `Ok(None)` if no record carries `token`.
    pub async fn unsubscribe_from_device(&self, token: &str) -> Result<Option<Device>> {
        let Some(device) = self.directory.find_by_token(token).await? else {
            debug!("Release of unknown token {}", token);
            return Ok(None);
        };

        let snapshot = if device.status == Status::Shutdown {
            device
        } else {
            self.directory
                .update_by_identity(&device, &DevicePatch::release())
                .await?
                .unwrap_or(device)
        };
        info!(token = %snapshot.token, "Released device");

        if let Err(e) = self.enforce_ceiling(snapshot.platform).await {
            warn!("Ceiling enforcement for {} failed: {}", snapshot.platform, e);
        }

        Ok(Some(snapshot))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Eviction
    // ─────────────────────────────────────────────────────────────────────

    /// Recycle worn-out idle devices and trim the platform under its ceiling
    pub async fn enforce_ceiling(&self, platform: Platform) -> Result<()> {
        let scope = DeviceFilter::for_platform(platform);
        let booted = self
            .directory
            .find(&with_status(&scope, Status::Booted))
            .await?;
        let busy = self
            .directory
            .find(&with_status(&scope, Status::Busy))
            .await?
            .len();

        let limit = self.config.usage_limit(platform);
        let mut idle = Vec::with_capacity(booted.len());
        for device in booted {
            if self.usage.reached_limit(&device.token, limit) {
                info!(
                    token = %device.token,
                    uses = self.usage.get(&device.token),
                    "Recycling device that reached its usage limit"
                );
                self.kill_device(&device).await?;
            } else {
                idle.push(device);
            }
        }

        let max = self.config.max_count(platform);
        let mut active = idle.len() + busy;
        if active < max {
            return Ok(());
        }

        // Oldest instances go first
        idle.sort_by_key(|d| d.started_at);
        for device in idle {
            if active < max {
                break;
            }
            info!(
                token = %device.token,
                "Stopping idle {} device: {} active, ceiling {}",
                platform, active, max
            );
            self.kill_device(&device).await?;
            active -= 1;
        }

        if active >= max {
            warn!(
                "{} {} devices active with ceiling {}, all of them leased",
                active, platform, max
            );
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Kill
    // ─────────────────────────────────────────────────────────────────────

    /// Stop one device and mark its record `SHUTDOWN`
    ///
    /// Backend failures are logged; the record is marked either way.
    pub async fn kill_device(&self, device: &Device) -> Result<()> {
        match self.registry.remove(&device.token).await {
            Some(mut handle) => {
                if let Err(e) = self.backend.stop_device(&mut handle).await {
                    warn!(token = %device.token, "Failed to stop device: {}", e);
                }
            }
            None => {
                if let Err(e) = self.backend.kill_by_identity(device).await {
                    warn!(token = %device.token, "Failed to kill device: {}", e);
                }
            }
        }
        self.reset_usage(&device.token).await?;

        let patch = DevicePatch::shutdown();
        if self
            .directory
            .update_by_identity(device, &patch)
            .await?
            .is_none()
        {
            self.directory.update(&device.token, &patch).await?;
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        debug!(token = %device.token, "Device marked SHUTDOWN");
        Ok(())
    }

    /// Kill every matching device, then resync the same scope
    pub async fn kill_devices(&self, filter: Option<&DeviceFilter>) -> Result<Vec<Device>> {
        let filter = filter.cloned().unwrap_or_default();
        let devices = self.directory.find(&filter).await?;
        info!("Killing {} devices matching {}", devices.len(), filter);

        for device in &devices {
            self.kill_device(device).await?;
        }

        self.refresh_data(&filter).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Resynchronization
    // ─────────────────────────────────────────────────────────────────────

    /// Make sure every matching running record has a live handle with listeners
    ///
    /// Shut-down records are never attached. Returns the records that ended
    /// up attached.
    pub async fn attach_to_device(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        let records = self.directory.find(filter).await?;
        let mut attached = Vec::with_capacity(records.len());

        for record in records {
            if record.status == Status::Shutdown {
                trace!(token = %record.token, "Not attaching to shut-down device");
                continue;
            }
            if self.registry.has_listeners(&record.token).await {
                attached.push(record);
                continue;
            }

            match self.backend.attach_to_running_device(&record).await {
                Ok(handle) => {
                    debug!(token = %record.token, "Attached live handle");
                    self.registry.insert(handle).await;
                    attached.push(record);
                }
                Err(e) => warn!(token = %record.token, "Failed to attach: {}", e),
            }
        }
        Ok(attached)
    }

    /// Replace matching records with the backend's inventory and reattach
    pub async fn refresh_data(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        let inventory = self.backend.inventory(filter).await?;
        let removed = self.directory.delete_many(filter).await?;
        debug!(
            "Refreshing {}: {} records out, {} in",
            filter,
            removed,
            inventory.len()
        );
        self.directory.insert_many(inventory).await?;

        let records = self.directory.find(filter).await?;
        for record in records.iter().filter(|d| d.status == Status::Booted) {
            if let Err(e) = self.attach_to_device(&DeviceFilter::for_device(record)).await {
                warn!(token = %record.token, "Reattach after refresh failed: {}", e);
            }
        }
        Ok(records)
    }

    /// Forget every record and rebuild the directory from the backend
    pub async fn drop_and_refresh(&self) -> Result<Vec<Device>> {
        info!("Dropping device directory");
        self.directory.drop_all().await?;
        self.refresh_data(&DeviceFilter::all()).await
    }

    pub async fn update(&self, token: &str, patch: &DevicePatch) -> Result<Option<Device>> {
        self.directory.update(token, patch).await
    }

    pub async fn find(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        self.directory.find(filter).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ports
    // ─────────────────────────────────────────────────────────────────────

    /// Hand out a free port and remember it in the directory
    pub async fn reserve_port(&self, request: &PortRequest) -> Result<u16> {
        let mut ports = self.ports.lock().await;
        let port = ports.reserve(request).await?;

        if let Err(e) = self
            .directory
            .store_reserved_ports(ports.reserved().clone())
            .await
        {
            ports.release(port);
            return Err(e);
        }
        info!(port, "Reserved port");
        Ok(port)
    }

    /// Return a port; `false` if it was not reserved
    pub async fn release_port(&self, port: u16) -> Result<bool> {
        let mut ports = self.ports.lock().await;
        if !ports.is_reserved(port) {
            debug!(port, "Release of a port that was not reserved");
            return Ok(false);
        }

        let mut remaining = ports.reserved().clone();
        remaining.remove(&port);
        self.directory.store_reserved_ports(remaining).await?;
        ports.release(port);
        info!(port, "Released port");
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Signals and reconciliation
    // ─────────────────────────────────────────────────────────────────────

    /// React to a lifecycle signal from a live handle
    pub async fn handle_signal(&self, tagged: TaggedSignal) -> Result<()> {
        let TaggedSignal {
            token,
            generation,
            signal,
        } = tagged;

        match signal {
            DeviceSignal::Killed(device) => {
                if self
                    .registry
                    .remove_if_current(&token, generation)
                    .await
                    .is_none()
                {
                    let current = self.registry.generation(&token).await;
                    debug!(
                        "Ignoring killed signal from stale handle {} (generation {}, current {:?})",
                        token, generation, current
                    );
                    return Ok(());
                }

                info!(token = %token, name = %device.name, "Device exited");
                self.reset_usage(&token).await?;
                self.directory
                    .update(&token, &DevicePatch::shutdown())
                    .await?;
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
            }
            DeviceSignal::Error { device, message } => {
                warn!(token = %token, name = %device.name, "Device error: {}", message);
            }
            DeviceSignal::Attached(device) => {
                info!(token = %token, name = %device.name, "Attached to running device");
            }
        }
        Ok(())
    }

    /// Fold running devices the directory does not track as live
    ///
    /// Returns how many devices were taken over.
    pub async fn reconcile_running(&self, running: Vec<Device>) -> Result<usize> {
        let mut reconciled = 0;

        for device in running {
            let tracked = self
                .directory
                .find_one(
                    &DeviceFilter::by_token(device.token.clone())
                        .with_name(FieldMatch::exact(device.name.clone())),
                )
                .await?;
            if tracked.is_some_and(|d| d.status != Status::Shutdown) {
                continue;
            }

            info!(
                token = %device.token,
                name = %device.name,
                "Taking over device started outside the pool"
            );
            match device.platform {
                Platform::Android => self.reconcile_android(&device).await?,
                Platform::Ios => {
                    let patch = DevicePatch::from_running(&device);
                    if self.directory.update(&device.token, &patch).await?.is_none() {
                        self.directory.insert_many(vec![device.clone()]).await?;
                    }
                }
            }
            self.reset_usage(&device.token).await?;

            if let Err(e) = self
                .attach_to_device(&DeviceFilter::for_device(&device))
                .await
            {
                warn!(token = %device.token, "Failed to attach reconciled device: {}", e);
            }
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Emulator ports are reused by the OS; move a colliding record aside
    async fn reconcile_android(&self, device: &Device) -> Result<()> {
        if let Some(holder) = self.directory.find_by_token(&device.token).await? {
            if holder.name != device.name {
                let mut taken: Vec<String> = self
                    .directory
                    .find(
                        &DeviceFilter::for_platform(Platform::Android)
                            .with_device_type(DeviceType::Emulator),
                    )
                    .await?
                    .into_iter()
                    .map(|d| d.token)
                    .collect();
                taken.push(device.token.clone());

                match next_emulator_token(&taken) {
                    Some(fresh) => {
                        debug!(
                            "Token {} of {} collides with {}, moving it to {}",
                            holder.token, holder.name, device.name, fresh
                        );
                        let patch = DevicePatch {
                            token: Some(fresh),
                            ..Default::default()
                        };
                        self.directory.update_by_identity(&holder, &patch).await?;
                    }
                    None => warn!("No free emulator port left to resolve token collision"),
                }
            }
        }

        let by_name = self
            .directory
            .find_one(
                &DeviceFilter::for_platform(Platform::Android)
                    .with_name(FieldMatch::exact(device.name.clone())),
            )
            .await?;
        match by_name {
            Some(record) => {
                self.directory
                    .update_by_identity(&record, &DevicePatch::from_running(device))
                    .await?;
            }
            None => self.directory.insert_many(vec![device.clone()]).await?,
        }
        Ok(())
    }
}

/// Copy of `filter` pinned to one status
fn with_status(filter: &DeviceFilter, status: Status) -> DeviceFilter {
    filter.clone().with_status(status)
}
