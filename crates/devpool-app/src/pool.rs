//! DevicePool - public entry point
//!
//! Wraps a [`PoolEngine`] so that every mutating operation and every
//! lifecycle signal runs through one [`OperationSerializer`]. Reads and
//! plain record updates go straight to the directory.
//!
//! The first queued job restores lease counters and reserved ports from the
//! directory, so a pool opened on an existing snapshot carries on where the
//! previous one stopped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use devpool_core::prelude::*;
use devpool_core::{BootOptions, Device, DeviceFilter, DevicePatch, SubscribeRequest};
use devpool_daemon::{DeviceBackend, DeviceDirectory, ProcessProbe};

use crate::config::PoolConfig;
use crate::engine::PoolEngine;
use crate::poller::{ReconciliationPoller, TickOutcome};
use crate::ports::PortRequest;
use crate::serializer::OperationSerializer;
use crate::signals::{spawn_signal_pump, SIGNAL_QUEUE_CAPACITY};

/// How long shutdown waits for in-flight background jobs
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for emulator responsiveness checks
const CHECK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DevicePool<D, B, P> {
    engine: Arc<PoolEngine<D, B, P>>,
    serializer: OperationSerializer,
    worker: JoinHandle<()>,
    signal_pump: JoinHandle<()>,
    poller_task: Mutex<Option<JoinHandle<()>>>,
}

impl<D, B, P> DevicePool<D, B, P>
where
    D: DeviceDirectory + Send + Sync + 'static,
    B: DeviceBackend + Send + Sync + 'static,
    P: ProcessProbe + 'static,
{
    /// Build the engine and start the serializer and signal pump
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(directory: Arc<D>, backend: Arc<B>, probe: Arc<P>, config: PoolConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        let engine = Arc::new(PoolEngine::new(directory, backend, probe, config, queue_tx));
        let (serializer, worker) = OperationSerializer::start();
        let signal_pump = spawn_signal_pump(queue_rx, Arc::clone(&engine), serializer.clone());

        let restoring = Arc::clone(&engine);
        if let Err(e) =
            serializer.submit_detached("restore", async move { restoring.restore_state().await })
        {
            warn!("Could not queue state restore: {}", e);
        }

        Self {
            engine,
            serializer,
            worker,
            signal_pump,
            poller_task: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<PoolEngine<D, B, P>> {
        &self.engine
    }

    pub async fn boot(
        &self,
        filter: DeviceFilter,
        count: usize,
        options: BootOptions,
    ) -> Result<Vec<Device>> {
        let engine = Arc::clone(&self.engine);
        self.serializer
            .submit("boot", async move { engine.boot(&filter, count, &options).await })
            .await
    }

    pub async fn subscribe_for_device(&self, request: SubscribeRequest) -> Result<Option<Device>> {
        let engine = Arc::clone(&self.engine);
        self.serializer
            .submit("subscribe", async move {
                engine.subscribe_for_device(&request).await
            })
            .await
    }

    pub async fn unsubscribe_from_device(&self, token: impl Into<String>) -> Result<Option<Device>> {
        let engine = Arc::clone(&self.engine);
        let token = token.into();
        self.serializer
            .submit("unsubscribe", async move {
                engine.unsubscribe_from_device(&token).await
            })
            .await
    }

    /// Kill every device matching `filter`; `None` kills everything
    pub async fn kill_devices(&self, filter: Option<DeviceFilter>) -> Result<Vec<Device>> {
        let engine = Arc::clone(&self.engine);
        self.serializer
            .submit("kill", async move { engine.kill_devices(filter.as_ref()).await })
            .await
    }

    pub async fn refresh_data(&self, filter: DeviceFilter) -> Result<Vec<Device>> {
        let engine = Arc::clone(&self.engine);
        self.serializer
            .submit("refresh", async move { engine.refresh_data(&filter).await })
            .await
    }

    pub async fn attach_to_device(&self, filter: DeviceFilter) -> Result<Vec<Device>> {
        let engine = Arc::clone(&self.engine);
        self.serializer
            .submit("attach", async move { engine.attach_to_device(&filter).await })
            .await
    }

    pub async fn drop_and_refresh(&self) -> Result<Vec<Device>> {
        let engine = Arc::clone(&self.engine);
        self.serializer
            .submit("drop", async move { engine.drop_and_refresh().await })
            .await
    }

    /// Reserve a free TCP port for the caller
    pub async fn reserve_port(&self, request: PortRequest) -> Result<u16> {
        let engine = Arc::clone(&self.engine);
        self.serializer
            .submit("reserve port", async move { engine.reserve_port(&request).await })
            .await
    }

    pub async fn release_port(&self, port: u16) -> Result<bool> {
        let engine = Arc::clone(&self.engine);
        self.serializer
            .submit("release port", async move { engine.release_port(port).await })
            .await
    }

    pub async fn update(&self, token: &str, patch: &DevicePatch) -> Result<Option<Device>> {
        self.engine.update(token, patch).await
    }

    pub async fn find(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        self.engine.find(filter).await
    }

    /// Wait for every operation queued so far to finish
    pub async fn flush(&self) -> Result<()> {
        self.serializer.submit("flush", async { Ok(()) }).await
    }

    fn poller(&self) -> ReconciliationPoller<D, B, P> {
        ReconciliationPoller::new(Arc::clone(&self.engine), self.serializer.clone())
    }

    /// Start the reconciliation poller; a no-op if it already runs
    pub fn start_polling(&self) {
        let mut task = self
            .poller_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        *task = Some(self.poller().spawn());
    }

    pub fn is_polling(&self) -> bool {
        self.poller_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Run a single reconciliation pass now
    pub async fn poll_once(&self) -> TickOutcome {
        self.poller().tick().await
    }

    /// Stop polling, detach every live handle and stop the workers
    ///
    /// Devices keep running; a later pool can attach to them again.
    pub async fn shutdown(self) {
        let poller = self
            .poller_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(poller) = poller {
            poller.abort();
            let _ = poller.await;
        }

        // Let queued operations settle before handles go away
        if let Err(e) = self.flush().await {
            debug!("Serializer already stopped: {}", e);
        }
        if tokio::time::timeout(CHECK_SHUTDOWN_TIMEOUT, self.engine.settle_checks())
            .await
            .is_err()
        {
            warn!("Emulator responsiveness checks did not finish in time");
        }
        self.engine.registry().detach_all().await;
        self.signal_pump.abort();
        let _ = self.signal_pump.await;

        drop(self.serializer);
        match tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, self.worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Serializer worker ended abnormally: {}", e),
            Err(_) => warn!("Serializer worker did not stop in time"),
        }
        info!("Device pool shut down");
    }
}
