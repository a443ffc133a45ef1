//! Reconciliation Poller
//!
//! Periodically folds devices started outside the pool back into the
//! directory and the live handle registry. Ticks are skipped while a boot
//! or lease holds a [`PollSuppression`], and a tick that would overlap a
//! still-running one is dropped rather than queued. A tick whose inventory
//! predates a device being shut down is discarded; the next tick lists
//! running devices afresh.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use devpool_core::prelude::*;
use devpool_daemon::{DeviceBackend, DeviceDirectory, ProcessProbe};

use crate::engine::PoolEngine;
use crate::serializer::OperationSerializer;

/// Shared suspend/resume signal for the poller
#[derive(Debug, Clone, Default)]
pub struct PollGate {
    suppressed: Arc<AtomicUsize>,
}

impl PollGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress polling until the returned guard is dropped
    ///
    /// Guards nest; polling resumes once the last one goes away.
    pub fn suppress(&self) -> PollSuppression {
        self.suppressed.fetch_add(1, Ordering::SeqCst);
        PollSuppression {
            suppressed: Arc::clone(&self.suppressed),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst) > 0
    }
}

/// RAII guard returned by [`PollGate::suppress`]
#[derive(Debug)]
#[must_use = "polling resumes as soon as the guard is dropped"]
pub struct PollSuppression {
    suppressed: Arc<AtomicUsize>,
}

impl Drop for PollSuppression {
    fn drop(&mut self) {
        self.suppressed.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a single poll tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A boot or lease was in progress
    Suppressed,
    /// The previous tick had not finished yet
    Overlapping,
    /// A device was shut down after the inventory was taken
    Stale,
    /// Number of untracked running devices folded in
    Reconciled(usize),
    /// Inventory or reconciliation failed; logged
    Failed,
}

/// Clears the in-flight flag when a tick ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ReconciliationPoller<D, B, P> {
    engine: Arc<PoolEngine<D, B, P>>,
    serializer: OperationSerializer,
    in_flight: AtomicBool,
    interval: Duration,
}

impl<D, B, P> ReconciliationPoller<D, B, P>
where
    D: DeviceDirectory + Send + Sync + 'static,
    B: DeviceBackend + Send + Sync + 'static,
    P: ProcessProbe + 'static,
{
    pub fn new(engine: Arc<PoolEngine<D, B, P>>, serializer: OperationSerializer) -> Self {
        let interval = engine.config().poll_interval();
        Self {
            engine,
            serializer,
            in_flight: AtomicBool::new(false),
            interval,
        }
    }

    /// Run one reconciliation pass
    pub async fn tick(&self) -> TickOutcome {
        let gate = self.engine.poll_gate();
        if gate.is_suppressed() {
            trace!("Poll tick skipped: suppressed");
            return TickOutcome::Suppressed;
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Poll tick dropped: previous tick still running");
            return TickOutcome::Overlapping;
        }
        let _in_flight = InFlight(&self.in_flight);

        let epoch = self.engine.shutdown_epoch();
        let running = match self.engine.backend().running_devices().await {
            Ok(running) => running,
            Err(e) => {
                warn!("Poll tick failed to list running devices: {}", e);
                return TickOutcome::Failed;
            }
        };

        let engine = Arc::clone(&self.engine);
        let job = async move {
            // Boots, kills and signals may have run while this job was queued
            if engine.poll_gate().is_suppressed() {
                trace!("Poll tick discarded: suppressed while queued");
                return Ok::<_, Error>(TickOutcome::Suppressed);
            }
            if engine.shutdown_epoch() != epoch {
                debug!("Poll tick discarded: a device was shut down after the inventory");
                return Ok(TickOutcome::Stale);
            }

            let count = engine.reconcile_running(running).await?;
            if count > 0 {
                info!("Reconciled {} externally started devices", count);
            }
            Ok(TickOutcome::Reconciled(count))
        };

        self.serializer
            .submit("reconcile", job)
            .await
            .unwrap_or(TickOutcome::Failed)
    }

    /// Tick on a fixed interval until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        let poller = Arc::new(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poller.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            info!("Reconciliation poller started ({:?})", poller.interval);
            loop {
                interval.tick().await;
                let poller = Arc::clone(&poller);
                tokio::spawn(async move {
                    poller.tick().await;
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpool_core::{DeviceFilter, Status};
    use devpool_daemon::test_utils::{android_emulator, ios_simulator, FakeBackend, FakeProbe};
    use devpool_daemon::MemoryDirectory;
    use tokio::sync::mpsc;

    use crate::config::PoolConfig;

    type Engine = PoolEngine<MemoryDirectory, FakeBackend, FakeProbe>;

    fn engine(directory: MemoryDirectory, backend: FakeBackend) -> Arc<Engine> {
        let (queue_tx, _queue_rx) = mpsc::channel(8);
        Arc::new(PoolEngine::new(
            Arc::new(directory),
            Arc::new(backend),
            Arc::new(FakeProbe::new()),
            PoolConfig::default(),
            queue_tx,
        ))
    }

    #[test]
    fn test_gate_guards_nest() {
        let gate = PollGate::new();
        assert!(!gate.is_suppressed());

        let outer = gate.suppress();
        let inner = gate.suppress();
        drop(inner);
        assert!(gate.is_suppressed());
        drop(outer);
        assert!(!gate.is_suppressed());
    }

    #[tokio::test]
    async fn test_tick_skipped_while_suppressed() {
        let backend = FakeBackend::new();
        backend.start_externally(ios_simulator("A", "iPhone 15", "17.2"));
        let engine = engine(MemoryDirectory::new(), backend);
        let (serializer, _worker) = OperationSerializer::start();
        let poller = ReconciliationPoller::new(Arc::clone(&engine), serializer);

        let guard = engine.poll_gate().suppress();
        assert_eq!(poller.tick().await, TickOutcome::Suppressed);
        assert!(engine.find(&DeviceFilter::all()).await.unwrap().is_empty());

        drop(guard);
        assert_eq!(poller.tick().await, TickOutcome::Reconciled(1));
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_dropped() {
        let engine = engine(MemoryDirectory::new(), FakeBackend::new());
        let (serializer, _worker) = OperationSerializer::start();
        let poller = ReconciliationPoller::new(engine, serializer);

        poller.in_flight.store(true, Ordering::SeqCst);
        assert_eq!(poller.tick().await, TickOutcome::Overlapping);

        poller.in_flight.store(false, Ordering::SeqCst);
        assert_eq!(poller.tick().await, TickOutcome::Reconciled(0));
        assert!(!poller.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_tick_tracked_devices_are_left_alone() {
        let booted = ios_simulator("A", "iPhone 15", "17.2").with_status(Status::Booted);
        let backend = FakeBackend::with_devices(vec![booted.clone()]);
        let engine = engine(MemoryDirectory::with_devices(vec![booted]), backend);
        let (serializer, _worker) = OperationSerializer::start();
        let poller = ReconciliationPoller::new(Arc::clone(&engine), serializer);

        assert_eq!(poller.tick().await, TickOutcome::Reconciled(0));
        assert!(engine.backend().attaches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_poller_ticks_on_interval() {
        let backend = FakeBackend::new();
        let engine = engine(MemoryDirectory::new(), backend);
        let (serializer, _worker) = OperationSerializer::start();
        let task = ReconciliationPoller::new(Arc::clone(&engine), serializer).spawn();

        engine
            .backend()
            .start_externally(android_emulator("5554", "Pixel_API_33", "33"));

        // Nothing happens before the first interval elapses
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(engine.find(&DeviceFilter::all()).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let records = engine.find(&DeviceFilter::all()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Booted);

        task.abort();
    }

    #[tokio::test]
    async fn test_inventory_older_than_a_kill_is_discarded() {
        let record = ios_simulator("A", "iPhone 15", "17.2");
        let backend = FakeBackend::new();
        backend.start_externally(record.clone());
        let engine = engine(MemoryDirectory::with_devices(vec![record.clone()]), backend);
        let (serializer, _worker) = OperationSerializer::start();
        let poller = Arc::new(ReconciliationPoller::new(
            Arc::clone(&engine),
            serializer.clone(),
        ));

        // Hold the queue so the reconcile job waits behind it
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        serializer
            .submit_detached("hold", async move {
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();

        let tick = tokio::spawn({
            let poller = Arc::clone(&poller);
            async move { poller.tick().await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        engine.kill_device(&record).await.unwrap();
        release_tx.send(()).unwrap();

        assert_eq!(tick.await.unwrap(), TickOutcome::Stale);
        let records = engine.find(&DeviceFilter::all()).await.unwrap();
        assert_eq!(records[0].status, Status::Shutdown);

        // The next tick sees the device gone
        assert_eq!(poller.tick().await, TickOutcome::Reconciled(0));
    }
}
