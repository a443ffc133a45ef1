//! Lifecycle signal dispatch
//!
//! Each live handle gets one dispatcher task that forwards its signals,
//! tagged with the handle's registry generation, into a single engine
//! queue. The pump drains that queue through the operation serializer so
//! signal handling never interleaves with a running pool operation.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use devpool_core::prelude::*;
use devpool_core::DeviceSignal;
use devpool_daemon::{DeviceBackend, DeviceDirectory, ProcessProbe};

use crate::engine::PoolEngine;
use crate::serializer::OperationSerializer;

/// Capacity of the engine-wide signal queue
pub const SIGNAL_QUEUE_CAPACITY: usize = 64;

/// A signal plus the registry entry it was emitted for
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedSignal {
    /// Token the handle was registered under
    pub token: String,
    /// Registry generation of the handle
    pub generation: u64,
    pub signal: DeviceSignal,
}

/// Forward one handle's signals until either side goes away
pub(crate) fn spawn_dispatcher(
    token: String,
    generation: u64,
    mut signals: mpsc::Receiver<DeviceSignal>,
    queue: mpsc::Sender<TaggedSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            trace!("Dispatching {} signal for {}", signal.kind(), token);
            let tagged = TaggedSignal {
                token: token.clone(),
                generation,
                signal,
            };
            if queue.send(tagged).await.is_err() {
                debug!("Signal queue closed, dispatcher for {} exiting", token);
                break;
            }
        }
    })
}

/// Drain the signal queue into the serializer
pub(crate) fn spawn_signal_pump<D, B, P>(
    mut queue: mpsc::Receiver<TaggedSignal>,
    engine: Arc<PoolEngine<D, B, P>>,
    serializer: OperationSerializer,
) -> JoinHandle<()>
where
    D: DeviceDirectory + Send + Sync + 'static,
    B: DeviceBackend + Send + Sync + 'static,
    P: ProcessProbe + 'static,
{
    tokio::spawn(async move {
        while let Some(tagged) = queue.recv().await {
            let engine = Arc::clone(&engine);
            let submitted = serializer.submit_detached("signal", async move {
                engine.handle_signal(tagged).await
            });
            if submitted.is_err() {
                warn!("Serializer stopped, dropping lifecycle signals");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpool_core::{Device, DeviceType, Platform};

    #[tokio::test]
    async fn test_dispatcher_tags_signals() {
        let (signal_tx, signal_rx) = mpsc::channel(4);
        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        let dispatcher = spawn_dispatcher("ABC".into(), 7, signal_rx, queue_tx);

        let device = Device::new("ABC", "iPhone 15", Platform::Ios, DeviceType::Simulator);
        signal_tx
            .send(DeviceSignal::Killed(device.clone()))
            .await
            .unwrap();

        let tagged = queue_rx.recv().await.unwrap();
        assert_eq!(tagged.token, "ABC");
        assert_eq!(tagged.generation, 7);
        assert_eq!(tagged.signal, DeviceSignal::Killed(device));

        drop(signal_tx);
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_exits_when_queue_closes() {
        let (signal_tx, signal_rx) = mpsc::channel(4);
        let (queue_tx, queue_rx) = mpsc::channel(4);
        let dispatcher = spawn_dispatcher("ABC".into(), 1, signal_rx, queue_tx);
        drop(queue_rx);

        let device = Device::new("ABC", "iPhone 15", Platform::Ios, DeviceType::Simulator);
        signal_tx.send(DeviceSignal::Attached(device)).await.unwrap();
        dispatcher.await.unwrap();
    }
}
