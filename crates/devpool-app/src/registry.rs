//! Live Handle Registry
//!
//! Owns every [`LiveHandle`] the engine tracks, keyed by token. Each entry
//! carries a generation number so signals from a replaced handle can be
//! told apart from signals of the current one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use devpool_core::prelude::*;
use devpool_daemon::LiveHandle;

use crate::signals::{spawn_dispatcher, TaggedSignal};

struct Entry {
    handle: LiveHandle,
    generation: u64,
    dispatcher: Option<JoinHandle<()>>,
}

impl Entry {
    /// Stop forwarding signals and release the handle's watchers
    fn detach(mut self) -> LiveHandle {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.handle.detach();
        self.handle
    }
}

pub struct LiveHandleRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
    queue: mpsc::Sender<TaggedSignal>,
}

impl LiveHandleRegistry {
    /// Registry forwarding handle signals into `queue`
    pub fn new(queue: mpsc::Sender<TaggedSignal>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            queue,
        }
    }

    /// Register `handle` under its token, replacing and detaching any
    /// previous handle for that token. Returns the new generation.
    pub async fn insert(&self, mut handle: LiveHandle) -> u64 {
        let token = handle.token().to_string();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let dispatcher = handle
            .take_signals()
            .map(|signals| spawn_dispatcher(token.clone(), generation, signals, self.queue.clone()));

        let entry = Entry {
            handle,
            generation,
            dispatcher,
        };

        let previous = self.entries.lock().await.insert(token.clone(), entry);
        if let Some(previous) = previous {
            debug!(
                "Replaced live handle for {} (generation {} -> {})",
                token, previous.generation, generation
            );
            drop(previous.detach());
        }

        generation
    }

    /// Take the handle for `token` out of the registry, detaching its listeners
    pub async fn remove(&self, token: &str) -> Option<LiveHandle> {
        let entry = self.entries.lock().await.remove(token)?;
        Some(entry.detach())
    }

    /// Remove the entry only if it still has `generation`
    pub async fn remove_if_current(&self, token: &str, generation: u64) -> Option<LiveHandle> {
        let mut entries = self.entries.lock().await;
        let current = entries
            .get(token)
            .is_some_and(|e| e.generation == generation);
        if !current {
            return None;
        }
        entries.remove(token).map(Entry::detach)
    }

    pub async fn contains(&self, token: &str) -> bool {
        self.entries.lock().await.contains_key(token)
    }

    /// Whether the handle for `token` still has a live signal dispatcher
    pub async fn has_listeners(&self, token: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(token)
            .and_then(|e| e.dispatcher.as_ref())
            .is_some_and(|d| !d.is_finished())
    }

    pub async fn generation(&self, token: &str) -> Option<u64> {
        self.entries.lock().await.get(token).map(|e| e.generation)
    }

    pub async fn tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        tokens.sort();
        tokens
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Detach every handle and clear the registry
    pub async fn detach_all(&self) {
        let drained: Vec<Entry> = self.entries.lock().await.drain().map(|(_, e)| e).collect();
        if !drained.is_empty() {
            info!("Detaching {} live handles", drained.len());
        }
        for entry in drained {
            drop(entry.detach());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpool_core::{Device, DeviceSignal, DeviceType, Platform};
    use std::time::Duration;

    fn sim(token: &str) -> Device {
        Device::new(token, "iPhone 15", Platform::Ios, DeviceType::Simulator)
    }

    #[tokio::test]
    async fn test_insert_forwards_tagged_signals() {
        let (queue_tx, mut queue_rx) = mpsc::channel(8);
        let registry = LiveHandleRegistry::new(queue_tx);

        let (handle, signal_tx) = LiveHandle::channel(sim("A"));
        let generation = registry.insert(handle).await;
        assert!(registry.has_listeners("A").await);

        signal_tx.send(DeviceSignal::Killed(sim("A"))).await.unwrap();
        let tagged = queue_rx.recv().await.unwrap();
        assert_eq!(tagged.token, "A");
        assert_eq!(tagged.generation, generation);
    }

    #[tokio::test]
    async fn test_replacing_bumps_generation_and_silences_old_handle() {
        let (queue_tx, mut queue_rx) = mpsc::channel(8);
        let registry = LiveHandleRegistry::new(queue_tx);

        let (old, old_tx) = LiveHandle::channel(sim("A"));
        let first = registry.insert(old).await;
        let (new, new_tx) = LiveHandle::channel(sim("A"));
        let second = registry.insert(new).await;
        assert!(second > first);
        assert_eq!(registry.len().await, 1);

        // The old dispatcher is aborted, which drops its receiver
        tokio::time::timeout(Duration::from_secs(1), old_tx.closed())
            .await
            .unwrap();

        new_tx.send(DeviceSignal::Killed(sim("A"))).await.unwrap();
        assert_eq!(queue_rx.recv().await.unwrap().generation, second);
    }

    #[tokio::test]
    async fn test_remove_if_current_ignores_stale_generation() {
        let (queue_tx, _queue_rx) = mpsc::channel(8);
        let registry = LiveHandleRegistry::new(queue_tx);

        let (handle, _tx) = LiveHandle::channel(sim("A"));
        let generation = registry.insert(handle).await;

        assert!(registry.remove_if_current("A", generation + 1).await.is_none());
        assert!(registry.contains("A").await);
        assert!(registry.remove_if_current("A", generation).await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_listeners_end_when_handle_signals_close() {
        let (queue_tx, _queue_rx) = mpsc::channel(8);
        let registry = LiveHandleRegistry::new(queue_tx);

        let (handle, signal_tx) = LiveHandle::channel(sim("A"));
        registry.insert(handle).await;
        drop(signal_tx);

        for _ in 0..100 {
            if !registry.has_listeners("A").await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!registry.has_listeners("A").await);
        assert!(registry.contains("A").await);
    }

    #[tokio::test]
    async fn test_detach_all() {
        let (queue_tx, _queue_rx) = mpsc::channel(8);
        let registry = LiveHandleRegistry::new(queue_tx);
        for token in ["A", "B"] {
            let (handle, _tx) = LiveHandle::channel(sim(token));
            registry.insert(handle).await;
        }
        assert_eq!(registry.tokens().await, vec!["A".to_string(), "B".to_string()]);

        registry.detach_all().await;
        assert!(registry.is_empty().await);
    }
}
