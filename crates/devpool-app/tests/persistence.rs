//! Integration tests for state carried between pools sharing one snapshot

use std::path::Path;
use std::sync::Arc;

use devpool_app::{DevicePool, PoolConfig, PortRequest};
use devpool_core::{Device, DeviceFilter, Platform, Status, SubscribeRequest};
use devpool_daemon::test_utils::{android_emulator, FakeBackend, FakeProbe};
use devpool_daemon::{DeviceDirectory, MemoryDirectory};

type Pool = DevicePool<MemoryDirectory, FakeBackend, FakeProbe>;

fn booted_emulator() -> Device {
    android_emulator("emulator-5554", "Pixel_API_33", "33").with_status(Status::Booted)
}

fn config() -> PoolConfig {
    PoolConfig {
        max_emulators_count: 5,
        emulator_max_usage_limit: 1,
        ..Default::default()
    }
}

/// Pool over the snapshot at `path`; fails if an earlier pool still owns it
fn open_pool(path: &Path, running: Vec<Device>) -> (Pool, Arc<FakeBackend>) {
    let directory = MemoryDirectory::try_open(path).unwrap();
    let backend = Arc::new(FakeBackend::with_devices(running));
    let pool = DevicePool::new(
        Arc::new(directory),
        Arc::clone(&backend),
        Arc::new(FakeProbe::new()),
        config(),
    );
    (pool, backend)
}

async fn seed(path: &Path, devices: Vec<Device>) {
    let directory = MemoryDirectory::try_open(path).unwrap();
    directory.insert_many(devices).await.unwrap();
}

#[tokio::test]
async fn test_usage_limit_applies_across_pools() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");
    seed(&path, vec![booted_emulator()]).await;

    // First run leases the emulator and exits
    let (first, _) = open_pool(&path, vec![booted_emulator()]);
    let leased = first
        .subscribe_for_device(SubscribeRequest::new(DeviceFilter::for_platform(
            Platform::Android,
        )))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.status, Status::Busy);
    assert_eq!(first.engine().usage().get("emulator-5554"), 1);
    first.shutdown().await;

    // Second run releases it; the stored count has hit the limit of 1
    let (second, backend) = open_pool(&path, vec![leased.clone()]);
    second.flush().await.unwrap();
    assert_eq!(second.engine().usage().get("emulator-5554"), 1);

    second.unsubscribe_from_device("emulator-5554").await.unwrap();
    let record = second
        .find(&DeviceFilter::by_token("emulator-5554"))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(record.status, Status::Shutdown);
    assert!(!backend.is_running("emulator-5554"));
    assert_eq!(second.engine().usage().get("emulator-5554"), 0);
    second.shutdown().await;

    let reopened = MemoryDirectory::try_open(&path).unwrap();
    assert!(reopened.usage_counts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reserved_port_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");
    let base = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let request = PortRequest {
        from: base,
        host: "127.0.0.1".to_string(),
        retries: 100,
    };

    let (first, _) = open_pool(&path, Vec::new());
    let port = first.reserve_port(request.clone()).await.unwrap();
    first.shutdown().await;

    let (second, _) = open_pool(&path, Vec::new());
    let next = second.reserve_port(request).await.unwrap();
    assert_ne!(next, port);

    assert!(second.release_port(port).await.unwrap());
    assert!(!second.release_port(port).await.unwrap());
    second.shutdown().await;

    let reopened = MemoryDirectory::try_open(&path).unwrap();
    let reserved = reopened.reserved_ports().await.unwrap();
    assert!(!reserved.contains(&port));
    assert!(reserved.contains(&next));
}
