//! Integration tests for lifecycle signals, resync and the reconciliation poller

use std::sync::Arc;
use std::time::Duration;

use devpool_app::{DevicePool, PoolConfig, TaggedSignal, TickOutcome};
use devpool_core::{
    BootOptions, Device, DeviceFilter, DeviceSignal, FieldMatch, Platform, Status,
    SubscribeRequest,
};
use devpool_daemon::test_utils::{android_emulator, ios_simulator, FakeBackend, FakeProbe};
use devpool_daemon::MemoryDirectory;

type Pool = DevicePool<MemoryDirectory, FakeBackend, FakeProbe>;

/// Pool over a directory holding `records` and a backend knowing `known`
fn pool_with(records: Vec<Device>, backend: FakeBackend) -> (Pool, Arc<FakeBackend>) {
    let backend = Arc::new(backend);
    let pool = DevicePool::new(
        Arc::new(MemoryDirectory::with_devices(records)),
        Arc::clone(&backend),
        Arc::new(FakeProbe::new()),
        PoolConfig::default(),
    );
    (pool, backend)
}

async fn status_of(pool: &Pool, name: &str) -> Option<Status> {
    pool.find(&DeviceFilter::all().with_name(FieldMatch::exact(name)))
        .await
        .unwrap()
        .first()
        .map(|d| d.status)
}

async fn wait_for_status(pool: &Pool, name: &str, expected: Status) {
    for _ in 0..200 {
        if status_of(pool, name).await == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "{} never reached {} (is {:?})",
        name,
        expected,
        status_of(pool, name).await
    );
}

#[tokio::test]
async fn test_killed_signal_marks_device_shutdown() {
    let devices = vec![ios_simulator("A", "iPhone 15", "17.2")];
    let (pool, backend) = pool_with(devices.clone(), FakeBackend::with_devices(devices));

    pool.subscribe_for_device(SubscribeRequest::new(DeviceFilter::for_platform(
        Platform::Ios,
    )))
    .await
    .unwrap()
    .unwrap();

    assert!(backend.kill_externally("A").await);
    wait_for_status(&pool, "iPhone 15", Status::Shutdown).await;

    pool.flush().await.unwrap();
    assert!(!pool.engine().registry().contains("A").await);
    assert_eq!(pool.engine().usage().get("A"), 0);
}

#[tokio::test]
async fn test_error_signal_leaves_record_alone() {
    let devices = vec![ios_simulator("A", "iPhone 15", "17.2")];
    let (pool, backend) = pool_with(devices.clone(), FakeBackend::with_devices(devices));
    pool.boot(DeviceFilter::all(), 1, BootOptions::default())
        .await
        .unwrap();

    let device = ios_simulator("A", "iPhone 15", "17.2");
    assert!(
        backend
            .emit(
                "A",
                DeviceSignal::Error {
                    device,
                    message: "simctl hiccup".into(),
                },
            )
            .await
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.flush().await.unwrap();
    assert_eq!(status_of(&pool, "iPhone 15").await, Some(Status::Booted));
    assert!(pool.engine().registry().contains("A").await);
}

#[tokio::test]
async fn test_stale_generation_signal_is_ignored() {
    let devices = vec![ios_simulator("A", "iPhone 15", "17.2")];
    let (pool, _backend) = pool_with(devices.clone(), FakeBackend::with_devices(devices));
    pool.boot(DeviceFilter::all(), 1, BootOptions::default())
        .await
        .unwrap();

    let engine = pool.engine();
    let current = engine.registry().generation("A").await.unwrap();

    engine
        .handle_signal(TaggedSignal {
            token: "A".into(),
            generation: current + 1,
            signal: DeviceSignal::Killed(ios_simulator("A", "iPhone 15", "17.2")),
        })
        .await
        .unwrap();
    assert_eq!(status_of(&pool, "iPhone 15").await, Some(Status::Booted));
    assert!(engine.registry().contains("A").await);

    engine
        .handle_signal(TaggedSignal {
            token: "A".into(),
            generation: current,
            signal: DeviceSignal::Killed(ios_simulator("A", "iPhone 15", "17.2")),
        })
        .await
        .unwrap();
    assert_eq!(status_of(&pool, "iPhone 15").await, Some(Status::Shutdown));
}

#[tokio::test]
async fn test_boot_follows_reassigned_token() {
    let devices = vec![android_emulator("5554", "Pixel_API_33", "33")];
    let backend = FakeBackend::with_devices(devices.clone());
    backend.reassign_token_on_start("Pixel_API_33", "5556");
    let (pool, _backend) = pool_with(devices, backend);

    let booted = pool
        .boot(DeviceFilter::for_platform(Platform::Android), 1, BootOptions::default())
        .await
        .unwrap();
    assert_eq!(booted.len(), 1);
    assert_eq!(booted[0].token, "5556");

    let records = pool.find(&DeviceFilter::all()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].token, "5556");
    assert_eq!(records[0].status, Status::Booted);
    assert_eq!(pool.engine().registry().tokens().await, vec!["5556".to_string()]);
}

#[tokio::test]
async fn test_refresh_rebuilds_directory_and_attaches_once() {
    let backend = FakeBackend::with_devices(vec![
        ios_simulator("A", "iPhone 15", "17.2").with_status(Status::Booted),
        ios_simulator("B", "iPhone 14", "16.4"),
    ]);
    // A stale record the backend no longer knows about
    let (pool, backend) = pool_with(vec![ios_simulator("Z", "iPhone 8", "12.0")], backend);

    let records = pool.refresh_data(DeviceFilter::all()).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(status_of(&pool, "iPhone 15").await, Some(Status::Booted));
    assert_eq!(status_of(&pool, "iPhone 14").await, Some(Status::Shutdown));
    assert_eq!(status_of(&pool, "iPhone 8").await, None);
    assert_eq!(backend.attaches(), vec!["A".to_string()]);

    // The existing handle still has listeners, so it is reused
    pool.refresh_data(DeviceFilter::all()).await.unwrap();
    assert_eq!(backend.attaches(), vec!["A".to_string()]);
}

#[tokio::test]
async fn test_attach_to_device_registers_handles() {
    let booted = ios_simulator("A", "iPhone 15", "17.2").with_status(Status::Booted);
    let (pool, backend) = pool_with(
        vec![booted.clone()],
        FakeBackend::with_devices(vec![booted]),
    );

    let attached = pool
        .attach_to_device(DeviceFilter::by_token("A"))
        .await
        .unwrap();
    assert_eq!(attached.len(), 1);
    assert!(pool.engine().registry().has_listeners("A").await);

    // An attached device dying externally is still noticed
    assert!(backend.kill_externally("A").await);
    wait_for_status(&pool, "iPhone 15", Status::Shutdown).await;
}

#[tokio::test]
async fn test_attach_to_device_skips_shutdown_records() {
    let booted = ios_simulator("A", "iPhone 15", "17.2").with_status(Status::Booted);
    let stopped = ios_simulator("B", "iPhone 8", "12.0");
    let (pool, backend) = pool_with(
        vec![booted.clone(), stopped.clone()],
        FakeBackend::with_devices(vec![booted, stopped]),
    );

    let attached = pool.attach_to_device(DeviceFilter::all()).await.unwrap();
    let tokens: Vec<_> = attached.iter().map(|d| d.token.as_str()).collect();
    assert_eq!(tokens, vec!["A"]);
    assert!(!pool.engine().registry().contains("B").await);
    assert_eq!(backend.attaches(), vec!["A".to_string()]);
    assert_eq!(status_of(&pool, "iPhone 8").await, Some(Status::Shutdown));
}

#[tokio::test]
async fn test_drop_and_refresh() {
    let backend = FakeBackend::with_devices(vec![android_emulator("5554", "Pixel_API_33", "33")]);
    let (pool, _backend) = pool_with(
        vec![
            ios_simulator("Z", "iPhone 8", "12.0"),
            ios_simulator("Y", "iPhone X", "13.0"),
        ],
        backend,
    );

    let records = pool.drop_and_refresh().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "Pixel_API_33");
}

#[tokio::test]
async fn test_poller_takes_over_external_android_with_token_collision() {
    // Stale record for another AVD still holding port 5554
    let (pool, backend) = pool_with(
        vec![android_emulator("5554", "Pixel_API_30", "30")],
        FakeBackend::new(),
    );
    backend.start_externally(android_emulator("5554", "Pixel_API_33", "33"));

    assert_eq!(pool.poll_once().await, TickOutcome::Reconciled(1));

    let moved = pool
        .find(&DeviceFilter::all().with_name(FieldMatch::exact("Pixel_API_30")))
        .await
        .unwrap();
    assert_eq!(moved[0].token, "5556");
    assert_eq!(moved[0].status, Status::Shutdown);

    let taken_over = pool
        .find(&DeviceFilter::all().with_name(FieldMatch::exact("Pixel_API_33")))
        .await
        .unwrap();
    assert_eq!(taken_over[0].token, "5554");
    assert_eq!(taken_over[0].status, Status::Booted);
    assert_eq!(backend.attaches(), vec!["5554".to_string()]);

    // Tracked now, so the next tick leaves it alone
    assert_eq!(pool.poll_once().await, TickOutcome::Reconciled(0));
}

#[tokio::test]
async fn test_poller_updates_shutdown_ios_record() {
    let (pool, backend) = pool_with(
        vec![ios_simulator("A", "iPhone 15", "17.2")],
        FakeBackend::new(),
    );
    backend.start_externally(ios_simulator("A", "iPhone 15", "17.2"));

    assert_eq!(pool.poll_once().await, TickOutcome::Reconciled(1));
    let records = pool.find(&DeviceFilter::all()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Status::Booted);
    assert!(records[0].started_at > 0);

    // The reconciled device can be leased without booting
    let leased = pool
        .subscribe_for_device(SubscribeRequest::new(DeviceFilter::for_platform(
            Platform::Ios,
        )))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.token, "A");
    assert_eq!(backend.start_count(), 0);
}

#[tokio::test]
async fn test_poller_skips_while_operation_suppresses() {
    let (pool, backend) = pool_with(Vec::new(), FakeBackend::new());
    backend.start_externally(ios_simulator("A", "iPhone 15", "17.2"));

    let guard = pool.engine().poll_gate().suppress();
    assert_eq!(pool.poll_once().await, TickOutcome::Suppressed);
    drop(guard);

    assert_eq!(pool.poll_once().await, TickOutcome::Reconciled(1));
}

#[tokio::test(start_paused = true)]
async fn test_background_polling() {
    let (pool, backend) = pool_with(Vec::new(), FakeBackend::new());
    pool.start_polling();
    pool.start_polling();
    assert!(pool.is_polling());

    backend.start_externally(ios_simulator("A", "iPhone 15", "17.2"));
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert_eq!(status_of(&pool, "iPhone 15").await, Some(Status::Booted));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_detaches_handles_but_keeps_devices() {
    let devices = vec![ios_simulator("A", "iPhone 15", "17.2")];
    let (pool, backend) = pool_with(devices.clone(), FakeBackend::with_devices(devices));
    pool.boot(DeviceFilter::all(), 1, BootOptions::default())
        .await
        .unwrap();

    let engine = Arc::clone(pool.engine());
    pool.shutdown().await;

    assert!(engine.registry().is_empty().await);
    assert!(backend.is_running("A"));
    assert!(backend.stops().is_empty());
}
