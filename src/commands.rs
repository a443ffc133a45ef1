//! One-shot CLI commands
//!
//! Each command opens the snapshot-backed pool, runs a single operation and
//! prints the result as JSON on stdout.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use devpool_app::{DevicePool, PoolConfig, PortRequest};
use devpool_core::prelude::*;
use devpool_core::{patch_from_pairs, split_args, DeviceFilter, DeviceQuery};
use devpool_daemon::{MemoryDirectory, NativeBackend, SystemProbe};

pub type NativePool = DevicePool<MemoryDirectory, NativeBackend, SystemProbe>;

/// Open the pool over the snapshot at `store`
///
/// Waits while another devpool process owns the snapshot. An empty
/// snapshot is seeded from the devices present on this machine.
pub async fn open_pool(store: &Path, config: PoolConfig) -> Result<NativePool> {
    let directory = MemoryDirectory::open(store).await?;
    let backend = NativeBackend::detect().await;
    let pool = DevicePool::new(
        Arc::new(directory),
        Arc::new(backend),
        Arc::new(SystemProbe),
        config,
    );

    if pool.find(&DeviceFilter::all()).await?.is_empty() {
        let seeded = pool.refresh_data(DeviceFilter::all()).await?;
        info!("Seeded device directory with {} records", seeded.len());
    }
    Ok(pool)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn devices(pool: &NativePool, filter: &[String]) -> Result<bool> {
    let query = DeviceQuery::from_args(filter)?;
    print_json(&pool.find(&query.filter).await?)?;
    Ok(true)
}

pub async fn refresh(pool: &NativePool, filter: &[String]) -> Result<bool> {
    let query = DeviceQuery::from_args(filter)?;
    print_json(&pool.refresh_data(query.filter).await?)?;
    Ok(true)
}

pub async fn boot(pool: &NativePool, filter: &[String]) -> Result<bool> {
    let query = DeviceQuery::from_args(filter)?;
    let count = query.boot_count();
    let booted = pool.boot(query.filter, count, query.options).await?;
    print_json(&booted)?;
    Ok(!booted.is_empty())
}

/// Returns `false` when the pool is exhausted
pub async fn subscribe(pool: &NativePool, filter: &[String]) -> Result<bool> {
    let query = DeviceQuery::from_args(filter)?;
    let leased = pool.subscribe_for_device(query.subscribe_request()).await?;
    print_json(&leased)?;
    Ok(leased.is_some())
}

pub async fn unsubscribe(pool: &NativePool, token: &str) -> Result<bool> {
    let released = pool.unsubscribe_from_device(token).await?;
    if released.is_none() {
        warn!("No device with token {}", token);
    }
    print_json(&released)?;
    Ok(true)
}

pub async fn kill(pool: &NativePool, filter: &[String]) -> Result<bool> {
    let query = DeviceQuery::from_args(filter)?;
    let filter = (!query.filter.is_empty()).then_some(query.filter);
    print_json(&pool.kill_devices(filter).await?)?;
    Ok(true)
}

pub async fn drop_all(pool: &NativePool) -> Result<bool> {
    print_json(&pool.drop_and_refresh().await?)?;
    Ok(true)
}

pub async fn update(pool: &NativePool, token: &str, fields: &[String]) -> Result<bool> {
    let patch = patch_from_pairs(split_args(fields)?)?;
    let updated = pool.update(token, &patch).await?;
    print_json(&updated)?;
    Ok(updated.is_some())
}

pub async fn port(pool: &NativePool, request: PortRequest) -> Result<bool> {
    print_json(&pool.reserve_port(request).await?)?;
    Ok(true)
}

pub async fn release_port(pool: &NativePool, port: u16) -> Result<bool> {
    if !pool.release_port(port).await? {
        warn!("Port {} was not reserved", port);
    }
    print_json(&port)?;
    Ok(true)
}
