//! Foreground mode: keep the pool reconciled until interrupted

use std::path::Path;

use devpool_app::PoolConfig;
use devpool_core::prelude::*;
use devpool_core::DeviceFilter;

use crate::commands::open_pool;

/// Resync, then poll for externally started devices until Ctrl-C
pub async fn run(store: &Path, config: PoolConfig) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("devpool serve");
    info!("Store: {}", store.display());
    info!("═══════════════════════════════════════════════════════");

    let pool = open_pool(store, config).await?;
    let records = pool.refresh_data(DeviceFilter::all()).await?;
    info!("Tracking {} devices", records.len());

    pool.start_polling();
    tokio::signal::ctrl_c().await?;

    info!("Interrupted, shutting down");
    pool.shutdown().await;
    Ok(())
}
