//! # devpool-app - Pool engine and orchestration
//!
//! Leasing, boot, release, eviction and resynchronization of test devices,
//! plus the machinery that keeps those operations from interleaving.
//!
//! Depends on [`devpool_core`] for domain types and [`devpool_daemon`] for
//! the directory, backend and liveness contracts.
//!
//! ## Public API
//!
//! ### Entry point
//! - [`DevicePool`] - Serialized front door over the engine
//!
//! ### Engine
//! - [`PoolEngine`] - Boot, subscribe, unsubscribe, kill, refresh
//! - [`LiveHandleRegistry`] - Live handles by token, with generations
//! - [`UsageTracker`] - Leases served per booted instance
//! - [`PortAllocator`] - Free TCP ports handed out to test runs
//!
//! ### Background work
//! - [`OperationSerializer`] - FIFO execution of mutating operations
//! - [`ReconciliationPoller`] - Folds externally started devices in
//! - [`PollGate`] - Suspends polling while boots and leases run
//! - [`TaggedSignal`] - Lifecycle signal tagged with its handle generation
//!
//! ### Configuration
//! - [`PoolConfig`] - Ceilings, usage limits, poll interval, boot options

pub mod config;
pub mod engine;
pub mod poller;
pub mod pool;
pub mod ports;
pub mod registry;
pub mod serializer;
pub mod signals;
pub mod usage;

pub use config::{
    default_config_path, default_snapshot_path, load_config, load_config_file, PoolConfig,
};
pub use engine::PoolEngine;
pub use poller::{PollGate, PollSuppression, ReconciliationPoller, TickOutcome};
pub use pool::DevicePool;
pub use ports::{PortAllocator, PortRequest};
pub use registry::LiveHandleRegistry;
pub use serializer::OperationSerializer;
pub use signals::TaggedSignal;
pub use usage::UsageTracker;
