//! # devpool-core - Core Domain Types
//!
//! Foundation crate for devpool. Provides the device record, typed filters,
//! boundary parsing, lifecycle signals, error handling and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, chrono, thiserror, regex, tracing, url).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Device`] - A device record as stored in the directory
//! - [`DevicePatch`] - Field-wise partial update of a record
//! - [`Platform`], [`DeviceType`], [`Status`] - Record classification
//! - [`BootOptions`] - Flags forwarded to the backend on boot
//!
//! ### Filters (`filter`, `query`)
//! - [`DeviceFilter`] - Structured query with per-field [`FieldMatch`] modes
//! - [`DeviceQuery`] - Parsed `key=value` request parameters
//! - [`SubscribeRequest`] - Lease request handed to the engine
//!
//! ### Events (`events`)
//! - [`DeviceSignal`] - Killed / error / attached signals from live handles
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use devpool_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod filter;
pub mod logging;
pub mod query;
pub mod types;

/// Prelude for common imports used throughout all devpool crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use error::{Error, Result, ResultExt};
pub use events::DeviceSignal;
pub use filter::{DeviceFilter, FieldMatch};
pub use query::{patch_from_pairs, split_args, DeviceQuery, SubscribeRequest};
pub use types::{
    now_millis, BootOptions, Device, DevicePatch, DeviceType, Platform, Status, UNSET_TIMESTAMP,
};
