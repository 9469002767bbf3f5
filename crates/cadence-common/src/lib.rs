//! # Cadence Common
//!
//! Shared types and errors for the Cadence heart-rate governor.
//!
//! ## Core Types
//!
//! - [`FeedbackSample`]: one `(beat, windowed_rate)` observation from the monitored application
//! - [`ProcessId`]: the single process whose heart rate is governed
//!
//! ## Errors
//!
//! - [`CadenceError`]: unified error with one sub-enum per failure domain
//!   (discovery, catalog construction, actuation, sampling)

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{
    ActuationError, CadenceError, CatalogError, DiscoveryError, Result, SampleError,
};
pub use types::{process::ProcessId, sample::FeedbackSample};

/// Cadence version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest core count the machine-state catalog is built for by default.
/// The configuration space grows as `(F+1)^C`.
pub const DEFAULT_MAX_CATALOG_CORES: usize = 16;

/// Per-active-core overhead added to a state's synthetic power, in the same
/// unit as the frequencies (kHz on Linux cpufreq).
pub const DEFAULT_CORE_POWER_OVERHEAD: u64 = 1_000_000;

/// Proportional gain for the core-count controller
pub const DEFAULT_CORE_KP: f64 = 0.4;

/// Proportional gain for the aggregate-speed controller
pub const DEFAULT_SPEED_KP: f64 = 100.0;

/// Frequency units (kHz) per unit of aggregate speed seen by the speed
/// controller's gain
pub const DEFAULT_SPEED_UNIT: u64 = 10_000;

/// Environment variable naming the heartbeat-enabled application directory
pub const HEARTBEAT_DIR_ENV: &str = "HEARTBEAT_ENABLED_DIR";
