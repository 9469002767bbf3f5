//! # Cadence Engine
//!
//! Heart-rate driven CPU governor core.
//!
//! ## Pipeline
//!
//! ```text
//! heartbeat sample -> ControlLoop -> DecisionStrategy -> ActuatorSet -> Machine
//! ```
//!
//! A strategy only writes actuator targets. The loop applies every target
//! that differs from the host value, then holds off for one heartbeat window
//! so the application's windowed rate can reflect the change.
//!
//! ## Machine states
//!
//! For the aggregate-speed actuator the engine precomputes every useful
//! assignment of frequencies to cores:
//!
//! ```text
//! speed = Σ freq(core)
//! power = Σ freq(core) + overhead × active_cores
//! ```
//!
//! Permutations, equal `(speed, power)` states and dominated states are
//! dropped, leaving a list strictly increasing in both speed and power.

pub mod actuator;
pub mod catalog;
pub mod control_loop;
pub mod controller;
pub mod telemetry;

pub use actuator::{
    ActuationBackend, Actuator, ActuatorId, ActuatorKind, ActuatorSet, Machine, SimulatedBackend,
};
pub use catalog::{
    CatalogOptions, LinearPowerModel, MachineState, MachineStateCatalog, PowerModel, Selection,
    StateSelector,
};
pub use control_loop::{
    Action, ControlLoop, HeartbeatSource, RunSummary, StatusRecord, StatusSink,
};
pub use controller::{DecisionStrategy, RateBand, StrategyKind};
pub use telemetry::LoopMetrics;

use serde::{Deserialize, Serialize};

use cadence_common::{
    DEFAULT_CORE_KP, DEFAULT_CORE_POWER_OVERHEAD, DEFAULT_MAX_CATALOG_CORES, DEFAULT_SPEED_KP,
    DEFAULT_SPEED_UNIT,
};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Proportional gain of the core-count controller
    pub core_kp: f64,
    /// Proportional gain of the aggregate-speed controller
    pub speed_kp: f64,
    /// Catalog speed per unit of `speed_kp` output
    pub speed_unit: u64,
    /// Largest core count a catalog is built for
    pub max_catalog_cores: usize,
    /// Per-active-core power overhead of the default power model
    pub core_power_overhead: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            core_kp: DEFAULT_CORE_KP,
            speed_kp: DEFAULT_SPEED_KP,
            speed_unit: DEFAULT_SPEED_UNIT,
            max_catalog_cores: DEFAULT_MAX_CATALOG_CORES,
            core_power_overhead: DEFAULT_CORE_POWER_OVERHEAD,
        }
    }
}

impl EngineConfig {
    pub fn power_model(&self) -> LinearPowerModel {
        LinearPowerModel::new(self.core_power_overhead)
    }

    pub fn catalog_options(&self) -> CatalogOptions {
        CatalogOptions::default().with_max_cores(self.max_catalog_cores)
    }
}
