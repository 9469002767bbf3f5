//! Nearest-state lookup over a catalog

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{MachineState, MachineStateCatalog, PowerModel};

/// A chosen machine state decomposed into actuation targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Row of the state in the catalog
    pub index: usize,
    pub speed: u64,
    pub power: u64,
    /// Number of cores to enable (the active prefix)
    pub core_count: usize,
    /// Frequency for each enabled core, in core order
    pub frequencies: Vec<u64>,
}

impl Selection {
    fn from_state(index: usize, state: &MachineState) -> Self {
        let frequencies: Vec<u64> = state
            .frequencies
            .iter()
            .copied()
            .take_while(|&f| f > 0)
            .collect();
        Self {
            index,
            speed: state.speed,
            power: state.power,
            core_count: frequencies.len(),
            frequencies,
        }
    }

    /// Rebuild the full per-core state on a machine with `total_cores` cores
    pub fn to_state(&self, total_cores: usize, model: &dyn PowerModel) -> MachineState {
        let mut frequencies = self.frequencies.clone();
        frequencies.resize(total_cores.max(self.frequencies.len()), 0);
        MachineState::from_frequencies(frequencies, model)
    }
}

/// Picks the catalog state whose speed is closest to a target speed
#[derive(Debug, Clone)]
pub struct StateSelector {
    catalog: Arc<MachineStateCatalog>,
}

impl StateSelector {
    pub fn new(catalog: Arc<MachineStateCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &MachineStateCatalog {
        &self.catalog
    }

    /// Index of the state nearest to `target_speed`.
    ///
    /// The target is clamped to `[min_speed, max_speed]`. On an exact tie
    /// between the two neighbours the slower one wins.
    pub fn nearest_index(&self, target_speed: u64) -> usize {
        let speeds = self.catalog.states();
        nearest_in(speeds.len(), |i| speeds[i].speed, target_speed)
    }

    pub fn nearest(&self, target_speed: u64) -> &MachineState {
        &self.catalog.states()[self.nearest_index(target_speed)]
    }

    /// Nearest state and the core-count / per-core targets that realize it
    pub fn select(&self, target_speed: u64) -> Selection {
        let index = self.nearest_index(target_speed);
        Selection::from_state(index, &self.catalog.states()[index])
    }
}

/// Binary search over an ascending column of `len` values read through `at`.
///
/// Shared with actuator ladders so every snap uses the same tie rule.
pub(crate) fn nearest_in(len: usize, at: impl Fn(usize) -> u64, target: u64) -> usize {
    if len == 0 {
        return 0;
    }
    let target = target.clamp(at(0), at(len - 1));

    // partition point: first index whose value is >= target
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if at(mid) < target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    if lo == len {
        return len - 1;
    }
    if at(lo) == target || lo == 0 {
        return lo;
    }
    let below = target - at(lo - 1);
    let above = at(lo) - target;
    if below <= above {
        lo - 1
    } else {
        lo
    }
}
