//! Machine states and the synthetic power metric

use serde::{Deserialize, Serialize};

use cadence_common::DEFAULT_CORE_POWER_OVERHEAD;

/// One feasible assignment of a frequency (or 0 = off) to every core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineState {
    /// Sum of active core frequencies
    pub speed: u64,
    /// Cost reported by the [`PowerModel`] the state was built with
    pub power: u64,
    /// Per-core frequency, 0 when the core is disabled
    pub frequencies: Vec<u64>,
}

impl MachineState {
    /// Derive speed and power from a per-core frequency vector
    pub fn from_frequencies(frequencies: Vec<u64>, model: &dyn PowerModel) -> Self {
        let speed = frequencies.iter().sum();
        let power = model.power(&frequencies);
        Self {
            speed,
            power,
            frequencies,
        }
    }

    pub fn core_count(&self) -> usize {
        self.frequencies.len()
    }

    /// Number of leading cores with a nonzero frequency
    pub fn active_cores(&self) -> usize {
        self.frequencies.iter().take_while(|&&f| f > 0).count()
    }

    /// Canonical form: per-core frequencies are non-increasing
    pub fn is_canonical(&self) -> bool {
        self.frequencies.windows(2).all(|w| w[0] >= w[1])
    }
}

/// Cost function over a per-core frequency vector.
///
/// The default [`LinearPowerModel`] is a heuristic, not a measurement, so
/// callers can substitute their own (closures implement this trait).
pub trait PowerModel: Send + Sync {
    fn power(&self, frequencies: &[u64]) -> u64;
}

impl<F> PowerModel for F
where
    F: Fn(&[u64]) -> u64 + Send + Sync,
{
    fn power(&self, frequencies: &[u64]) -> u64 {
        self(frequencies)
    }
}

/// `power = Σ (overhead if active) + frequency`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearPowerModel {
    pub core_overhead: u64,
}

impl LinearPowerModel {
    pub fn new(core_overhead: u64) -> Self {
        Self { core_overhead }
    }
}

impl Default for LinearPowerModel {
    fn default() -> Self {
        Self::new(DEFAULT_CORE_POWER_OVERHEAD)
    }
}

impl PowerModel for LinearPowerModel {
    fn power(&self, frequencies: &[u64]) -> u64 {
        frequencies
            .iter()
            .filter(|&&f| f > 0)
            .map(|&f| self.core_overhead.saturating_add(f))
            .fold(0u64, u64::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_power() {
        let model = LinearPowerModel::new(500);
        let state = MachineState::from_frequencies(vec![2000, 1000, 0], &model);
        assert_eq!(state.speed, 3000);
        assert_eq!(state.power, 2000 + 500 + 1000 + 500);
        assert_eq!(state.active_cores(), 2);
        assert!(state.is_canonical());
    }

    #[test]
    fn test_non_canonical_permutation() {
        let model = LinearPowerModel::default();
        let state = MachineState::from_frequencies(vec![1000, 2000], &model);
        assert!(!state.is_canonical());
    }

    #[test]
    fn test_closure_power_model() {
        let squares = |f: &[u64]| f.iter().map(|x| x * x).sum::<u64>();
        let state = MachineState::from_frequencies(vec![3, 2], &squares);
        assert_eq!(state.power, 13);
    }
}
