//! In-memory host for dry runs and tests
//!
//! Clones share state, so a caller can keep a handle to inspect what the
//! control loop did after handing a clone to a [`Machine`](super::Machine).

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use cadence_common::{ActuationError, ProcessId};

use super::{ActuationBackend, CoreMask};

/// One side effect observed by the simulated host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    SetAffinity { count: usize },
    SetFrequency { core: usize, freq: u64 },
}

#[derive(Debug)]
struct SimState {
    frequencies: Vec<u64>,
    affinity: usize,
    core_freq: Vec<u64>,
    calls: Vec<HostCall>,
    failing_cores: HashSet<usize>,
    failing_affinity: bool,
}

/// Simulated cpufreq/affinity host
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    cpu_count: usize,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBackend {
    /// `cpu_count` cores, every core at the lowest frequency, process on one core
    pub fn new(cpu_count: usize, frequencies: &[u64]) -> Self {
        let mut frequencies = frequencies.to_vec();
        frequencies.sort_unstable();
        frequencies.dedup();
        let lowest = frequencies.first().copied().unwrap_or(0);
        Self {
            cpu_count,
            state: Arc::new(Mutex::new(SimState {
                frequencies,
                affinity: 1,
                core_freq: vec![lowest; cpu_count],
                calls: Vec::new(),
                failing_cores: HashSet::new(),
                failing_affinity: false,
            })),
        }
    }

    pub fn with_affinity(self, count: usize) -> Self {
        self.state.lock().affinity = count;
        self
    }

    pub fn with_core_frequency(self, core: usize, freq: u64) -> Self {
        if let Some(slot) = self.state.lock().core_freq.get_mut(core) {
            *slot = freq;
        }
        self
    }

    /// Make every `set_frequency` on `core` fail
    pub fn fail_frequency(&self, core: usize) {
        self.state.lock().failing_cores.insert(core);
    }

    /// Make every `set_affinity` fail
    pub fn fail_affinity(&self) {
        self.state.lock().failing_affinity = true;
    }

    pub fn affinity(&self) -> usize {
        self.state.lock().affinity
    }

    pub fn core_frequency(&self, core: usize) -> u64 {
        self.state.lock().core_freq.get(core).copied().unwrap_or(0)
    }

    /// Side effects in the order they happened
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }
}

impl ActuationBackend for SimulatedBackend {
    fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    fn get_affinity(&mut self, _pid: ProcessId) -> Result<CoreMask, ActuationError> {
        Ok(CoreMask::first(self.state.lock().affinity))
    }

    fn set_affinity(&mut self, _pid: ProcessId, count: usize) -> Result<(), ActuationError> {
        let mut state = self.state.lock();
        if state.failing_affinity {
            return Err(ActuationError::Backend {
                actuator: "cores".into(),
                reason: "simulated affinity failure".into(),
            });
        }
        if count == 0 || count > self.cpu_count {
            return Err(ActuationError::OutOfRange {
                value: count as u64,
                min: 1,
                max: self.cpu_count as u64,
            });
        }
        state.affinity = count;
        state.calls.push(HostCall::SetAffinity { count });
        Ok(())
    }

    fn get_frequency(&mut self, core: usize) -> Result<u64, ActuationError> {
        self.state
            .lock()
            .core_freq
            .get(core)
            .copied()
            .ok_or_else(|| ActuationError::Backend {
                actuator: format!("freq{}", core),
                reason: "no such core".into(),
            })
    }

    fn set_frequency(&mut self, core: usize, freq: u64) -> Result<(), ActuationError> {
        let mut state = self.state.lock();
        if state.failing_cores.contains(&core) {
            return Err(ActuationError::Backend {
                actuator: format!("freq{}", core),
                reason: "simulated frequency failure".into(),
            });
        }
        if !state.frequencies.contains(&freq) {
            return Err(ActuationError::UnsupportedFrequency(freq));
        }
        let slot = state
            .core_freq
            .get_mut(core)
            .ok_or_else(|| ActuationError::Backend {
                actuator: format!("freq{}", core),
                reason: "no such core".into(),
            })?;
        *slot = freq;
        state.calls.push(HostCall::SetFrequency { core, freq });
        Ok(())
    }

    fn available_frequencies(&mut self, _core: usize) -> Result<Vec<u64>, ActuationError> {
        Ok(self.state.lock().frequencies.clone())
    }

    fn hardware_limits(&mut self, _core: usize) -> Result<(u64, u64), ActuationError> {
        let state = self.state.lock();
        match (state.frequencies.first(), state.frequencies.last()) {
            (Some(&min), Some(&max)) => Ok((min, max)),
            _ => Err(ActuationError::Backend {
                actuator: "freq".into(),
                reason: "no frequencies configured".into(),
            }),
        }
    }
}
