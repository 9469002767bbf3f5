//! OS actuation seam
//!
//! [`ActuationBackend`] is the capability set the engine needs from the host
//! (affinity and cpufreq). [`Machine`] binds a backend to the governed process
//! and, when a catalog is in use, to a [`StateSelector`] that realizes
//! aggregate-speed targets.

use std::fmt;

use tracing::{debug, warn};

use cadence_common::{ActuationError, ProcessId};

use super::{ActuatorKind, ActuatorReading};
use crate::catalog::{MachineStateCatalog, StateSelector};

/// Bitmask of CPUs a process may run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreMask(pub u64);

impl CoreMask {
    /// Mask with cores `0..count` set
    pub fn first(count: usize) -> Self {
        if count >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }
}

impl fmt::Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Host operations used to read and move the actuators
pub trait ActuationBackend: Send {
    /// Number of CPUs the host exposes
    fn cpu_count(&self) -> usize;

    fn get_affinity(&mut self, pid: ProcessId) -> Result<CoreMask, ActuationError>;

    /// Pin `pid` to cores `0..count`
    fn set_affinity(&mut self, pid: ProcessId, count: usize) -> Result<(), ActuationError>;

    fn get_frequency(&mut self, core: usize) -> Result<u64, ActuationError>;

    fn set_frequency(&mut self, core: usize, freq: u64) -> Result<(), ActuationError>;

    /// Available frequencies of `core`, any order
    fn available_frequencies(&mut self, core: usize) -> Result<Vec<u64>, ActuationError>;

    /// Hardware `(min, max)` frequency of `core`
    fn hardware_limits(&mut self, core: usize) -> Result<(u64, u64), ActuationError>;
}

/// The governed process on a concrete host
pub struct Machine {
    backend: Box<dyn ActuationBackend>,
    pid: ProcessId,
    selector: Option<StateSelector>,
}

impl Machine {
    pub fn new(backend: Box<dyn ActuationBackend>, pid: ProcessId) -> Self {
        Self {
            backend,
            pid,
            selector: None,
        }
    }

    /// Enable the `AggregateSpeed` actuator
    pub fn with_selector(mut self, selector: StateSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn selector(&self) -> Option<&StateSelector> {
        self.selector.as_ref()
    }

    pub fn cpu_count(&self) -> usize {
        self.backend.cpu_count()
    }

    /// Cores usable by the governor: the catalog's when one is attached
    pub fn governed_cores(&self) -> usize {
        match &self.selector {
            Some(selector) => selector.catalog().core_count(),
            None => self.backend.cpu_count(),
        }
    }

    /// Ascending frequency ladder of `core`, restricted to its hardware limits
    pub fn frequency_ladder(&mut self, core: usize) -> Result<Vec<u64>, ActuationError> {
        let (min, max) = self.backend.hardware_limits(core)?;
        let mut ladder: Vec<u64> = self
            .backend
            .available_frequencies(core)?
            .into_iter()
            .filter(|&f| f > 0 && f >= min && f <= max)
            .collect();
        ladder.sort_unstable();
        ladder.dedup();
        if ladder.is_empty() {
            return Err(ActuationError::Backend {
                actuator: ActuatorKind::PerCoreFrequency(core).to_string(),
                reason: format!("no available frequency within [{}, {}]", min, max),
            });
        }
        Ok(ladder)
    }

    /// Read the current value, bounds, and step ladder of an actuator
    pub fn read(&mut self, kind: ActuatorKind) -> Result<ActuatorReading, ActuationError> {
        match kind {
            ActuatorKind::CoreCount => {
                let cores = self.governed_cores().max(1);
                let current = self.backend.get_affinity(self.pid)?.count().clamp(1, cores);
                Ok(ActuatorReading {
                    current: current as u64,
                    min: 1,
                    max: cores as u64,
                    ladder: None,
                })
            }
            ActuatorKind::PerCoreFrequency(core) => self.read_frequency(core),
            ActuatorKind::GlobalFrequency => self.read_frequency(0),
            ActuatorKind::AggregateSpeed => {
                let pid = self.pid;
                let selector = self
                    .selector
                    .as_ref()
                    .ok_or_else(|| ActuationError::NotInitialized(kind.to_string()))?;
                let catalog = selector.catalog();
                let active = self
                    .backend
                    .get_affinity(pid)?
                    .count()
                    .clamp(1, catalog.core_count().max(1));

                let mut speed = 0u64;
                for core in 0..active {
                    speed += self.backend.get_frequency(core)?;
                }
                let current = selector.nearest(speed).speed;
                Ok(ActuatorReading {
                    current,
                    min: catalog.min_speed(),
                    max: catalog.max_speed(),
                    ladder: Some(catalog.speeds()),
                })
            }
        }
    }

    fn read_frequency(&mut self, core: usize) -> Result<ActuatorReading, ActuationError> {
        let ladder = self.frequency_ladder(core)?;
        let current = self.backend.get_frequency(core)?;
        Ok(ActuatorReading {
            current,
            min: ladder[0],
            max: ladder[ladder.len() - 1],
            ladder: Some(ladder),
        })
    }

    /// Perform the side effect that moves `kind` to `target`
    pub fn actuate(&mut self, kind: ActuatorKind, target: u64) -> Result<(), ActuationError> {
        debug!(actuator = %kind, target, "actuating");
        match kind {
            ActuatorKind::CoreCount => self.backend.set_affinity(self.pid, target as usize),
            ActuatorKind::PerCoreFrequency(core) => self.backend.set_frequency(core, target),
            ActuatorKind::GlobalFrequency => {
                let mut first_error = None;
                for core in 0..self.governed_cores() {
                    if let Err(e) = self.backend.set_frequency(core, target) {
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
            ActuatorKind::AggregateSpeed => {
                let selector = self
                    .selector
                    .as_ref()
                    .ok_or_else(|| ActuationError::NotInitialized(kind.to_string()))?;
                let selection = selector.select(target);
                let mut previous = Vec::with_capacity(selection.frequencies.len());
                for (core, &freq) in selection.frequencies.iter().enumerate() {
                    let before = self.backend.get_frequency(core);
                    if let Err(e) = self.backend.set_frequency(core, freq) {
                        self.restore_frequencies(&previous);
                        return Err(e);
                    }
                    if let Ok(before) = before {
                        previous.push((core, before));
                    }
                }
                if let Err(e) = self.backend.set_affinity(self.pid, selection.core_count) {
                    self.restore_frequencies(&previous);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Put cores retuned by an aborted aggregate-speed move back where they were
    fn restore_frequencies(&mut self, previous: &[(usize, u64)]) {
        for &(core, freq) in previous.iter().rev() {
            if let Err(e) = self.backend.set_frequency(core, freq) {
                warn!(core, freq, error = %e, "cannot restore frequency");
            }
        }
    }

    /// Catalog behind the aggregate-speed actuator, if any
    pub fn catalog(&self) -> Option<&MachineStateCatalog> {
        self.selector.as_ref().map(StateSelector::catalog)
    }
}
