//! Actuators: bounded, controllable resource dimensions
//!
//! Each actuator carries a `current` value (what the host is set to) and a
//! `target` written by the decision strategy. The control loop applies the
//! difference through a [`Machine`]; a failed apply leaves `current` untouched.

pub mod backend;
pub mod simulated;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use cadence_common::ActuationError;

use crate::catalog::selector::nearest_in;

pub use self::backend::{ActuationBackend, CoreMask, Machine};
pub use self::simulated::SimulatedBackend;

/// Which resource an actuator moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActuatorKind {
    /// Number of cores the process is pinned to
    CoreCount,
    /// Frequency of a single core
    PerCoreFrequency(usize),
    /// One frequency written to every governed core
    GlobalFrequency,
    /// Catalog speed, realized through core count and per-core frequencies
    AggregateSpeed,
}

impl fmt::Display for ActuatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorKind::CoreCount => write!(f, "cores"),
            ActuatorKind::PerCoreFrequency(core) => write!(f, "freq{}", core),
            ActuatorKind::GlobalFrequency => write!(f, "freq"),
            ActuatorKind::AggregateSpeed => write!(f, "speed"),
        }
    }
}

/// What an actuator reports at initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorReading {
    pub current: u64,
    pub min: u64,
    pub max: u64,
    /// Discrete ascending values the actuator can take, if not every integer
    pub ladder: Option<Vec<u64>>,
}

/// A single controllable dimension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actuator {
    kind: ActuatorKind,
    current: u64,
    target: u64,
    min: u64,
    max: u64,
    ladder: Option<Vec<u64>>,
}

impl Actuator {
    /// Build an actuator from a reading; `current` is snapped into range
    pub fn from_reading(kind: ActuatorKind, reading: ActuatorReading) -> Self {
        let mut actuator = Self {
            kind,
            current: reading.current,
            target: reading.current,
            min: reading.min.min(reading.max),
            max: reading.max.max(reading.min),
            ladder: reading.ladder.filter(|l| !l.is_empty()),
        };
        actuator.current = actuator.snap(reading.current);
        actuator.target = actuator.current;
        actuator
    }

    /// Read the actuator's state from the host
    pub fn init(kind: ActuatorKind, machine: &mut Machine) -> Result<Self, ActuationError> {
        let reading = machine.read(kind)?;
        info!(
            actuator = %kind,
            current = reading.current,
            min = reading.min,
            max = reading.max,
            "actuator initialized"
        );
        Ok(Self::from_reading(kind, reading))
    }

    /// Move the host to `target`; `current` follows only on success
    pub fn apply(&mut self, machine: &mut Machine) -> Result<(), ActuationError> {
        if self.target < self.min || self.target > self.max {
            return Err(ActuationError::OutOfRange {
                value: self.target,
                min: self.min,
                max: self.max,
            });
        }
        machine.actuate(self.kind, self.target)?;
        self.current = self.target;
        Ok(())
    }

    pub fn kind(&self) -> ActuatorKind {
        self.kind
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn ladder(&self) -> Option<&[u64]> {
        self.ladder.as_deref()
    }

    /// Whether the target differs from the host value
    pub fn is_pending(&self) -> bool {
        self.target != self.current
    }

    /// Set the target, clamped to bounds and snapped to the ladder
    pub fn set_target(&mut self, value: u64) {
        self.target = self.snap(value);
    }

    /// Set the target from a continuous controller output
    pub fn set_target_f64(&mut self, value: f64) {
        let value = if value.is_nan() { self.current as f64 } else { value };
        let rounded = value.round().clamp(0.0, u64::MAX as f64) as u64;
        self.set_target(rounded);
    }

    /// Target one step above the current value (bounded by `max`)
    pub fn step_up(&mut self) {
        self.target = self.next_above(self.current);
    }

    /// Target one step below the current value (bounded by `min`)
    pub fn step_down(&mut self) {
        self.target = self.next_below(self.current);
    }

    pub fn at_max(&self) -> bool {
        self.current >= self.max
    }

    pub fn at_min(&self) -> bool {
        self.current <= self.min
    }

    fn snap(&self, value: u64) -> u64 {
        let value = value.clamp(self.min, self.max);
        match &self.ladder {
            Some(ladder) => ladder[nearest_in(ladder.len(), |i| ladder[i], value)],
            None => value,
        }
    }

    fn next_above(&self, value: u64) -> u64 {
        match &self.ladder {
            Some(ladder) => ladder
                .iter()
                .copied()
                .find(|&v| v > value && v <= self.max)
                .unwrap_or_else(|| self.snap(value)),
            None => value.saturating_add(1).min(self.max),
        }
    }

    fn next_below(&self, value: u64) -> u64 {
        match &self.ladder {
            Some(ladder) => ladder
                .iter()
                .rev()
                .copied()
                .find(|&v| v < value && v >= self.min)
                .unwrap_or_else(|| self.snap(value)),
            None => value.saturating_sub(1).max(self.min),
        }
    }
}

/// Handle to an actuator inside an [`ActuatorSet`], resolved once when a
/// strategy is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActuatorId(usize);

/// The actuators owned by one control loop
#[derive(Debug, Clone, Default)]
pub struct ActuatorSet {
    actuators: Vec<Actuator>,
}

impl ActuatorSet {
    pub fn new(actuators: Vec<Actuator>) -> Self {
        Self { actuators }
    }

    /// Initialize one actuator per kind, in order
    pub fn init(kinds: &[ActuatorKind], machine: &mut Machine) -> Result<Self, ActuationError> {
        let actuators = kinds
            .iter()
            .map(|&kind| Actuator::init(kind, machine))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(actuators))
    }

    pub fn find(&self, kind: ActuatorKind) -> Option<ActuatorId> {
        self.actuators
            .iter()
            .position(|a| a.kind == kind)
            .map(ActuatorId)
    }

    /// Handles of every per-core frequency actuator, by core index
    pub fn per_core_frequencies(&self) -> Vec<ActuatorId> {
        let mut cores: Vec<(usize, ActuatorId)> = self
            .actuators
            .iter()
            .enumerate()
            .filter_map(|(i, a)| match a.kind {
                ActuatorKind::PerCoreFrequency(core) => Some((core, ActuatorId(i))),
                _ => None,
            })
            .collect();
        cores.sort_by_key(|&(core, _)| core);
        cores.into_iter().map(|(_, id)| id).collect()
    }

    pub fn get(&self, id: ActuatorId) -> &Actuator {
        &self.actuators[id.0]
    }

    pub fn get_mut(&mut self, id: ActuatorId) -> &mut Actuator {
        &mut self.actuators[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Actuator> {
        self.actuators.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Actuator> {
        self.actuators.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }

    /// Current values in set order
    pub fn values(&self) -> Vec<u64> {
        self.actuators.iter().map(Actuator::current).collect()
    }

    /// Display names in set order
    pub fn names(&self) -> Vec<String> {
        self.actuators.iter().map(|a| a.kind.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frequency_actuator(current: u64) -> Actuator {
        Actuator::from_reading(
            ActuatorKind::PerCoreFrequency(0),
            ActuatorReading {
                current,
                min: 800,
                max: 2400,
                ladder: Some(vec![800, 1600, 2400]),
            },
        )
    }

    #[test]
    fn test_ladder_steps() {
        let mut act = frequency_actuator(1600);
        act.step_up();
        assert_eq!(act.target(), 2400);
        act.step_down();
        assert_eq!(act.target(), 800);

        let mut top = frequency_actuator(2400);
        top.step_up();
        assert_eq!(top.target(), 2400);
        assert!(!top.is_pending());
    }

    #[test]
    fn test_off_ladder_current_is_snapped() {
        let act = frequency_actuator(1700);
        assert_eq!(act.current(), 1600);
    }

    #[test]
    fn test_integer_steps_are_bounded() {
        let mut cores = Actuator::from_reading(
            ActuatorKind::CoreCount,
            ActuatorReading {
                current: 1,
                min: 1,
                max: 4,
                ladder: None,
            },
        );
        cores.step_down();
        assert_eq!(cores.target(), 1);
        cores.step_up();
        assert_eq!(cores.target(), 2);
        cores.set_target_f64(7.6);
        assert_eq!(cores.target(), 4);
        cores.set_target_f64(-3.0);
        assert_eq!(cores.target(), 1);
        cores.set_target_f64(f64::NAN);
        assert_eq!(cores.target(), 1);
    }

    #[test]
    fn test_set_target_snaps_to_ladder() {
        let mut act = frequency_actuator(800);
        act.set_target(2000);
        assert_eq!(act.target(), 1600);
        act.set_target(2001);
        assert_eq!(act.target(), 2400);
    }

    #[test]
    fn test_actuator_set_lookup() {
        let set = ActuatorSet::new(vec![
            frequency_actuator(800),
            Actuator::from_reading(
                ActuatorKind::CoreCount,
                ActuatorReading {
                    current: 2,
                    min: 1,
                    max: 4,
                    ladder: None,
                },
            ),
        ]);
        let cores = set.find(ActuatorKind::CoreCount).unwrap();
        assert_eq!(set.get(cores).current(), 2);
        assert!(set.find(ActuatorKind::AggregateSpeed).is_none());
        assert_eq!(set.per_core_frequencies().len(), 1);
        assert_eq!(set.names(), vec!["freq0".to_string(), "cores".to_string()]);
        assert_eq!(set.values(), vec![800, 2]);
    }
}
