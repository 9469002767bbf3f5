//! Coordinated core-count / frequency ladder
//!
//! Cores and frequencies form one ordered ladder. Going up, the last active
//! core is raised to its maximum frequency before another core is enabled at
//! its lowest frequency. Going down mirrors this: a core is only released
//! once its frequency has already reached the minimum.

use tracing::trace;

use cadence_common::FeedbackSample;

use super::{DecisionStrategy, RateBand, RateZone};
use crate::actuator::{ActuatorId, ActuatorSet};

pub struct CoordinatedStep {
    cores: ActuatorId,
    /// Per-core frequency actuators indexed by core
    frequencies: Vec<ActuatorId>,
}

impl CoordinatedStep {
    pub fn new(cores: ActuatorId, frequencies: Vec<ActuatorId>) -> Self {
        Self { cores, frequencies }
    }

    /// Frequency actuator of the highest enabled core
    fn last_active(&self, actuators: &ActuatorSet) -> Option<(usize, ActuatorId)> {
        let active = actuators.get(self.cores).current() as usize;
        let index = active.clamp(1, self.frequencies.len()) - 1;
        self.frequencies.get(index).map(|&id| (index, id))
    }

    fn climb(&self, actuators: &mut ActuatorSet) {
        let Some((core, freq)) = self.last_active(actuators) else {
            return;
        };

        if !actuators.get(freq).at_max() {
            actuators.get_mut(freq).step_up();
            trace!(core, "raising frequency");
            return;
        }

        let cores = actuators.get(self.cores);
        if cores.at_max() || core + 1 >= self.frequencies.len() {
            return;
        }
        actuators.get_mut(self.cores).step_up();
        let next = self.frequencies[core + 1];
        let lowest = actuators.get(next).min();
        actuators.get_mut(next).set_target(lowest);
        trace!(core = core + 1, "enabling core");
    }

    fn descend(&self, actuators: &mut ActuatorSet) {
        let Some((core, freq)) = self.last_active(actuators) else {
            return;
        };

        if !actuators.get(freq).at_min() {
            actuators.get_mut(freq).step_down();
            trace!(core, "lowering frequency");
            return;
        }

        if !actuators.get(self.cores).at_min() {
            actuators.get_mut(self.cores).step_down();
            trace!(core, "releasing core");
        }
    }
}

impl DecisionStrategy for CoordinatedStep {
    fn name(&self) -> &'static str {
        "coordinated"
    }

    fn decide(&mut self, sample: &FeedbackSample, band: &RateBand, actuators: &mut ActuatorSet) {
        match band.classify(sample.windowed_rate) {
            RateZone::Below => self.climb(actuators),
            RateZone::Above => self.descend(actuators),
            RateZone::Within => {}
        }
    }
}
