//! Bang-bang control: one step per dimension when the rate leaves the band
//!
//! With several actuators each one is stepped independently, which is the
//! uncoordinated core + frequency policy.

use cadence_common::FeedbackSample;

use super::{DecisionStrategy, RateBand, RateZone};
use crate::actuator::{ActuatorId, ActuatorSet};

pub struct BangBang {
    name: &'static str,
    actuators: Vec<ActuatorId>,
}

impl BangBang {
    pub fn new(name: &'static str, actuators: Vec<ActuatorId>) -> Self {
        Self { name, actuators }
    }
}

impl DecisionStrategy for BangBang {
    fn name(&self) -> &'static str {
        self.name
    }

    fn decide(&mut self, sample: &FeedbackSample, band: &RateBand, actuators: &mut ActuatorSet) {
        let zone = band.classify(sample.windowed_rate);
        for &id in &self.actuators {
            let actuator = actuators.get_mut(id);
            match zone {
                RateZone::Below => actuator.step_up(),
                RateZone::Above => actuator.step_down(),
                RateZone::Within => {}
            }
        }
    }
}
