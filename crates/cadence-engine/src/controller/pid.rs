//! Proportional control around the middle of the rate band

use ::pid::Pid;

use cadence_common::FeedbackSample;

use super::{DecisionStrategy, RateBand};
use crate::actuator::{ActuatorId, ActuatorSet};

/// Largest correction a single decision may request
const OUTPUT_LIMIT: f64 = 1.0e12;

pub struct ProportionalController {
    name: &'static str,
    actuator: ActuatorId,
    pid: Pid<f64>,
    /// Actuator units per unit of controller output
    scale: f64,
}

impl ProportionalController {
    pub fn new(name: &'static str, actuator: ActuatorId, kp: f64) -> Self {
        let mut pid = Pid::new(0.0, OUTPUT_LIMIT);
        pid.p(kp, OUTPUT_LIMIT);

        Self {
            name,
            actuator,
            pid,
            scale: 1.0,
        }
    }

    /// Multiply every correction by `scale`, e.g. kHz per speed unit
    pub fn with_output_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Correction for a measured rate: `kp * (midpoint - rate) * scale`
    pub fn correction(&mut self, band: &RateBand, rate: f64) -> f64 {
        self.pid.setpoint(band.midpoint());
        self.pid.next_control_output(rate).output * self.scale
    }
}

impl DecisionStrategy for ProportionalController {
    fn name(&self) -> &'static str {
        self.name
    }

    fn decide(&mut self, sample: &FeedbackSample, band: &RateBand, actuators: &mut ActuatorSet) {
        let correction = self.correction(band, sample.windowed_rate);
        let actuator = actuators.get_mut(self.actuator);
        let target = actuator.current() as f64 + correction;
        actuator.set_target_f64(target);
    }
}
