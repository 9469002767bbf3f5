//! Prometheus counters for the control loop

use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};

use cadence_common::{CadenceError, Result};

/// Control loop metrics
#[derive(Clone)]
pub struct LoopMetrics {
    pub samples_evaluated: IntCounter,
    pub samples_held_off: IntCounter,
    pub actuations_total: IntCounter,
    pub actuation_failures: IntCounter,
    pub heart_rate: Gauge,
    pub aggregate_speed: Gauge,
}

fn metric_error(e: prometheus::Error) -> CadenceError {
    CadenceError::Internal(format!("metrics: {}", e))
}

impl LoopMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            samples_evaluated: IntCounter::new(
                "cadence_samples_evaluated_total",
                "Samples handed to the decision strategy",
            )
            .map_err(metric_error)?,
            samples_held_off: IntCounter::new(
                "cadence_samples_held_off_total",
                "Samples skipped inside a hold-off window",
            )
            .map_err(metric_error)?,
            actuations_total: IntCounter::new(
                "cadence_actuations_total",
                "Actuator targets applied to the host",
            )
            .map_err(metric_error)?,
            actuation_failures: IntCounter::new(
                "cadence_actuation_failures_total",
                "Actuator applications rejected by the host",
            )
            .map_err(metric_error)?,
            heart_rate: Gauge::new("cadence_heart_rate", "Last windowed heart rate (beats/s)")
                .map_err(metric_error)?,
            aggregate_speed: Gauge::new(
                "cadence_aggregate_speed",
                "Current catalog speed of the governed process",
            )
            .map_err(metric_error)?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry
            .register(Box::new(self.samples_evaluated.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.samples_held_off.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.actuations_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.actuation_failures.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.heart_rate.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.aggregate_speed.clone()))
            .map_err(metric_error)?;
        Ok(())
    }
}

/// Render a registry in the Prometheus text exposition format
pub fn render(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(metric_error)?;
    String::from_utf8(buffer).map_err(|e| CadenceError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_render() {
        let registry = Registry::new();
        let metrics = LoopMetrics::new().unwrap();
        metrics.register(&registry).unwrap();

        metrics.actuations_total.inc_by(3);
        metrics.heart_rate.set(12.5);

        let text = render(&registry).unwrap();
        assert!(text.contains("cadence_actuations_total 3"));
        assert!(text.contains("cadence_heart_rate 12.5"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let metrics = LoopMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }
}
