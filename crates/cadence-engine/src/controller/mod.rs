//! Decision strategies
//!
//! A strategy reads the latest sample and the actuators' current values and
//! writes new targets. Strategies never block and never touch the host.
pub mod bang_bang;
pub mod coordinated;
pub mod pid;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use cadence_common::{CadenceError, FeedbackSample, Result};

use crate::actuator::{ActuatorKind, ActuatorSet};
use crate::EngineConfig;

pub use self::bang_bang::BangBang;
pub use self::coordinated::CoordinatedStep;
pub use self::pid::ProportionalController;

/// Target heart-rate interval reported by the heartbeat source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateBand {
    pub min_rate: f64,
    pub max_rate: f64,
}

/// Where a rate falls relative to a [`RateBand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateZone {
    Below,
    Within,
    Above,
}

impl RateBand {
    pub fn new(min_rate: f64, max_rate: f64) -> Self {
        Self { min_rate, max_rate }
    }

    pub fn midpoint(&self) -> f64 {
        (self.min_rate + self.max_rate) / 2.0
    }

    pub fn classify(&self, rate: f64) -> RateZone {
        if rate < self.min_rate {
            RateZone::Below
        } else if rate > self.max_rate {
            RateZone::Above
        } else {
            RateZone::Within
        }
    }
}

/// Policy that proposes actuator targets from a feedback sample
pub trait DecisionStrategy: Send {
    fn name(&self) -> &'static str;

    fn decide(&mut self, sample: &FeedbackSample, band: &RateBand, actuators: &mut ActuatorSet);
}

/// Baseline strategy: never moves anything
#[derive(Debug, Default)]
pub struct Dummy;

impl DecisionStrategy for Dummy {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn decide(&mut self, _sample: &FeedbackSample, _band: &RateBand, _actuators: &mut ActuatorSet) {}
}

/// Strategies selectable by name at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Dummy,
    CoreBangBang,
    FreqBangBang,
    Uncoordinated,
    Coordinated,
    CoreProportional,
    SpeedProportional,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 7] = [
        StrategyKind::Dummy,
        StrategyKind::CoreBangBang,
        StrategyKind::FreqBangBang,
        StrategyKind::Uncoordinated,
        StrategyKind::Coordinated,
        StrategyKind::CoreProportional,
        StrategyKind::SpeedProportional,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Dummy => "dummy",
            StrategyKind::CoreBangBang => "core-bang-bang",
            StrategyKind::FreqBangBang => "freq-bang-bang",
            StrategyKind::Uncoordinated => "uncoordinated",
            StrategyKind::Coordinated => "coordinated",
            StrategyKind::CoreProportional => "core-proportional",
            StrategyKind::SpeedProportional => "speed-proportional",
        }
    }

    /// Whether the strategy needs a machine-state catalog
    pub fn needs_catalog(self) -> bool {
        matches!(self, StrategyKind::SpeedProportional)
    }

    /// Actuators the strategy drives on a machine with `cores` governed cores
    pub fn actuator_kinds(self, cores: usize) -> Vec<ActuatorKind> {
        match self {
            StrategyKind::Dummy | StrategyKind::Uncoordinated => {
                vec![ActuatorKind::CoreCount, ActuatorKind::GlobalFrequency]
            }
            StrategyKind::CoreBangBang | StrategyKind::CoreProportional => {
                vec![ActuatorKind::CoreCount]
            }
            StrategyKind::FreqBangBang => vec![ActuatorKind::GlobalFrequency],
            StrategyKind::Coordinated => std::iter::once(ActuatorKind::CoreCount)
                .chain((0..cores).map(ActuatorKind::PerCoreFrequency))
                .collect(),
            StrategyKind::SpeedProportional => vec![ActuatorKind::AggregateSpeed],
        }
    }

    /// Build the strategy against an initialized actuator set
    pub fn build(
        self,
        actuators: &ActuatorSet,
        config: &EngineConfig,
    ) -> Result<Box<dyn DecisionStrategy>> {
        let require = |kind: ActuatorKind| {
            actuators.find(kind).ok_or_else(|| {
                CadenceError::Config(format!("strategy {} needs the {} actuator", self, kind))
            })
        };

        let strategy: Box<dyn DecisionStrategy> = match self {
            StrategyKind::Dummy => Box::new(Dummy),
            StrategyKind::CoreBangBang => {
                Box::new(BangBang::new("core-bang-bang", vec![require(ActuatorKind::CoreCount)?]))
            }
            StrategyKind::FreqBangBang => Box::new(BangBang::new(
                "freq-bang-bang",
                vec![require(ActuatorKind::GlobalFrequency)?],
            )),
            StrategyKind::Uncoordinated => Box::new(BangBang::new(
                "uncoordinated",
                vec![
                    require(ActuatorKind::CoreCount)?,
                    require(ActuatorKind::GlobalFrequency)?,
                ],
            )),
            StrategyKind::Coordinated => {
                let frequencies = actuators.per_core_frequencies();
                if frequencies.is_empty() {
                    return Err(CadenceError::Config(
                        "strategy coordinated needs per-core frequency actuators".into(),
                    ));
                }
                Box::new(CoordinatedStep::new(
                    require(ActuatorKind::CoreCount)?,
                    frequencies,
                ))
            }
            StrategyKind::CoreProportional => Box::new(ProportionalController::new(
                "core-proportional",
                require(ActuatorKind::CoreCount)?,
                config.core_kp,
            )),
            StrategyKind::SpeedProportional => Box::new(ProportionalController::new(
                "speed-proportional",
                require(ActuatorKind::AggregateSpeed)?,
                config.speed_kp,
            )
            .with_output_scale(config.speed_unit.max(1) as f64)),
        };
        Ok(strategy)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = StrategyKind::ALL.iter().map(|k| k.as_str()).collect();
                CadenceError::Config(format!(
                    "unknown strategy '{}' (expected one of: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_band() {
        let band = RateBand::new(4.0, 6.0);
        assert_eq!(band.midpoint(), 5.0);
        assert_eq!(band.classify(3.9), RateZone::Below);
        assert_eq!(band.classify(4.0), RateZone::Within);
        assert_eq!(band.classify(6.0), RateZone::Within);
        assert_eq!(band.classify(6.1), RateZone::Above);
    }

    #[test]
    fn test_strategy_names_roundtrip() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.as_str().parse::<StrategyKind>().unwrap(), kind);
        }
        assert_eq!(
            "Speed_Proportional".parse::<StrategyKind>().unwrap(),
            StrategyKind::SpeedProportional
        );
        assert!("pid".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_coordinated_actuator_kinds() {
        assert_eq!(
            StrategyKind::Coordinated.actuator_kinds(2),
            vec![
                ActuatorKind::CoreCount,
                ActuatorKind::PerCoreFrequency(0),
                ActuatorKind::PerCoreFrequency(1),
            ]
        );
        assert!(StrategyKind::SpeedProportional.needs_catalog());
        assert!(!StrategyKind::Coordinated.needs_catalog());
    }

    #[test]
    fn test_build_reports_missing_actuator() {
        let empty = ActuatorSet::default();
        let err = StrategyKind::CoreBangBang
            .build(&empty, &EngineConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("cores"));
        assert!(StrategyKind::Dummy
            .build(&empty, &EngineConfig::default())
            .is_ok());
    }
}
