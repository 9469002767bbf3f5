//! Daemon configuration
//!
//! Layered: built-in defaults, then an optional TOML file, then `CADENCE_*`
//! environment variables (`__` separates nested keys, e.g.
//! `CADENCE_HEARTBEAT__MIN_RATE=12.5`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ::config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};

use cadence_common::{
    CadenceError, DEFAULT_CORE_KP, DEFAULT_CORE_POWER_OVERHEAD, DEFAULT_MAX_CATALOG_CORES,
    DEFAULT_SPEED_KP, DEFAULT_SPEED_UNIT, HEARTBEAT_DIR_ENV,
};
use cadence_engine::{EngineConfig, StrategyKind};

/// Environment variable prefix for every setting
pub const ENV_PREFIX: &str = "CADENCE";

/// Cadence daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Decision strategy driving the actuators
    pub strategy: StrategyKind,
    /// Stop after this beat
    pub max_beats: Option<i64>,
    /// Directory where heartbeat-enabled applications register
    pub heartbeat_dir: Option<PathBuf>,
    /// Drive a simulated host instead of sysfs and taskset
    pub dry_run: bool,
    pub heartbeat: HeartbeatSettings,
    pub cpu: CpuSettings,
    pub gains: GainSettings,
    pub catalog: CatalogSettings,
    pub status: StatusSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Dummy,
            max_beats: None,
            heartbeat_dir: None,
            dry_run: false,
            heartbeat: HeartbeatSettings::default(),
            cpu: CpuSettings::default(),
            gains: GainSettings::default(),
            catalog: CatalogSettings::default(),
            status: StatusSettings::default(),
        }
    }
}

/// Target rate band and polling of the heartbeat log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub min_rate: f64,
    pub max_rate: f64,
    /// Beats in the application's rate window; also the hold-off after a move
    pub window_size: i64,
    pub poll_interval_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            min_rate: 10.0,
            max_rate: 20.0,
            window_size: 20,
            poll_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuSettings {
    /// Largest core count the machine-state catalog is built for
    pub max_cores: usize,
    pub sysfs_root: PathBuf,
    /// Switch every governed core to the `userspace` cpufreq governor
    pub set_userspace_governor: bool,
}

impl Default for CpuSettings {
    fn default() -> Self {
        Self {
            max_cores: DEFAULT_MAX_CATALOG_CORES,
            sysfs_root: PathBuf::from("/sys/devices/system/cpu"),
            set_userspace_governor: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GainSettings {
    pub core_kp: f64,
    pub speed_kp: f64,
    /// kHz per aggregate-speed unit of the speed controller's output
    pub speed_unit: u64,
}

impl Default for GainSettings {
    fn default() -> Self {
        Self {
            core_kp: DEFAULT_CORE_KP,
            speed_kp: DEFAULT_SPEED_KP,
            speed_unit: DEFAULT_SPEED_UNIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// Power charged per active core on top of its frequency
    pub core_power_overhead: u64,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            core_power_overhead: DEFAULT_CORE_POWER_OVERHEAD,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFormat {
    #[default]
    Tsv,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSettings {
    pub format: StatusFormat,
}

impl DaemonConfig {
    /// Load from `.env`, an optional file, and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut cfg = Self::load_with(path, None)?;
        if cfg.heartbeat_dir.is_none() {
            cfg.heartbeat_dir = std::env::var_os(HEARTBEAT_DIR_ENV).map(PathBuf::from);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an optional file and an environment map (the process
    /// environment when `env` is `None`)
    pub fn load_with(path: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let cfg = builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize::<Self>()
            .context("invalid configuration")?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), CadenceError> {
        let hb = &self.heartbeat;
        if !(hb.min_rate.is_finite() && hb.max_rate.is_finite()) || hb.min_rate > hb.max_rate {
            return Err(CadenceError::Config(format!(
                "heartbeat rate band [{}, {}] is empty",
                hb.min_rate, hb.max_rate
            )));
        }
        if hb.window_size < 1 {
            return Err(CadenceError::Config(format!(
                "heartbeat window_size must be at least 1, got {}",
                hb.window_size
            )));
        }
        if self.cpu.max_cores == 0 || self.cpu.max_cores > 64 {
            return Err(CadenceError::Config(format!(
                "cpu.max_cores must be within 1..=64, got {}",
                self.cpu.max_cores
            )));
        }
        if self.gains.speed_unit == 0 {
            return Err(CadenceError::Config("gains.speed_unit must be positive".into()));
        }
        if let Some(max) = self.max_beats {
            if max < 0 {
                return Err(CadenceError::Config(format!("max_beats {} is negative", max)));
            }
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            core_kp: self.gains.core_kp,
            speed_kp: self.gains.speed_kp,
            speed_unit: self.gains.speed_unit,
            max_catalog_cores: self.cpu.max_cores,
            core_power_overhead: self.catalog.core_power_overhead,
        }
    }
}
