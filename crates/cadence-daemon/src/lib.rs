//! Cadence daemon
//!
//! Host side of the governor: layered configuration, discovery of the
//! heartbeat-enabled process, the Linux cpufreq/affinity backend, the log-file
//! heartbeat source and the `states` table tool.

pub mod config;
pub mod discovery;
pub mod heartbeat;
pub mod service;
pub mod states;
pub mod sysfs;

pub use self::config::DaemonConfig;
