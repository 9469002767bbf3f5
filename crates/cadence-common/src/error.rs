//! Error types for Cadence
//!
//! Startup failures (discovery, catalog) are fatal. Steady-state failures
//! (actuation, sampling) are absorbed by the control loop.

use thiserror::Error;

/// Result type alias using CadenceError
pub type Result<T> = std::result::Result<T, CadenceError>;

/// Unified error type for Cadence operations
#[derive(Debug, Error)]
pub enum CadenceError {
    // Target process discovery errors
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    // Machine-state catalog errors
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    // Actuator errors
    #[error("Actuation error: {0}")]
    Actuation(#[from] ActuationError),

    // Heartbeat sample errors
    #[error("Sample error: {0}")]
    Sample(#[from] SampleError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Filesystem / process errors
    #[error("IO error: {0}")]
    Io(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Target process discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No heartbeat-enabled process found in {dir}")]
    NotFound { dir: String },

    #[error("Expected exactly one heartbeat-enabled process, found {count}: {pids:?}")]
    MultipleTargets { count: usize, pids: Vec<u32> },

    #[error("Cannot read heartbeat directory {dir}: {reason}")]
    InvalidEntry { dir: String, reason: String },
}

/// Machine-state catalog construction errors
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Cannot allocate state table for {core_count} cores x {freq_count} frequencies")]
    Allocation { core_count: usize, freq_count: usize },

    #[error("No usable machine state for {core_count} cores x {freq_count} frequencies")]
    Empty { core_count: usize, freq_count: usize },

    #[error("Core count {core_count} exceeds catalog limit {max}")]
    TooManyCores { core_count: usize, max: usize },

    #[error("No available frequencies")]
    NoFrequencies,

    #[error("Invalid state table: {0}")]
    InvalidTable(String),
}

/// Actuator errors. A failed apply leaves the actuator's current value untouched.
#[derive(Debug, Error)]
pub enum ActuationError {
    #[error("{actuator} backend failed: {reason}")]
    Backend { actuator: String, reason: String },

    #[error("Target {value} outside [{min}, {max}]")]
    OutOfRange { value: u64, min: u64, max: u64 },

    #[error("Frequency {0} is not an available frequency")]
    UnsupportedFrequency(u64),

    #[error("Actuator {0} has not been initialized")]
    NotInitialized(String),
}

/// Heartbeat sample errors. Never fatal: the loop keeps polling.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Malformed heartbeat record: {0}")]
    Malformed(String),

    #[error("Heartbeat unavailable: {0}")]
    Unavailable(String),

    #[error("Heartbeat source closed")]
    Closed,
}

// Implement From for common external error types
impl From<serde_json::Error> for CadenceError {
    fn from(err: serde_json::Error) -> Self {
        CadenceError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CadenceError {
    fn from(err: std::io::Error) -> Self {
        CadenceError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for CadenceError {
    fn from(err: anyhow::Error) -> Self {
        CadenceError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CadenceError::Discovery(DiscoveryError::MultipleTargets {
            count: 2,
            pids: vec![100, 200],
        });
        assert!(err.to_string().contains("found 2"));
        assert!(err.to_string().contains("200"));
    }

    #[test]
    fn test_catalog_error() {
        let err = CatalogError::TooManyCores {
            core_count: 64,
            max: 16,
        };
        assert_eq!(err.to_string(), "Core count 64 exceeds catalog limit 16");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "scaling_setspeed");
        let err: CadenceError = io.into();
        assert!(matches!(err, CadenceError::Io(ref msg) if msg.contains("scaling_setspeed")));
    }
}
