//! Demodulation error types

use thiserror::Error;

/// Result type for demodulation operations
pub type DemulResult<T> = Result<T, DemulError>;

/// Errors raised by the uplink demodulation stage.
///
/// None of these are transient. Configuration errors mean the running
/// configuration and the supported feature set disagree; resource errors
/// come from constructors only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DemulError {
    /// Modulation order not handled by any soft demodulator
    #[error("Unsupported modulation order: {0} bits per symbol (supported: 2, 4, 6)")]
    UnsupportedModulation(usize),

    /// Block size is not a whole number of cache lines
    #[error("{what} of {size} subcarriers is not a multiple of the {width}-subcarrier cache line")]
    MisalignedBlock {
        what: &'static str,
        size: usize,
        width: usize,
    },

    /// Buffer or matrix shape disagrees with the configuration
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Any other inconsistent configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Aligned scratch allocation failed
    #[error("Failed to allocate {len} aligned elements for {what}")]
    AllocationFailed { what: &'static str, len: usize },

    /// Matrix-vector kernel could not be prepared
    #[error("Cannot plan {rows}x{cols} matrix-vector kernel: {reason}")]
    KernelPlan {
        rows: usize,
        cols: usize,
        reason: String,
    },

    /// A task tag field does not fit its bit width, or addresses
    /// coordinates outside the configured frame
    #[error("Task {field} {value} out of range (limit {limit})")]
    TaskOutOfRange {
        field: &'static str,
        value: usize,
        limit: usize,
    },

    /// Worker thread could not be spawned or terminated abnormally
    #[error("Worker error: {0}")]
    Worker(String),
}

impl DemulError {
    /// Check if the error indicates an inconsistent configuration
    pub fn is_config_fatal(&self) -> bool {
        matches!(
            self,
            DemulError::UnsupportedModulation(_)
                | DemulError::MisalignedBlock { .. }
                | DemulError::DimensionMismatch { .. }
                | DemulError::InvalidConfig(_)
        )
    }

    /// Check if the error came from startup resource acquisition
    pub fn is_resource_fatal(&self) -> bool {
        matches!(
            self,
            DemulError::AllocationFailed { .. } | DemulError::KernelPlan { .. }
        )
    }
}
