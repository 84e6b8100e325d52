//! Error types for tile operations

use thiserror::Error;

use crate::Backend;

/// Result type for tile operations
pub type Result<T> = std::result::Result<T, TileError>;

/// Errors that can occur while driving the tile unit
///
/// None of these are retried. `CapabilityDenied` ends the calling thread's use
/// of the tile unit; everything else is a caller-side contract problem detected
/// before any tile instruction is issued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileError {
    /// The OS refused the extended-state permission for tile data
    #[error("Tile capability denied by the OS (errno {errno})")]
    CapabilityDenied {
        /// Raw OS error code returned by the permission request
        errno: i32,
    },

    /// Backend not supported on this platform
    #[error("Backend not supported on this platform: {0:?}")]
    UnsupportedBackend(Backend),

    /// Operation attempted outside its contract (wrong state, stride, geometry)
    #[error("Tile contract violation: {0}")]
    ContractViolation(String),

    /// Requested geometry exceeds the tile storage budget
    #[error("Tile resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
