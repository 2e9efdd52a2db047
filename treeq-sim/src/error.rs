//! Error types for register-level operations

use thiserror::Error;
use treeq_state::StateError;

/// Errors that can occur while driving the simulated register
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    /// An error surfaced from the state/tree layer
    #[error(transparent)]
    State(#[from] StateError),

    /// Invalid qubit index
    #[error("Invalid qubit index {index} for {qubit_count}-qubit register")]
    InvalidQubitIndex { index: usize, qubit_count: usize },

    /// Invalid basis permutation
    #[error("Invalid basis permutation {perm} for {qubit_count}-qubit register")]
    InvalidPermutation { perm: u64, qubit_count: usize },

    /// Construction-time configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Post-gate norm drifted beyond tolerance with normalization disabled
    #[error("State norm drifted to {norm}")]
    NumericalDrift { norm: f64 },

    /// A structurally valid request this representation cannot carry out
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type for register-level operations
pub type Result<T> = std::result::Result<T, SimError>;
