//! Error types for the shard layer

use thiserror::Error;
use treeq_state::StateError;

/// Errors that can occur in the shard-keeping register
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnitError {
    /// An error surfaced from the engine layer
    #[error(transparent)]
    State(#[from] StateError),

    /// Invalid qubit index
    #[error("Invalid qubit index {index} for {qubit_count}-qubit unit")]
    InvalidQubitIndex { index: usize, qubit_count: usize },

    /// Invalid basis permutation
    #[error("Invalid basis permutation {perm} for {qubit_count}-qubit unit")]
    InvalidPermutation { perm: u64, qubit_count: usize },

    /// Construction-time configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type for the shard layer
pub type Result<T> = std::result::Result<T, UnitError>;
