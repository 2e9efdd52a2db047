//! Error types for state and tree operations

use thiserror::Error;

/// Errors that can occur during state or tree operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    /// Invalid qubit index
    #[error("Invalid qubit index {index} for {num_qubits}-qubit state")]
    InvalidQubitIndex { index: usize, num_qubits: usize },

    /// Invalid basis permutation
    #[error("Invalid basis permutation {perm} for {num_qubits}-qubit state")]
    InvalidPermutation { perm: u64, num_qubits: usize },

    /// Invalid state dimension
    #[error("Invalid state dimension {dimension}, expected power of 2")]
    InvalidDimension { dimension: usize },

    /// The requested qubit range does not factor out of the state
    #[error("Qubit range [{start}, {start}+{length}) is not separable")]
    NotSeparable { start: usize, length: usize },

    /// A measurement outcome of (numerically) zero probability was forced
    #[error("Forced outcome {outcome} on qubit {qubit} has zero probability")]
    ImpossibleOutcome { qubit: usize, outcome: bool },

    /// State not normalized
    #[error("State not normalized, norm = {norm}")]
    NotNormalized { norm: f64 },
}

/// Result type for state and tree operations
pub type Result<T> = std::result::Result<T, StateError>;
