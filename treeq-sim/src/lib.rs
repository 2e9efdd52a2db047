//! Quantum register simulation on a compressed binary decision tree
//!
//! A [`Qbdt`] register keeps its amplitude vector as a tree of shared
//! sub-states instead of a dense array, so states with structure cost far
//! less than `2^n` memory. Gates act directly on the compressed form:
//! traversal skips zero subtrees, mutation unshares copy-on-write, and a
//! pruning pass after every gate merges equal subtrees back together.
//!
//! Qubits beyond the tree's depth live in dense engines attached at the
//! leaves; gates and measurements spanning the boundary forward into them.
//!
//! # Example
//!
//! ```
//! use treeq_sim::{Qbdt, SimConfig};
//! use num_complex::Complex64;
//!
//! let h = std::f64::consts::FRAC_1_SQRT_2;
//! let hadamard = [
//!     [Complex64::new(h, 0.0), Complex64::new(h, 0.0)],
//!     [Complex64::new(h, 0.0), Complex64::new(-h, 0.0)],
//! ];
//! let one = Complex64::new(1.0, 0.0);
//!
//! let mut register = Qbdt::new(2, 0, SimConfig::new().with_seed(1)).unwrap();
//! register.mtrx(&hadamard, 0).unwrap();
//! register.mc_invert(&[0], one, one, 1).unwrap();
//!
//! assert!((register.prob_all(0b11).unwrap() - 0.5).abs() < 1e-9);
//! ```

pub mod config;
pub mod error;
pub mod parallel;
pub mod qbdt;

pub use config::SimConfig;
pub use error::{Result, SimError};
pub use parallel::{for_qbdt, par_for_qbdt, par_reduce_qbdt};
pub use qbdt::Qbdt;
