//! Binary-decision-tree quantum state representation
//!
//! This crate provides the compressed tree form of an amplitude vector and
//! the structural operations a register layer needs to operate on it in
//! place:
//!
//! - **Dense**: [`DenseEngine`], a normalized amplitude vector with stride
//!   kernels — the backend behind attached leaves and shards
//! - **Tree**: [`BdtNode`] vertices sharing sub-states through `Arc`, with
//!   unshare-on-write mutation ([`branch_node`]) and tolerance-aware
//!   canonicalization ([`ops::prune`])
//!
//! The amplitude of a basis permutation is the product of vertex scales
//! along the path its bits select, times the attached engine's amplitude for
//! the high-order bits when the path ends in an attached leaf.

pub mod dense;
pub mod device;
pub mod engine;
pub mod error;
pub mod node;
pub mod ops;

pub use dense::DenseEngine;
pub use device::DeviceInfo;
pub use engine::{EnginePtr, Matrix2x2, StateEngine};
pub use error::{Result, StateError};
pub use node::{branch_node, is_equal, is_equal_under, select_bit, BdtNode, NodeKind, NodePtr};
