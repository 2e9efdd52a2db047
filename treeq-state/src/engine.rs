//! The opaque dense-backend interface used by attached tree leaves and shards
//!
//! A `StateEngine` is a normalized dense sub-state-vector with the usual
//! register primitives. The tree layer treats it as a black box: it reads and
//! writes amplitudes, forwards gates and measurements, and composes engines
//! when registers are concatenated. Device placement is bookkeeping only at
//! this layer; the multi-device unit decides where an engine actually lives.

use crate::error::Result;
use num_complex::Complex64;
use parking_lot::Mutex;
use std::sync::Arc;

/// A 2×2 gate matrix in row-major order
pub type Matrix2x2 = [[Complex64; 2]; 2];

/// Shared handle to an engine, possibly referenced by several tree leaves
pub type EnginePtr = Arc<Mutex<dyn StateEngine>>;

/// Dense sub-state-vector backend
///
/// Implementations keep their amplitudes normalized except transiently inside
/// an operation. Random values are supplied by the caller so that generator
/// access stays serialized at the register layer.
pub trait StateEngine: Send + std::fmt::Debug {
    /// Number of qubits held by this engine
    fn qubit_count(&self) -> usize;

    /// `2^qubit_count`
    fn max_q_power(&self) -> u64 {
        1u64 << self.qubit_count()
    }

    /// Amplitude of a basis permutation (low bit = qubit 0)
    fn get_amplitude(&self, perm: u64) -> Complex64;

    /// Overwrite the amplitude of a basis permutation
    fn set_amplitude(&mut self, perm: u64, amplitude: Complex64);

    /// Marginal probability of measuring `qubit` as 1
    fn prob(&self, qubit: usize) -> Result<f64>;

    /// Probability of the full basis permutation
    fn prob_all(&self, perm: u64) -> f64;

    /// Measure one qubit
    ///
    /// `result` forces the outcome when `Some`; otherwise the outcome is
    /// sampled against `rand_value` in `[0, 1)`. When `do_apply` is set the
    /// state collapses and renormalizes.
    fn force_m(
        &mut self,
        qubit: usize,
        result: Option<bool>,
        do_apply: bool,
        rand_value: f64,
    ) -> Result<bool>;

    /// Measure every qubit, collapsing to the sampled basis state
    fn m_all(&mut self, rng: &mut dyn FnMut() -> f64) -> Result<u64>;

    /// Apply a 2×2 unitary to `target`
    fn mtrx(&mut self, mtrx: &Matrix2x2, target: usize) -> Result<()>;

    /// Apply a 2×2 unitary to `target`, conditioned on every control being 1
    fn mc_mtrx(&mut self, controls: &[usize], mtrx: &Matrix2x2, target: usize) -> Result<()>;

    /// Controlled diagonal gate `diag(top_left, bottom_right)`
    fn mc_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()>;

    /// Controlled anti-diagonal gate `[[0, top_right], [bottom_left, 0]]`
    fn mc_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()>;

    /// Append `other` as the high-order qubits of this engine
    ///
    /// Returns the index at which the appended qubits start.
    fn compose(&mut self, other: &dyn StateEngine) -> usize;

    /// Detach the separable qubit range `[start, start+length)`
    ///
    /// Fails with [`crate::StateError::NotSeparable`] (state untouched) when
    /// the range does not factor out within `eps`.
    fn decompose(&mut self, start: usize, length: usize, eps: f64) -> Result<EnginePtr>;

    /// Drop a qubit known to be in the basis state `value`
    ///
    /// Used after measurement to shrink the engine by the collapsed qubit.
    fn dispose_fixed(&mut self, qubit: usize, value: bool) -> Result<()>;

    /// Current norm of the amplitudes
    fn norm(&self) -> f64;

    /// Rescale to unit norm; returns the norm prior to rescaling
    ///
    /// A zero-norm state is left untouched and 0 is returned.
    fn normalize(&mut self) -> f64;

    /// Exchange two qubits
    fn swap(&mut self, qubit1: usize, qubit2: usize) -> Result<()> {
        if qubit1 == qubit2 {
            return Ok(());
        }
        let one = Complex64::new(1.0, 0.0);
        self.mc_invert(&[qubit1], one, one, qubit2)?;
        self.mc_invert(&[qubit2], one, one, qubit1)?;
        self.mc_invert(&[qubit1], one, one, qubit2)
    }

    /// Move this engine to a device
    fn set_device(&mut self, device_id: usize);

    /// Device this engine currently resides on
    fn device_id(&self) -> usize;

    /// Maximum state-vector allocation of the engine's current device, in
    /// amplitudes — unbounded for a device the registry does not know
    fn max_size(&self) -> u64;

    /// Deep copy behind a fresh shared handle
    fn clone_shared(&self) -> EnginePtr;
}
