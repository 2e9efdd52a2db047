//! Dense reference engine backing attached leaves and shards
//!
//! A straightforward normalized amplitude vector with stride-indexed gate
//! kernels. Gate application parallelizes over chunks above a size threshold;
//! below it the sequential path avoids synchronization overhead.

use crate::device;
use crate::engine::{EnginePtr, Matrix2x2, StateEngine};
use crate::error::{Result, StateError};
use num_complex::Complex64;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::Arc;

/// Minimum amplitude count before gate kernels go parallel
const PARALLEL_THRESHOLD: usize = 1 << 12;

/// Numerical floor below which a squared magnitude counts as zero
const NORM_FLOOR: f64 = 1e-24;

/// Dense state-vector engine
#[derive(Clone, Debug)]
pub struct DenseEngine {
    amplitudes: Vec<Complex64>,
    num_qubits: usize,
    device_id: usize,
}

impl DenseEngine {
    /// Engine of `num_qubits` qubits in the basis state `perm`
    pub fn new(num_qubits: usize, perm: u64) -> Result<Self> {
        let dimension = 1usize
            .checked_shl(num_qubits as u32)
            .ok_or(StateError::InvalidDimension {
                dimension: usize::MAX,
            })?;
        if perm >= dimension as u64 {
            return Err(StateError::InvalidPermutation { perm, num_qubits });
        }
        let mut amplitudes = vec![Complex64::new(0.0, 0.0); dimension];
        amplitudes[perm as usize] = Complex64::new(1.0, 0.0);
        Ok(Self {
            amplitudes,
            num_qubits,
            device_id: 0,
        })
    }

    /// Engine from raw amplitudes (length must be `2^num_qubits`)
    pub fn from_amplitudes(num_qubits: usize, amplitudes: &[Complex64]) -> Result<Self> {
        if amplitudes.len() != 1usize << num_qubits {
            return Err(StateError::InvalidDimension {
                dimension: amplitudes.len(),
            });
        }
        Ok(Self {
            amplitudes: amplitudes.to_vec(),
            num_qubits,
            device_id: 0,
        })
    }

    /// Read-only view of the amplitudes
    pub fn amplitudes(&self) -> &[Complex64] {
        &self.amplitudes
    }

    fn check_qubit(&self, qubit: usize) -> Result<()> {
        if qubit >= self.num_qubits {
            return Err(StateError::InvalidQubitIndex {
                index: qubit,
                num_qubits: self.num_qubits,
            });
        }
        Ok(())
    }

    fn check_controls(&self, controls: &[usize], target: usize) -> Result<u64> {
        self.check_qubit(target)?;
        let mut mask = 0u64;
        for &control in controls {
            self.check_qubit(control)?;
            if control == target || mask & (1 << control) != 0 {
                return Err(StateError::InvalidQubitIndex {
                    index: control,
                    num_qubits: self.num_qubits,
                });
            }
            mask |= 1 << control;
        }
        Ok(mask)
    }

    fn apply_pairs<F>(&mut self, target: usize, control_mask: u64, op: F)
    where
        F: Fn(Complex64, Complex64) -> (Complex64, Complex64) + Sync,
    {
        let stride = 1usize << target;
        let span = stride << 1;
        let apply_chunk = |chunk_index: usize, chunk: &mut [Complex64]| {
            let base = chunk_index * span;
            for offset in 0..stride.min(chunk.len().saturating_sub(stride)) {
                let low = base + offset;
                if (low as u64) & control_mask != control_mask {
                    continue;
                }
                let (a, b) = op(chunk[offset], chunk[offset + stride]);
                chunk[offset] = a;
                chunk[offset + stride] = b;
            }
        };
        if self.amplitudes.len() >= PARALLEL_THRESHOLD {
            self.amplitudes
                .par_chunks_mut(span)
                .enumerate()
                .for_each(|(index, chunk)| apply_chunk(index, chunk));
        } else {
            for (index, chunk) in self.amplitudes.chunks_mut(span).enumerate() {
                apply_chunk(index, chunk);
            }
        }
    }
}

impl StateEngine for DenseEngine {
    fn qubit_count(&self) -> usize {
        self.num_qubits
    }

    fn get_amplitude(&self, perm: u64) -> Complex64 {
        let mask = (self.amplitudes.len() as u64) - 1;
        self.amplitudes[(perm & mask) as usize]
    }

    fn set_amplitude(&mut self, perm: u64, amplitude: Complex64) {
        let mask = (self.amplitudes.len() as u64) - 1;
        self.amplitudes[(perm & mask) as usize] = amplitude;
    }

    fn prob(&self, qubit: usize) -> Result<f64> {
        self.check_qubit(qubit)?;
        let bit = 1usize << qubit;
        let sum = if self.amplitudes.len() >= PARALLEL_THRESHOLD {
            self.amplitudes
                .par_iter()
                .enumerate()
                .filter(|(index, _)| index & bit != 0)
                .map(|(_, amp)| amp.norm_sqr())
                .sum()
        } else {
            self.amplitudes
                .iter()
                .enumerate()
                .filter(|(index, _)| index & bit != 0)
                .map(|(_, amp)| amp.norm_sqr())
                .sum()
        };
        Ok(clamp_prob(sum))
    }

    fn prob_all(&self, perm: u64) -> f64 {
        clamp_prob(self.get_amplitude(perm).norm_sqr())
    }

    fn force_m(
        &mut self,
        qubit: usize,
        result: Option<bool>,
        do_apply: bool,
        rand_value: f64,
    ) -> Result<bool> {
        let one_chance = self.prob(qubit)?;
        let outcome = match result {
            Some(forced) => forced,
            None => {
                if one_chance >= 1.0 {
                    true
                } else if one_chance <= 0.0 {
                    false
                } else {
                    rand_value <= one_chance
                }
            }
        };
        if !do_apply {
            return Ok(outcome);
        }

        let chance = if outcome { one_chance } else { 1.0 - one_chance };
        if chance <= NORM_FLOOR {
            return Err(StateError::ImpossibleOutcome { qubit, outcome });
        }
        let bit = 1usize << qubit;
        let keep = if outcome { bit } else { 0 };
        let renorm = 1.0 / chance.sqrt();
        for (index, amp) in self.amplitudes.iter_mut().enumerate() {
            if index & bit == keep {
                *amp *= renorm;
            } else {
                *amp = Complex64::new(0.0, 0.0);
            }
        }
        Ok(outcome)
    }

    fn m_all(&mut self, rng: &mut dyn FnMut() -> f64) -> Result<u64> {
        let draw = rng();
        let mut cumulative = 0.0;
        let mut chosen = self.amplitudes.len() - 1;
        for (index, amp) in self.amplitudes.iter().enumerate() {
            cumulative += amp.norm_sqr();
            if draw < cumulative {
                chosen = index;
                break;
            }
        }
        for amp in self.amplitudes.iter_mut() {
            *amp = Complex64::new(0.0, 0.0);
        }
        self.amplitudes[chosen] = Complex64::new(1.0, 0.0);
        Ok(chosen as u64)
    }

    fn mtrx(&mut self, mtrx: &Matrix2x2, target: usize) -> Result<()> {
        self.check_qubit(target)?;
        let m = *mtrx;
        self.apply_pairs(target, 0, move |a, b| {
            (m[0][0] * a + m[0][1] * b, m[1][0] * a + m[1][1] * b)
        });
        Ok(())
    }

    fn mc_mtrx(&mut self, controls: &[usize], mtrx: &Matrix2x2, target: usize) -> Result<()> {
        let mask = self.check_controls(controls, target)?;
        let m = *mtrx;
        self.apply_pairs(target, mask, move |a, b| {
            (m[0][0] * a + m[0][1] * b, m[1][0] * a + m[1][1] * b)
        });
        Ok(())
    }

    fn mc_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        let mask = self.check_controls(controls, target)?;
        self.apply_pairs(target, mask, move |a, b| (top_left * a, bottom_right * b));
        Ok(())
    }

    fn mc_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        let mask = self.check_controls(controls, target)?;
        self.apply_pairs(target, mask, move |a, b| (top_right * b, bottom_left * a));
        Ok(())
    }

    fn compose(&mut self, other: &dyn StateEngine) -> usize {
        let start = self.num_qubits;
        let own_dim = self.amplitudes.len();
        let other_dim = other.max_q_power() as usize;
        let mut merged = vec![Complex64::new(0.0, 0.0); own_dim * other_dim];
        for high in 0..other_dim {
            let factor = other.get_amplitude(high as u64);
            if factor.norm_sqr() <= NORM_FLOOR {
                continue;
            }
            let base = high << start;
            for (low, amp) in self.amplitudes.iter().enumerate() {
                merged[base | low] = amp * factor;
            }
        }
        self.amplitudes = merged;
        self.num_qubits += other.qubit_count();
        start
    }

    fn decompose(&mut self, start: usize, length: usize, eps: f64) -> Result<EnginePtr> {
        if length == 0 || start + length > self.num_qubits {
            return Err(StateError::InvalidQubitIndex {
                index: start + length,
                num_qubits: self.num_qubits,
            });
        }
        let mid_dim = 1usize << length;
        let rest_dim = 1usize << (self.num_qubits - length);
        let low_mask = (1usize << start) - 1;
        let index_of = |rest: usize, mid: usize| -> usize {
            let low = rest & low_mask;
            let high = (rest >> start) << (start + length);
            high | (mid << start) | low
        };

        // reference column: the rest-index carrying the most weight
        let mut reference = 0usize;
        let mut best = -1.0f64;
        for rest in 0..rest_dim {
            let weight: f64 = (0..mid_dim)
                .map(|mid| self.amplitudes[index_of(rest, mid)].norm_sqr())
                .sum();
            if weight > best {
                best = weight;
                reference = rest;
            }
        }

        let mut part: Vec<Complex64> = (0..mid_dim)
            .map(|mid| self.amplitudes[index_of(reference, mid)])
            .collect();
        let part_norm = part.iter().map(|a| a.norm_sqr()).sum::<f64>().sqrt();
        if part_norm * part_norm <= NORM_FLOOR {
            return Err(StateError::NotSeparable { start, length });
        }
        for amp in part.iter_mut() {
            *amp /= part_norm;
        }

        let rest: Vec<Complex64> = (0..rest_dim)
            .map(|r| {
                (0..mid_dim)
                    .map(|mid| part[mid].conj() * self.amplitudes[index_of(r, mid)])
                    .sum()
            })
            .collect();

        let mut residual = 0.0;
        for r in 0..rest_dim {
            for mid in 0..mid_dim {
                residual += (self.amplitudes[index_of(r, mid)] - rest[r] * part[mid]).norm_sqr();
            }
        }
        if residual > eps {
            return Err(StateError::NotSeparable { start, length });
        }

        self.amplitudes = rest;
        self.num_qubits -= length;
        self.normalize();
        let detached = DenseEngine {
            amplitudes: part,
            num_qubits: length,
            device_id: self.device_id,
        };
        Ok(Arc::new(Mutex::new(detached)))
    }

    fn dispose_fixed(&mut self, qubit: usize, value: bool) -> Result<()> {
        self.check_qubit(qubit)?;
        let low_mask = (1usize << qubit) - 1;
        let keep = if value { 1usize << qubit } else { 0 };
        let kept: Vec<Complex64> = (0..self.amplitudes.len() >> 1)
            .map(|short| {
                let full = ((short & !low_mask) << 1) | keep | (short & low_mask);
                self.amplitudes[full]
            })
            .collect();
        let norm_sqr: f64 = kept.iter().map(|a| a.norm_sqr()).sum();
        if norm_sqr <= NORM_FLOOR {
            return Err(StateError::ImpossibleOutcome {
                qubit,
                outcome: value,
            });
        }
        self.amplitudes = kept;
        self.num_qubits -= 1;
        self.normalize();
        Ok(())
    }

    fn norm(&self) -> f64 {
        self.amplitudes
            .iter()
            .map(|a| a.norm_sqr())
            .sum::<f64>()
            .sqrt()
    }

    fn normalize(&mut self) -> f64 {
        let norm = self.norm();
        if norm * norm <= NORM_FLOOR {
            return 0.0;
        }
        let inverse = 1.0 / norm;
        for amp in self.amplitudes.iter_mut() {
            *amp *= inverse;
        }
        norm
    }

    fn set_device(&mut self, device_id: usize) {
        self.device_id = device_id;
    }

    fn device_id(&self) -> usize {
        self.device_id
    }

    fn max_size(&self) -> u64 {
        device::lookup(self.device_id).max_size
    }

    fn clone_shared(&self) -> EnginePtr {
        Arc::new(Mutex::new(self.clone()))
    }
}

#[inline]
fn clamp_prob(p: f64) -> f64 {
    p.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    fn hadamard() -> Matrix2x2 {
        let h = std::f64::consts::FRAC_1_SQRT_2;
        [[c(h), c(h)], [c(h), c(-h)]]
    }

    #[test]
    fn test_new_basis_state() {
        let engine = DenseEngine::new(3, 0b101).unwrap();
        assert_eq!(engine.qubit_count(), 3);
        assert_relative_eq!(engine.get_amplitude(0b101).re, 1.0, epsilon = 1e-12);
        assert_relative_eq!(engine.prob_all(0b101), 1.0, epsilon = 1e-12);
        assert_relative_eq!(engine.prob_all(0b010), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_permutation_rejected() {
        assert!(DenseEngine::new(2, 4).is_err());
    }

    #[test]
    fn test_pauli_x_flips() {
        let mut engine = DenseEngine::new(1, 0).unwrap();
        let x: Matrix2x2 = [[c(0.0), c(1.0)], [c(1.0), c(0.0)]];
        engine.mtrx(&x, 0).unwrap();
        assert_relative_eq!(engine.prob_all(1), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_hadamard_splits_probability() {
        let mut engine = DenseEngine::new(2, 0).unwrap();
        engine.mtrx(&hadamard(), 1).unwrap();
        assert_relative_eq!(engine.prob(1).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(engine.prob(0).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cnot_entangles() {
        let mut engine = DenseEngine::new(2, 0).unwrap();
        engine.mtrx(&hadamard(), 0).unwrap();
        engine.mc_invert(&[0], c(1.0), c(1.0), 1).unwrap();
        assert_relative_eq!(engine.prob_all(0b00), 0.5, epsilon = 1e-12);
        assert_relative_eq!(engine.prob_all(0b11), 0.5, epsilon = 1e-12);
        assert_relative_eq!(engine.prob_all(0b01), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mc_phase_applies_sign() {
        let mut engine = DenseEngine::new(2, 0b11).unwrap();
        engine
            .mc_phase(&[0], c(1.0), c(-1.0), 1)
            .unwrap();
        assert_relative_eq!(engine.get_amplitude(0b11).re, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_force_m_collapses() {
        let mut engine = DenseEngine::new(1, 0).unwrap();
        engine.mtrx(&hadamard(), 0).unwrap();
        let outcome = engine.force_m(0, Some(true), true, 0.0).unwrap();
        assert!(outcome);
        assert_relative_eq!(engine.prob(0).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(engine.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_force_m_impossible_outcome() {
        let mut engine = DenseEngine::new(1, 0).unwrap();
        assert!(engine.force_m(0, Some(true), true, 0.0).is_err());
    }

    #[test]
    fn test_m_all_follows_draw() {
        let mut engine = DenseEngine::new(2, 0).unwrap();
        engine.mtrx(&hadamard(), 0).unwrap();
        engine.mc_invert(&[0], c(1.0), c(1.0), 1).unwrap();
        // draw past the |00⟩ mass lands on |11⟩
        let mut rig = || 0.75;
        let result = engine.m_all(&mut rig).unwrap();
        assert_eq!(result, 0b11);
        assert_relative_eq!(engine.prob_all(0b11), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_tensor_product() {
        let mut low = DenseEngine::new(1, 1).unwrap();
        let high = DenseEngine::new(2, 0b10).unwrap();
        let start = low.compose(&high);
        assert_eq!(start, 1);
        assert_eq!(low.qubit_count(), 3);
        assert_relative_eq!(low.prob_all(0b101), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_decompose_separable() {
        // |1⟩ ⊗ |+⟩ with the |+⟩ in the middle of a 3-qubit register
        let mut engine = DenseEngine::new(3, 0b001).unwrap();
        engine.mtrx(&hadamard(), 1).unwrap();
        let part = engine.decompose(1, 1, 1e-12).unwrap();
        assert_eq!(engine.qubit_count(), 2);
        let part = part.lock();
        assert_eq!(part.qubit_count(), 1);
        assert_relative_eq!(part.prob(0).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(engine.prob_all(0b01), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_decompose_rejects_entangled() {
        let mut engine = DenseEngine::new(2, 0).unwrap();
        engine.mtrx(&hadamard(), 0).unwrap();
        engine.mc_invert(&[0], c(1.0), c(1.0), 1).unwrap();
        let before = engine.amplitudes().to_vec();
        let err = engine.decompose(0, 1, 1e-12).unwrap_err();
        assert!(matches!(err, StateError::NotSeparable { .. }));
        assert_eq!(engine.amplitudes(), &before[..]);
    }

    #[test]
    fn test_dispose_fixed_drops_qubit() {
        let mut engine = DenseEngine::new(3, 0b101).unwrap();
        engine.dispose_fixed(1, false).unwrap();
        assert_eq!(engine.qubit_count(), 2);
        assert_relative_eq!(engine.prob_all(0b11), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_swap_exchanges_qubits() {
        let mut engine = DenseEngine::new(2, 0b01).unwrap();
        engine.swap(0, 1).unwrap();
        assert_relative_eq!(engine.prob_all(0b10), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_clone_shared_is_independent() {
        let engine = DenseEngine::new(1, 0).unwrap();
        let shared = engine.clone_shared();
        shared.lock().mtrx(&hadamard(), 0).unwrap();
        assert_relative_eq!(engine.prob_all(0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(shared.lock().prob(0).unwrap(), 0.5, epsilon = 1e-12);
    }
}
