//! Shard-keeping register
//!
//! One shard per qubit at construction; qubits stay in separate engines for
//! as long as the algebra allows. A multi-qubit gate entangles its operands
//! first — engines merge and the affected shards remap — and measurement
//! separates the collapsed qubit back out into its own engine. The engines
//! themselves are opaque [`StateEngine`] backends; this layer only forwards
//! through that interface.

use crate::error::{Result, UnitError};
use num_complex::Complex64;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use treeq_state::{DenseEngine, EnginePtr, Matrix2x2, StateEngine};

/// One qubit's residence: the backing engine and the qubit's index inside it
#[derive(Clone)]
pub struct Shard {
    pub unit: EnginePtr,
    pub mapped: usize,
}

/// Register that keeps qubits in separable engine shards
pub struct QubitUnit {
    shards: Vec<Shard>,
    qubit_count: usize,
    device_id: usize,
    separability_threshold: f64,
    rng: StdRng,
}

impl QubitUnit {
    /// Unit of `qubit_count` qubits in the basis state `perm`, one engine
    /// per qubit
    pub fn new(
        qubit_count: usize,
        perm: u64,
        device_id: usize,
        seed: Option<u64>,
    ) -> Result<Self> {
        if qubit_count == 0 || qubit_count > 63 {
            return Err(UnitError::InvalidConfiguration(format!(
                "qubit_count must be in 1..=63, got {qubit_count}"
            )));
        }
        if perm >> qubit_count != 0 {
            return Err(UnitError::InvalidPermutation { perm, qubit_count });
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let shards = (0..qubit_count)
            .map(|qubit| {
                let mut engine = DenseEngine::new(1, (perm >> qubit) & 1)?;
                engine.set_device(device_id);
                Ok(Shard {
                    unit: Arc::new(Mutex::new(engine)) as EnginePtr,
                    mapped: 0,
                })
            })
            .collect::<treeq_state::Result<Vec<_>>>()?;
        Ok(Self {
            shards,
            qubit_count,
            device_id,
            separability_threshold: 1e-12,
            rng,
        })
    }

    /// Adjust the tolerance used when splitting ranges back out
    pub fn set_separability_threshold(&mut self, threshold: f64) {
        self.separability_threshold = threshold;
    }

    /// Number of qubits in the unit
    pub fn qubit_count(&self) -> usize {
        self.qubit_count
    }

    /// The shard a qubit currently lives in
    pub fn shard(&self, qubit: usize) -> Result<&Shard> {
        self.shards
            .get(qubit)
            .ok_or(UnitError::InvalidQubitIndex {
                index: qubit,
                qubit_count: self.qubit_count,
            })
    }

    /// Distinct backing engines, in first-use order
    pub fn distinct_engines(&self) -> Vec<EnginePtr> {
        let mut engines: Vec<EnginePtr> = Vec::new();
        for shard in &self.shards {
            if !engines.iter().any(|seen| Arc::ptr_eq(seen, &shard.unit)) {
                engines.push(shard.unit.clone());
            }
        }
        engines
    }

    fn check_bits(&self, bits: &[usize]) -> Result<()> {
        for (position, &bit) in bits.iter().enumerate() {
            if bit >= self.qubit_count || bits[..position].contains(&bit) {
                return Err(UnitError::InvalidQubitIndex {
                    index: bit,
                    qubit_count: self.qubit_count,
                });
            }
        }
        Ok(())
    }

    /// Merge the engines of `bits` into one, remapping the affected shards
    ///
    /// Bits already co-resident return their engine unchanged.
    pub fn entangle_in_current_basis(&mut self, bits: &[usize]) -> Result<EnginePtr> {
        self.check_bits(bits)?;
        let Some(&first_bit) = bits.first() else {
            return Err(UnitError::InvalidQubitIndex {
                index: 0,
                qubit_count: self.qubit_count,
            });
        };
        let first = self.shards[first_bit].unit.clone();
        for &bit in &bits[1..] {
            let unit = self.shards[bit].unit.clone();
            if Arc::ptr_eq(&unit, &first) {
                continue;
            }
            let offset = {
                let guard = unit.lock();
                first.lock().compose(&*guard)
            };
            for shard in self.shards.iter_mut() {
                if Arc::ptr_eq(&shard.unit, &unit) {
                    shard.mapped += offset;
                    shard.unit = first.clone();
                }
            }
        }
        Ok(first)
    }

    /// Merge every qubit into a single engine
    pub fn entangle_all(&mut self) -> Result<EnginePtr> {
        let bits: Vec<usize> = (0..self.qubit_count).collect();
        self.entangle_in_current_basis(&bits)
    }

    /// Reorder an engine's qubits so register order equals engine order
    pub fn order_contiguous(&mut self, engine: &EnginePtr) -> Result<()> {
        let members: Vec<usize> = (0..self.qubit_count)
            .filter(|&qubit| Arc::ptr_eq(&self.shards[qubit].unit, engine))
            .collect();
        for (position, &qubit) in members.iter().enumerate() {
            let current = self.shards[qubit].mapped;
            if current == position {
                continue;
            }
            engine.lock().swap(current, position)?;
            if let Some(displaced) = (0..self.qubit_count).find(|&other| {
                other != qubit
                    && Arc::ptr_eq(&self.shards[other].unit, engine)
                    && self.shards[other].mapped == position
            }) {
                self.shards[displaced].mapped = current;
            }
            self.shards[qubit].mapped = position;
        }
        Ok(())
    }

    /// Apply a 2×2 unitary to `qubit`
    pub fn mtrx(&mut self, mtrx: &Matrix2x2, qubit: usize) -> Result<()> {
        let shard = self.shard(qubit)?.clone();
        shard.unit.lock().mtrx(mtrx, shard.mapped)?;
        Ok(())
    }

    /// Apply a multi-controlled 2×2 unitary, entangling operands first
    pub fn mc_mtrx(&mut self, controls: &[usize], mtrx: &Matrix2x2, target: usize) -> Result<()> {
        if controls.is_empty() {
            return self.mtrx(mtrx, target);
        }
        let mut bits = controls.to_vec();
        bits.push(target);
        let engine = self.entangle_in_current_basis(&bits)?;
        let mapped_controls: Vec<usize> = controls
            .iter()
            .map(|&control| self.shards[control].mapped)
            .collect();
        engine
            .lock()
            .mc_mtrx(&mapped_controls, mtrx, self.shards[target].mapped)?;
        Ok(())
    }

    /// Controlled diagonal gate
    pub fn mc_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        let mtrx: Matrix2x2 = [
            [top_left, Complex64::new(0.0, 0.0)],
            [Complex64::new(0.0, 0.0), bottom_right],
        ];
        self.mc_mtrx(controls, &mtrx, target)
    }

    /// Controlled anti-diagonal gate
    pub fn mc_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        let mtrx: Matrix2x2 = [
            [Complex64::new(0.0, 0.0), top_right],
            [bottom_left, Complex64::new(0.0, 0.0)],
        ];
        self.mc_mtrx(controls, &mtrx, target)
    }

    /// Marginal probability of measuring `qubit` as 1
    pub fn prob(&self, qubit: usize) -> Result<f64> {
        let shard = self.shard(qubit)?;
        Ok(shard.unit.lock().prob(shard.mapped)?)
    }

    /// Probability of the full basis permutation
    pub fn prob_all(&self, perm: u64) -> Result<f64> {
        if perm >> self.qubit_count != 0 {
            return Err(UnitError::InvalidPermutation {
                perm,
                qubit_count: self.qubit_count,
            });
        }
        let mut product = 1.0f64;
        for engine in self.distinct_engines() {
            let mut sub_perm = 0u64;
            for (qubit, shard) in self.shards.iter().enumerate() {
                if Arc::ptr_eq(&shard.unit, &engine) {
                    sub_perm |= ((perm >> qubit) & 1) << shard.mapped;
                }
            }
            product *= engine.lock().prob_all(sub_perm);
        }
        Ok(product)
    }

    /// Measure one qubit, separating it from its engine afterwards
    pub fn force_m(&mut self, qubit: usize, result: Option<bool>, do_apply: bool) -> Result<bool> {
        let shard = self.shard(qubit)?.clone();
        let draw = self.rng.gen::<f64>();
        let outcome = shard
            .unit
            .lock()
            .force_m(shard.mapped, result, do_apply, draw)?;
        if do_apply && shard.unit.lock().qubit_count() > 1 {
            self.separate_bit(outcome, qubit)?;
        }
        Ok(outcome)
    }

    /// Measure every qubit
    pub fn m_all(&mut self) -> Result<u64> {
        let mut result = 0u64;
        for qubit in 0..self.qubit_count {
            if self.force_m(qubit, None, true)? {
                result |= 1 << qubit;
            }
        }
        Ok(result)
    }

    /// Split a measured qubit out of its engine into a fresh basis-state
    /// engine
    pub fn separate_bit(&mut self, value: bool, qubit: usize) -> Result<()> {
        let shard = self.shard(qubit)?.clone();
        shard.unit.lock().dispose_fixed(shard.mapped, value)?;
        for other in self.shards.iter_mut() {
            if Arc::ptr_eq(&other.unit, &shard.unit) && other.mapped > shard.mapped {
                other.mapped -= 1;
            }
        }
        let mut fresh = DenseEngine::new(1, value as u64)?;
        fresh.set_device(self.device_id);
        self.shards[qubit] = Shard {
            unit: Arc::new(Mutex::new(fresh)),
            mapped: 0,
        };
        Ok(())
    }

    /// Detach the qubit range `[start, start+length)` into its own unit
    ///
    /// Fails with `NotSeparable` when the range is entangled with the rest
    /// of the register.
    pub fn detach(&mut self, start: usize, length: usize) -> Result<QubitUnit> {
        if length == 0 || start + length > self.qubit_count || length == self.qubit_count {
            return Err(UnitError::InvalidQubitIndex {
                index: start + length,
                qubit_count: self.qubit_count,
            });
        }
        let bits: Vec<usize> = (start..start + length).collect();
        let engine = self.entangle_in_current_basis(&bits)?;

        // move the range to engine positions [0, length)
        for (position, &qubit) in bits.iter().enumerate() {
            let current = self.shards[qubit].mapped;
            if current == position {
                continue;
            }
            engine.lock().swap(current, position)?;
            if let Some(displaced) = (0..self.qubit_count).find(|&other| {
                other != qubit
                    && Arc::ptr_eq(&self.shards[other].unit, &engine)
                    && self.shards[other].mapped == position
            }) {
                self.shards[displaced].mapped = current;
            }
            self.shards[qubit].mapped = position;
        }

        let engine_qubits = engine.lock().qubit_count();
        let part = if engine_qubits == length {
            engine.clone()
        } else {
            let part = engine
                .lock()
                .decompose(0, length, self.separability_threshold)?;
            for shard in self.shards.iter_mut() {
                if Arc::ptr_eq(&shard.unit, &engine) && shard.mapped >= length {
                    shard.mapped -= length;
                }
            }
            part
        };

        let dest_shards: Vec<Shard> = (0..length)
            .map(|position| Shard {
                unit: part.clone(),
                mapped: position,
            })
            .collect();
        self.shards.drain(start..start + length);
        self.qubit_count -= length;

        let seed = self.rng.gen::<u64>();
        Ok(QubitUnit {
            shards: dest_shards,
            qubit_count: length,
            device_id: self.device_id,
            separability_threshold: self.separability_threshold,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// The full amplitude vector, in register order
    pub fn get_quantum_state(&mut self) -> Result<Vec<Complex64>> {
        let engine = self.entangle_all()?;
        self.order_contiguous(&engine)?;
        let guard = engine.lock();
        Ok((0..guard.max_q_power())
            .map(|perm| guard.get_amplitude(perm))
            .collect())
    }

    /// All basis probabilities, in register order
    pub fn get_probs(&mut self) -> Result<Vec<f64>> {
        Ok(self
            .get_quantum_state()?
            .iter()
            .map(|amp| amp.norm_sqr())
            .collect())
    }
}

impl Clone for QubitUnit {
    /// Deep copy: every distinct engine is cloned once, shard groupings and
    /// mappings preserved
    fn clone(&self) -> Self {
        let mut copies: Vec<(EnginePtr, EnginePtr)> = Vec::new();
        let shards = self
            .shards
            .iter()
            .map(|shard| {
                let unit = match copies
                    .iter()
                    .find(|(original, _)| Arc::ptr_eq(original, &shard.unit))
                {
                    Some((_, copy)) => copy.clone(),
                    None => {
                        let copy = shard.unit.lock().clone_shared();
                        copies.push((shard.unit.clone(), copy.clone()));
                        copy
                    }
                };
                Shard {
                    unit,
                    mapped: shard.mapped,
                }
            })
            .collect();
        Self {
            shards,
            qubit_count: self.qubit_count,
            device_id: self.device_id,
            separability_threshold: self.separability_threshold,
            rng: self.rng.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    fn one() -> Complex64 {
        c(1.0)
    }

    fn hadamard() -> Matrix2x2 {
        let h = std::f64::consts::FRAC_1_SQRT_2;
        [[c(h), c(h)], [c(h), c(-h)]]
    }

    #[test]
    fn test_new_unit_is_fully_separated() {
        let unit = QubitUnit::new(4, 0b1010, 0, Some(1)).unwrap();
        assert_eq!(unit.distinct_engines().len(), 4);
        assert_relative_eq!(unit.prob(1).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(unit.prob(0).unwrap(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(unit.prob_all(0b1010).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_entangle_merges_shards() {
        let mut unit = QubitUnit::new(3, 0, 0, Some(2)).unwrap();
        unit.entangle_in_current_basis(&[0, 2]).unwrap();
        assert_eq!(unit.distinct_engines().len(), 2);
        // idempotent: already co-resident
        let before = unit.distinct_engines().len();
        unit.entangle_in_current_basis(&[0, 2]).unwrap();
        assert_eq!(unit.distinct_engines().len(), before);
    }

    #[test]
    fn test_bell_pair_on_unit() {
        let mut unit = QubitUnit::new(2, 0, 0, Some(3)).unwrap();
        unit.mtrx(&hadamard(), 0).unwrap();
        unit.mc_invert(&[0], one(), one(), 1).unwrap();
        assert_eq!(unit.distinct_engines().len(), 1);
        assert_relative_eq!(unit.prob_all(0b00).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(unit.prob_all(0b11).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(unit.prob_all(0b01).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_measurement_separates() {
        let mut unit = QubitUnit::new(2, 0, 0, Some(4)).unwrap();
        unit.mtrx(&hadamard(), 0).unwrap();
        unit.mc_invert(&[0], one(), one(), 1).unwrap();
        let outcome = unit.force_m(0, None, true).unwrap();
        // both qubits are definite and live in their own engines again
        assert_eq!(unit.distinct_engines().len(), 2);
        assert_relative_eq!(
            unit.prob(1).unwrap(),
            if outcome { 1.0 } else { 0.0 },
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_state_readout_in_register_order() {
        let x: Matrix2x2 = [[c(0.0), c(1.0)], [c(1.0), c(0.0)]];
        let mut unit = QubitUnit::new(3, 0, 0, Some(5)).unwrap();
        unit.mtrx(&x, 2).unwrap();
        // entangle in an order that scrambles the engine-internal layout
        unit.mc_invert(&[2], one(), one(), 0).unwrap();
        let state = unit.get_quantum_state().unwrap();
        assert_relative_eq!(state[0b101].norm(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_detach_separable_range() {
        let mut unit = QubitUnit::new(4, 0, 0, Some(6)).unwrap();
        unit.mtrx(&hadamard(), 2).unwrap();
        let part = unit.detach(2, 2).unwrap();
        assert_eq!(part.qubit_count(), 2);
        assert_eq!(unit.qubit_count(), 2);
        assert_relative_eq!(part.prob(0).unwrap(), 0.5, epsilon = 1e-9);
        assert_relative_eq!(part.prob(1).unwrap(), 0.0, epsilon = 1e-9);
        let total: f64 = unit.get_probs().unwrap().iter().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_detach_entangled_range_fails() {
        let mut unit = QubitUnit::new(3, 0, 0, Some(7)).unwrap();
        unit.mtrx(&hadamard(), 0).unwrap();
        unit.mc_invert(&[0], one(), one(), 2).unwrap();
        // qubit 2 is entangled with qubit 0 outside the range
        assert!(unit.detach(1, 2).is_err());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut unit = QubitUnit::new(2, 0, 0, Some(8)).unwrap();
        unit.mtrx(&hadamard(), 0).unwrap();
        let clone = unit.clone();
        unit.force_m(0, Some(true), true).unwrap();
        assert_relative_eq!(clone.prob(0).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(unit.prob(0).unwrap(), 1.0, epsilon = 1e-12);
    }
}
