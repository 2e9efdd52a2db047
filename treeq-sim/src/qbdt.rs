//! The simulated register: gates, measurement, and structural surgery on a
//! compressed decision tree
//!
//! Bit order: tree depth `d` consumes bit `d` of a basis permutation, and
//! attached qubits are the high-order bits `perm >> bdt_qubit_count`. Every
//! amplitude read and write in this module follows that convention.
//!
//! Gates mutate the tree through recursive unshare-on-write descent: each
//! vertex on the way to the target depth is branched, zero-scale subtrees are
//! skipped, and the two halves fan out over the worker pool near the root.
//! Pruning runs once at the end of each gate and restores the canonical
//! normalized gauge, in which the total state norm is just the squared root
//! scale.

use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::parallel::{for_qbdt, par_reduce_qbdt};
use ahash::AHashMap;
use num_complex::Complex64;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use treeq_state::{
    branch_node, ops, select_bit, BdtNode, DenseEngine, EnginePtr, Matrix2x2, NodeKind, NodePtr,
    StateEngine,
};

const ONE: Complex64 = Complex64::new(1.0, 0.0);
const ZERO: Complex64 = Complex64::new(0.0, 0.0);

/// Quantum register backed by a binary decision tree
///
/// The low `bdt_qubit_count` qubits live as tree depths; any remaining
/// qubits live inside dense engines at the tree's leaves. In flat mode
/// (`is_state_vec`) the whole register has been collapsed into a single
/// attached engine and every operation forwards to it.
pub struct Qbdt {
    root: NodePtr,
    bdt_qubit_count: usize,
    attached_qubit_count: usize,
    qubit_count: usize,
    is_state_vec: bool,
    config: SimConfig,
    rng: StdRng,
    par_depth: usize,
}

impl Qbdt {
    /// Register of `qubit_count` qubits in the basis state `init_state`
    pub fn new(qubit_count: usize, init_state: u64, config: SimConfig) -> Result<Self> {
        config.validate().map_err(SimError::InvalidConfiguration)?;
        if qubit_count == 0 || qubit_count > 63 {
            return Err(SimError::InvalidConfiguration(format!(
                "qubit_count must be in 1..=63, got {qubit_count}"
            )));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let threads = rayon::current_num_threads().max(1);
        let par_depth = (usize::BITS - threads.leading_zeros()) as usize;
        let mut register = Self {
            root: Arc::new(BdtNode::zero()),
            bdt_qubit_count: qubit_count,
            attached_qubit_count: 0,
            qubit_count,
            is_state_vec: false,
            config,
            rng,
            par_depth,
        };
        register.set_permutation(init_state, None)?;
        Ok(register)
    }

    /// Number of qubits in the register
    pub fn qubit_count(&self) -> usize {
        self.qubit_count
    }

    /// Number of qubits represented as tree depths
    pub fn bdt_qubit_count(&self) -> usize {
        self.bdt_qubit_count
    }

    /// Number of qubits held in attached leaf engines
    pub fn attached_qubit_count(&self) -> usize {
        self.attached_qubit_count
    }

    /// Whether the register is in flat (single attached engine) mode
    pub fn is_state_vector(&self) -> bool {
        self.is_state_vec
    }

    fn set_counts(&mut self, qubit_count: usize, attached: usize) {
        self.qubit_count = qubit_count;
        self.attached_qubit_count = attached;
        self.bdt_qubit_count = qubit_count - attached;
    }

    fn check_qubit(&self, index: usize) -> Result<()> {
        if index >= self.qubit_count {
            return Err(SimError::InvalidQubitIndex {
                index,
                qubit_count: self.qubit_count,
            });
        }
        Ok(())
    }

    fn check_perm(&self, perm: u64) -> Result<()> {
        if perm >> self.qubit_count != 0 {
            return Err(SimError::InvalidPermutation {
                perm,
                qubit_count: self.qubit_count,
            });
        }
        Ok(())
    }

    fn check_controls(&self, controls: &[usize], target: usize) -> Result<()> {
        self.check_qubit(target)?;
        for (position, &control) in controls.iter().enumerate() {
            self.check_qubit(control)?;
            if control == target || controls[..position].contains(&control) {
                return Err(SimError::InvalidQubitIndex {
                    index: control,
                    qubit_count: self.qubit_count,
                });
            }
        }
        Ok(())
    }

    fn phase_factor(&mut self) -> Complex64 {
        if self.config.random_global_phase {
            let angle = self.rng.gen::<f64>() * std::f64::consts::TAU;
            Complex64::from_polar(1.0, angle)
        } else {
            ONE
        }
    }

    fn make_engine(&self, qubit_count: usize, perm: u64) -> Result<EnginePtr> {
        let mut engine = DenseEngine::new(qubit_count, perm)?;
        engine.set_device(self.config.device_id);
        Ok(Arc::new(Mutex::new(engine)))
    }

    /// Flat-mode engine, unshared for writing
    fn flat_engine(&mut self) -> EnginePtr {
        let vertex = branch_node(&mut self.root);
        match &vertex.kind {
            NodeKind::Attached(engine) => engine.clone(),
            _ => unreachable!("flat register without an attached root"),
        }
    }

    /// Reset to the pure basis state `init_state`
    ///
    /// The optional `phase` overrides the global phase; otherwise it is 1, or
    /// random when the register is configured for random global phase.
    pub fn set_permutation(&mut self, init_state: u64, phase: Option<Complex64>) -> Result<()> {
        self.check_perm(init_state)?;
        if self.is_state_vec {
            self.set_counts(self.qubit_count, 0);
            self.is_state_vec = false;
        }
        let phase = phase.unwrap_or_else(|| self.phase_factor());

        if self.bdt_qubit_count == 0 {
            let engine = self.make_engine(self.attached_qubit_count, init_state)?;
            self.root = Arc::new(BdtNode::attached(phase, engine));
            return Ok(());
        }

        let mut child: NodePtr = if self.attached_qubit_count > 0 {
            let engine = self.make_engine(
                self.attached_qubit_count,
                init_state >> self.bdt_qubit_count,
            )?;
            Arc::new(BdtNode::attached(ONE, engine))
        } else {
            Arc::new(BdtNode::leaf(ONE))
        };
        for depth in (0..self.bdt_qubit_count).rev() {
            let bit = select_bit(init_state, depth);
            let mut branches = [Arc::new(BdtNode::zero()), Arc::new(BdtNode::zero())];
            branches[bit] = child;
            child = Arc::new(BdtNode::interior(ONE, branches));
        }
        let mut root = child;
        Arc::make_mut(&mut root).scale = phase;
        self.root = root;
        Ok(())
    }

    /// Product of scales along the tree path of `perm`, and the final vertex
    fn traverse_path(&self, perm: u64) -> (Complex64, NodePtr) {
        let eps = self.config.amplitude_floor;
        let mut node = self.root.clone();
        let mut scale = node.scale;
        for depth in 0..self.bdt_qubit_count {
            if scale.norm_sqr() <= eps {
                break;
            }
            let Some(branches) = node.branches() else {
                break;
            };
            let next = branches[select_bit(perm, depth)].clone();
            scale *= next.scale;
            node = next;
        }
        (scale, node)
    }

    /// Amplitude of the basis permutation `perm`
    pub fn get_amplitude(&self, perm: u64) -> Result<Complex64> {
        self.check_perm(perm)?;
        let (mut scale, leaf) = self.traverse_path(perm);
        if scale.norm_sqr() > self.config.amplitude_floor && self.attached_qubit_count > 0 {
            if let NodeKind::Attached(engine) = &leaf.kind {
                scale *= engine.lock().get_amplitude(perm >> self.bdt_qubit_count);
            }
        }
        Ok(scale)
    }

    /// Probability of the full basis permutation `perm`
    pub fn prob_all(&self, perm: u64) -> Result<f64> {
        Ok(clamp_prob(self.get_amplitude(perm)?.norm_sqr()))
    }

    /// The full amplitude vector, in permutation order
    pub fn get_quantum_state(&self) -> Vec<Complex64> {
        let eps = self.config.amplitude_floor;
        let mut out = vec![ZERO; 1usize << self.qubit_count];
        for path in 0..1u64 << self.bdt_qubit_count {
            let (scale, leaf) = self.traverse_path(path);
            if scale.norm_sqr() <= eps {
                continue;
            }
            match &leaf.kind {
                NodeKind::Attached(engine) => {
                    let guard = engine.lock();
                    for ket in 0..1u64 << self.attached_qubit_count {
                        out[(path | (ket << self.bdt_qubit_count)) as usize] =
                            scale * guard.get_amplitude(ket);
                    }
                }
                _ => out[path as usize] = scale,
            }
        }
        out
    }

    /// All basis probabilities, in permutation order
    pub fn get_probs(&self) -> Vec<f64> {
        self.get_quantum_state()
            .iter()
            .map(|amp| amp.norm_sqr())
            .collect()
    }

    /// Overwrite the state with the given amplitude vector
    pub fn set_quantum_state(&mut self, state: &[Complex64]) -> Result<()> {
        if state.len() != 1usize << self.qubit_count {
            return Err(treeq_state::StateError::InvalidDimension {
                dimension: state.len(),
            }
            .into());
        }
        if self.is_state_vec {
            self.set_counts(self.qubit_count, 0);
            self.is_state_vec = false;
        }
        let eps = self.config.amplitude_floor;
        self.root = self.build_tree(state, self.bdt_qubit_count, 0, 1)?;
        ops::pop_state_vector(&mut self.root, self.bdt_qubit_count, eps);
        ops::prune(&mut self.root, self.bdt_qubit_count, eps);
        if self.config.do_normalize {
            let norm_sqr = self.root.scale.norm_sqr();
            if norm_sqr > eps {
                Arc::make_mut(&mut self.root).scale /= norm_sqr.sqrt();
            }
        }
        Ok(())
    }

    fn build_tree(
        &self,
        state: &[Complex64],
        depth_left: usize,
        base: u64,
        stride: u64,
    ) -> Result<NodePtr> {
        if depth_left > 0 {
            let b0 = self.build_tree(state, depth_left - 1, base, stride * 2)?;
            let b1 = self.build_tree(state, depth_left - 1, base + stride, stride * 2)?;
            return Ok(Arc::new(BdtNode::interior(ONE, [b0, b1])));
        }
        if self.attached_qubit_count == 0 {
            return Ok(Arc::new(BdtNode::leaf(state[base as usize])));
        }
        let amps: Vec<Complex64> = (0..1u64 << self.attached_qubit_count)
            .map(|ket| state[(base + ket * stride) as usize])
            .collect();
        let norm_sqr: f64 = amps.iter().map(|a| a.norm_sqr()).sum();
        if norm_sqr <= self.config.amplitude_floor {
            return Ok(Arc::new(BdtNode::zero()));
        }
        let norm = norm_sqr.sqrt();
        let normalized: Vec<Complex64> = amps.iter().map(|a| a / norm).collect();
        let mut engine = DenseEngine::from_amplitudes(self.attached_qubit_count, &normalized)?;
        engine.set_device(self.config.device_id);
        Ok(Arc::new(BdtNode::attached(
            Complex64::new(norm, 0.0),
            Arc::new(Mutex::new(engine)),
        )))
    }

    /// Marginal probability of measuring `qubit` as 1
    pub fn prob(&self, qubit: usize) -> Result<f64> {
        self.check_qubit(qubit)?;
        if self.is_state_vec {
            if let NodeKind::Attached(engine) = &self.root.kind {
                return Ok(engine.lock().prob(qubit)?);
            }
        }
        let eps = self.config.amplitude_floor;
        if qubit < self.bdt_qubit_count {
            let max_qubit = qubit;
            let root = self.root.clone();
            let one_chance = par_reduce_qbdt(0, 1u64 << max_qubit, 0.0f64, |path| {
                let mut node = root.clone();
                let mut scale = node.scale;
                for depth in 0..max_qubit {
                    if scale.norm_sqr() <= eps {
                        return (0.0, block_skip(path, max_qubit - depth));
                    }
                    let Some(branches) = node.branches() else {
                        return (0.0, 0);
                    };
                    let next = branches[select_bit_be(path, max_qubit, depth)].clone();
                    scale *= next.scale;
                    node = next;
                }
                if scale.norm_sqr() <= eps {
                    return (0.0, 0);
                }
                let Some(branches) = node.branches() else {
                    return (0.0, 0);
                };
                ((scale * branches[1].scale).norm_sqr(), 0)
            });
            return Ok(clamp_prob(one_chance));
        }

        // attached qubit: one probability per distinct leaf engine, cached,
        // summed incoherently — exact, because distinct tree paths are
        // orthonormal basis states of the tree qubits
        let engine_qubit = qubit - self.bdt_qubit_count;
        let max_qubit = self.bdt_qubit_count;
        let mut cache: AHashMap<usize, f64> = AHashMap::new();
        let mut one_chance = 0.0f64;
        let mut failure = None;
        for_qbdt(0, 1u64 << max_qubit, |path| {
            let mut node = self.root.clone();
            let mut scale = node.scale;
            for depth in 0..max_qubit {
                if scale.norm_sqr() <= eps {
                    return block_skip(path, max_qubit - depth);
                }
                let Some(branches) = node.branches() else {
                    return 0;
                };
                let next = branches[select_bit_be(path, max_qubit, depth)].clone();
                scale *= next.scale;
                node = next;
            }
            if scale.norm_sqr() <= eps {
                return 0;
            }
            if let NodeKind::Attached(engine) = &node.kind {
                let key = Arc::as_ptr(engine).cast::<()>() as usize;
                let prob = match cache.get(&key).copied() {
                    Some(hit) => hit,
                    None => match engine.lock().prob(engine_qubit) {
                        Ok(computed) => {
                            cache.insert(key, computed);
                            computed
                        }
                        Err(error) => {
                            failure = Some(error);
                            // abandon the rest of the enumeration
                            return (1u64 << max_qubit) - path - 1;
                        }
                    },
                };
                one_chance += scale.norm_sqr() * prob;
            }
            0
        });
        if let Some(error) = failure {
            return Err(error.into());
        }
        Ok(clamp_prob(one_chance))
    }

    /// Measure one qubit
    ///
    /// `result` forces the outcome; otherwise it is sampled. With `do_apply`
    /// the state collapses: tree paths zero the rejected child and
    /// unit-normalize the selected one, attached qubits forward into their
    /// leaf engines with the leaf weight adjusted by the engine's own
    /// outcome probability.
    pub fn force_m(&mut self, qubit: usize, result: Option<bool>, do_apply: bool) -> Result<bool> {
        self.check_qubit(qubit)?;
        if self.is_state_vec {
            let engine = self.flat_engine();
            let draw = self.rng.gen::<f64>();
            return Ok(engine.lock().force_m(qubit, result, do_apply, draw)?);
        }
        if let Some(forced) = result {
            if !do_apply {
                return Ok(forced);
            }
            // forcing requires a post-selection renormalization the tree
            // collapse does not express; run it through flat mode
            self.set_state_vector()?;
            let engine = self.flat_engine();
            let draw = self.rng.gen::<f64>();
            return Ok(engine.lock().force_m(qubit, Some(forced), true, draw)?);
        }

        let one_chance = self.prob(qubit)?;
        let outcome = if one_chance >= 1.0 {
            true
        } else if one_chance <= 0.0 {
            false
        } else {
            self.rng.gen::<f64>() <= one_chance
        };
        if !do_apply {
            return Ok(outcome);
        }

        let eps = self.config.amplitude_floor;
        let is_ket = qubit >= self.bdt_qubit_count;
        let max_qubit = if is_ket { self.bdt_qubit_count } else { qubit };
        let phase = self.phase_factor();
        Arc::make_mut(&mut self.root).scale = phase;
        let ket_qubit = if is_ket {
            Some(qubit - self.bdt_qubit_count)
        } else {
            None
        };
        collapse(&mut self.root, max_qubit, outcome, ket_qubit, eps)?;
        ops::prune(&mut self.root, max_qubit + 1, eps);
        self.renormalize_root()?;
        Ok(outcome)
    }

    /// Measure every qubit and reset to the sampled basis state
    pub fn m_all(&mut self) -> Result<u64> {
        if self.is_state_vec {
            let engine = self.flat_engine();
            let result = {
                let mut guard = engine.lock();
                let rng = &mut self.rng;
                let mut draw = || rng.gen::<f64>();
                guard.m_all(&mut draw)?
            };
            self.set_counts(self.qubit_count, 0);
            self.is_state_vec = false;
            self.set_permutation(result, None)?;
            return Ok(result);
        }

        let eps = self.config.amplitude_floor;
        let mut node = self.root.clone();
        let mut result = 0u64;
        for depth in 0..self.bdt_qubit_count {
            let Some(branches) = node.branches() else {
                break;
            };
            let one_chance = clamp_prob(branches[1].scale.norm_sqr());
            let bit = if one_chance >= 1.0 {
                true
            } else if one_chance <= 0.0 {
                false
            } else {
                self.rng.gen::<f64>() <= one_chance
            };
            let next = branches[bit as usize].clone();
            if next.is_zero(eps) {
                break;
            }
            if bit {
                result |= 1 << depth;
            }
            node = next;
        }
        if self.attached_qubit_count > 0 {
            if let NodeKind::Attached(engine) = &node.kind {
                let guard = engine.lock();
                let draw = self.rng.gen::<f64>();
                let mut cumulative = 0.0;
                let mut chosen = guard.max_q_power() - 1;
                for ket in 0..guard.max_q_power() {
                    cumulative += guard.get_amplitude(ket).norm_sqr();
                    if draw < cumulative {
                        chosen = ket;
                        break;
                    }
                }
                result |= chosen << self.bdt_qubit_count;
            }
        }
        self.set_permutation(result, None)?;
        Ok(result)
    }

    /// Apply a 2×2 unitary to `target`
    pub fn mtrx(&mut self, mtrx: &Matrix2x2, target: usize) -> Result<()> {
        self.check_qubit(target)?;
        if self.is_state_vec {
            let engine = self.flat_engine();
            engine.lock().mtrx(mtrx, target)?;
            return Ok(());
        }
        self.gate_on_tree(mtrx, &[], target)
    }

    /// Apply a multi-controlled 2×2 unitary, dispatched by matrix shape
    pub fn mc_mtrx(&mut self, controls: &[usize], mtrx: &Matrix2x2, target: usize) -> Result<()> {
        if controls.is_empty() {
            return self.mtrx(mtrx, target);
        }
        let eps = self.config.amplitude_floor;
        if mtrx[0][1].norm_sqr() <= eps && mtrx[1][0].norm_sqr() <= eps {
            return self.mc_phase(controls, mtrx[0][0], mtrx[1][1], target);
        }
        if mtrx[0][0].norm_sqr() <= eps && mtrx[1][1].norm_sqr() <= eps {
            return self.mc_invert(controls, mtrx[0][1], mtrx[1][0], target);
        }
        self.apply_controlled_single(mtrx, controls, target)
    }

    /// Controlled diagonal gate `diag(top_left, bottom_right)`
    ///
    /// With a unit top-left entry only the all-ones subspace picks up phase,
    /// so the gate retargets onto the deepest participating qubit and no
    /// swap optimization is ever needed.
    pub fn mc_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        let mtrx: Matrix2x2 = [[top_left, ZERO], [ZERO, bottom_right]];
        if controls.is_empty() {
            return self.mtrx(&mtrx, target);
        }
        let eps = self.config.amplitude_floor;
        if (top_left - ONE).norm_sqr() <= eps {
            if (bottom_right - ONE).norm_sqr() <= eps {
                return Ok(());
            }
            self.check_controls(controls, target)?;
            let mut bits: Vec<usize> = controls.to_vec();
            bits.push(target);
            bits.sort_unstable();
            let deepest = bits.pop().expect("at least the target is present");
            let mtrx: Matrix2x2 = [[ONE, ZERO], [ZERO, bottom_right]];
            return self.apply_controlled_single(&mtrx, &bits, deepest);
        }
        self.apply_controlled_single(&mtrx, controls, target)
    }

    /// Controlled anti-diagonal gate `[[0, top_right], [bottom_left, 0]]`
    pub fn mc_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        let mtrx: Matrix2x2 = [[ZERO, top_right], [bottom_left, ZERO]];
        if controls.is_empty() {
            return self.mtrx(&mtrx, target);
        }
        self.apply_controlled_single(&mtrx, controls, target)
    }

    fn apply_controlled_single(
        &mut self,
        mtrx: &Matrix2x2,
        controls: &[usize],
        target: usize,
    ) -> Result<()> {
        self.check_controls(controls, target)?;
        if self.is_state_vec {
            let engine = self.flat_engine();
            engine.lock().mc_mtrx(controls, mtrx, target)?;
            return Ok(());
        }

        let mut controls: Vec<usize> = controls.to_vec();
        controls.sort_unstable();
        let deepest = *controls.last().expect("dispatch guarantees controls");

        // keep the target at the deepest participating level so the descent
        // bounds the traversal; undone below
        let swapped = target < deepest && target < self.bdt_qubit_count;
        let (swap_a, swap_b) = (target, deepest);
        let mut target = target;
        if swapped {
            self.swap(swap_a, swap_b)?;
            *controls.last_mut().expect("non-empty") = target;
            controls.sort_unstable();
            target = deepest;
        }

        let outcome = self.gate_on_tree(mtrx, &controls, target);

        if swapped {
            self.swap(swap_a, swap_b)?;
        }
        outcome
    }

    /// Shared descent for plain and controlled gates
    fn gate_on_tree(&mut self, mtrx: &Matrix2x2, controls: &[usize], target: usize) -> Result<()> {
        let eps = self.config.amplitude_floor;
        let is_ket = target >= self.bdt_qubit_count;
        let max_qubit = if is_ket { self.bdt_qubit_count } else { target };

        let mut control_mask = 0u64;
        let mut ket_controls = Vec::new();
        for &control in controls {
            if control < self.bdt_qubit_count {
                control_mask |= 1u64 << control;
            } else {
                ket_controls.push(control - self.bdt_qubit_count);
            }
        }
        ket_controls.sort_unstable();

        let ctx = GateContext {
            mtrx,
            target,
            bdt_qubit_count: self.bdt_qubit_count,
            is_ket,
            ket_controls: &ket_controls,
            control_mask,
            eps,
        };
        gate_descent(&mut self.root, max_qubit, max_qubit, self.par_depth, &ctx)?;
        ops::prune(&mut self.root, max_qubit + 1, eps);
        self.settle_norm()
    }

    /// Exchange two qubits
    pub fn swap(&mut self, qubit1: usize, qubit2: usize) -> Result<()> {
        self.check_qubit(qubit1)?;
        self.check_qubit(qubit2)?;
        if qubit1 == qubit2 {
            return Ok(());
        }
        if self.is_state_vec {
            let engine = self.flat_engine();
            engine.lock().swap(qubit1, qubit2)?;
            return Ok(());
        }
        let eps = self.config.amplitude_floor;
        let (low, high) = (qubit1.min(qubit2), qubit1.max(qubit2));
        if low >= self.bdt_qubit_count {
            // both attached: engine-level exchange
            let engines = self.collect_attached();
            for engine in engines {
                engine
                    .lock()
                    .swap(low - self.bdt_qubit_count, high - self.bdt_qubit_count)?;
            }
        } else {
            for position in low..high {
                self.adjacent_swap(position)?;
            }
            if high - low > 1 {
                for position in (low..high - 1).rev() {
                    self.adjacent_swap(position)?;
                }
            }
        }
        ops::prune(&mut self.root, self.bdt_qubit_count, eps);
        Ok(())
    }

    fn adjacent_swap(&mut self, position: usize) -> Result<()> {
        let eps = self.config.amplitude_floor;
        if position + 1 < self.bdt_qubit_count {
            ops::transpose_at_depth(&mut self.root, position, eps);
            return Ok(());
        }
        if position >= self.bdt_qubit_count {
            let low = position - self.bdt_qubit_count;
            let engines = self.collect_attached();
            for engine in engines {
                engine.lock().swap(low, low + 1)?;
            }
            return Ok(());
        }
        self.boundary_swap()
    }

    /// Exchange the deepest tree qubit with the first attached qubit
    fn boundary_swap(&mut self) -> Result<()> {
        let depth = self.bdt_qubit_count - 1;
        let attached = self.attached_qubit_count;
        let eps = self.config.amplitude_floor;
        let device = self.config.device_id;
        boundary_swap_rec(&mut self.root, depth, attached, eps, device)
    }

    /// Branch every nonzero attached leaf and return the distinct engines
    fn collect_attached(&mut self) -> Vec<EnginePtr> {
        let mut engines = Vec::new();
        collect_attached_rec(
            &mut self.root,
            self.bdt_qubit_count,
            self.config.amplitude_floor,
            &mut engines,
        );
        engines
    }

    /// Rotate the qubits in `[start, start+length)` up by `shift` positions
    pub fn rol(&mut self, shift: usize, start: usize, length: usize) -> Result<()> {
        if length < 2 {
            return Ok(());
        }
        let shift = shift % length;
        if shift == 0 {
            return Ok(());
        }
        // content moves p -> p + shift (mod length): rotate the position
        // array right by `shift` via three reversals
        self.reverse_positions(start, start + length - 1)?;
        self.reverse_positions(start, start + shift - 1)?;
        self.reverse_positions(start + shift, start + length - 1)?;
        Ok(())
    }

    /// Rotate the qubits in `[start, start+length)` down by `shift` positions
    pub fn ror(&mut self, shift: usize, start: usize, length: usize) -> Result<()> {
        if length < 2 {
            return Ok(());
        }
        self.rol(length - (shift % length), start, length)
    }

    fn reverse_positions(&mut self, low: usize, high: usize) -> Result<()> {
        let count = (high + 1 - low) / 2;
        for offset in 0..count {
            self.swap(low + offset, high - offset)?;
        }
        Ok(())
    }

    /// Concatenate `other` into this register at position `start`
    ///
    /// When attached regions are involved the splice boundary is rotated to a
    /// representable position first and rotated back afterwards.
    pub fn compose(&mut self, other: &Qbdt, start: usize) -> Result<usize> {
        if start > self.qubit_count {
            return Err(SimError::InvalidQubitIndex {
                index: start,
                qubit_count: self.qubit_count,
            });
        }
        if self.is_state_vec {
            self.reset_state_vector()?;
        }
        let eps = self.config.amplitude_floor;

        if self.attached_qubit_count > 0 && other.attached_qubit_count > 0 {
            let mid = self.bdt_qubit_count;
            if start < mid {
                self.rol(mid - start, 0, self.qubit_count)?;
                self.compose(other, mid)?;
                self.ror(mid - start, 0, self.qubit_count)?;
                return Ok(start);
            }
            if mid < start {
                self.ror(start - mid, 0, self.qubit_count)?;
                self.compose(other, mid)?;
                self.rol(start - mid, 0, self.qubit_count)?;
                return Ok(start);
            }
        } else if self.attached_qubit_count > 0 && other.attached_qubit_count == 0 && start > 0 {
            self.ror(start, 0, self.qubit_count)?;
            self.compose(other, 0)?;
            self.rol(start, 0, self.qubit_count)?;
            return Ok(start);
        } else if self.attached_qubit_count == 0
            && other.attached_qubit_count > 0
            && start < self.qubit_count
        {
            let end = self.qubit_count;
            self.rol(end - start, 0, self.qubit_count)?;
            self.compose(other, end)?;
            self.ror(end - start, 0, self.qubit_count)?;
            return Ok(start);
        }

        ops::insert_at_depth(
            &mut self.root,
            &other.root,
            start,
            other.bdt_qubit_count,
            eps,
        );
        self.set_counts(
            self.qubit_count + other.qubit_count,
            self.attached_qubit_count + other.attached_qubit_count,
        );
        ops::prune(&mut self.root, self.bdt_qubit_count, eps);
        Ok(start)
    }

    /// Splice a dense engine below the tree as new attached qubits
    ///
    /// Returns the index at which the new qubits start.
    pub fn attach(&mut self, engine: EnginePtr) -> Result<usize> {
        let start = self.qubit_count;
        let added = engine.lock().qubit_count();
        if added == 0 {
            return Ok(start);
        }
        if self.is_state_vec {
            self.reset_state_vector()?;
        }
        let eps = self.config.amplitude_floor;

        if self.attached_qubit_count > 0 {
            let guest = engine.lock().clone_shared();
            let hosts = self.collect_attached();
            for host in hosts {
                let guard = guest.lock();
                host.lock().compose(&*guard);
            }
        } else {
            let shared = engine.lock().clone_shared();
            attach_at_leaves(&mut self.root, self.bdt_qubit_count - 1, &shared, eps);
        }
        self.set_counts(self.qubit_count + added, self.attached_qubit_count + added);
        Ok(start)
    }

    /// Detach the separable qubit range `[start, start+length)`
    pub fn decompose(&mut self, start: usize, length: usize) -> Result<Qbdt> {
        if length == 0 || start + length > self.qubit_count {
            return Err(SimError::InvalidQubitIndex {
                index: start + length,
                qubit_count: self.qubit_count,
            });
        }
        if length == self.qubit_count {
            return Err(SimError::Unsupported(
                "decomposing the entire register".to_string(),
            ));
        }
        if self.is_state_vec {
            self.reset_state_vector()?;
        }
        let eps = self.config.amplitude_floor;
        let separability = self.config.separability_threshold;

        if self.bdt_qubit_count == 0 {
            // attached-only register: split the single engine
            let engine = self.flat_engine();
            let part = engine.lock().decompose(start, length, separability)?;
            let dest = self.make_peer(part, length, length)?;
            self.set_counts(self.qubit_count - length, self.attached_qubit_count - length);
            return Ok(dest);
        }

        if self.attached_qubit_count > 0 && start > 0 {
            // rotate the range down to position 0 so it is tree-representable
            self.ror(start, 0, self.qubit_count)?;
            let dest = self.decompose(0, length);
            self.rol(start, 0, self.qubit_count)?;
            return dest;
        }

        if length > self.bdt_qubit_count {
            return Err(SimError::Unsupported(format!(
                "decomposing {length} qubits across the attached boundary of a {}-level tree",
                self.bdt_qubit_count
            )));
        }

        let block =
            ops::remove_separable_at_depth(&mut self.root, start, length, separability)?;
        self.set_counts(self.qubit_count - length, self.attached_qubit_count);
        ops::prune(&mut self.root, self.bdt_qubit_count, eps);
        if self.config.do_normalize {
            let norm_sqr = self.root.scale.norm_sqr();
            if norm_sqr > eps {
                Arc::make_mut(&mut self.root).scale /= norm_sqr.sqrt();
            }
        }

        let mut dest_root = block;
        ops::prune(&mut dest_root, length, eps);
        let dest_norm = dest_root.scale.norm_sqr();
        if dest_norm > eps {
            Arc::make_mut(&mut dest_root).scale /= dest_norm.sqrt();
        }
        let mut dest = self.peer_shell(length, 0)?;
        dest.root = dest_root;
        Ok(dest)
    }

    fn peer_shell(&mut self, qubit_count: usize, attached: usize) -> Result<Qbdt> {
        let seed = self.rng.gen::<u64>();
        Ok(Qbdt {
            root: Arc::new(BdtNode::zero()),
            bdt_qubit_count: qubit_count - attached,
            attached_qubit_count: attached,
            qubit_count,
            is_state_vec: false,
            config: self.config.clone(),
            rng: StdRng::seed_from_u64(seed),
            par_depth: self.par_depth,
        })
    }

    fn make_peer(&mut self, engine: EnginePtr, qubit_count: usize, attached: usize) -> Result<Qbdt> {
        let mut peer = self.peer_shell(qubit_count, attached)?;
        peer.root = Arc::new(BdtNode::attached(ONE, engine));
        Ok(peer)
    }

    /// Fidelity-style distance `1 − |⟨self|other⟩|²`, clamped to `[0, 1]`
    pub fn sum_sqr_diff(&mut self, other: &mut Qbdt) -> Result<f64> {
        if self.qubit_count != other.qubit_count {
            return Ok(1.0);
        }
        self.reset_state_vector()?;
        other.reset_state_vector()?;
        // the paired walk needs both registers in pure tree form; a flatten
        // and rebuild absorbs any attached leaves into tree depths
        if self.attached_qubit_count > 0 {
            self.set_state_vector()?;
            self.reset_state_vector()?;
        }
        if other.attached_qubit_count > 0 {
            other.set_state_vector()?;
            other.reset_state_vector()?;
        }

        let eps = self.config.amplitude_floor;
        let depth = self.qubit_count;
        let own_root = self.root.clone();
        let other_root = other.root.clone();
        let projection = par_reduce_qbdt(0, 1u64 << depth, ZERO, |path| {
            let walk = |root: &NodePtr| -> (Complex64, usize) {
                let mut node = root.clone();
                let mut scale = node.scale;
                for level in 0..depth {
                    if scale.norm_sqr() <= eps {
                        return (ZERO, level);
                    }
                    let Some(branches) = node.branches() else {
                        return (ZERO, level);
                    };
                    let next = branches[select_bit_be(path, depth, level)].clone();
                    scale *= next.scale;
                    node = next;
                }
                (scale, depth)
            };
            let (own_scale, own_depth) = walk(&own_root);
            let (other_scale, other_depth) = walk(&other_root);
            let died = own_depth.min(other_depth);
            if died < depth {
                return (ZERO, block_skip(path, depth - died));
            }
            (other_scale.conj() * own_scale, 0)
        });
        Ok(1.0 - clamp_prob(projection.norm_sqr()))
    }

    /// Collapse the tree into a single attached engine holding the full
    /// dense state (flat mode)
    pub fn set_state_vector(&mut self) -> Result<()> {
        if self.is_state_vec {
            return Ok(());
        }
        let amplitudes = self.get_quantum_state();
        let mut engine = DenseEngine::from_amplitudes(self.qubit_count, &amplitudes)?;
        engine.set_device(self.config.device_id);
        self.root = Arc::new(BdtNode::attached(ONE, Arc::new(Mutex::new(engine))));
        self.attached_qubit_count = self.qubit_count;
        self.bdt_qubit_count = 0;
        self.is_state_vec = true;
        Ok(())
    }

    /// Rebuild the tree from flat mode
    pub fn reset_state_vector(&mut self) -> Result<()> {
        if !self.is_state_vec {
            return Ok(());
        }
        let amplitudes = self.get_quantum_state();
        self.is_state_vec = false;
        self.set_counts(self.qubit_count, 0);
        self.set_quantum_state(&amplitudes)
    }

    fn renormalize_root(&mut self) -> Result<()> {
        let norm_sqr = self.root.scale.norm_sqr();
        if norm_sqr <= self.config.amplitude_floor {
            return Err(SimError::NumericalDrift { norm: 0.0 });
        }
        Arc::make_mut(&mut self.root).scale /= norm_sqr.sqrt();
        Ok(())
    }

    fn settle_norm(&mut self) -> Result<()> {
        let norm_sqr = self.root.scale.norm_sqr();
        if (norm_sqr - 1.0).abs() <= self.config.norm_tolerance {
            return Ok(());
        }
        if self.config.do_normalize {
            if norm_sqr <= self.config.amplitude_floor {
                return Err(SimError::NumericalDrift { norm: 0.0 });
            }
            Arc::make_mut(&mut self.root).scale /= norm_sqr.sqrt();
            Ok(())
        } else {
            Err(SimError::NumericalDrift {
                norm: norm_sqr.sqrt(),
            })
        }
    }
}

impl Clone for Qbdt {
    /// Shallow copy: subtrees and leaf engines stay shared until either side
    /// writes (unshare-on-write covers engines too)
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            bdt_qubit_count: self.bdt_qubit_count,
            attached_qubit_count: self.attached_qubit_count,
            qubit_count: self.qubit_count,
            is_state_vec: self.is_state_vec,
            config: self.config.clone(),
            rng: self.rng.clone(),
            par_depth: self.par_depth,
        }
    }
}

struct GateContext<'a> {
    mtrx: &'a Matrix2x2,
    target: usize,
    bdt_qubit_count: usize,
    is_ket: bool,
    ket_controls: &'a [usize],
    control_mask: u64,
    eps: f64,
}

fn gate_descent(
    node: &mut NodePtr,
    depth_left: usize,
    max_qubit: usize,
    par: usize,
    ctx: &GateContext<'_>,
) -> Result<()> {
    if node.is_zero(ctx.eps) {
        return Ok(());
    }
    if depth_left == 0 {
        if ctx.is_ket {
            let vertex = branch_node(node);
            if let NodeKind::Attached(engine) = &vertex.kind {
                let mut guard = engine.lock();
                let engine_target = ctx.target - ctx.bdt_qubit_count;
                if ctx.ket_controls.is_empty() {
                    guard.mtrx(ctx.mtrx, engine_target)?;
                } else {
                    guard.mc_mtrx(ctx.ket_controls, ctx.mtrx, engine_target)?;
                }
            }
        } else {
            let child_depth = ctx.bdt_qubit_count - ctx.target - 1;
            ops::apply_2x2(node, ctx.mtrx, child_depth, ctx.eps, par);
        }
        return Ok(());
    }

    let depth = max_qubit - depth_left;
    let vertex = branch_node(node);
    let NodeKind::Interior(branches) = &mut vertex.kind else {
        return Ok(());
    };
    let (left, right) = branches.split_at_mut(1);
    if ctx.control_mask & (1u64 << depth) != 0 {
        // only the control-satisfied half is visited; the other half is the
        // recursive form of the control-mask skip
        return gate_descent(&mut right[0], depth_left - 1, max_qubit, par, ctx);
    }
    if par > 0 {
        let (first, second) = rayon::join(
            || gate_descent(&mut left[0], depth_left - 1, max_qubit, par - 1, ctx),
            || gate_descent(&mut right[0], depth_left - 1, max_qubit, par - 1, ctx),
        );
        first?;
        second?;
    } else {
        gate_descent(&mut left[0], depth_left - 1, max_qubit, 0, ctx)?;
        gate_descent(&mut right[0], depth_left - 1, max_qubit, 0, ctx)?;
    }
    Ok(())
}

/// Post-measurement collapse along every nonzero path to `depth_left`
fn collapse(
    node: &mut NodePtr,
    depth_left: usize,
    outcome: bool,
    ket_qubit: Option<usize>,
    eps: f64,
) -> Result<()> {
    if node.is_zero(eps) {
        return Ok(());
    }
    if depth_left == 0 {
        let vertex = branch_node(node);
        match (&mut vertex.kind, ket_qubit) {
            (NodeKind::Attached(engine), Some(qubit)) => {
                let selected_chance = {
                    let mut guard = engine.lock();
                    let one_chance = guard.prob(qubit)?;
                    let chance = if outcome { one_chance } else { 1.0 - one_chance };
                    if chance > eps {
                        guard.force_m(qubit, Some(outcome), true, 0.0)?;
                    }
                    chance
                };
                if selected_chance <= eps {
                    vertex.set_zero();
                } else {
                    // fold the engine's outcome weight into the path scale so
                    // relative weights across leaves stay correct; the global
                    // renormalization happens at the root
                    vertex.scale *= selected_chance.sqrt();
                }
            }
            (NodeKind::Interior(branches), None) => {
                let selected = outcome as usize;
                if branches[selected].is_zero(eps) {
                    vertex.set_zero();
                } else {
                    {
                        let chosen = Arc::make_mut(&mut branches[selected]);
                        chosen.scale /= chosen.scale.norm();
                    }
                    branches[selected ^ 1] = Arc::new(BdtNode::zero());
                }
            }
            _ => {}
        }
        return Ok(());
    }
    let vertex = branch_node(node);
    if let NodeKind::Interior(branches) = &mut vertex.kind {
        let (left, right) = branches.split_at_mut(1);
        collapse(&mut left[0], depth_left - 1, outcome, ket_qubit, eps)?;
        collapse(&mut right[0], depth_left - 1, outcome, ket_qubit, eps)?;
    }
    Ok(())
}

fn collect_attached_rec(node: &mut NodePtr, depth: usize, eps: f64, out: &mut Vec<EnginePtr>) {
    if node.is_zero(eps) {
        return;
    }
    let vertex = branch_node(node);
    if depth == 0 {
        if let NodeKind::Attached(engine) = &vertex.kind {
            if !out.iter().any(|seen| Arc::ptr_eq(seen, engine)) {
                out.push(engine.clone());
            }
        }
        return;
    }
    if let NodeKind::Interior(branches) = &mut vertex.kind {
        let (left, right) = branches.split_at_mut(1);
        collect_attached_rec(&mut left[0], depth - 1, eps, out);
        collect_attached_rec(&mut right[0], depth - 1, eps, out);
    }
}

fn attach_at_leaves(node: &mut NodePtr, depth: usize, engine: &EnginePtr, eps: f64) {
    if node.is_zero(eps) {
        return;
    }
    let vertex = branch_node(node);
    if depth > 0 {
        if let NodeKind::Interior(branches) = &mut vertex.kind {
            let (left, right) = branches.split_at_mut(1);
            attach_at_leaves(&mut left[0], depth - 1, engine, eps);
            attach_at_leaves(&mut right[0], depth - 1, engine, eps);
        }
        return;
    }
    if let NodeKind::Interior(branches) = &mut vertex.kind {
        for branch in branches.iter_mut() {
            if branch.is_zero(eps) {
                *branch = Arc::new(BdtNode::zero());
                continue;
            }
            *branch = Arc::new(BdtNode::attached(branch.scale, engine.clone()));
        }
    }
}

fn boundary_swap_rec(
    node: &mut NodePtr,
    depth_left: usize,
    attached: usize,
    eps: f64,
    device: usize,
) -> Result<()> {
    if node.is_zero(eps) {
        return Ok(());
    }
    let vertex = branch_node(node);
    if depth_left > 0 {
        if let NodeKind::Interior(branches) = &mut vertex.kind {
            let (left, right) = branches.split_at_mut(1);
            boundary_swap_rec(&mut left[0], depth_left - 1, attached, eps, device)?;
            boundary_swap_rec(&mut right[0], depth_left - 1, attached, eps, device)?;
        }
        return Ok(());
    }

    let NodeKind::Interior(branches) = &vertex.kind else {
        return Ok(());
    };
    let ket_dim = 1u64 << attached;
    let snapshot = |branch: &NodePtr| -> Option<(Complex64, Vec<Complex64>)> {
        if branch.is_zero(eps) {
            return None;
        }
        if let NodeKind::Attached(engine) = &branch.kind {
            let guard = engine.lock();
            Some((
                branch.scale,
                (0..ket_dim).map(|k| guard.get_amplitude(k)).collect(),
            ))
        } else {
            None
        }
    };
    let sides = [snapshot(&branches[0]), snapshot(&branches[1])];

    let mut rebuilt: [NodePtr; 2] = [Arc::new(BdtNode::zero()), Arc::new(BdtNode::zero())];
    for (bit, slot) in rebuilt.iter_mut().enumerate() {
        let amps: Vec<Complex64> = (0..ket_dim)
            .map(|ket| {
                let source = &sides[(ket & 1) as usize];
                match source {
                    Some((scale, amplitudes)) => {
                        scale * amplitudes[((ket & !1) | bit as u64) as usize]
                    }
                    None => ZERO,
                }
            })
            .collect();
        let norm_sqr: f64 = amps.iter().map(|a| a.norm_sqr()).sum();
        if norm_sqr <= eps {
            continue;
        }
        let norm = norm_sqr.sqrt();
        let normalized: Vec<Complex64> = amps.iter().map(|a| a / norm).collect();
        let mut engine = DenseEngine::from_amplitudes(attached, &normalized)?;
        engine.set_device(device);
        *slot = Arc::new(BdtNode::attached(
            Complex64::new(norm, 0.0),
            Arc::new(Mutex::new(engine)),
        ));
    }
    vertex.kind = NodeKind::Interior(rebuilt);
    Ok(())
}

/// Bit of `path` selecting the branch at `depth`, big-endian within the
/// enumeration so a dead prefix owns a contiguous index block
#[inline]
fn select_bit_be(path: u64, max_qubit: usize, depth: usize) -> usize {
    ((path >> (max_qubit - 1 - depth)) & 1) as usize
}

/// Indices remaining in the aligned block of `levels` free low bits
#[inline]
fn block_skip(path: u64, levels: usize) -> u64 {
    let block = 1u64 << levels;
    let end = ((path >> levels) + 1) * block;
    end - path - 1
}

#[inline]
fn clamp_prob(p: f64) -> f64 {
    p.clamp(0.0, 1.0)
}
