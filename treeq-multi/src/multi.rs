//! Multi-device shard orchestration
//!
//! Wraps a [`QubitUnit`] with a device table and keeps the backing engines
//! spread across devices by load. Engines are redistributed after every
//! operation that changes the shard partition: largest engines place first,
//! an engine on an otherwise-empty device stays put, ties prefer the
//! default device, and an engine that fits nowhere falls back to the
//! default device (assumed largest).

use crate::error::{Result, UnitError};
use crate::unit::QubitUnit;
use num_complex::Complex64;
use std::sync::Arc;
use treeq_state::device::{self, DeviceInfo};
use treeq_state::{EnginePtr, Matrix2x2};

/// One distinct engine and where it currently lives
pub struct EngineInfo {
    pub engine: EnginePtr,
    pub device_index: usize,
    pub qubit_count: usize,
    pub size: u64,
}

/// Shard-keeping register distributed over several devices
pub struct MultiDeviceUnit {
    unit: QubitUnit,
    devices: Vec<DeviceInfo>,
    /// Engines below this qubit count never migrate (they stay wherever
    /// their hybrid backend keeps them, typically CPU)
    threshold_qubits: usize,
}

impl MultiDeviceUnit {
    /// Unit of `qubit_count` qubits in the basis state `perm`
    ///
    /// With `devices: None` the process-wide registry is consulted; the
    /// registry's first device becomes the default and the remainder sort by
    /// capacity descending. An explicit device list is taken as-is, first
    /// entry default.
    pub fn new(
        qubit_count: usize,
        perm: u64,
        devices: Option<Vec<DeviceInfo>>,
        seed: Option<u64>,
    ) -> Result<Self> {
        let devices = match devices {
            Some(list) => {
                if list.is_empty() {
                    return Err(UnitError::InvalidConfiguration(
                        "empty device list".to_string(),
                    ));
                }
                list
            }
            None => {
                let mut list = device::devices();
                list[1..].sort_by(|a, b| b.max_size.cmp(&a.max_size));
                list
            }
        };
        let unit = QubitUnit::new(qubit_count, perm, devices[0].id, seed)?;
        Ok(Self {
            unit,
            devices,
            threshold_qubits: 0,
        })
    }

    /// Set the hybrid threshold below which engines never migrate
    pub fn set_threshold_qubits(&mut self, threshold: usize) {
        self.threshold_qubits = threshold;
    }

    /// Adjust the tolerance used when splitting ranges back out
    pub fn set_separability_threshold(&mut self, threshold: f64) {
        self.unit.set_separability_threshold(threshold);
    }

    /// Number of qubits in the unit
    pub fn qubit_count(&self) -> usize {
        self.unit.qubit_count()
    }

    /// The device table, default device first
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Read-only access to the underlying shard register
    pub fn unit(&self) -> &QubitUnit {
        &self.unit
    }

    fn device_index_of(&self, device_id: usize) -> usize {
        self.devices
            .iter()
            .position(|device| device.id == device_id)
            .unwrap_or(0)
    }

    fn device_capacity(&self, device_id: usize) -> u64 {
        self.devices
            .iter()
            .find(|device| device.id == device_id)
            .map(|device| device.max_size)
            .unwrap_or(u64::MAX)
    }

    /// One record per distinct engine, sorted by size descending so the
    /// largest engines place first
    pub fn engine_infos(&self) -> Vec<EngineInfo> {
        let mut infos: Vec<EngineInfo> = self
            .unit
            .distinct_engines()
            .into_iter()
            .map(|engine| {
                let (qubit_count, size, device_id) = {
                    let guard = engine.lock();
                    (guard.qubit_count(), guard.max_q_power(), guard.device_id())
                };
                EngineInfo {
                    engine,
                    device_index: self.device_index_of(device_id),
                    qubit_count,
                    size,
                }
            })
            .collect();
        infos.sort_by(|a, b| b.size.cmp(&a.size));
        infos
    }

    /// Best-fit engine placement across the device table
    pub fn redistribute_engines(&mut self) {
        if self.devices.len() <= 1 {
            return;
        }
        let infos = self.engine_infos();
        let mut device_loads = vec![0u64; self.devices.len()];

        for info in infos {
            // single-qubit engines and sub-threshold hybrid shards add
            // negligible load; leave them where they are
            if info.qubit_count <= 1 || info.qubit_count < self.threshold_qubits {
                continue;
            }
            let mut index = info.device_index;
            let load = device_loads[index];
            // an engine alone on its device keeps its residency
            if load > 0 {
                let mut chosen = index;
                if device_loads[0] < load {
                    chosen = 0;
                }
                let mut best = device_loads[chosen];
                for (candidate, device) in self.devices.iter().enumerate() {
                    if device_loads[candidate] < best
                        && device_loads[candidate] + info.size <= device.max_size
                    {
                        chosen = candidate;
                        best = device_loads[candidate];
                    }
                }
                info.engine.lock().set_device(self.devices[chosen].id);
                index = chosen;
            }
            device_loads[index] += info.size;
        }
    }

    /// Merge the engines of `bits` into one, capacity-checked
    ///
    /// When the merged engine would not fit on the first operand's current
    /// device, that engine migrates to the default device before the merge.
    pub fn entangle_in_current_basis(&mut self, bits: &[usize]) -> Result<EnginePtr> {
        let Some(&first_bit) = bits.first() else {
            return Err(UnitError::InvalidQubitIndex {
                index: 0,
                qubit_count: self.unit.qubit_count(),
            });
        };
        let first = self.unit.shard(first_bit)?.unit.clone();
        let already_entangled = bits
            .iter()
            .all(|&bit| match self.unit.shard(bit) {
                Ok(shard) => Arc::ptr_eq(&shard.unit, &first),
                Err(_) => false,
            });
        if already_entangled {
            return self.unit.entangle_in_current_basis(bits);
        }

        let first_device = first.lock().device_id();
        if self.devices[0].id != first_device {
            let mut seen: Vec<EnginePtr> = Vec::new();
            let mut total_qubits = 0usize;
            for &bit in bits {
                let unit = self.unit.shard(bit)?.unit.clone();
                if !seen.iter().any(|engine| Arc::ptr_eq(engine, &unit)) {
                    total_qubits += unit.lock().qubit_count();
                    seen.push(unit);
                }
            }
            // the merge must fit both the engine's own device limit (the
            // registry's view) and this orchestrator's table entry
            let capacity = first.lock().max_size().min(self.device_capacity(first_device));
            if 1u64 << total_qubits > capacity {
                first.lock().set_device(self.devices[0].id);
            }
        }

        let merged = self.unit.entangle_in_current_basis(bits)?;
        self.redistribute_engines();
        Ok(merged)
    }

    /// Apply a 2×2 unitary to `qubit`
    pub fn mtrx(&mut self, mtrx: &Matrix2x2, qubit: usize) -> Result<()> {
        self.unit.mtrx(mtrx, qubit)
    }

    /// Apply a multi-controlled 2×2 unitary
    pub fn mc_mtrx(&mut self, controls: &[usize], mtrx: &Matrix2x2, target: usize) -> Result<()> {
        if !controls.is_empty() {
            let mut bits = controls.to_vec();
            bits.push(target);
            self.entangle_in_current_basis(&bits)?;
        }
        self.unit.mc_mtrx(controls, mtrx, target)
    }

    /// Controlled diagonal gate
    pub fn mc_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        if !controls.is_empty() {
            let mut bits = controls.to_vec();
            bits.push(target);
            self.entangle_in_current_basis(&bits)?;
        }
        self.unit.mc_phase(controls, top_left, bottom_right, target)
    }

    /// Controlled anti-diagonal gate
    pub fn mc_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        if !controls.is_empty() {
            let mut bits = controls.to_vec();
            bits.push(target);
            self.entangle_in_current_basis(&bits)?;
        }
        self.unit.mc_invert(controls, top_right, bottom_left, target)
    }

    /// Marginal probability of measuring `qubit` as 1
    pub fn prob(&self, qubit: usize) -> Result<f64> {
        self.unit.prob(qubit)
    }

    /// Probability of the full basis permutation
    pub fn prob_all(&self, perm: u64) -> Result<f64> {
        self.unit.prob_all(perm)
    }

    /// Measure one qubit; the separation it causes triggers redistribution
    pub fn force_m(&mut self, qubit: usize, result: Option<bool>, do_apply: bool) -> Result<bool> {
        let outcome = self.unit.force_m(qubit, result, do_apply)?;
        if do_apply {
            self.redistribute_engines();
        }
        Ok(outcome)
    }

    /// Measure every qubit
    pub fn m_all(&mut self) -> Result<u64> {
        let result = self.unit.m_all()?;
        self.redistribute_engines();
        Ok(result)
    }

    /// Detach a separable qubit range into its own multi-device unit
    pub fn detach(&mut self, start: usize, length: usize) -> Result<MultiDeviceUnit> {
        let part = self.unit.detach(start, length)?;
        self.redistribute_engines();
        let mut dest = MultiDeviceUnit {
            unit: part,
            devices: self.devices.clone(),
            threshold_qubits: self.threshold_qubits,
        };
        dest.redistribute_engines();
        Ok(dest)
    }

    /// The full amplitude vector: everything entangles into one engine,
    /// ordered contiguously, and reads out
    pub fn get_quantum_state(&mut self) -> Result<Vec<Complex64>> {
        let bits: Vec<usize> = (0..self.unit.qubit_count()).collect();
        let engine = self.entangle_in_current_basis(&bits)?;
        self.unit.order_contiguous(&engine)?;
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

impl Clone for MultiDeviceUnit {
    fn clone(&self) -> Self {
        let mut copy = Self {
            unit: self.unit.clone(),
            devices: self.devices.clone(),
            threshold_qubits: self.threshold_qubits,
        };
        copy.redistribute_engines();
        copy
    }
}
