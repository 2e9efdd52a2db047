//! End-to-end register scenarios

use num_complex::Complex64;
use parking_lot::Mutex;
use std::sync::Arc;
use treeq_sim::{Qbdt, SimConfig};
use treeq_state::{DenseEngine, EnginePtr, Matrix2x2, StateEngine};

fn c(re: f64) -> Complex64 {
    Complex64::new(re, 0.0)
}

fn ci(im: f64) -> Complex64 {
    Complex64::new(0.0, im)
}

fn one() -> Complex64 {
    c(1.0)
}

fn hadamard() -> Matrix2x2 {
    let h = std::f64::consts::FRAC_1_SQRT_2;
    [[c(h), c(h)], [c(h), c(-h)]]
}

fn seeded(qubits: usize, perm: u64, seed: u64) -> Qbdt {
    Qbdt::new(qubits, perm, SimConfig::new().with_seed(seed)).unwrap()
}

fn bell_pair(seed: u64) -> Qbdt {
    let mut register = seeded(2, 0, seed);
    register.mtrx(&hadamard(), 0).unwrap();
    register.mc_invert(&[0], one(), one(), 1).unwrap();
    register
}

fn assert_close(actual: f64, expected: f64, eps: f64) {
    assert!(
        (actual - expected).abs() <= eps,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn test_permutation_init_reads_back() {
    let register = seeded(3, 0b101, 1);
    let amp = register.get_amplitude(0b101).unwrap();
    assert_close(amp.re, 1.0, 1e-12);
    assert_close(amp.im, 0.0, 1e-12);
    for perm in [0b000, 0b001, 0b010, 0b100, 0b111] {
        assert_close(register.prob_all(perm).unwrap(), 0.0, 1e-12);
    }
}

#[test]
fn test_bell_circuit_probabilities() {
    let register = bell_pair(2);
    assert_close(register.prob_all(0b00).unwrap(), 0.5, 1e-12);
    assert_close(register.prob_all(0b11).unwrap(), 0.5, 1e-12);
    assert_close(register.prob_all(0b01).unwrap(), 0.0, 1e-12);
    assert_close(register.prob_all(0b10).unwrap(), 0.0, 1e-12);
}

#[test]
fn test_bell_state_matches_dense_reference() {
    let mut register = bell_pair(3);

    let h = std::f64::consts::FRAC_1_SQRT_2;
    let mut reference = seeded(2, 0, 4);
    reference
        .set_quantum_state(&[c(h), c(0.0), c(0.0), c(h)])
        .unwrap();

    let distance = register.sum_sqr_diff(&mut reference).unwrap();
    assert_close(distance, 0.0, 1e-9);
}

#[test]
fn test_sum_sqr_diff_bounds() {
    let mut bell = bell_pair(5);
    let mut same = bell_pair(6);
    let mut basis = seeded(2, 0, 7);

    assert_close(bell.sum_sqr_diff(&mut same).unwrap(), 0.0, 1e-9);
    // |⟨00|Bell⟩|² = 1/2
    let distance = bell.sum_sqr_diff(&mut basis).unwrap();
    assert_close(distance, 0.5, 1e-9);
    assert!((0.0..=1.0).contains(&distance));
}

#[test]
fn test_unitary_then_adjoint_is_identity() {
    let theta = 0.37f64;
    let rx: Matrix2x2 = [
        [c((theta / 2.0).cos()), ci(-(theta / 2.0).sin())],
        [ci(-(theta / 2.0).sin()), c((theta / 2.0).cos())],
    ];
    let rx_dagger: Matrix2x2 = [
        [rx[0][0].conj(), rx[1][0].conj()],
        [rx[0][1].conj(), rx[1][1].conj()],
    ];

    let mut register = seeded(3, 0, 8);
    register.mtrx(&hadamard(), 0).unwrap();
    register.mc_invert(&[0], one(), one(), 2).unwrap();
    let mut untouched = register.clone();

    register.mtrx(&rx, 1).unwrap();
    register.mtrx(&rx_dagger, 1).unwrap();
    assert_close(register.sum_sqr_diff(&mut untouched).unwrap(), 0.0, 1e-9);
}

#[test]
fn test_measure_all_of_basis_states() {
    for perm in [0u64, 1, 0b1010, 0b1111] {
        let mut register = seeded(4, perm, 9);
        assert_eq!(register.m_all().unwrap(), perm);
        // collapsed register stays consistent
        assert_close(register.prob_all(perm).unwrap(), 1.0, 1e-12);
    }
}

#[test]
fn test_compose_then_decompose_returns_part() {
    let mut front = bell_pair(10);
    let mut back = seeded(2, 0, 11);
    back.mtrx(&hadamard(), 0).unwrap();
    let back_state = back.get_quantum_state();

    let start = front.compose(&back, 2).unwrap();
    assert_eq!(start, 2);
    assert_eq!(front.qubit_count(), 4);
    let total: f64 = front.get_probs().iter().sum();
    assert_close(total, 1.0, 1e-9);

    let mut part = front.decompose(2, 2).unwrap();
    assert_eq!(part.qubit_count(), 2);
    assert_eq!(front.qubit_count(), 2);

    let mut reference = seeded(2, 0, 12);
    reference.set_quantum_state(&back_state).unwrap();
    assert_close(part.sum_sqr_diff(&mut reference).unwrap(), 0.0, 1e-9);

    // what remains is the Bell pair
    assert_close(front.prob_all(0b00).unwrap(), 0.5, 1e-9);
    assert_close(front.prob_all(0b11).unwrap(), 0.5, 1e-9);
}

#[test]
fn test_decompose_identity_tail_of_bell_product() {
    // Bell on the low pair, |00⟩ above it
    let mut register = seeded(4, 0, 13);
    register.mtrx(&hadamard(), 0).unwrap();
    register.mc_invert(&[0], one(), one(), 1).unwrap();

    let part = register.decompose(2, 2).unwrap();
    assert_close(part.prob_all(0).unwrap(), 1.0, 1e-9);
    assert_close(register.prob_all(0b00).unwrap(), 0.5, 1e-9);
    assert_close(register.prob_all(0b11).unwrap(), 0.5, 1e-9);
}

#[test]
fn test_decompose_bell_head_of_product() {
    let mut register = seeded(4, 0, 14);
    register.mtrx(&hadamard(), 0).unwrap();
    register.mc_invert(&[0], one(), one(), 1).unwrap();

    let part = register.decompose(0, 2).unwrap();
    assert_close(part.prob_all(0b00).unwrap(), 0.5, 1e-9);
    assert_close(part.prob_all(0b11).unwrap(), 0.5, 1e-9);
    assert_close(register.prob_all(0).unwrap(), 1.0, 1e-9);
}

#[test]
fn test_decompose_entangled_range_fails_cleanly() {
    let mut register = bell_pair(15);
    let before = register.get_quantum_state();
    assert!(register.decompose(0, 1).is_err());
    let after = register.get_quantum_state();
    for (b, a) in before.iter().zip(after.iter()) {
        assert_close((b - a).norm(), 0.0, 1e-12);
    }
}

#[test]
fn test_histogram_matches_probabilities() {
    let mut register = seeded(5, 0, 16);
    register.mtrx(&hadamard(), 0).unwrap();
    register.mc_invert(&[0], one(), one(), 1).unwrap();
    register.mtrx(&hadamard(), 3).unwrap();
    let t = Complex64::from_polar(1.0, std::f64::consts::FRAC_PI_4);
    register.mc_phase(&[3], one(), t, 4).unwrap();
    register.mtrx(&hadamard(), 4).unwrap();

    let amplitudes = register.get_quantum_state();
    let probs = register.get_probs();

    let shots = 3000usize;
    let mut counts = vec![0usize; probs.len()];
    for _ in 0..shots {
        register.set_quantum_state(&amplitudes).unwrap();
        let outcome = register.m_all().unwrap();
        counts[outcome as usize] += 1;
    }

    for (perm, &p) in probs.iter().enumerate() {
        let expected = shots as f64 * p;
        let sigma = (shots as f64 * p * (1.0 - p)).sqrt();
        let tolerance = 5.0 * sigma + 1.0;
        assert!(
            ((counts[perm] as f64) - expected).abs() <= tolerance,
            "perm {perm}: counted {}, expected {expected} ± {tolerance}",
            counts[perm]
        );
    }
}

fn fresh_engine(qubits: usize, perm: u64) -> EnginePtr {
    Arc::new(Mutex::new(DenseEngine::new(qubits, perm).unwrap()))
}

#[test]
fn test_attach_extends_register() {
    let mut register = seeded(2, 0b01, 17);
    let start = register.attach(fresh_engine(1, 0)).unwrap();
    assert_eq!(start, 2);
    assert_eq!(register.qubit_count(), 3);
    assert_eq!(register.attached_qubit_count(), 1);
    assert_close(register.prob_all(0b001).unwrap(), 1.0, 1e-12);
}

#[test]
fn test_gates_on_attached_qubits() {
    let mut register = seeded(2, 0, 18);
    register.attach(fresh_engine(1, 0)).unwrap();

    register.mtrx(&hadamard(), 2).unwrap();
    assert_close(register.prob(2).unwrap(), 0.5, 1e-12);
    register.mtrx(&hadamard(), 2).unwrap();
    assert_close(register.prob(2).unwrap(), 0.0, 1e-9);

    // entangle a tree qubit with the attached qubit
    register.mtrx(&hadamard(), 0).unwrap();
    register.mc_invert(&[0], one(), one(), 2).unwrap();
    assert_close(register.prob(2).unwrap(), 0.5, 1e-9);
    assert_close(register.prob_all(0b101).unwrap(), 0.5, 1e-9);
    assert_close(register.prob_all(0b000).unwrap(), 0.5, 1e-9);
}

#[test]
fn test_attached_control_on_tree_target() {
    let x: Matrix2x2 = [[c(0.0), c(1.0)], [c(1.0), c(0.0)]];
    let mut register = seeded(2, 0, 19);
    register.attach(fresh_engine(1, 0)).unwrap();

    // set the attached qubit, then flip a tree qubit conditioned on it
    register.mtrx(&x, 2).unwrap();
    register.mc_invert(&[2], one(), one(), 0).unwrap();

    let mut reference = DenseEngine::new(3, 0).unwrap();
    reference.mtrx(&x, 2).unwrap();
    reference.mc_invert(&[2], one(), one(), 0).unwrap();

    let state = register.get_quantum_state();
    for (perm, amp) in state.iter().enumerate() {
        assert_close(
            (amp - reference.get_amplitude(perm as u64)).norm(),
            0.0,
            1e-9,
        );
    }
}

#[test]
fn test_measure_attached_qubit() {
    let mut register = seeded(2, 0, 20);
    register.attach(fresh_engine(1, 0)).unwrap();
    register.mtrx(&hadamard(), 2).unwrap();

    let outcome = register.force_m(2, None, true).unwrap();
    assert_close(
        register.prob(2).unwrap(),
        if outcome { 1.0 } else { 0.0 },
        1e-9,
    );
    let total: f64 = register.get_probs().iter().sum();
    assert_close(total, 1.0, 1e-9);
}

#[test]
fn test_decompose_attached_range_via_rotation() {
    let mut register = seeded(2, 0, 21);
    register.attach(fresh_engine(1, 0)).unwrap();
    register.mtrx(&hadamard(), 2).unwrap();

    // the range overlaps the attached region; the register rotates it down
    // to position 0, detaches, and rotates back
    let part = register.decompose(2, 1).unwrap();
    assert_eq!(part.qubit_count(), 1);
    assert_close(part.prob(0).unwrap(), 0.5, 1e-9);

    assert_eq!(register.qubit_count(), 2);
    assert_close(register.prob_all(0b00).unwrap(), 1.0, 1e-9);
}

#[test]
fn test_forced_measurement_post_selects() {
    let mut register = bell_pair(22);
    let outcome = register.force_m(0, Some(true), true).unwrap();
    assert!(outcome);
    assert_close(register.prob(1).unwrap(), 1.0, 1e-9);
    let total: f64 = register.get_probs().iter().sum();
    assert_close(total, 1.0, 1e-9);
}

#[test]
fn test_random_global_phase_leaves_probabilities_alone() {
    let config = SimConfig::new().with_seed(23).with_random_global_phase(true);
    let mut register = Qbdt::new(3, 0b010, config).unwrap();
    assert_close(register.prob_all(0b010).unwrap(), 1.0, 1e-12);
    register.mtrx(&hadamard(), 1).unwrap();
    assert_close(register.prob(1).unwrap(), 0.5, 1e-12);
    let total: f64 = register.get_probs().iter().sum();
    assert_close(total, 1.0, 1e-9);
}
