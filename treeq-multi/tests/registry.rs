//! Process-wide device registry behavior
//!
//! Lives in its own test binary: installing the global registry here cannot
//! interfere with the explicit-device-list placement tests.

use num_complex::Complex64;
use treeq_multi::{devices, init_devices, DeviceInfo, MultiDeviceUnit};
use treeq_state::{DenseEngine, Matrix2x2, StateEngine};

fn one() -> Complex64 {
    Complex64::new(1.0, 0.0)
}

fn x_gate() -> Matrix2x2 {
    let zero = Complex64::new(0.0, 0.0);
    [[zero, one()], [one(), zero]]
}

#[test]
fn test_engine_max_size_tracks_device_registry() {
    assert!(init_devices(vec![
        DeviceInfo::new(0, 1 << 20),
        DeviceInfo::new(1, 8),
        DeviceInfo::new(2, 1 << 6),
    ]));
    assert_eq!(devices().len(), 3);

    // an engine's advertised limit follows whatever device it sits on
    let mut engine = DenseEngine::new(2, 0).unwrap();
    assert_eq!(engine.max_size(), 1 << 20);
    engine.set_device(1);
    assert_eq!(engine.max_size(), 8);
    engine.set_device(2);
    assert_eq!(engine.max_size(), 1 << 6);
    // a device the registry does not know stays unbounded
    engine.set_device(7);
    assert_eq!(engine.max_size(), u64::MAX);

    // registry-backed construction: default device first, the remainder
    // sorted by capacity descending
    let unit = MultiDeviceUnit::new(2, 0, None, Some(1)).unwrap();
    assert_eq!(unit.devices()[0].id, 0);
    assert_eq!(unit.devices()[1].id, 2);
    assert_eq!(unit.devices()[2].id, 1);

    // the merge capacity check honors the engine's own device limit even
    // when the orchestrator's table is more generous: device 1 claims
    // 2^20 amplitudes in the table but only 8 in the registry, so merging
    // four qubits onto it must migrate the operand to the default device
    let table = vec![DeviceInfo::new(0, 1 << 20), DeviceInfo::new(1, 1 << 20)];
    let mut unit = MultiDeviceUnit::new(4, 0, Some(table), Some(2)).unwrap();
    unit.mc_invert(&[0], one(), one(), 1).unwrap();
    unit.mc_invert(&[2], one(), one(), 3).unwrap();
    let moved = unit
        .engine_infos()
        .into_iter()
        .find(|info| info.qubit_count > 1 && info.engine.lock().device_id() == 1);
    assert!(moved.is_some(), "expected a multi-qubit engine on device 1");

    let merged = unit.entangle_in_current_basis(&[2, 3, 0, 1]).unwrap();
    assert_eq!(merged.lock().qubit_count(), 4);
    assert_eq!(merged.lock().device_id(), 0);

    // sanity: the state survived all the shuffling
    let mut check = unit;
    check.mtrx(&x_gate(), 0).unwrap();
    assert!((check.prob(0).unwrap() - 1.0).abs() < 1e-9);
}
