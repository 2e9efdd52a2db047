//! Shard-keeping quantum register with multi-device engine placement
//!
//! A [`QubitUnit`] keeps every qubit in its own engine until a multi-qubit
//! gate forces a merge, and splits measured qubits back out — separability
//! maintained as an optimization, in the spirit of explicitly-separated
//! simulation. [`MultiDeviceUnit`] layers a device table on top and keeps
//! the resulting engines spread across accelerators by load, largest first,
//! with the default device as the fallback for anything that fits nowhere.

pub mod error;
pub mod multi;
pub mod unit;

pub use error::{Result, UnitError};
pub use multi::{EngineInfo, MultiDeviceUnit};
pub use treeq_state::device;
pub use treeq_state::device::{devices, init_devices, lookup, DeviceInfo};
pub use unit::{QubitUnit, Shard};
