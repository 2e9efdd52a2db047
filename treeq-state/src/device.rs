//! Accelerator device descriptors and the process-wide registry
//!
//! The registry stands in for a driver-level device enumeration: it is
//! initialized once at process startup and read-mostly afterwards. Engines
//! consult it for the allocation limit of whatever device they are assigned
//! to, and the multi-device orchestrator reads it for its default device
//! list. When it is never initialized, a single unbounded CPU device is
//! assumed, so single-device use needs no setup at all.

use std::sync::OnceLock;

/// One placement target: an id and its maximum state-vector allocation,
/// counted in amplitudes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: usize,
    pub max_size: u64,
}

impl DeviceInfo {
    pub fn new(id: usize, max_size: u64) -> Self {
        Self { id, max_size }
    }
}

static REGISTRY: OnceLock<Vec<DeviceInfo>> = OnceLock::new();

/// Install the process-wide device list
///
/// Returns false when the registry was already initialized; the first
/// installation wins.
pub fn init_devices(devices: Vec<DeviceInfo>) -> bool {
    REGISTRY.set(devices).is_ok()
}

/// The process-wide device list (a single unbounded device when never
/// initialized)
pub fn devices() -> Vec<DeviceInfo> {
    REGISTRY
        .get()
        .cloned()
        .unwrap_or_else(|| vec![DeviceInfo::new(0, u64::MAX)])
}

/// Capacity record for a device id, falling back to an unbounded device
pub fn lookup(id: usize) -> DeviceInfo {
    devices()
        .into_iter()
        .find(|device| device.id == id)
        .unwrap_or(DeviceInfo::new(id, u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninitialized_registry_defaults() {
        // the registry is process-global; this test only relies on behavior
        // that holds whether or not another test initialized it
        let devices = devices();
        assert!(!devices.is_empty());
        let unknown = lookup(usize::MAX - 1);
        assert_eq!(unknown.max_size, u64::MAX);
    }
}
