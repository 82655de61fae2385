//! Keeps the pinned `cilium_devices` BPF map in sync with the host's
//! selected network devices.

pub mod devices;
pub mod error;
pub mod map;
pub mod rate;
pub mod sync;
pub mod sysfs;

pub use devices::{Device, DeviceTable, DeviceWatch};
pub use devices_map_common::{DeviceKey, DeviceState};
pub use error::{MapError, SyncError, WriteOp};
pub use map::{DevicesMap, MapOptions, MemoryDevicesMap, PinnedDevicesMap};
pub use sync::{DevicesMapSync, PassStats, SyncConfig, desired_state, reconcile};
