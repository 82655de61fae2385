//! Typed access to the `cilium_devices` map.
//!
//! [`DevicesMap`] is the capability set the sync loop needs. The kernel
//! backed implementation is [`PinnedDevicesMap`]; [`MemoryDevicesMap`] keeps
//! entries in process memory with the same capacity and not-found semantics.

use std::path::PathBuf;

use devices_map_common::{DEVICES_MAP_MAX_ENTRIES, DEVICES_MAP_NAME, DeviceKey, DeviceState};

use crate::error::MapError;

mod memory;
mod pinned;

pub use memory::MemoryDevicesMap;
pub use pinned::PinnedDevicesMap;

/// Directory the datapath looks up pinned-by-name maps in.
pub const DEFAULT_BPFFS_DIR: &str = "/sys/fs/bpf/tc/globals";

pub trait DevicesMap {
    /// Inserts or overwrites the entry for `ifindex`.
    fn upsert(&mut self, ifindex: u32, state: DeviceState) -> Result<(), MapError>;

    /// Removes the entry for `ifindex`, returning [`MapError::NotFound`] if
    /// there was none.
    fn delete(&mut self, ifindex: u32) -> Result<(), MapError>;

    fn lookup(&self, ifindex: u32) -> Result<DeviceState, MapError>;

    /// Calls `f` once per entry, in no particular order. On a
    /// [`MapError::Read`] the entries already passed to `f` are still valid.
    fn for_each<F>(&self, f: F) -> Result<(), MapError>
    where
        F: FnMut(&DeviceKey, &DeviceState);
}

/// Parameters used when the map has to be created.
#[derive(Clone, Debug)]
pub struct MapOptions {
    pub pin_path: PathBuf,
    pub max_entries: u32,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            pin_path: PathBuf::from(DEFAULT_BPFFS_DIR).join(DEVICES_MAP_NAME),
            max_entries: DEVICES_MAP_MAX_ENTRIES,
        }
    }
}
