#![cfg_attr(not(test), no_std)]

// Records shared between the userspace sync agent and datapath programs that
// read the `cilium_devices` map. Layouts mirror `struct device_state` in the
// datapath headers byte for byte; keep this crate `no_std` so kernel-side
// Rust code can depend on it.

use core::mem::{offset_of, size_of};

/// Name the map is created and pinned under.
pub const DEVICES_MAP_NAME: &str = "cilium_devices";

/// Capacity the map is created with unless overridden.
pub const DEVICES_MAP_MAX_ENTRIES: u32 = 256;

/// Length of an Ethernet hardware address.
pub const MAC_LEN: usize = 6;

/// Key of the devices map: the kernel interface index.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeviceKey {
    pub ifindex: u32,
}

impl DeviceKey {
    pub const fn new(ifindex: u32) -> Self {
        Self { ifindex }
    }
}

/// Value of the devices map.
///
/// Devices without a 6-byte hardware address (tunnels, wireguard, other L3
/// interfaces) carry a zeroed `mac` and `l3 == 1`. Padding fields must stay
/// zero.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct DeviceState {
    pub mac: [u8; MAC_LEN],
    pub pad0: u16,
    pub l3: u8,
    pub pad1: u8,
    pub pad2: u16,
    pub pad3: u32,
}

impl DeviceState {
    /// Builds the map value for a device from its hardware address.
    ///
    /// Never fails: any address that is not exactly [`MAC_LEN`] bytes long
    /// marks the device as L3-only instead.
    pub fn new(hardware_addr: &[u8]) -> Self {
        let mut state = Self::default();
        match <[u8; MAC_LEN]>::try_from(hardware_addr) {
            Ok(mac) => state.mac = mac,
            Err(_) => state.l3 = 1,
        }
        state
    }

    pub fn mac(&self) -> [u8; MAC_LEN] {
        self.mac
    }

    pub fn is_l3(&self) -> bool {
        self.l3 != 0
    }
}

const _: () = {
    assert!(size_of::<DeviceKey>() == 4);
    assert!(size_of::<DeviceState>() == 16);
    assert!(offset_of!(DeviceState, mac) == 0);
    assert!(offset_of!(DeviceState, pad0) == 6);
    assert!(offset_of!(DeviceState, l3) == 8);
    assert!(offset_of!(DeviceState, pad1) == 9);
    assert!(offset_of!(DeviceState, pad2) == 10);
    assert!(offset_of!(DeviceState, pad3) == 12);
};

// Userspace builds enable `user` to get `aya::Pod` so the records can be used
// with aya's typed map APIs.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{DeviceKey, DeviceState};
    use aya::Pod;

    unsafe impl Pod for DeviceKey {}
    unsafe impl Pod for DeviceState {}
}
