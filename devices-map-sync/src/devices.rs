//! Watchable in-memory table of host network devices.

use std::{collections::BTreeMap, future, sync::Arc};

use tokio::sync::watch;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Device {
    pub index: u32,
    pub name: String,
    /// Link-layer address; empty for devices without one.
    pub hardware_addr: Vec<u8>,
    /// Whether the datapath should know about this device.
    pub selected: bool,
}

impl Device {
    /// A selected device.
    pub fn new(index: u32, name: impl Into<String>, hardware_addr: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            name: name.into(),
            hardware_addr: hardware_addr.into(),
            selected: true,
        }
    }
}

type Devices = Arc<BTreeMap<u32, Device>>;

/// Devices keyed by interface index.
///
/// Cloning yields another handle to the same table. Readers take a snapshot
/// with [`DeviceTable::selected`] and wait on the returned [`DeviceWatch`]
/// for the next mutation.
#[derive(Clone, Debug)]
pub struct DeviceTable {
    tx: Arc<watch::Sender<Devices>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Devices::default());
        Self { tx: Arc::new(tx) }
    }

    /// Inserts or replaces the device with the same index.
    pub fn insert(&self, device: Device) {
        self.tx.send_if_modified(|devices| {
            if devices.get(&device.index) == Some(&device) {
                return false;
            }
            Arc::make_mut(devices).insert(device.index, device);
            true
        });
    }

    pub fn remove(&self, index: u32) -> Option<Device> {
        let mut removed = None;
        self.tx.send_if_modified(|devices| {
            if !devices.contains_key(&index) {
                return false;
            }
            removed = Arc::make_mut(devices).remove(&index);
            true
        });
        removed
    }

    /// Replaces the whole table. Watchers are only woken if the contents
    /// differ from what was there before.
    pub fn replace_all<I>(&self, devices: I)
    where
        I: IntoIterator<Item = Device>,
    {
        let next: BTreeMap<u32, Device> = devices
            .into_iter()
            .map(|device| (device.index, device))
            .collect();
        self.tx.send_if_modified(|devices| {
            if **devices == next {
                return false;
            }
            *devices = Arc::new(next);
            true
        });
    }

    pub fn get(&self, index: u32) -> Option<Device> {
        self.tx.borrow().get(&index).cloned()
    }

    /// Selected devices ordered by index, plus a watch that fires on the
    /// next change to the table.
    pub fn selected(&self) -> (Vec<Device>, DeviceWatch) {
        let mut rx = self.tx.subscribe();
        let snapshot = Arc::clone(&rx.borrow_and_update());
        let devices = snapshot
            .values()
            .filter(|device| device.selected)
            .cloned()
            .collect();
        (devices, DeviceWatch { rx })
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Change notification tied to one [`DeviceTable::selected`] snapshot.
#[derive(Debug)]
pub struct DeviceWatch {
    rx: watch::Receiver<Devices>,
}

impl DeviceWatch {
    /// Resolves once the table has been mutated after the snapshot was taken.
    /// Never resolves if every table handle is gone.
    pub async fn changed(&mut self) {
        if self.rx.changed().await.is_err() {
            future::pending::<()>().await;
        }
    }
}
