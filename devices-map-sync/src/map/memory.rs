use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use devices_map_common::{DEVICES_MAP_MAX_ENTRIES, DeviceKey, DeviceState};

use super::DevicesMap;
use crate::error::{MapError, WriteOp};

/// In-process stand-in for the kernel map.
///
/// Clones share the same entries, so a test can hand one clone to the sync
/// loop and inspect the other. Inserting a new key into a full map fails
/// with `E2BIG` as a kernel hash map does.
#[derive(Clone, Debug)]
pub struct MemoryDevicesMap {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<u32, DeviceState>,
    max_entries: usize,
    failing_upserts: BTreeSet<u32>,
    failing_deletes: BTreeSet<u32>,
    iteration_limit: Option<usize>,
}

impl MemoryDevicesMap {
    pub fn new() -> Self {
        Self::with_max_entries(DEVICES_MAP_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                max_entries: max_entries as usize,
                ..Inner::default()
            })),
        }
    }

    /// Copy of the current contents, ordered by ifindex.
    pub fn entries(&self) -> BTreeMap<u32, DeviceState> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Makes every upsert of `ifindex` fail with `EPERM` until cleared.
    pub fn fail_upserts_of(&self, ifindex: u32) {
        self.lock().failing_upserts.insert(ifindex);
    }

    /// Makes every delete of `ifindex` fail with `EPERM` until cleared.
    pub fn fail_deletes_of(&self, ifindex: u32) {
        self.lock().failing_deletes.insert(ifindex);
    }

    /// Makes iteration fail after yielding `limit` entries.
    pub fn fail_iteration_after(&self, limit: usize) {
        self.lock().iteration_limit = Some(limit);
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failing_upserts.clear();
        inner.failing_deletes.clear();
        inner.iteration_limit = None;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("memory devices map mutex poisoned")
    }
}

impl Default for MemoryDevicesMap {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicesMap for MemoryDevicesMap {
    fn upsert(&mut self, ifindex: u32, state: DeviceState) -> Result<(), MapError> {
        let mut inner = self.lock();
        let errno = if inner.failing_upserts.contains(&ifindex) {
            Some(libc::EPERM)
        } else if !inner.entries.contains_key(&ifindex) && inner.entries.len() >= inner.max_entries
        {
            Some(libc::E2BIG)
        } else {
            None
        };
        if let Some(errno) = errno {
            return Err(MapError::Write {
                op: WriteOp::Upsert,
                ifindex,
                source: io::Error::from_raw_os_error(errno),
            });
        }
        inner.entries.insert(ifindex, state);
        Ok(())
    }

    fn delete(&mut self, ifindex: u32) -> Result<(), MapError> {
        let mut inner = self.lock();
        if inner.failing_deletes.contains(&ifindex) {
            return Err(MapError::Write {
                op: WriteOp::Delete,
                ifindex,
                source: io::Error::from_raw_os_error(libc::EPERM),
            });
        }
        inner
            .entries
            .remove(&ifindex)
            .map(|_| ())
            .ok_or(MapError::NotFound { ifindex })
    }

    fn lookup(&self, ifindex: u32) -> Result<DeviceState, MapError> {
        self.lock()
            .entries
            .get(&ifindex)
            .copied()
            .ok_or(MapError::NotFound { ifindex })
    }

    fn for_each<F>(&self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(&DeviceKey, &DeviceState),
    {
        // Snapshot first so the callback may use other handles to the map.
        let (entries, limit) = {
            let inner = self.lock();
            (inner.entries.clone(), inner.iteration_limit)
        };
        for (yielded, (ifindex, state)) in entries.iter().enumerate() {
            if limit.is_some_and(|limit| yielded >= limit) {
                return Err(MapError::Read {
                    source: io::Error::from_raw_os_error(libc::EINTR),
                });
            }
            f(&DeviceKey::new(*ifindex), state);
        }
        Ok(())
    }
}
