use std::{
    fs, io,
    mem::size_of,
    path::{Path, PathBuf},
};

use aya::maps::{HashMap, Map, MapData, MapError as AyaMapError, MapType};
use aya::pin::PinError;
use aya_obj::{
    EbpfSectionKind,
    generated::bpf_map_type,
    maps::{LegacyMap, PinningType, bpf_map_def},
};
use devices_map_common::{DEVICES_MAP_NAME, DeviceKey, DeviceState};
use tracing::{debug, info};

use super::{DevicesMap, MapOptions};
use crate::error::{BoxError, MapError, WriteOp};

// include/uapi/linux/bpf.h
const BPF_F_NO_PREALLOC: u32 = 1 << 0;

/// Equivalent of `Map::from_map_data` (not available in aya 0.13.1) for the
/// hash map types: wraps `data` in the variant matching its kernel map type.
fn map_from_map_data(data: MapData) -> Result<Map, AyaMapError> {
    Ok(match data.info()?.map_type()? {
        MapType::Hash => Map::HashMap(data),
        MapType::LruHash => Map::LruHashMap(data),
        _ => Map::Unsupported(data),
    })
}

/// The devices map as pinned in bpffs.
pub struct PinnedDevicesMap {
    map: HashMap<MapData, DeviceKey, DeviceState>,
    pin_path: PathBuf,
}

impl PinnedDevicesMap {
    /// Attaches to the map pinned at `opts.pin_path`, creating and pinning a
    /// new one if nothing usable is there.
    pub fn open_or_create(opts: &MapOptions) -> Result<Self, MapError> {
        let path = opts.pin_path.as_path();
        match Self::from_pin(path) {
            Ok(map) => return Ok(map),
            Err(err) => debug!(
                path = %path.display(),
                error = %err,
                "no pinned devices map to attach to, creating one"
            ),
        }
        let map = Self::create(opts).map_err(|source| MapError::Init {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            path = %path.display(),
            max_entries = opts.max_entries,
            "created devices map"
        );
        Ok(map)
    }

    /// Attaches to an already pinned map without ever creating one.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MapError> {
        let path = path.as_ref();
        Self::from_pin(path).map_err(|source| MapError::Init {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn pin_path(&self) -> &Path {
        &self.pin_path
    }

    fn from_pin(path: &Path) -> Result<Self, BoxError> {
        let data = MapData::from_pin(path)?;
        let map = HashMap::try_from(map_from_map_data(data)?)?;
        Ok(Self {
            map,
            pin_path: path.to_path_buf(),
        })
    }

    fn create(opts: &MapOptions) -> Result<Self, BoxError> {
        let path = opts.pin_path.as_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let obj = aya_obj::Map::Legacy(LegacyMap {
            def: bpf_map_def {
                map_type: bpf_map_type::BPF_MAP_TYPE_HASH as u32,
                key_size: size_of::<DeviceKey>() as u32,
                value_size: size_of::<DeviceState>() as u32,
                max_entries: opts.max_entries,
                map_flags: BPF_F_NO_PREALLOC,
                id: 0,
                pinning: PinningType::ByName,
            },
            section_index: 0,
            section_kind: EbpfSectionKind::Maps,
            symbol_index: None,
            data: Vec::new(),
        });
        let data = MapData::create(obj, DEVICES_MAP_NAME, None)?;

        match data.pin(path) {
            Ok(()) => {}
            // Another agent pinned it between our attach attempt and now.
            Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
                return Self::from_pin(path);
            }
            Err(err) => return Err(err.into()),
        }

        let map = HashMap::try_from(Map::HashMap(data))?;
        Ok(Self {
            map,
            pin_path: path.to_path_buf(),
        })
    }
}

impl DevicesMap for PinnedDevicesMap {
    fn upsert(&mut self, ifindex: u32, state: DeviceState) -> Result<(), MapError> {
        self.map
            .insert(DeviceKey::new(ifindex), state, 0)
            .map_err(|err| MapError::Write {
                op: WriteOp::Upsert,
                ifindex,
                source: into_io_error(err),
            })
    }

    fn delete(&mut self, ifindex: u32) -> Result<(), MapError> {
        self.map
            .remove(&DeviceKey::new(ifindex))
            .map_err(|err| delete_error(ifindex, into_io_error(err)))
    }

    fn lookup(&self, ifindex: u32) -> Result<DeviceState, MapError> {
        self.map
            .get(&DeviceKey::new(ifindex), 0)
            .map_err(|err| lookup_error(ifindex, err))
    }

    fn for_each<F>(&self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(&DeviceKey, &DeviceState),
    {
        for item in self.map.iter() {
            let (key, state) = item.map_err(|err| MapError::Read {
                source: into_io_error(err),
            })?;
            f(&key, &state);
        }
        Ok(())
    }
}

/// Unwraps the errno of a failed map syscall; other aya errors are boxed.
fn into_io_error(err: AyaMapError) -> io::Error {
    match err {
        AyaMapError::SyscallError(err) => err.io_error,
        other => io::Error::other(other),
    }
}

/// `ENOENT` from a delete means the key was already gone.
fn delete_error(ifindex: u32, source: io::Error) -> MapError {
    if source.raw_os_error() == Some(libc::ENOENT) {
        return MapError::NotFound { ifindex };
    }
    MapError::Write {
        op: WriteOp::Delete,
        ifindex,
        source,
    }
}

fn lookup_error(ifindex: u32, err: AyaMapError) -> MapError {
    match err {
        AyaMapError::KeyNotFound => MapError::NotFound { ifindex },
        other => MapError::Read {
            source: into_io_error(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_syscall_errors_carry_no_errno() {
        let err = into_io_error(AyaMapError::KeyNotFound);
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(err.raw_os_error().is_none());
    }

    #[test]
    fn delete_of_absent_key_is_not_found() {
        let err = delete_error(7, io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(err, MapError::NotFound { ifindex: 7 }));
        assert!(err.is_not_found());
    }

    #[test]
    fn other_delete_errnos_are_write_errors() {
        match delete_error(7, io::Error::from_raw_os_error(libc::EPERM)) {
            MapError::Write {
                op: WriteOp::Delete,
                ifindex: 7,
                source,
            } => assert_eq!(source.raw_os_error(), Some(libc::EPERM)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn lookup_of_absent_key_is_not_found() {
        let err = lookup_error(3, AyaMapError::KeyNotFound);
        assert!(matches!(err, MapError::NotFound { ifindex: 3 }));
    }

    #[test]
    fn other_lookup_failures_are_read_errors() {
        let err = lookup_error(3, AyaMapError::ElementNotFound);
        assert!(matches!(err, MapError::Read { .. }));
        assert!(!err.is_not_found());
    }

    #[test]
    fn attaching_to_missing_pin_is_init_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEVICES_MAP_NAME);
        match PinnedDevicesMap::open(&path) {
            Err(MapError::Init { path: reported, .. }) => assert_eq!(reported, path),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("opened a map that was never pinned"),
        }
    }

    // Needs CAP_BPF and a bpffs mount at /sys/fs/bpf.
    #[test]
    #[ignore]
    fn privileged_pinned_map_crud() {
        let dir = PathBuf::from("/sys/fs/bpf/devices-map-sync-test");
        let opts = MapOptions {
            pin_path: dir.join(DEVICES_MAP_NAME),
            ..MapOptions::default()
        };
        let _ = fs::remove_file(&opts.pin_path);

        let mut map = PinnedDevicesMap::open_or_create(&opts).unwrap();

        let state1 = DeviceState::new(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let state2 = DeviceState::new(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        map.upsert(1, state1).unwrap();
        map.upsert(2, state2).unwrap();

        assert_eq!(map.lookup(1).unwrap(), state1);
        assert_eq!(map.lookup(2).unwrap(), state2);

        let mut seen = std::collections::HashMap::new();
        map.for_each(|key, state| {
            seen.insert(key.ifindex, *state);
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[&1], state1);
        assert_eq!(seen[&2], state2);

        // A second handle attaches to the same pin and sees the writes.
        let reader = PinnedDevicesMap::open_or_create(&opts).unwrap();
        assert_eq!(reader.lookup(1).unwrap(), state1);

        map.delete(2).unwrap();
        assert!(matches!(
            map.lookup(2),
            Err(MapError::NotFound { ifindex: 2 })
        ));
        assert!(matches!(
            map.delete(2),
            Err(MapError::NotFound { ifindex: 2 })
        ));

        fs::remove_file(&opts.pin_path).unwrap();
        let _ = fs::remove_dir(&dir);
    }
}
