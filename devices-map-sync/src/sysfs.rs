//! Populates a [`DeviceTable`] from `/sys/class/net`.

use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    devices::{Device, DeviceTable},
    error::SyncError,
    sync::stop_requested,
};

pub const DEFAULT_SYSFS_NET: &str = "/sys/class/net";
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

// include/uapi/linux/if_arp.h
const ARPHRD_LOOPBACK: u32 = 772;

/// Which scanned devices end up selected.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Selection {
    /// Everything except loopback.
    #[default]
    NonLoopback,
    /// Exactly the named interfaces.
    Named(BTreeSet<String>),
}

impl Selection {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            Selection::NonLoopback
        } else {
            Selection::Named(names)
        }
    }

    fn selects(&self, name: &str, link_type: Option<u32>) -> bool {
        match self {
            Selection::NonLoopback => link_type != Some(ARPHRD_LOOPBACK),
            Selection::Named(names) => names.contains(name),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FeederOptions {
    pub root: PathBuf,
    pub selection: Selection,
    pub interval: Duration,
}

impl Default for FeederOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_SYSFS_NET),
            selection: Selection::default(),
            interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

/// Parses `aa:bb:cc` style addresses. Anything malformed yields an empty
/// address, which the map encodes as an L3 device.
pub fn parse_hardware_addr(raw: &str) -> Vec<u8> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(':')
        .map(|octet| u8::from_str_radix(octet, 16))
        .collect::<Result<Vec<u8>, _>>()
        .unwrap_or_default()
}

/// Reads every interface below `root`.
///
/// Only a failure to list `root` itself is an error. Plain files such as
/// `bonding_masters` are ignored, and an interface whose attributes cannot
/// be read is logged and left out of the result.
pub fn scan(root: &Path, selection: &Selection) -> io::Result<Vec<Device>> {
    let mut devices = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        // Interfaces are symlinks into /sys/devices; follow them.
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match read_device(&path, name, selection) {
            Ok(device) => devices.push(device),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "interface vanished during scan");
            }
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "skipping unreadable interface"
            ),
        }
    }
    devices.sort_by_key(|device| device.index);
    Ok(devices)
}

fn read_device(dir: &Path, name: String, selection: &Selection) -> io::Result<Device> {
    let index = read_attr(dir, "ifindex")?
        .parse::<u32>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let hardware_addr = match read_attr(dir, "address") {
        Ok(raw) => parse_hardware_addr(&raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err),
    };
    let link_type = read_attr(dir, "type")
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok());
    let selected = selection.selects(&name, link_type);

    Ok(Device {
        index,
        name,
        hardware_addr,
        selected,
    })
}

fn read_attr(dir: &Path, attr: &str) -> io::Result<String> {
    fs::read_to_string(dir.join(attr)).map(|raw| raw.trim().to_string())
}

/// Rescans `opts.root` every `opts.interval` and replaces the table
/// contents until `stop` fires. Scan errors are logged and retried on the
/// next tick. A zero interval is raised to one millisecond.
pub async fn run_feeder(
    table: DeviceTable,
    opts: FeederOptions,
    mut stop: watch::Receiver<bool>,
) -> SyncError {
    let mut ticker = time::interval(opts.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            reason = stop_requested(&mut stop) => return reason,
        }
        match scan(&opts.root, &opts.selection) {
            Ok(devices) => table.replace_all(devices),
            Err(err) => warn!(
                root = %opts.root.display(),
                error = %err,
                "failed to scan network devices"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn add_iface(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (attr, value) in attrs {
            fs::write(dir.join(attr), format!("{value}\n")).unwrap();
        }
    }

    fn host() -> TempDir {
        let root = tempfile::tempdir().unwrap();
        add_iface(
            root.path(),
            "lo",
            &[("ifindex", "1"), ("address", "00:00:00:00:00:00"), ("type", "772")],
        );
        add_iface(
            root.path(),
            "eth0",
            &[("ifindex", "2"), ("address", "00:11:22:33:44:55"), ("type", "1")],
        );
        add_iface(
            root.path(),
            "ipip0",
            &[("ifindex", "7"), ("address", "00:00:00:00"), ("type", "768")],
        );
        add_iface(root.path(), "wg0", &[("ifindex", "9"), ("type", "65534")]);
        root
    }

    #[test]
    fn parses_hardware_addresses() {
        assert_eq!(
            parse_hardware_addr("de:ad:be:ef:00:01\n"),
            vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]
        );
        assert_eq!(parse_hardware_addr("aa:bb:cc"), vec![0xaa, 0xbb, 0xcc]);
        assert!(parse_hardware_addr("").is_empty());
        assert!(parse_hardware_addr("zz:00").is_empty());
    }

    #[test]
    fn scan_skips_loopback_by_default() {
        let root = host();
        let devices = scan(root.path(), &Selection::default()).unwrap();

        let summary: Vec<(u32, &str, bool)> = devices
            .iter()
            .map(|d| (d.index, d.name.as_str(), d.selected))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "lo", false),
                (2, "eth0", true),
                (7, "ipip0", true),
                (9, "wg0", true),
            ]
        );
        assert_eq!(devices[1].hardware_addr, vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(devices[2].hardware_addr.len(), 4);
        assert!(devices[3].hardware_addr.is_empty());
    }

    #[test]
    fn named_selection_only_picks_listed_devices() {
        let root = host();
        let selection = Selection::from_names(["eth0", "wg0"]);
        let selected: Vec<u32> = scan(root.path(), &selection)
            .unwrap()
            .into_iter()
            .filter(|d| d.selected)
            .map(|d| d.index)
            .collect();
        assert_eq!(selected, vec![2, 9]);
        assert_eq!(
            Selection::from_names(Vec::<String>::new()),
            Selection::NonLoopback
        );
    }

    #[test]
    fn malformed_interface_is_skipped() {
        let root = host();
        add_iface(root.path(), "bad0", &[("ifindex", "nope")]);
        let indexes: Vec<u32> = scan(root.path(), &Selection::default())
            .unwrap()
            .iter()
            .map(|d| d.index)
            .collect();
        assert_eq!(indexes, vec![1, 2, 7, 9]);
    }

    #[test]
    fn plain_files_in_root_are_ignored() {
        let root = host();
        fs::write(root.path().join("bonding_masters"), "\n").unwrap();
        let devices = scan(root.path(), &Selection::default()).unwrap();
        assert_eq!(devices.len(), 4);
        assert!(devices.iter().all(|d| d.name != "bonding_masters"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let err = scan(&root.path().join("absent"), &Selection::default()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn feeder_fills_table_and_stops() {
        let root = host();
        let table = DeviceTable::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let opts = FeederOptions {
            root: root.path().to_path_buf(),
            interval: Duration::from_millis(10),
            ..FeederOptions::default()
        };
        let handle = tokio::spawn(run_feeder(table.clone(), opts, stop_rx));

        let (_, mut watch) = table.selected();
        time::timeout(Duration::from_secs(5), watch.changed())
            .await
            .unwrap();
        let (devices, _) = table.selected();
        assert_eq!(devices.len(), 3);

        stop_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), SyncError::Cancelled);
    }
}
