//! Keeps the devices map converged with the selected devices.
//!
//! Every pass rebuilds the desired state from a fresh snapshot of the
//! [`DeviceTable`], upserts all of it and deletes whatever else is in the
//! map. Failed writes are logged and picked up again by the next pass, which
//! runs on the next table change, on the periodic resync tick, or not at all
//! once the stop signal fires.

use std::{collections::BTreeMap, time::Duration};

use devices_map_common::DeviceState;
use tokio::{
    sync::watch,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    devices::{Device, DeviceTable, DeviceWatch},
    error::{MapError, SyncError},
    map::DevicesMap,
    rate::Limiter,
};

pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MIN_PASS_INTERVAL: Duration = Duration::from_millis(50);

// tokio intervals reject a zero period.
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Loop timing. Zero durations are raised to one millisecond.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncConfig {
    /// Full resync period when the device table is quiet.
    pub resync_interval: Duration,
    /// Minimum spacing between two passes.
    pub min_pass_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            min_pass_interval: DEFAULT_MIN_PASS_INTERVAL,
        }
    }
}

/// Target contents of the map, keyed by ifindex.
pub type DesiredState = BTreeMap<u32, DeviceState>;

pub fn desired_state<'a, I>(devices: I) -> DesiredState
where
    I: IntoIterator<Item = &'a Device>,
{
    devices
        .into_iter()
        .map(|device| (device.index, DeviceState::new(&device.hardware_addr)))
        .collect()
}

/// What a single pass did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PassStats {
    pub upserted: usize,
    pub upsert_failures: usize,
    pub deleted: usize,
    pub delete_failures: usize,
    /// Stale keys that had already disappeared when deleted.
    pub already_absent: usize,
    pub iteration_failed: bool,
}

impl PassStats {
    pub fn failures(&self) -> usize {
        self.upsert_failures + self.delete_failures + usize::from(self.iteration_failed)
    }
}

/// Applies `desired` to `map`. Never stops early on a failed operation.
pub fn reconcile<M: DevicesMap>(map: &mut M, desired: &DesiredState) -> PassStats {
    let mut stats = PassStats::default();
    upsert_desired(map, desired, &mut stats);
    prune_stale(map, desired, &mut stats);
    stats
}

fn upsert_desired<M: DevicesMap>(map: &mut M, desired: &DesiredState, stats: &mut PassStats) {
    for (&ifindex, &state) in desired {
        match map.upsert(ifindex, state) {
            Ok(()) => stats.upserted += 1,
            Err(err) => {
                stats.upsert_failures += 1;
                warn!(ifindex, error = ?err, "failed to upsert device map entry");
            }
        }
    }
}

fn prune_stale<M: DevicesMap>(map: &mut M, desired: &DesiredState, stats: &mut PassStats) {
    let mut stale = Vec::new();
    let walk = map.for_each(|key, _| {
        if !desired.contains_key(&key.ifindex) {
            stale.push(key.ifindex);
        }
    });
    if let Err(err) = walk {
        stats.iteration_failed = true;
        warn!(error = ?err, "failed to iterate device map");
    }

    for ifindex in stale {
        match map.delete(ifindex) {
            Ok(()) => stats.deleted += 1,
            Err(MapError::NotFound { .. }) => {
                stats.already_absent += 1;
                debug!(ifindex, "stale device map entry already gone");
            }
            Err(err) => {
                stats.delete_failures += 1;
                warn!(ifindex, error = ?err, "failed to delete stale device map entry");
            }
        }
    }
}

/// Resolves when `stop` turns true or every sender is gone.
pub async fn stop_requested(stop: &mut watch::Receiver<bool>) -> SyncError {
    loop {
        if *stop.borrow_and_update() {
            return SyncError::Cancelled;
        }
        if stop.changed().await.is_err() {
            return SyncError::StopSignalClosed;
        }
    }
}

/// The sync loop together with the map it owns.
pub struct DevicesMapSync<M> {
    map: M,
    devices: DeviceTable,
    config: SyncConfig,
}

impl<M: DevicesMap> DevicesMapSync<M> {
    pub fn new(map: M, devices: DeviceTable, config: SyncConfig) -> Self {
        Self {
            map,
            devices,
            config,
        }
    }

    /// Runs one pass against the current table contents and returns the
    /// watch for changes made after the snapshot.
    pub fn sync_once(&mut self) -> (PassStats, DeviceWatch) {
        let (devices, watch) = self.devices.selected();
        let desired = desired_state(&devices);
        let stats = reconcile(&mut self.map, &desired);
        debug!(
            desired = desired.len(),
            upserted = stats.upserted,
            deleted = stats.deleted,
            failures = stats.failures(),
            "devices map sync pass done"
        );
        (stats, watch)
    }

    /// Runs passes until `stop` fires and returns why it stopped.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> SyncError {
        let mut limiter = Limiter::new(self.config.min_pass_interval.max(MIN_TIMER_PERIOD));
        let resync = self.config.resync_interval.max(MIN_TIMER_PERIOD);
        let mut ticker = time::interval_at(Instant::now() + resync, resync);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let (_, mut watch) = self.sync_once();

            tokio::select! {
                _ = watch.changed() => {}
                _ = ticker.tick() => {}
                reason = stop_requested(&mut stop) => return reason,
            }
            tokio::select! {
                _ = limiter.wait() => {}
                reason = stop_requested(&mut stop) => return reason,
            }
        }
    }
}
