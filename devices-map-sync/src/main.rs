use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tokio::{signal, sync::watch};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use devices_map_common::{DEVICES_MAP_MAX_ENTRIES, DeviceState};
use devices_map_sync::{
    DeviceTable, DevicesMap, DevicesMapSync, MapError, MapOptions, PinnedDevicesMap, SyncConfig,
    sync::{DEFAULT_MIN_PASS_INTERVAL, DEFAULT_RESYNC_INTERVAL},
    sysfs::{self, FeederOptions, Selection},
};

#[derive(Parser)]
#[command(name = "devices-map-sync")]
#[command(about = "Keeps the cilium_devices BPF map in sync with host devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open or create the map and keep it in sync until Ctrl+C
    Sync(SyncCommand),
    /// Print every map entry as JSON
    Dump(MapArgs),
    /// Print the entry for one interface as JSON
    Get(GetCommand),
}

#[derive(Args)]
struct MapArgs {
    /// Path of the pinned map in bpffs
    #[arg(long, value_name = "PATH", default_value_os_t = MapOptions::default().pin_path)]
    pin_path: PathBuf,
}

#[derive(Args)]
struct SyncCommand {
    #[command(flatten)]
    map: MapArgs,
    /// Capacity used when the map has to be created
    #[arg(long, value_name = "COUNT", default_value_t = DEVICES_MAP_MAX_ENTRIES)]
    max_entries: u32,
    /// Interfaces to select; every non-loopback interface if omitted
    #[arg(long, value_name = "IFACE", value_delimiter = ',')]
    devices: Vec<String>,
    /// Directory listing the host's network interfaces
    #[arg(long, value_name = "DIR", default_value = sysfs::DEFAULT_SYSFS_NET)]
    sysfs_root: PathBuf,
    /// Seconds between device rescans
    #[arg(long, default_value_t = sysfs::DEFAULT_SCAN_INTERVAL.as_secs())]
    scan_interval_secs: u64,
    /// Seconds between full resyncs when nothing changes
    #[arg(long, default_value_t = DEFAULT_RESYNC_INTERVAL.as_secs())]
    resync_interval_secs: u64,
    /// Minimum milliseconds between two sync passes
    #[arg(long, value_name = "MILLIS", default_value_t = DEFAULT_MIN_PASS_INTERVAL.as_millis() as u64)]
    min_pass_interval_ms: u64,
}

#[derive(Args)]
struct GetCommand {
    #[command(flatten)]
    map: MapArgs,
    /// Interface index to look up
    #[arg(long)]
    ifindex: u32,
}

#[derive(Debug, Serialize)]
struct EntryView {
    ifindex: u32,
    mac: String,
    l3: bool,
}

impl EntryView {
    fn new(ifindex: u32, state: &DeviceState) -> Self {
        let mac = state
            .mac()
            .iter()
            .map(|octet| format!("{octet:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        Self {
            ifindex,
            mac,
            l3: state.is_l3(),
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("devices-map-sync error: {err:?}");
        exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Sync(cmd)) => run_sync(cmd).await?,
        Some(Commands::Dump(args)) => {
            let map = PinnedDevicesMap::open(&args.pin_path)?;
            println!("{}", serde_json::to_string_pretty(&dump(&map)?)?);
        }
        Some(Commands::Get(cmd)) => {
            let map = PinnedDevicesMap::open(&cmd.map.pin_path)?;
            let state = match map.lookup(cmd.ifindex) {
                Ok(state) => state,
                Err(MapError::NotFound { ifindex }) => {
                    return Err(anyhow!("ifindex {ifindex} not found"));
                }
                Err(err) => return Err(err.into()),
            };
            let view = EntryView::new(cmd.ifindex, &state);
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn dump<M: DevicesMap>(map: &M) -> Result<Vec<EntryView>> {
    let mut entries = Vec::new();
    map.for_each(|key, state| entries.push(EntryView::new(key.ifindex, state)))
        .context("failed to walk devices map")?;
    entries.sort_by_key(|entry| entry.ifindex);
    Ok(entries)
}

fn validate_sync_command(cmd: &SyncCommand) -> Result<()> {
    ensure!(cmd.max_entries > 0, "max entries must be greater than zero");
    ensure!(
        cmd.scan_interval_secs > 0,
        "scan interval must be greater than zero"
    );
    ensure!(
        cmd.resync_interval_secs > 0,
        "resync interval must be greater than zero"
    );
    ensure!(
        cmd.min_pass_interval_ms > 0,
        "min pass interval must be greater than zero"
    );
    Ok(())
}

async fn run_sync(cmd: SyncCommand) -> Result<()> {
    validate_sync_command(&cmd)?;

    let map = PinnedDevicesMap::open_or_create(&MapOptions {
        pin_path: cmd.map.pin_path.clone(),
        max_entries: cmd.max_entries,
    })?;

    let table = DeviceTable::new();
    let (stop_tx, stop_rx) = watch::channel(false);

    let feeder = tokio::spawn(sysfs::run_feeder(
        table.clone(),
        FeederOptions {
            root: cmd.sysfs_root,
            selection: Selection::from_names(cmd.devices),
            interval: Duration::from_secs(cmd.scan_interval_secs),
        },
        stop_rx.clone(),
    ));

    let config = SyncConfig {
        resync_interval: Duration::from_secs(cmd.resync_interval_secs),
        min_pass_interval: Duration::from_millis(cmd.min_pass_interval_ms),
    };
    info!(pin_path = %map.pin_path().display(), "syncing devices map, press Ctrl+C to stop");
    let sync = tokio::spawn(DevicesMapSync::new(map, table, config).run(stop_rx));
    signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;

    stop_tx.send(true).ok();
    let reason = sync.await.context("sync task panicked")?;
    feeder.await.context("feeder task panicked")?;
    info!(%reason, "devices map sync stopped");
    Ok(())
}
