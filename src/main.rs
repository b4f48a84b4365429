mod settings;
mod startup;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use engine::{SledDataEngine, SledMetaEngine};
use raftstore::{CellDescriptor, Command, Epoch, PeerMeta, Store, StoreConfig};
use slog::Drain;
#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use crate::settings::Settings;
use crate::startup::{setup_logger, setup_panic_hook};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Starts a single store of the sharded key-value replica described by this
/// workspace: bootstraps one cell spanning the whole keyspace on this store
/// and drives its raft tick loop, optionally exercising a handful of puts
/// and reads against it for a smoke-test run.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a config file overriding the default `config/config.yaml`.
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// `key=value` pairs proposed against the bootstrap cell after startup.
    #[arg(long = "put", value_name = "KEY=VALUE")]
    puts: Vec<String>,

    /// Keys to read back (via a linearizable read) after the puts above are
    /// applied, logged at `info` level.
    #[arg(long = "get", value_name = "KEY")]
    gets: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::new(args.config.clone())?;

    setup_logger(&settings.log_level);
    setup_panic_hook();

    std::fs::create_dir_all(&settings.storage.path)?;
    let meta_engine = Arc::new(SledMetaEngine::open(settings.storage.path.join("meta"))?);
    let data_engine = Arc::new(SledDataEngine::open(settings.storage.path.join("data"))?);

    let apply_pool = Arc::new(raftstore::WorkerPool::new(
        "apply",
        settings.storage.max_apply_threads,
    )?);
    let snapshot_pool = Arc::new(raftstore::WorkerPool::new("snapshot", 1)?);

    // `raft` crate uses `slog` crate so it is needed to use `slog_stdlog::StdLog` to forward
    // logs from it to `log` crate
    let slog_logger = slog::Logger::root(slog_stdlog::StdLog.fuse(), slog::o!());

    let raft_base_config = raft::Config {
        election_tick: settings.raft.election_tick,
        heartbeat_tick: settings.raft.heartbeat_tick,
        ..Default::default()
    };

    let transport = raftstore::ChannelTransport::new();
    let pd_client = Arc::new(raftstore::LocalPdClient::new(settings.cluster.pd_first_free_id));

    let store = Store::new(StoreConfig {
        store_id: settings.store_id,
        raft_base_config,
        logger: slog_logger,
        meta_engine,
        data_engine,
        apply_scheduler: apply_pool,
        snapshot_scheduler: snapshot_pool,
        transport: transport.clone(),
        pd_client: pd_client.clone(),
    });

    let bootstrap_cell = CellDescriptor {
        id: 1,
        start_key: vec![],
        end_key: vec![],
        epoch: Epoch::default(),
        peers: vec![PeerMeta { id: 1, store_id: settings.store_id }],
    };
    store.bootstrap_cell(bootstrap_cell, 1)?;
    log::info!("store {} bootstrapped cell 1 covering the full keyspace", settings.store_id);

    for pair in &args.puts {
        let Some((key, value)) = pair.split_once('=') else {
            log::warn!("ignoring malformed --put {pair:?}, expected key=value");
            continue;
        };
        let mut rx = store.propose(1, Command::Put { key: key.into(), value: value.into() })?;
        match drain_ticks_until(&store, &transport, settings.store_id, &mut rx) {
            Some(_) => log::info!("put {key:?} applied"),
            None => log::warn!("put {key:?} never completed"),
        }
    }

    for key in &args.gets {
        let mut rx = store.propose_read(1, key.clone().into_bytes())?;
        match drain_ticks_until(&store, &transport, settings.store_id, &mut rx) {
            Some(raftstore::ReadCmdResult::Done(value)) => {
                log::info!("get {key:?} -> {:?}", value.map(|v| String::from_utf8_lossy(&v).into_owned()));
            }
            Some(raftstore::ReadCmdResult::Stale) => log::warn!("get {key:?} was serviced stale"),
            None => log::warn!("get {key:?} never completed"),
        }
    }

    let tick_interval = Duration::from_millis(settings.raft.tick_interval_ms);
    let split_check_ticks = settings.raft.split_check_ticks;
    let handle = thread::Builder::new().name("raft-tick".to_string()).spawn(move || {
        let mut tick_count: u64 = 0;
        loop {
            // Every message is routed to cell 1: this demo never splits, so
            // it never has more than one cell to route between. A real
            // command-dispatch front-end would track which cell each
            // message's source peer belongs to.
            for (_from, msg) in transport.drain(settings.store_id) {
                if let Err(e) = store.step(1, msg) {
                    log::warn!("step failed: {e}");
                }
            }
            store.on_tick();
            tick_count += 1;
            if tick_count % split_check_ticks == 0 {
                store.run_split_checks();
            }
            thread::sleep(tick_interval);
        }
    })?;

    handle.join().expect("raft tick thread panicked");
    Ok(())
}

/// Drains the in-memory transport loopback and ticks the store until `rx`
/// resolves, bounded so a demo run can't spin forever if a proposal is
/// silently dropped (e.g. lost leadership mid-flight).
fn drain_ticks_until<T>(
    store: &Arc<Store>,
    transport: &Arc<raftstore::ChannelTransport>,
    store_id: u64,
    rx: &mut tokio::sync::oneshot::Receiver<T>,
) -> Option<T> {
    for _ in 0..200 {
        for (_from, msg) in transport.drain(store_id) {
            if let Err(e) = store.step(1, msg) {
                log::warn!("step failed: {e}");
            }
        }
        store.on_tick();
        if let Ok(value) = rx.try_recv() {
            return Some(value);
        }
        thread::sleep(Duration::from_millis(10));
    }
    None
}
