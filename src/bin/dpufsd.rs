//! dpufs backend daemon.
//!
//! Hosts the file backend on a DPU (or any RDMA-capable machine): binds
//! the CM listener, preloads the metadata cache when configured, and runs
//! the polling loop until SIGINT/SIGTERM.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;

use dpufs::backend::run_backend;
use dpufs::cache::{preload_from_file, CacheTable};
use dpufs::config::BackendConfig;
use dpufs::server::signals::setup_signal_handlers;
use dpufs::service::memfs::MemFileService;

#[derive(Parser, Debug)]
#[command(name = "dpufsd", about = "dpufs backend daemon", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "dpufs.toml")]
    config: String,

    /// Override the listen address (ip:port)
    #[arg(long)]
    listen: Option<String>,

    /// Override the number of control session slots
    #[arg(long)]
    max_clients: Option<u32>,

    /// Override the number of buffer session slots
    #[arg(long)]
    max_buffs: Option<u32>,
}

fn main() {
    let args = Args::parse();

    let mut config = match BackendConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration ({e}), using defaults");
            BackendConfig::default()
        }
    };
    if let Some(listen) = args.listen {
        config.network.listen_addr = listen;
    }
    if let Some(max_clients) = args.max_clients {
        config.network.max_clients = max_clients;
    }
    if let Some(max_buffs) = args.max_buffs {
        config.network.max_buffs = max_buffs;
    }
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    }

    dpufs::logging::init_with_hostname(&config.node.log_level);
    tracing::info!("starting dpufs backend");
    tracing::info!(node = %config.node.node_id, listen = %config.network.listen_addr);

    let cache = match CacheTable::new(config.cache.bucket_count_power) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            tracing::error!("cache table init failed: {e}");
            std::process::exit(1);
        }
    };

    if let Some(path) = &config.cache.preload_path {
        match preload_from_file(&cache, path) {
            Ok(items) => tracing::info!(items, path = %path.display(), "cache preloaded"),
            Err(e) => {
                tracing::error!(path = %path.display(), "cache preload failed: {e}");
                std::process::exit(1);
            }
        }
    }

    let service = Arc::new(MemFileService::with_quota(
        cache.clone(),
        config.storage.quota_bytes,
    ));

    let stop = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(stop.clone());

    let result = run(&config, service, stop);
    if let Err(e) = result {
        tracing::error!("backend failed: {e}");
        std::process::exit(1);
    }
}

#[cfg(feature = "rdma")]
fn run(
    config: &BackendConfig,
    service: Arc<MemFileService>,
    stop: Arc<AtomicBool>,
) -> Result<(), dpufs::backend::BackendError> {
    let fabric = dpufs::rdma::verbs::VerbsFabric::new();
    run_backend(&fabric, config, service, stop)
}

#[cfg(not(feature = "rdma"))]
fn run(
    config: &BackendConfig,
    service: Arc<MemFileService>,
    stop: Arc<AtomicBool>,
) -> Result<(), dpufs::backend::BackendError> {
    // Without the verbs fabric the daemon can only serve in-process
    // loopback peers, which is useful for soak testing the pipeline.
    tracing::warn!("built without the `rdma` feature; serving loopback only");
    let fabric = dpufs::rdma::loopback::LoopbackFabric::new();
    run_backend(&fabric, config, service, stop)
}
