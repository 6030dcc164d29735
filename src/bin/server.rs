//! hotrodkv Server Binary
//!
//! Starts a single-node Hot Rod server backed by in-memory caches.

use std::sync::Arc;

use clap::Parser;
use hotrodkv::network::Server;
use hotrodkv::{
    CacheConfiguration, CacheManager, ClusterView, Config, LocalCache, RequestProcessor, StaticClusterView,
    VersionTable,
};
use tracing_subscriber::{fmt, EnvFilter};

/// hotrodkv Server
#[derive(Parser, Debug)]
#[command(name = "hotrodkv-server")]
#[command(about = "Hot Rod protocol server for an in-memory cache")]
#[command(version)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:11222")]
    listen: String,

    /// Worker threads executing cache operations (default: available cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Name of the default cache
    #[arg(short = 'c', long, default_value = "default")]
    default_cache: String,

    /// Make the default cache transactional (pessimistic, repeatable read)
    #[arg(short, long)]
    transactional: bool,

    /// Name of this node
    #[arg(long, default_value = "node-1")]
    node_name: String,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hotrodkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("hotrodkv Server v{}", hotrodkv::VERSION);
    tracing::info!("Listen address: {}", args.listen);

    // Build config from args
    let mut builder = Config::builder()
        .listen_addr(&args.listen)
        .max_connections(args.max_connections)
        .default_cache_name(&args.default_cache)
        .node_name(&args.node_name);
    if let Some(workers) = args.workers {
        builder = builder.worker_threads(workers);
    }
    let config = builder.build();

    let cache_config = if args.transactional {
        CacheConfiguration::transactional()
    } else {
        CacheConfiguration::default()
    };
    let caches = Arc::new(CacheManager::new(config.default_cache_name.clone()));
    caches.register(Arc::new(LocalCache::new(config.default_cache_name.clone(), cache_config)));

    let cluster: Arc<dyn ClusterView> = Arc::new(StaticClusterView::new(config.node_name.as_str()));
    let processor = Arc::new(RequestProcessor::new(
        caches,
        cluster,
        Arc::new(VersionTable::standard()),
        &config,
    ));

    tracing::info!(
        "Cache '{}' ready (transactional: {}), {} workers",
        config.default_cache_name,
        args.transactional,
        config.worker_threads
    );

    // Start server
    let server = Server::new(config, processor);
    match server.start() {
        Ok(handle) => handle.wait(),
        Err(e) => {
            tracing::error!("Server error: {}", e);
            std::process::exit(1);
        }
    }

    tracing::info!("Server stopped");
}
