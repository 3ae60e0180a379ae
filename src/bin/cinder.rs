/*!
 * cinder Server Main Entry Point
 *
 * Loads the server properties, builds the storage engine (replaying the AOF
 * when enabled), wraps it in the cluster layer when peers are configured and
 * serves clients until SIGINT or SIGTERM, which drain connections and flush
 * the AOF before exiting.
 */

use anyhow::{anyhow, Context, Result};
use cinder::{ClusterDatabase, Database, Server, ServerProperties, StandaloneDatabase};
use log::info;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CONFIG: &str = "redis.conf";

/// Properties from `$CONFIG`, else `./redis.conf` if present, else defaults
fn load_properties() -> Result<ServerProperties> {
    if let Some(path) = std::env::var_os("CONFIG") {
        return ServerProperties::load(&path)
            .with_context(|| format!("load config {}", Path::new(&path).display()));
    }
    if Path::new(DEFAULT_CONFIG).exists() {
        return ServerProperties::load(DEFAULT_CONFIG)
            .with_context(|| format!("load config {}", DEFAULT_CONFIG));
    }
    Ok(ServerProperties::default())
}

fn main() -> Result<()> {
    // Logging level comes from RUST_LOG, e.g. RUST_LOG=debug
    env_logger::init();

    let props = load_properties()?;

    let local: Arc<dyn Database> = Arc::new(StandaloneDatabase::new(&props)?);
    let db: Arc<dyn Database> = if props.is_cluster() {
        Arc::new(ClusterDatabase::new(&props, local)?)
    } else {
        local
    };

    let addr = props
        .addr()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("cannot resolve {}", props.addr()))?;
    let server = Server::bind(addr, db, props.max_clients)?;

    let stop = server.shutdown_handle()?;
    ctrlc::set_handler(move || {
        info!("signal received, shutting down");
        stop.shutdown();
    })
    .context("install signal handler")?;

    println!("cinder running on {}", addr);

    // Blocks until shut down
    server.run()
}
