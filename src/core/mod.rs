use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use log::{info, warn};
use nix::unistd::Uid;

mod cmd;
mod dns;
mod driver;
mod error;
mod msg;
mod network;
mod peer;
mod server;
mod watcher;

pub use cmd::*;
pub use dns::{HttpNameService, NameService};
pub use driver::{Driver, DriverConfig, Endpoint, EndpointState};
pub use error::{PeerFailure, PluginError};
pub use msg::*;
pub use network::{
    Allocator, Attacher, DeviceKind, HttpAllocator, IpCidr, Link, LinkOps, MacAddr, NetlinkLinks,
    VethPair,
};
pub use server::{router, serve};
pub use watcher::{
    ContainerEngine, ContainerInfo, DockerEngine, EngineEvent, EventStream, WatchScope,
    WatchedNetworks, Watcher,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Writes a resolv.conf pointing containers at `nameserver`.
fn write_resolv_conf(path: &Path, nameserver: Ipv4Addr) -> anyhow::Result<PathBuf> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::write(path, format!("nameserver {}\n", nameserver))
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(path.to_path_buf())
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    info!("[Daemon]: netplugin {} starting", VERSION);
    if !Uid::effective().is_root() {
        warn!("[Daemon]: Not running as root; attaching endpoints will fail");
    }

    let resolv_conf_path = match config.nameserver {
        Some(nameserver) => Some(write_resolv_conf(&config.resolv_conf_path(), nameserver)?),
        None => None,
    };

    let client = reqwest::Client::builder()
        .timeout(config.peer_timeout)
        .build()
        .context("failed to build HTTP client")?;
    let allocator = Arc::new(HttpAllocator::new(client.clone(), &config.ipam_url)?);
    let names: Arc<dyn NameService> = Arc::new(HttpNameService::new(client, &config.dns_url)?);

    let links = Arc::new(NetlinkLinks::new()?);
    let attacher = Attacher::new(links, &config.device);
    let watched = WatchedNetworks::default();

    if config.no_watch {
        info!("[Daemon]: Container event watcher disabled");
    } else {
        let watcher = Watcher::new(
            Arc::new(DockerEngine::new(&config.docker_socket)),
            names.clone(),
            watched.clone(),
            &config.domain,
            config.watch_scope,
        );
        tokio::spawn(watcher.run());
    }

    let driver = Driver::new(
        allocator,
        names,
        attacher,
        watched,
        DriverConfig {
            nameserver: config.nameserver,
            resolv_conf_path,
            domain: config.domain.clone(),
        },
    );
    let app = router(Arc::new(driver), VERSION);

    let result = tokio::select! {
        res = server::run(&config.socket, app) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("[Daemon]: Interrupted");
            Ok(())
        }
    };

    if let Err(e) = std::fs::remove_file(&config.socket) {
        warn!(
            "[Daemon]: Failed to remove {}: {}",
            config.socket.display(),
            e
        );
    }
    info!("[Daemon]: Daemon is exiting");

    result
}

pub fn daemon(config: Config) {
    let env = env_logger::Env::default().default_filter_or(config.log_level());
    env_logger::Builder::from_env(env).init();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")
        .and_then(|runtime| runtime.block_on(run_daemon(config)));

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
