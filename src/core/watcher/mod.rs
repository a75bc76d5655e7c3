use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use dashmap::DashSet;
use futures::StreamExt;
use log::{debug, error, info, warn};

mod docker;

pub use docker::{
    ContainerConfig, ContainerEngine, ContainerInfo, DockerEngine, EndpointSettings, EngineEvent,
    EventActor, EventStream, NetworkSettings, DEFAULT_DOCKER_SOCKET,
};

#[cfg(test)]
pub use docker::MockContainerEngine;

use crate::core::dns::NameService;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How the watcher decides that a container belongs to it.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchScope {
    /// The container's domain matches the managed domain.
    #[default]
    Domain,
    /// As `Domain`, and the container is also attached to a watched network.
    Network,
}

/// Network ids whose containers the watcher tracks. Shared with the driver.
#[derive(Debug, Clone, Default)]
pub struct WatchedNetworks(Arc<DashSet<String>>);

impl WatchedNetworks {
    pub fn watch(&self, network_id: &str) {
        debug!("[Watcher]: Watch network {}", network_id);
        self.0.insert(network_id.to_string());
    }

    pub fn unwatch(&self, network_id: &str) {
        debug!("[Watcher]: Unwatch network {}", network_id);
        self.0.remove(network_id);
    }

    pub fn contains(&self, network_id: &str) -> bool {
        self.0.contains(network_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct Watcher {
    engine: Arc<dyn ContainerEngine>,
    names: Arc<dyn NameService>,
    networks: WatchedNetworks,
    domain: String,
    scope: WatchScope,
    retry_delay: Duration,
}

impl Watcher {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        names: Arc<dyn NameService>,
        networks: WatchedNetworks,
        domain: &str,
        scope: WatchScope,
    ) -> Self {
        Watcher {
            engine,
            names,
            networks,
            domain: domain.to_string(),
            scope,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Delay before the first resubscribe attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Consumes the engine's event feed, resubscribing whenever the
    /// subscription fails or the feed ends. Never returns.
    pub async fn run(self) {
        let mut delay = self.retry_delay;
        loop {
            match self.engine.events().await {
                Ok(events) => {
                    info!("[Watcher]: Watching container events for domain {}", self.domain);
                    delay = self.retry_delay;
                    self.consume(events).await;
                    warn!("[Watcher]: Engine event stream ended");
                }
                Err(e) => {
                    error!("[Watcher]: Unable to subscribe to engine events: {:#}", e);
                }
            }

            debug!("[Watcher]: Resubscribing in {:?}", delay);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    async fn consume(&self, mut events: EventStream) {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.handle_event(&event).await,
                Err(e) => warn!("[Watcher]: Bad event from engine: {:#}", e),
            }
        }
    }

    pub async fn handle_event(&self, event: &EngineEvent) {
        if !event.is_container() {
            return;
        }

        match event.action() {
            "start" => self.container_started(event.container_id()).await,
            "die" => self.container_died(event.container_id()).await,
            _ => {}
        }
    }

    pub async fn container_started(&self, id: &str) {
        debug!("[Watcher]: Container started {}", id);

        let Some((fqdn, addr)) = self.relevant(id).await else {
            return;
        };

        match self.names.register(id, &fqdn, addr).await {
            Ok(()) => info!("[Watcher]: Registered {} as {} ({})", id, fqdn, addr),
            Err(e) => warn!("[Watcher]: Unable to register {} with nameserver: {}", id, e),
        }
    }

    pub async fn container_died(&self, id: &str) {
        debug!("[Watcher]: Container died {}", id);

        let Some((fqdn, addr)) = self.relevant(id).await else {
            return;
        };

        match self.names.deregister(id, addr).await {
            Ok(()) => info!("[Watcher]: Deregistered {} ({})", fqdn, addr),
            Err(e) => warn!("[Watcher]: Unable to deregister {} with nameserver: {}", id, e),
        }
    }

    /// Inspects the container and returns its name and address when it is
    /// one of ours.
    async fn relevant(&self, id: &str) -> Option<(String, Ipv4Addr)> {
        let info = match self.engine.inspect(id).await {
            Ok(info) => info,
            Err(e) => {
                warn!("[Watcher]: Error inspecting container {}: {:#}", id, e);
                return None;
            }
        };

        if info.config.domainname != self.domain {
            return None;
        }

        let address = match self.scope {
            WatchScope::Domain => {
                let settings = &info.network_settings;
                if settings.ip_address.is_empty() {
                    settings
                        .networks
                        .values()
                        .map(|net| net.ip_address.as_str())
                        .find(|ip| !ip.is_empty())
                        .unwrap_or_default()
                } else {
                    settings.ip_address.as_str()
                }
            }
            WatchScope::Network => {
                let Some(net) = info
                    .network_settings
                    .networks
                    .values()
                    .find(|net| self.networks.contains(&net.network_id))
                else {
                    debug!("[Watcher]: Container {} is on no watched network", id);
                    return None;
                };
                net.ip_address.as_str()
            }
        };

        let addr = match address.parse::<Ipv4Addr>() {
            Ok(addr) => addr,
            Err(_) => {
                warn!(
                    "[Watcher]: Container {} has no usable address ({:?})",
                    id, address
                );
                return None;
            }
        };

        let fqdn = format!("{}.{}", info.config.hostname, info.config.domainname);
        Some((fqdn, addr))
    }
}
