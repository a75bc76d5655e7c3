use std::{collections::HashMap, net::Ipv4Addr, path::PathBuf, sync::Arc};

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core::dns::NameService;
use crate::core::error::{PluginError, Result};
use crate::core::msg::*;
use crate::core::network::{Allocator, Attacher, IpCidr, VethPair, GUEST_DST_PREFIX};
use crate::core::watcher::WatchedNetworks;

pub const SCOPE_GLOBAL: &str = "global";

#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    /// Advertised to containers on join, when set.
    pub nameserver: Option<Ipv4Addr>,
    pub resolv_conf_path: Option<PathBuf>,
    /// Domain whose containers get registered with the name service.
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Joined(VethPair),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub address: IpCidr,
    pub state: EndpointState,
}

#[derive(Debug)]
struct Network {
    id: String,
    endpoints: HashMap<String, Endpoint>,
}

/// The single-network lifecycle. Every protocol call lands here.
pub struct Driver {
    network: Mutex<Option<Network>>,
    /// Serializes calls per endpoint, held across remote calls.
    endpoint_locks: DashMap<String, Arc<Mutex<()>>>,
    watched: WatchedNetworks,
    allocator: Arc<dyn Allocator>,
    names: Arc<dyn NameService>,
    attacher: Attacher,
    config: DriverConfig,
}

impl Driver {
    pub fn new(
        allocator: Arc<dyn Allocator>,
        names: Arc<dyn NameService>,
        attacher: Attacher,
        watched: WatchedNetworks,
        config: DriverConfig,
    ) -> Self {
        Driver {
            network: Mutex::new(None),
            endpoint_locks: DashMap::new(),
            watched,
            allocator,
            names,
            attacher,
            config,
        }
    }

    pub async fn network_id(&self) -> Option<String> {
        self.network.lock().await.as_ref().map(|n| n.id.clone())
    }

    pub async fn endpoint(&self, endpoint_id: &str) -> Option<Endpoint> {
        self.network
            .lock()
            .await
            .as_ref()
            .and_then(|n| n.endpoints.get(endpoint_id).cloned())
    }

    pub fn capabilities(&self) -> CapabilitiesResponse {
        CapabilitiesResponse {
            scope: SCOPE_GLOBAL.to_string(),
        }
    }

    pub async fn create_network(&self, req: NetworkRequest) -> Result<EmptyResponse> {
        debug!("[Driver]: CreateNetwork {:?}", req);

        let mut network = self.network.lock().await;
        if let Some(existing) = network.as_ref() {
            return Err(PluginError::conflict(format!(
                "You get just one network, and you already made {}",
                existing.id
            )));
        }

        *network = Some(Network {
            id: req.network_id.clone(),
            endpoints: HashMap::new(),
        });
        self.watched.watch(&req.network_id);

        info!("[Driver]: Create network {}", req.network_id);
        Ok(EmptyResponse {})
    }

    pub async fn delete_network(&self, req: NetworkRequest) -> Result<EmptyResponse> {
        debug!("[Driver]: DeleteNetwork {:?}", req);

        let orphans = {
            let mut network = self.network.lock().await;
            match network.as_ref() {
                Some(n) if n.id == req.network_id => {}
                _ => {
                    return Err(PluginError::not_found(format!(
                        "Network {} not found",
                        req.network_id
                    )))
                }
            }
            network
                .take()
                .map(|n| n.endpoints)
                .unwrap_or_default()
        };
        self.watched.unwatch(&req.network_id);
        info!("[Driver]: Destroy network {}", req.network_id);

        for (id, endpoint) in orphans {
            warn!(
                "[Driver]: Tearing down endpoint {} left on network {}",
                id, req.network_id
            );
            let _guard = self.lock_endpoint(&id).await;
            self.teardown(&id, Some(&endpoint)).await;
        }

        Ok(EmptyResponse {})
    }

    pub async fn create_endpoint(
        &self,
        req: CreateEndpointRequest,
    ) -> Result<CreateEndpointResponse> {
        debug!("[Driver]: CreateEndpoint {:?}", req);
        let _guard = self.lock_endpoint(&req.endpoint_id).await;

        {
            let network = self.network.lock().await;
            let network = active(&network, &req.network_id)?;
            if network.endpoints.contains_key(&req.endpoint_id) {
                return Err(PluginError::conflict(format!(
                    "Endpoint {} already exists",
                    req.endpoint_id
                )));
            }
        }

        let address = self.allocator.allocate(&req.endpoint_id).await?;

        let inserted = {
            let mut network = self.network.lock().await;
            match network.as_mut() {
                Some(n) if n.id == req.network_id => {
                    n.endpoints.insert(
                        req.endpoint_id.clone(),
                        Endpoint {
                            id: req.endpoint_id.clone(),
                            address,
                            state: EndpointState::Created,
                        },
                    );
                    true
                }
                _ => false,
            }
        };
        if !inserted {
            // Network went away while the peer was allocating.
            if let Err(e) = self.allocator.release(&req.endpoint_id).await {
                warn!("[Driver]: {}", e);
            }
            return Err(PluginError::not_found(format!(
                "No such network {}",
                req.network_id
            )));
        }

        self.register_name(&req, address).await;

        info!(
            "[Driver]: Create endpoint {} with address {}",
            req.endpoint_id, address
        );
        Ok(CreateEndpointResponse {
            interfaces: vec![EndpointInterface {
                address: address.to_string(),
                mac_address: address.mac().to_string(),
            }],
        })
    }

    /// Registers `<hostname>.<domain>` when the engine asked for our domain.
    async fn register_name(&self, req: &CreateEndpointRequest, address: IpCidr) {
        if req.option_str(DOMAINNAME_OPTION) != Some(self.config.domain.as_str()) {
            return;
        }
        let Some(hostname) = req.option_str(HOSTNAME_OPTION).filter(|h| !h.is_empty()) else {
            return;
        };

        let fqdn = format!("{}.{}", hostname, self.config.domain);
        match self
            .names
            .register(&req.endpoint_id, &fqdn, address.addr)
            .await
        {
            Ok(()) => info!("[Driver]: Registered {} as {}", req.endpoint_id, fqdn),
            Err(e) => warn!("[Driver]: {}", e),
        }
    }

    /// Never fails; cleanup errors are only logged.
    pub async fn delete_endpoint(&self, req: EndpointRequest) -> EmptyResponse {
        debug!("[Driver]: DeleteEndpoint {:?}", req);
        let guard = self.lock_endpoint(&req.endpoint_id).await;

        let known = {
            let mut network = self.network.lock().await;
            match network.as_mut() {
                Some(n) if n.id == req.network_id => n.endpoints.remove(&req.endpoint_id),
                _ => {
                    warn!(
                        "[Driver]: Delete endpoint {} on unknown network {}",
                        req.endpoint_id, req.network_id
                    );
                    None
                }
            }
        };

        self.teardown(&req.endpoint_id, known.as_ref()).await;
        drop(guard);

        info!("[Driver]: Delete endpoint {}", req.endpoint_id);
        EmptyResponse {}
    }

    pub fn endpoint_info(&self, req: EndpointRequest) -> EndpointInfoResponse {
        debug!("[Driver]: EndpointOperInfo {:?}", req);
        EndpointInfoResponse::default()
    }

    pub async fn join(&self, req: JoinRequest) -> Result<JoinResponse> {
        debug!("[Driver]: Join {:?}", req);
        let _guard = self.lock_endpoint(&req.endpoint_id).await;

        {
            let network = self.network.lock().await;
            let network = active(&network, &req.network_id)?;
            match network.endpoints.get(&req.endpoint_id) {
                None => {
                    return Err(PluginError::not_found(format!(
                        "No such endpoint {}",
                        req.endpoint_id
                    )))
                }
                Some(Endpoint {
                    state: EndpointState::Joined(_),
                    ..
                }) => {
                    return Err(PluginError::conflict(format!(
                        "Endpoint {} already joined",
                        req.endpoint_id
                    )))
                }
                Some(_) => {}
            }
        }

        let pair = self.attacher.attach(&req.endpoint_id).await?;

        let recorded = {
            let mut network = self.network.lock().await;
            match network
                .as_mut()
                .filter(|n| n.id == req.network_id)
                .and_then(|n| n.endpoints.get_mut(&req.endpoint_id))
            {
                Some(endpoint) => {
                    endpoint.state = EndpointState::Joined(pair.clone());
                    true
                }
                None => false,
            }
        };
        if !recorded {
            if let Err(e) = self.attacher.detach(&req.endpoint_id).await {
                warn!("[Driver]: {}", e);
            }
            return Err(PluginError::not_found(format!(
                "No such network {}",
                req.network_id
            )));
        }

        info!(
            "[Driver]: Join endpoint {} (sandbox {})",
            req.endpoint_id, req.sandbox_key
        );
        Ok(self.join_response(pair))
    }

    fn join_response(&self, pair: VethPair) -> JoinResponse {
        let mut resp = JoinResponse {
            interface_names: vec![InterfaceName {
                src_name: pair.guest,
                dst_prefix: GUEST_DST_PREFIX.to_string(),
            }],
            static_routes: None,
            resolv_conf_path: None,
        };

        if let Some(nameserver) = self.config.nameserver {
            resp.static_routes = Some(vec![StaticRoute {
                destination: format!("{}/32", nameserver),
                route_type: ROUTE_CONNECTED,
                next_hop: String::new(),
            }]);
            resp.resolv_conf_path = self
                .config
                .resolv_conf_path
                .as_ref()
                .map(|p| p.display().to_string());
        }

        resp
    }

    /// Never fails; a missing pair is only logged.
    pub async fn leave(&self, req: EndpointRequest) -> EmptyResponse {
        debug!("[Driver]: Leave {:?}", req);
        let _guard = self.lock_endpoint(&req.endpoint_id).await;

        if let Err(e) = self.attacher.detach(&req.endpoint_id).await {
            warn!("[Driver]: {}", e);
        }

        let mut network = self.network.lock().await;
        if let Some(endpoint) = network
            .as_mut()
            .filter(|n| n.id == req.network_id)
            .and_then(|n| n.endpoints.get_mut(&req.endpoint_id))
        {
            endpoint.state = EndpointState::Created;
        }

        info!("[Driver]: Leave endpoint {}", req.endpoint_id);
        EmptyResponse {}
    }

    /// Best-effort removal of everything an endpoint holds: its veth pair,
    /// its name and its address. `known` is `None` when the record is gone,
    /// in which case the address is asked of the allocation peer.
    async fn teardown(&self, endpoint_id: &str, known: Option<&Endpoint>) {
        if let Some(Endpoint {
            state: EndpointState::Joined(_),
            ..
        }) = known
        {
            if let Err(e) = self.attacher.detach(endpoint_id).await {
                warn!("[Driver]: {}", e);
            }
        }

        let address = match known {
            Some(endpoint) => Some(endpoint.address),
            None => match self.allocator.lookup(endpoint_id).await {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!("[Driver]: {}", e);
                    None
                }
            },
        };

        if let Some(address) = address {
            if let Err(e) = self.names.deregister(endpoint_id, address.addr).await {
                warn!("[Driver]: {}", e);
            }
        }

        if let Err(e) = self.allocator.release(endpoint_id).await {
            warn!("[Driver]: {}", e);
        }
    }

    async fn lock_endpoint(&self, endpoint_id: &str) -> EndpointGuard<'_> {
        let lock = self
            .endpoint_locks
            .entry(endpoint_id.to_string())
            .or_default()
            .clone();

        EndpointGuard {
            locks: &self.endpoint_locks,
            endpoint_id: endpoint_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

/// Holds an endpoint's lock. On release the lock's map entry is dropped
/// unless another call is waiting on it.
struct EndpointGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    endpoint_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EndpointGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.endpoint_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn active<'a>(network: &'a Option<Network>, network_id: &str) -> Result<&'a Network> {
    network
        .as_ref()
        .filter(|n| n.id == network_id)
        .ok_or_else(|| PluginError::not_found(format!("No such network {}", network_id)))
}
