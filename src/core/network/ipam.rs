use async_trait::async_trait;
use log::debug;
#[cfg(test)]
use mockall::automock;
use reqwest::{Client, Method, StatusCode, Url};

use super::addr::IpCidr;
use crate::core::error::{PeerFailure, PluginError, Result};
use crate::core::peer;

/// Address allocation, keyed by endpoint id. The peer is authoritative; no
/// allocation state lives on this side.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Allocator: Send + Sync {
    /// Returns the address for `endpoint_id`, allocating a fresh one if necessary.
    async fn allocate(&self, endpoint_id: &str) -> Result<IpCidr>;

    /// Returns the address already allocated to `endpoint_id`.
    async fn lookup(&self, endpoint_id: &str) -> Result<IpCidr>;

    /// Releases the address held by `endpoint_id`.
    async fn release(&self, endpoint_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpamOp {
    Allocate,
    Lookup,
    Release,
}

impl IpamOp {
    fn method(self) -> Method {
        match self {
            IpamOp::Allocate => Method::POST,
            IpamOp::Lookup => Method::GET,
            IpamOp::Release => Method::DELETE,
        }
    }

    fn failure(self, endpoint_id: &str, reason: PeerFailure) -> PluginError {
        let endpoint_id = endpoint_id.to_string();

        match self {
            IpamOp::Allocate => PluginError::AllocationFailed {
                endpoint_id,
                reason,
            },
            IpamOp::Lookup => PluginError::LookupFailed {
                endpoint_id,
                reason,
            },
            IpamOp::Release => PluginError::ReleaseFailed {
                endpoint_id,
                reason,
            },
        }
    }
}

/// Client of the allocation peer's `/ip/{id}` resource.
#[derive(Debug, Clone)]
pub struct HttpAllocator {
    client: Client,
    base_url: Url,
}

impl HttpAllocator {
    pub fn new(client: Client, base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client,
            base_url: peer::base_url(base_url)?,
        })
    }

    async fn ipam_op(&self, endpoint_id: &str, op: IpamOp) -> Result<Option<IpCidr>> {
        let url = peer::resource(&self.base_url, &["ip", endpoint_id]);
        debug!("[IPAM]: {} {}", op.method(), url);

        let res = self
            .client
            .request(op.method(), url)
            .send()
            .await
            .map_err(|e| op.failure(endpoint_id, PeerFailure::transport(&e)))?;

        let status = res.status();
        if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
            return Err(op.failure(endpoint_id, PeerFailure::Status(status.as_u16())));
        }

        if op == IpamOp::Release {
            return Ok(None);
        }

        let body = res
            .text()
            .await
            .map_err(|e| op.failure(endpoint_id, PeerFailure::transport(&e)))?;

        body.parse::<IpCidr>()
            .map(Some)
            .map_err(|_| op.failure(endpoint_id, PeerFailure::Malformed(body.clone())))
    }

    async fn address_op(&self, endpoint_id: &str, op: IpamOp) -> Result<IpCidr> {
        self.ipam_op(endpoint_id, op)
            .await?
            .ok_or_else(|| op.failure(endpoint_id, PeerFailure::Malformed(String::new())))
    }
}

#[async_trait]
impl Allocator for HttpAllocator {
    async fn allocate(&self, endpoint_id: &str) -> Result<IpCidr> {
        self.address_op(endpoint_id, IpamOp::Allocate).await
    }

    async fn lookup(&self, endpoint_id: &str) -> Result<IpCidr> {
        self.address_op(endpoint_id, IpamOp::Lookup).await
    }

    async fn release(&self, endpoint_id: &str) -> Result<()> {
        self.ipam_op(endpoint_id, IpamOp::Release).await.map(|_| ())
    }
}
