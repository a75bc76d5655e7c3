use std::net::Ipv4Addr;

use async_trait::async_trait;
use log::debug;
#[cfg(test)]
use mockall::automock;
use reqwest::{Client, Url};

use crate::core::error::{PeerFailure, PluginError, Result};
use crate::core::peer;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NameService: Send + Sync {
    /// Associates `fqdn` with `addr` on behalf of `id`.
    async fn register(&self, id: &str, fqdn: &str, addr: Ipv4Addr) -> Result<()>;

    /// Removes every name registered by `id` for `addr`.
    async fn deregister(&self, id: &str, addr: Ipv4Addr) -> Result<()>;
}

/// Client of the name-service peer's `/name/{id}/{address}` resource.
#[derive(Debug, Clone)]
pub struct HttpNameService {
    client: Client,
    base_url: Url,
}

impl HttpNameService {
    pub fn new(client: Client, base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client,
            base_url: peer::base_url(base_url)?,
        })
    }

    fn url(&self, id: &str, addr: Ipv4Addr) -> Url {
        let addr = addr.to_string();
        peer::resource(&self.base_url, &["name", id, addr.as_str()])
    }
}

#[async_trait]
impl NameService for HttpNameService {
    async fn register(&self, id: &str, fqdn: &str, addr: Ipv4Addr) -> Result<()> {
        let url = self.url(id, addr);
        debug!("[DNS]: PUT {} fqdn={}", url, fqdn);

        let res = self
            .client
            .put(url)
            .form(&[("fqdn", fqdn)])
            .send()
            .await
            .map_err(|e| PluginError::RegistrationFailed {
                fqdn: fqdn.to_string(),
                reason: PeerFailure::transport(&e),
            })?;

        if !res.status().is_success() {
            return Err(PluginError::RegistrationFailed {
                fqdn: fqdn.to_string(),
                reason: PeerFailure::Status(res.status().as_u16()),
            });
        }

        Ok(())
    }

    async fn deregister(&self, id: &str, addr: Ipv4Addr) -> Result<()> {
        let url = self.url(id, addr);
        debug!("[DNS]: DELETE {}", url);

        let res = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| PluginError::DeregistrationFailed {
                id: id.to_string(),
                reason: PeerFailure::transport(&e),
            })?;

        if !res.status().is_success() {
            return Err(PluginError::DeregistrationFailed {
                id: id.to_string(),
                reason: PeerFailure::Status(res.status().as_u16()),
            });
        }

        Ok(())
    }
}
