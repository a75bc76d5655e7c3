use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
#[cfg(test)]
use mockall::automock;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};

/// What a forwarding device turned out to be once looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// Native Linux bridge; ports attach by setting it as master.
    Bridge,
    /// Generic device backed by a software datapath; ports are added to it.
    Datapath,
    /// Any other link type. Never attached to.
    Unknown(String),
}

impl DeviceKind {
    /// Classifies a device by its rtnetlink `IFLA_INFO_KIND`.
    pub fn classify(kind: Option<&str>) -> Self {
        match kind {
            Some("bridge") => DeviceKind::Bridge,
            None | Some("openvswitch") => DeviceKind::Datapath,
            Some(other) => DeviceKind::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mtu: Option<u32>,
    pub kind: DeviceKind,
}

/// Kernel link operations used by the attachment engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Looks a link up by name; `Ok(None)` when no such link exists.
    async fn link_by_name(&self, name: &str) -> anyhow::Result<Option<Link>>;

    async fn add_veth(&self, host: &str, guest: &str) -> anyhow::Result<()>;

    async fn set_mtu(&self, name: &str, mtu: u32) -> anyhow::Result<()>;

    async fn set_master(&self, name: &str, master_index: u32) -> anyhow::Result<()>;

    async fn add_to_datapath(&self, datapath: &str, name: &str) -> anyhow::Result<()>;

    async fn set_up(&self, name: &str) -> anyhow::Result<()>;

    /// Deletes a link. Deleting one end of a veth removes its peer as well.
    async fn delete(&self, name: &str) -> anyhow::Result<()>;
}

/// `LinkOps` backed by an rtnetlink socket.
pub struct NetlinkLinks {
    handle: rtnetlink::Handle,
}

impl NetlinkLinks {
    /// Opens the netlink connection. Must be called from within a tokio runtime.
    pub fn new() -> anyhow::Result<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("Failed to open netlink socket")?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }

    async fn get_link_by_name(&self, name: &str) -> anyhow::Result<Option<LinkMessage>> {
        // Walk the full dump: a by-name request reports a missing link as an
        // errno, which cannot be told apart from a real failure.
        let mut links = self.handle.link().get().execute();
        while let Some(link) = links.try_next().await? {
            if link_name(&link) == Some(name) {
                return Ok(Some(link));
            }
        }

        Ok(None)
    }

    async fn require_index(&self, name: &str) -> anyhow::Result<u32> {
        self.get_link_by_name(name)
            .await?
            .map(|link| link.header.index)
            .ok_or(anyhow::anyhow!("Link {} not found", name))
    }
}

#[async_trait]
impl LinkOps for NetlinkLinks {
    async fn link_by_name(&self, name: &str) -> anyhow::Result<Option<Link>> {
        Ok(self.get_link_by_name(name).await?.map(|link| Link {
            index: link.header.index,
            name: name.to_string(),
            mtu: link_mtu(&link),
            kind: DeviceKind::classify(link_kind(&link).as_deref()),
        }))
    }

    async fn add_veth(&self, host: &str, guest: &str) -> anyhow::Result<()> {
        self.handle
            .link()
            .add()
            .veth(host.to_string(), guest.to_string())
            .execute()
            .await?;

        Ok(())
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> anyhow::Result<()> {
        let index = self.require_index(name).await?;
        self.handle.link().set(index).mtu(mtu).execute().await?;

        Ok(())
    }

    async fn set_master(&self, name: &str, master_index: u32) -> anyhow::Result<()> {
        let index = self.require_index(name).await?;
        self.handle
            .link()
            .set(index)
            .controller(master_index)
            .execute()
            .await?;

        Ok(())
    }

    async fn add_to_datapath(&self, datapath: &str, name: &str) -> anyhow::Result<()> {
        let output = tokio::process::Command::new("ovs-dpctl")
            .args(["add-if", datapath, name])
            .output()
            .await
            .context("Failed to execute `ovs-dpctl`")?;

        output.status.success().then_some(()).with_context(|| {
            format!(
                "`ovs-dpctl` exited with non-zero status: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )
        })
    }

    async fn set_up(&self, name: &str) -> anyhow::Result<()> {
        let index = self.require_index(name).await?;
        self.handle.link().set(index).up().execute().await?;

        Ok(())
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let index = self.require_index(name).await?;
        self.handle.link().del(index).execute().await?;

        Ok(())
    }
}

fn link_name(link: &LinkMessage) -> Option<&str> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

fn link_mtu(link: &LinkMessage) -> Option<u32> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Mtu(mtu) => Some(*mtu),
        _ => None,
    })
}

fn link_kind(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::LinkInfo(infos) => infos.iter().find_map(|info| match info {
            LinkInfo::Kind(InfoKind::Bridge) => Some("bridge".to_string()),
            LinkInfo::Kind(InfoKind::Other(kind)) => Some(kind.clone()),
            LinkInfo::Kind(kind) => Some(format!("{kind:?}").to_lowercase()),
            _ => None,
        }),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(Some("bridge"), DeviceKind::Bridge)]
    #[case(Some("openvswitch"), DeviceKind::Datapath)]
    #[case(None, DeviceKind::Datapath)]
    #[case(Some("veth"), DeviceKind::Unknown("veth".to_string()))]
    #[case(Some("vxlan"), DeviceKind::Unknown("vxlan".to_string()))]
    fn test_classify(#[case] kind: Option<&str>, #[case] expected: DeviceKind) {
        assert_eq!(DeviceKind::classify(kind), expected);
    }

    #[test]
    fn test_link_attributes() {
        let mut msg = LinkMessage::default();
        msg.header.index = 7;
        msg.attributes.push(LinkAttribute::IfName("weave".to_string()));
        msg.attributes.push(LinkAttribute::Mtu(1376));
        msg.attributes
            .push(LinkAttribute::LinkInfo(vec![LinkInfo::Kind(InfoKind::Bridge)]));

        assert_eq!(link_name(&msg), Some("weave"));
        assert_eq!(link_mtu(&msg), Some(1376));
        assert_eq!(
            DeviceKind::classify(link_kind(&msg).as_deref()),
            DeviceKind::Bridge
        );
    }

    #[test]
    fn test_generic_link_has_no_kind() {
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName("datapath".to_string()));

        assert_eq!(link_kind(&msg), None);
        assert_eq!(link_mtu(&msg), None);
    }
}
