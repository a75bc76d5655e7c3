use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::link::{DeviceKind, Link, LinkOps};
use crate::core::error::{PluginError, Result};

const HOST_PREFIX: &str = "vethwl";
const GUEST_PREFIX: &str = "vethwg";

/// Interface name prefix the engine gives the guest end inside the sandbox.
pub const GUEST_DST_PREFIX: &str = "ethwe";

/// Names of the two ends of an endpoint's veth pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub host: String,
    pub guest: String,
}

impl VethPair {
    /// Derives the pair from the first five characters of the endpoint id,
    /// keeping both names within the kernel's 15 byte limit.
    pub fn for_endpoint(endpoint_id: &str) -> Self {
        let suffix: String = endpoint_id.chars().take(5).collect();

        VethPair {
            host: format!("{HOST_PREFIX}{suffix}"),
            guest: format!("{GUEST_PREFIX}{suffix}"),
        }
    }
}

/// Wires endpoint veth pairs into the forwarding device.
pub struct Attacher {
    links: Arc<dyn LinkOps>,
    device: String,
    /// Device surgery on the forwarding device is serialized process-wide.
    lock: Mutex<()>,
}

impl Attacher {
    pub fn new(links: Arc<dyn LinkOps>, device: &str) -> Self {
        Attacher {
            links,
            device: device.to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Creates the endpoint's veth pair and attaches its host end to the
    /// forwarding device. On failure no part of the pair is left behind.
    pub async fn attach(&self, endpoint_id: &str) -> Result<VethPair> {
        let _guard = self.lock.lock().await;
        let pair = VethPair::for_endpoint(endpoint_id);

        let device = self
            .links
            .link_by_name(&self.device)
            .await
            .map_err(|e| PluginError::attachment("could not look up forwarding device", e))?
            .ok_or_else(|| PluginError::DeviceNotFound {
                name: self.device.clone(),
            })?;
        debug!("[Attach]: Forwarding device {:?}", device);

        self.links
            .add_veth(&pair.host, &pair.guest)
            .await
            .map_err(|e| PluginError::attachment("could not create veth pair", e))?;

        if let Err(e) = self.wire(&device, &pair).await {
            if let Err(cleanup) = self.links.delete(&pair.host).await {
                warn!(
                    "[Attach]: Failed to remove veth {} after error: {:#}",
                    pair.host, cleanup
                );
            }
            return Err(e);
        }

        info!(
            "[Attach]: Attached {} to {} ({} for the sandbox)",
            pair.host, self.device, pair.guest
        );
        Ok(pair)
    }

    async fn wire(&self, device: &Link, pair: &VethPair) -> Result<()> {
        if let Some(mtu) = device.mtu {
            for name in [&pair.host, &pair.guest] {
                self.links
                    .set_mtu(name, mtu)
                    .await
                    .map_err(|e| PluginError::attachment("could not set veth MTU", e))?;
            }
        }

        match &device.kind {
            DeviceKind::Bridge => self
                .links
                .set_master(&pair.host, device.index)
                .await
                .map_err(|e| PluginError::attachment("unable to attach veth to bridge", e))?,
            DeviceKind::Datapath => self
                .links
                .add_to_datapath(&device.name, &pair.guest)
                .await
                .map_err(|e| PluginError::attachment("unable to add veth to datapath", e))?,
            DeviceKind::Unknown(kind) => {
                return Err(PluginError::UnsupportedDeviceType {
                    name: device.name.clone(),
                    kind: kind.clone(),
                })
            }
        }

        self.links
            .set_up(&pair.host)
            .await
            .map_err(|e| PluginError::attachment("unable to bring veth up", e))
    }

    /// Removes the endpoint's veth pair.
    pub async fn detach(&self, endpoint_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let pair = VethPair::for_endpoint(endpoint_id);

        let present = self
            .links
            .link_by_name(&pair.host)
            .await
            .map_err(|e| PluginError::attachment("could not look up veth", e))?;
        if present.is_none() {
            return Err(PluginError::DeviceNotFound { name: pair.host });
        }

        self.links
            .delete(&pair.host)
            .await
            .map_err(|e| PluginError::attachment("unable to delete veth", e))?;

        info!("[Attach]: Removed {}", pair.host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::link::MockLinkOps;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn device(kind: DeviceKind, mtu: Option<u32>) -> Link {
        Link {
            index: 4,
            name: "weave".to_string(),
            mtu,
            kind,
        }
    }

    fn with_device(links: &mut MockLinkOps, dev: Option<Link>) {
        links
            .expect_link_by_name()
            .withf(|name| name == "weave")
            .returning(move |_| Ok(dev.clone()));
    }

    #[rstest]
    #[case("abcdef0123456789", "vethwlabcde", "vethwgabcde")]
    #[case("ab", "vethwlab", "vethwgab")]
    fn test_veth_names(#[case] id: &str, #[case] host: &str, #[case] guest: &str) {
        let pair = VethPair::for_endpoint(id);
        assert_eq!(pair.host, host);
        assert_eq!(pair.guest, guest);
        assert!(pair.host.len() <= 15);
    }

    #[tokio::test]
    async fn test_attach_to_bridge() {
        let mut links = MockLinkOps::new();
        let mut seq = Sequence::new();
        with_device(&mut links, Some(device(DeviceKind::Bridge, Some(1376))));

        links
            .expect_add_veth()
            .withf(|host, guest| host == "vethwlabcde" && guest == "vethwgabcde")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        links
            .expect_set_mtu()
            .withf(|name, mtu| name == "vethwlabcde" && *mtu == 1376)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        links
            .expect_set_mtu()
            .withf(|name, mtu| name == "vethwgabcde" && *mtu == 1376)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        links
            .expect_set_master()
            .withf(|name, master| name == "vethwlabcde" && *master == 4)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        links
            .expect_set_up()
            .withf(|name| name == "vethwlabcde")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        links.expect_delete().never();

        let attacher = Attacher::new(Arc::new(links), "weave");
        let pair = attacher.attach("abcdef0123").await.unwrap();

        assert_eq!(pair, VethPair::for_endpoint("abcdef0123"));
    }

    #[tokio::test]
    async fn test_attach_to_datapath() {
        let mut links = MockLinkOps::new();
        with_device(&mut links, Some(device(DeviceKind::Datapath, None)));

        links.expect_add_veth().times(1).returning(|_, _| Ok(()));
        links.expect_set_mtu().never();
        links.expect_set_master().never();
        links
            .expect_add_to_datapath()
            .withf(|dp, name| dp == "weave" && name == "vethwgabcde")
            .times(1)
            .returning(|_, _| Ok(()));
        links.expect_set_up().times(1).returning(|_| Ok(()));

        let attacher = Attacher::new(Arc::new(links), "weave");
        assert!(attacher.attach("abcdef").await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_device_creates_nothing() {
        let mut links = MockLinkOps::new();
        with_device(&mut links, None);
        links.expect_add_veth().never();
        links.expect_delete().never();

        let attacher = Attacher::new(Arc::new(links), "weave");
        let err = attacher.attach("abcdef").await.unwrap_err();

        assert!(matches!(err, PluginError::DeviceNotFound { ref name } if name == "weave"));
    }

    #[tokio::test]
    async fn test_unsupported_device_removes_pair() {
        let mut links = MockLinkOps::new();
        with_device(
            &mut links,
            Some(device(DeviceKind::Unknown("vxlan".to_string()), None)),
        );
        links.expect_add_veth().times(1).returning(|_, _| Ok(()));
        links
            .expect_delete()
            .withf(|name| name == "vethwlabcde")
            .times(1)
            .returning(|_| Ok(()));

        let attacher = Attacher::new(Arc::new(links), "weave");
        let err = attacher.attach("abcdef").await.unwrap_err();

        assert!(matches!(
            err,
            PluginError::UnsupportedDeviceType { ref kind, .. } if kind == "vxlan"
        ));
    }

    #[tokio::test]
    async fn test_failed_link_up_removes_pair() {
        let mut links = MockLinkOps::new();
        with_device(&mut links, Some(device(DeviceKind::Bridge, None)));
        links.expect_add_veth().times(1).returning(|_, _| Ok(()));
        links.expect_set_master().times(1).returning(|_, _| Ok(()));
        links
            .expect_set_up()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("operation not permitted")));
        links.expect_delete().times(1).returning(|_| Ok(()));

        let attacher = Attacher::new(Arc::new(links), "weave");
        let err = attacher.attach("abcdef").await.unwrap_err();

        assert!(matches!(err, PluginError::AttachmentFailed { .. }));
        assert!(err.to_string().contains("operation not permitted"));
    }

    #[tokio::test]
    async fn test_detach() {
        let mut links = MockLinkOps::new();
        links
            .expect_link_by_name()
            .withf(|name| name == "vethwlabcde")
            .times(1)
            .returning(|name| {
                Ok(Some(Link {
                    index: 9,
                    name: name.to_string(),
                    mtu: None,
                    kind: DeviceKind::Unknown("veth".to_string()),
                }))
            });
        links
            .expect_delete()
            .withf(|name| name == "vethwlabcde")
            .times(1)
            .returning(|_| Ok(()));

        let attacher = Attacher::new(Arc::new(links), "weave");
        assert!(attacher.detach("abcdef").await.is_ok());
    }

    #[tokio::test]
    async fn test_detach_missing_pair() {
        let mut links = MockLinkOps::new();
        links.expect_link_by_name().returning(|_| Ok(None));
        links.expect_delete().never();

        let attacher = Attacher::new(Arc::new(links), "weave");
        assert!(matches!(
            attacher.detach("abcdef").await,
            Err(PluginError::DeviceNotFound { .. })
        ));
    }
}
