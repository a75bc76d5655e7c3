mod addr;
mod attach;
mod ipam;
mod link;

pub use addr::{IpCidr, MacAddr, MAC_PREFIX};
pub use attach::{Attacher, VethPair, GUEST_DST_PREFIX};
pub use ipam::{Allocator, HttpAllocator};
pub use link::{DeviceKind, Link, LinkOps, NetlinkLinks};

#[cfg(test)]
pub use ipam::MockAllocator;
#[cfg(test)]
pub use link::MockLinkOps;
