use std::{fmt, net::Ipv4Addr, str::FromStr};

/// Locally-administered prefix for every endpoint MAC.
pub const MAC_PREFIX: [u8; 2] = [0x7a, 0x42];

/// An IPv4 address together with its prefix length, e.g. `10.32.0.5/12`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl IpCidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> anyhow::Result<Self> {
        if prefix_len > 32 {
            return Err(anyhow::anyhow!("Invalid prefix length"));
        }

        Ok(Self { addr, prefix_len })
    }

    /// Hardware address derived from this address.
    pub fn mac(&self) -> MacAddr {
        MacAddr::from_ip(self.addr)
    }
}

impl FromStr for IpCidr {
    type Err = anyhow::Error;

    fn from_str(cidr: &str) -> anyhow::Result<Self> {
        let (ip_str, len_str) = cidr
            .trim()
            .split_once('/')
            .ok_or(anyhow::anyhow!("Invalid CIDR"))?;

        let addr = ip_str.parse::<Ipv4Addr>()?;
        let prefix_len = len_str.parse::<u8>()?;

        Self::new(addr, prefix_len)
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn from_ip(ip: Ipv4Addr) -> Self {
        let mut hw = [0u8; 6];
        hw[..2].copy_from_slice(&MAC_PREFIX);
        hw[2..].copy_from_slice(&ip.octets());

        MacAddr(hw)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}
