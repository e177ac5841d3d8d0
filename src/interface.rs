//! Identity of the managed network interface.

use bytes::Bytes;
use std::{fmt, net::Ipv4Addr, str::FromStr};

/// ARP hardware type for Ethernet (`ARPHRD_ETHER`).
pub const ARPHRD_ETHER: u8 = 1;
/// ARP hardware type for IEEE 802 networks.
pub const ARPHRD_IEEE802: u8 = 6;

/// An address together with its netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self { addr, mask }
    }

    /// Number of leading one bits in the mask.
    pub fn prefix_len(&self) -> u8 {
        u32::from(self.mask).leading_ones() as u8
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & u32::from(self.mask))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !u32::from(self.mask))
    }

    /// Builds a mask from a prefix length, clamping anything above 32.
    pub fn mask_from_prefix(prefix: u8) -> Ipv4Addr {
        match prefix {
            0 => Ipv4Addr::UNSPECIFIED,
            p if p >= 32 => Ipv4Addr::BROADCAST,
            p => Ipv4Addr::from(u32::MAX << (32 - u32::from(p))),
        }
    }

    /// True when `addr` falls inside this network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        u32::from(addr) & mask == u32::from(self.addr) & mask
    }

    /// Classful netmask, used when a server omits the subnet mask option.
    pub fn classful_mask(addr: Ipv4Addr) -> Ipv4Addr {
        let first = addr.octets()[0];
        match first {
            0..=127 => Ipv4Addr::new(255, 0, 0, 0),
            128..=191 => Ipv4Addr::new(255, 255, 0, 0),
            192..=223 => Ipv4Addr::new(255, 255, 255, 0),
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len())
    }
}

/// Parses `a.b.c.d/len`, or a bare address as a host route.
impl FromStr for Ipv4Net {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| format!("invalid prefix length in '{s}'"))?;
                if prefix > 32 {
                    return Err(format!("prefix length {prefix} out of range"));
                }
                (addr, prefix)
            }
            None => (s, 32),
        };
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|e| format!("invalid address '{addr}': {e}"))?;
        Ok(Self::new(addr, Self::mask_from_prefix(prefix)))
    }
}

/// The interface a session runs on.
///
/// Supplied by the caller at session start. `addr` is the address currently
/// configured on the interface, which the session keeps up to date as it
/// applies and removes leases.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub hwaddr: Bytes,
    pub family: u8,
    pub mtu: u16,
    pub addr: Option<Ipv4Net>,
}

impl Interface {
    pub fn new(name: impl Into<String>, hwaddr: Bytes) -> Self {
        Self {
            name: name.into(),
            hwaddr,
            family: ARPHRD_ETHER,
            mtu: 1500,
            addr: None,
        }
    }

    pub fn hwlen(&self) -> usize {
        self.hwaddr.len()
    }

    /// True when `addr` is already configured on the interface.
    pub fn has_address(&self, addr: Ipv4Addr) -> bool {
        self.addr.is_some_and(|net| net.addr == addr)
    }
}

/// Formats a hardware address as colon separated hex.
pub fn hwaddr_to_string(hwaddr: &[u8]) -> String {
    hwaddr
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_broadcast() {
        let net = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(net.prefix_len(), 24);
        assert_eq!(net.network(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(net.broadcast(), Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(net.to_string(), "10.0.0.5/24");
    }

    #[test]
    fn test_mask_from_prefix() {
        assert_eq!(Ipv4Net::mask_from_prefix(0), Ipv4Addr::UNSPECIFIED);
        assert_eq!(Ipv4Net::mask_from_prefix(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(Ipv4Net::mask_from_prefix(40), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_classful_mask() {
        assert_eq!(
            Ipv4Net::classful_mask(Ipv4Addr::new(10, 1, 2, 3)),
            Ipv4Addr::new(255, 0, 0, 0)
        );
        assert_eq!(
            Ipv4Net::classful_mask(Ipv4Addr::new(192, 168, 1, 1)),
            Ipv4Addr::new(255, 255, 255, 0)
        );
    }

    #[test]
    fn test_parse_and_contains() {
        let net: Ipv4Net = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains(Ipv4Addr::new(192, 168, 1, 77)));
        assert!(!net.contains(Ipv4Addr::new(192, 168, 2, 1)));

        let host: Ipv4Net = "10.0.0.1".parse().unwrap();
        assert_eq!(host.prefix_len(), 32);
        assert!("10.0.0.1/33".parse::<Ipv4Net>().is_err());
        assert!("10.0.0/8".parse::<Ipv4Net>().is_err());
    }

    #[test]
    fn test_hwaddr_to_string() {
        assert_eq!(hwaddr_to_string(&[0x00, 0x0c, 0x29, 0xa8]), "00:0c:29:a8");
    }
}
