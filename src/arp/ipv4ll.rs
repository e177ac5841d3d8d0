//! IPv4 link-local address selection (RFC 3927).

use crate::interface::Ipv4Net;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::net::Ipv4Addr;

/// 169.254.1.0, the first usable link-local address.
const FIRST: u32 = 0xa9fe_0100;
/// 169.254.254.255, the last usable link-local address.
const LAST: u32 = 0xa9fe_feff;

pub fn netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 0, 0)
}

pub fn is_link_local(addr: Ipv4Addr) -> bool {
    Ipv4Net::new(Ipv4Addr::new(169, 254, 0, 0), netmask()).contains(addr)
}

/// Draws candidate addresses from a generator seeded by the hardware
/// address, so a host tends to land on the same address across restarts.
#[derive(Debug, Clone)]
pub struct Picker {
    rng: StdRng,
    last: Option<Ipv4Addr>,
}

impl Picker {
    pub fn new(hwaddr: &[u8]) -> Self {
        let seed = hwaddr
            .iter()
            .fold(0u64, |acc, &b| acc.rotate_left(8) ^ u64::from(b));
        Self {
            rng: StdRng::seed_from_u64(seed),
            last: None,
        }
    }

    /// Next candidate, never the one handed out just before.
    pub fn pick(&mut self) -> Ipv4Addr {
        loop {
            let addr = Ipv4Addr::from(self.rng.random_range(FIRST..=LAST));
            if self.last != Some(addr) {
                self.last = Some(addr);
                return addr;
            }
        }
    }
}
