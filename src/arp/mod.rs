//! ARP probe, announce and defend logic (RFC 3927 and RFC 5227).
//!
//! The engine only decides what to send and when. Sockets and timers belong
//! to the session that drives it.

pub mod ipv4ll;
pub mod packet;

pub use packet::ArpPacket;

use bytes::Bytes;
use rand::Rng;
use std::{
    net::Ipv4Addr,
    time::{Duration, Instant},
};

pub const PROBE_WAIT: Duration = Duration::from_secs(1);
pub const PROBE_NUM: u32 = 3;
pub const PROBE_MIN: Duration = Duration::from_secs(1);
pub const PROBE_MAX: Duration = Duration::from_secs(2);
pub const ANNOUNCE_WAIT: Duration = Duration::from_secs(2);
pub const ANNOUNCE_NUM: u32 = 2;
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_CONFLICTS: u32 = 10;
pub const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFEND_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Probing,
    Announcing,
}

/// What the engine wants sent on this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Probe { packet: ArpPacket, next: Duration },
    /// `next` is `None` after the final announcement: the address is claimed.
    Announce {
        packet: ArpPacket,
        next: Option<Duration>,
    },
}

fn random_between<R: Rng + ?Sized>(rng: &mut R, low: Duration, high: Duration) -> Duration {
    let low = low.as_millis() as u64;
    let high = high.as_millis() as u64;
    Duration::from_millis(rng.random_range(low..=high))
}

/// Probe then announce one candidate address.
#[derive(Debug, Clone)]
pub struct ArpProbe {
    addr: Ipv4Addr,
    htype: u16,
    hwaddr: Bytes,
    phase: Phase,
    probes: u32,
    announces: u32,
}

impl ArpProbe {
    pub fn new(addr: Ipv4Addr, htype: u16, hwaddr: Bytes) -> Self {
        Self {
            addr,
            htype,
            hwaddr,
            phase: Phase::Probing,
            probes: 0,
            announces: 0,
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn probes_sent(&self) -> u32 {
        self.probes
    }

    pub fn announces_sent(&self) -> u32 {
        self.announces
    }

    /// Random delay before the first probe.
    pub fn initial_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        random_between(rng, Duration::ZERO, PROBE_WAIT)
    }

    /// Advances on timer expiry and returns the packet to send.
    pub fn step<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Step {
        if self.phase == Phase::Probing && self.probes < PROBE_NUM {
            self.probes += 1;
            let next = if self.probes < PROBE_NUM {
                random_between(rng, PROBE_MIN, PROBE_MAX)
            } else {
                ANNOUNCE_WAIT
            };
            return Step::Probe {
                packet: ArpPacket::probe(self.htype, &self.hwaddr, self.addr),
                next,
            };
        }

        self.phase = Phase::Announcing;
        self.announces += 1;
        let next = (self.announces < ANNOUNCE_NUM).then_some(ANNOUNCE_INTERVAL);
        Step::Announce {
            packet: ArpPacket::announce(self.htype, &self.hwaddr, self.addr),
            next,
        }
    }

    /// True when `packet` shows another host using or probing our candidate.
    pub fn is_conflict(&self, packet: &ArpPacket) -> bool {
        claims_address(packet, self.addr, &self.hwaddr)
    }
}

/// True when another host uses `addr` as its sender address, or probes for
/// it with an unset sender address.
pub fn claims_address(packet: &ArpPacket, addr: Ipv4Addr, hwaddr: &[u8]) -> bool {
    if packet.sha.as_ref() == hwaddr {
        return false;
    }
    packet.spa == addr || (packet.spa.is_unspecified() && packet.tpa == addr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Defense {
    /// Re-announce and keep the address.
    Defend,
    /// Defended too recently; give the address up.
    Yield,
}

/// Rate limits defense of a bound address.
#[derive(Debug, Default, Clone)]
pub struct Defender {
    last: Option<Instant>,
}

impl Defender {
    /// Decides how to answer a conflict seen at `now`.
    ///
    /// Without a previous defense the address is always defended.
    pub fn on_conflict(&mut self, now: Instant) -> Defense {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < DEFEND_INTERVAL => Defense::Yield,
            _ => {
                self.last = Some(now);
                Defense::Defend
            }
        }
    }

    pub fn last_defense(&self) -> Option<Instant> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
