//! Lease parameters and their RFC 2131 timer arithmetic.

use super::message::Message;
use super::options::code;
use crate::interface::Ipv4Net;
use std::{
    net::Ipv4Addr,
    time::{Duration, Instant},
};

/// Lease time meaning "never expires".
pub const INFINITE_LEASE: u32 = u32::MAX;
/// Shortest lease the client will schedule.
pub const MIN_LEASE_SECS: u32 = 20;

/// Corrections applied by [`Lease::normalize`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Adjustments {
    pub lease_raised: bool,
    pub rebind_forced: bool,
    pub renewal_forced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub server: Ipv4Addr,
    /// Seconds, [`INFINITE_LEASE`] when the server sent no lease time.
    pub lease_time: u32,
    /// T1 in seconds, zero until computed when the server omitted it.
    pub renewal_time: u32,
    /// T2 in seconds, zero until computed when the server omitted it.
    pub rebind_time: u32,
    /// False for BOOTP leases.
    pub is_dhcp: bool,
    pub bound_at: Option<Instant>,
    /// Reconstructed from the lease file rather than negotiated.
    pub from_info: bool,
}

impl Default for Lease {
    fn default() -> Self {
        Self {
            addr: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            broadcast: Ipv4Addr::UNSPECIFIED,
            server: Ipv4Addr::UNSPECIFIED,
            lease_time: 0,
            renewal_time: 0,
            rebind_time: 0,
            is_dhcp: false,
            bound_at: None,
            from_info: false,
        }
    }
}

impl Lease {
    /// Extracts lease parameters from an OFFER, ACK or BOOTP reply.
    ///
    /// Missing or malformed options fall back to their defaults: classful
    /// mask, directed broadcast, infinite lease and unset T1/T2.
    pub fn from_message(msg: &Message) -> Self {
        // BOOTP servers may leave yiaddr empty when ciaddr was set.
        let addr = if msg.yiaddr.is_unspecified() {
            msg.ciaddr
        } else {
            msg.yiaddr
        };
        let mask = msg
            .option_addr(code::SUBNET_MASK)
            .ok()
            .flatten()
            .unwrap_or_else(|| Ipv4Net::classful_mask(addr));
        let broadcast = msg
            .option_addr(code::BROADCAST)
            .ok()
            .flatten()
            .unwrap_or_else(|| Ipv4Net::new(addr, mask).broadcast());
        let seconds = |opt| msg.option_u32(opt).ok().flatten();

        Self {
            addr,
            mask,
            broadcast,
            server: msg.server_id().ok().flatten().unwrap_or(Ipv4Addr::UNSPECIFIED),
            lease_time: seconds(code::LEASE_TIME).unwrap_or(INFINITE_LEASE),
            renewal_time: seconds(code::RENEWAL_TIME).unwrap_or(0),
            rebind_time: seconds(code::REBIND_TIME).unwrap_or(0),
            is_dhcp: msg.is_dhcp(),
            bound_at: None,
            from_info: false,
        }
    }

    /// Rebuilds a lease read back from disk, aged by the time since it was
    /// written. Returns `None` when it has expired and `persistent` is off.
    pub fn from_persisted(msg: &Message, elapsed: Duration, persistent: bool) -> Option<Self> {
        let mut lease = Self::from_message(msg);
        lease.normalize();
        lease.from_info = true;
        lease.age(elapsed, persistent).then_some(lease)
    }

    pub fn is_empty(&self) -> bool {
        self.addr.is_unspecified()
    }

    pub fn is_infinite(&self) -> bool {
        self.lease_time == INFINITE_LEASE
    }

    pub fn net(&self) -> Ipv4Net {
        Ipv4Net::new(self.addr, self.mask)
    }

    /// Brings T1 and T2 into `renewal <= rebind <= lease`.
    ///
    /// Missing timers default to 50% and 87.5% of the lease. A timer that
    /// breaks the ordering is recomputed from the same fractions. For a
    /// lease loaded from disk a zero timer means its window is already
    /// used up, so it is kept and fires immediately.
    pub fn normalize(&mut self) -> Adjustments {
        let mut adjusted = Adjustments::default();
        if self.is_infinite() {
            self.renewal_time = INFINITE_LEASE;
            self.rebind_time = INFINITE_LEASE;
            return adjusted;
        }
        if self.lease_time < MIN_LEASE_SECS {
            self.lease_time = MIN_LEASE_SECS;
            adjusted.lease_raised = true;
        }
        let t1 = self.lease_time / 2;
        let t2 = (u64::from(self.lease_time) * 7 / 8) as u32;

        if self.rebind_time == 0 && !self.from_info {
            self.rebind_time = t2;
        } else if self.rebind_time >= self.lease_time {
            self.rebind_time = t2;
            adjusted.rebind_forced = true;
        }
        if self.renewal_time == 0 && !self.from_info {
            self.renewal_time = t1;
        } else if self.renewal_time > self.rebind_time {
            self.renewal_time = t1.min(self.rebind_time);
            adjusted.renewal_forced = true;
        }
        adjusted
    }

    /// Offsets the timers by the time the lease spent on disk.
    ///
    /// Returns false when the lease has run out and should be discarded.
    /// In persistent mode an expired lease is kept with its timers run down
    /// to zero so the address can still be tried.
    pub fn age(&mut self, elapsed: Duration, persistent: bool) -> bool {
        if self.is_infinite() {
            return true;
        }
        let elapsed = u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX);
        if elapsed > self.lease_time && !persistent {
            return false;
        }
        self.lease_time = self.lease_time.saturating_sub(elapsed);
        self.renewal_time = self.renewal_time.saturating_sub(elapsed);
        self.rebind_time = self.rebind_time.saturating_sub(elapsed);
        true
    }

    /// Deadlines for T1, T2 and expiry measured from `now`, or `None` for
    /// an infinite lease.
    pub fn deadlines(&self, now: Instant) -> Option<(Instant, Instant, Instant)> {
        if self.is_infinite() {
            return None;
        }
        let at = |secs: u32| now + Duration::from_secs(u64::from(secs));
        Some((
            at(self.renewal_time),
            at(self.rebind_time),
            at(self.lease_time),
        ))
    }

    /// Zeroes the lease.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
