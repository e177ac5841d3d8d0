//! Deadline bookkeeping and backoff arithmetic for the session.

use rand::Rng;
use std::time::{Duration, Instant};

/// First retransmission interval.
pub const DHCP_BASE: Duration = Duration::from_secs(4);
/// Retransmission interval cap.
pub const DHCP_MAX: Duration = Duration::from_secs(64);
/// Upper bound of the NAK backoff.
pub const NAKOFF_MAX: Duration = Duration::from_secs(60);

/// The independent deadlines a session may have pending.
///
/// The declaration order is the order expired slots are handled in when
/// several fire in the same wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Exit,
    Expire,
    Rebind,
    Renew,
    Stop,
    Restart,
    Arp,
    Retransmit,
}

impl TimerKind {
    pub const ALL: [TimerKind; 8] = [
        TimerKind::Exit,
        TimerKind::Expire,
        TimerKind::Rebind,
        TimerKind::Renew,
        TimerKind::Stop,
        TimerKind::Restart,
        TimerKind::Arp,
        TimerKind::Retransmit,
    ];

    /// Timers that belong to the bound lease rather than a protocol phase.
    pub fn is_lease_timer(self) -> bool {
        matches!(self, TimerKind::Renew | TimerKind::Rebind | TimerKind::Expire)
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default, Clone)]
pub struct Timers {
    slots: [Option<Instant>; 8],
}

impl Timers {
    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.slots[kind.index()] = Some(at);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.slots[kind.index()] = None;
    }

    pub fn get(&self, kind: TimerKind) -> Option<Instant> {
        self.slots[kind.index()]
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.get(kind).is_some()
    }

    /// Cancels every timer except those `keep` selects.
    pub fn retain(&mut self, keep: impl Fn(TimerKind) -> bool) {
        for kind in TimerKind::ALL {
            if !keep(kind) {
                self.cancel(kind);
            }
        }
    }

    /// Earliest pending deadline.
    pub fn next(&self) -> Option<(Instant, TimerKind)> {
        TimerKind::ALL
            .iter()
            .filter_map(|&kind| self.get(kind).map(|at| (at, kind)))
            .min_by_key(|&(at, _)| at)
    }

    /// Disarms `kind` and reports whether it had expired by `now`.
    pub fn take_expired(&mut self, kind: TimerKind, now: Instant) -> bool {
        match self.get(kind) {
            Some(at) if at <= now => {
                self.cancel(kind);
                true
            }
            _ => false,
        }
    }

    /// Expired timers in handling order.
    pub fn expired(&self, now: Instant) -> Vec<TimerKind> {
        TimerKind::ALL
            .iter()
            .copied()
            .filter(|&kind| self.get(kind).is_some_and(|at| at <= now))
            .collect()
    }
}

/// Binary exponential retransmission backoff.
///
/// The interval is `base * 2^messages` capped at `max`; the jitter is kept
/// separate so the interval itself is monotonic.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    messages: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DHCP_BASE, DHCP_MAX)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            messages: 0,
        }
    }

    pub fn reset(&mut self) {
        self.messages = 0;
    }

    pub fn messages(&self) -> u32 {
        self.messages
    }

    /// Interval for the next retransmission without jitter.
    pub fn interval(&self) -> Duration {
        let factor = 1u32.checked_shl(self.messages.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Returns the delay until the next retransmission and counts a message.
    ///
    /// The delay is the interval plus a random offset in `[-1s, +1s)`.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let interval = self.interval();
        self.messages = self.messages.saturating_add(1);
        let jitter_ms: i64 = rng.random_range(-1000..1000);
        let millis = interval.as_millis() as i64 + jitter_ms;
        Duration::from_millis(millis.max(0) as u64)
    }
}

/// Delay applied before rediscovering after consecutive NAKs.
#[derive(Debug, Clone)]
pub struct NakBackoff {
    current: Duration,
}

impl Default for NakBackoff {
    fn default() -> Self {
        Self {
            current: Duration::from_secs(1),
        }
    }
}

impl NakBackoff {
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to apply for this NAK and doubles the next one.
    pub fn on_nak(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(NAKOFF_MAX);
        delay
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_timers_next_and_expiry() {
        let now = Instant::now();
        let mut timers = Timers::default();
        assert!(timers.next().is_none());

        timers.arm(TimerKind::Retransmit, now + Duration::from_secs(4));
        timers.arm(TimerKind::Renew, now + Duration::from_secs(1800));
        assert_eq!(
            timers.next(),
            Some((now + Duration::from_secs(4), TimerKind::Retransmit))
        );

        assert!(timers.expired(now).is_empty());
        let later = now + Duration::from_secs(5);
        assert_eq!(timers.expired(later), vec![TimerKind::Retransmit]);
        assert!(timers.take_expired(TimerKind::Retransmit, later));
        assert!(!timers.is_armed(TimerKind::Retransmit));
        assert!(!timers.take_expired(TimerKind::Renew, later));
    }

    #[test]
    fn test_timers_expired_order() {
        let now = Instant::now();
        let mut timers = Timers::default();
        timers.arm(TimerKind::Retransmit, now);
        timers.arm(TimerKind::Expire, now);
        timers.arm(TimerKind::Rebind, now);
        assert_eq!(
            timers.expired(now),
            vec![TimerKind::Expire, TimerKind::Rebind, TimerKind::Retransmit]
        );
    }

    #[test]
    fn test_timers_retain_lease_timers() {
        let now = Instant::now();
        let mut timers = Timers::default();
        for kind in TimerKind::ALL {
            timers.arm(kind, now);
        }
        timers.retain(TimerKind::is_lease_timer);
        assert!(timers.is_armed(TimerKind::Renew));
        assert!(timers.is_armed(TimerKind::Rebind));
        assert!(timers.is_armed(TimerKind::Expire));
        assert!(!timers.is_armed(TimerKind::Retransmit));
        assert!(!timers.is_armed(TimerKind::Exit));
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::default();
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let interval = backoff.interval();
            assert!(interval >= previous);
            assert!(interval <= DHCP_MAX);
            let delay = backoff.next_delay(&mut rng);
            assert!(delay + Duration::from_secs(1) >= interval);
            assert!(delay < interval + Duration::from_secs(1));
            previous = interval;
        }
        assert_eq!(backoff.interval(), DHCP_MAX);
    }

    #[test]
    fn test_backoff_sequence() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut backoff = Backoff::default();
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(backoff.interval().as_secs());
            backoff.next_delay(&mut rng);
        }
        assert_eq!(seen, vec![4, 8, 16, 32, 64, 64]);
        backoff.reset();
        assert_eq!(backoff.interval(), DHCP_BASE);
    }

    #[test]
    fn test_nak_backoff_doubles_and_caps() {
        let mut nak = NakBackoff::default();
        let delays: Vec<u64> = (0..8).map(|_| nak.on_nak().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        nak.reset();
        assert_eq!(nak.current(), Duration::from_secs(1));
    }
}
