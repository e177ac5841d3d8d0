//! DHCPv4 session state machine
//!
//! One `Session` manages one interface. It never touches sockets, files or
//! the clock itself: the driver feeds it events stamped with the current
//! time and carries out the actions it returns.

use super::{
    build::{self, Request},
    lease::{Lease, INFINITE_LEASE, MIN_LEASE_SECS},
    leasefile::StoredLease,
    message::{Message, BOOTREPLY},
    options::{code, Catalog},
};
use crate::{
    arp::{self, ipv4ll, ArpPacket, ArpProbe, Defender, Defense, Step},
    client::{Action, DhcpStateMachine, Event, ExitStatus, LinkState, Signal},
    config::ClientConfig,
    interface::{hwaddr_to_string, Interface, Ipv4Net, ARPHRD_ETHER, ARPHRD_IEEE802},
    network::Destination,
    script::Reason,
    timer::{Backoff, NakBackoff, TimerKind, Timers, DHCP_MAX},
};
use dhcproto::v4::MessageType;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, trace, warn};

/// Wait before rediscovering after declining an address.
pub const DECLINE_RETRY: Duration = Duration::from_secs(1);
/// Wait before restarting after the transport failed.
pub const TRANSPORT_RETRY: Duration = Duration::from_secs(2);
const FORCERENEW: u8 = 9;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Init,
    Discovering,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
    Reboot,
    RenewRequested,
    InitIpv4ll,
    Probing,
    Announcing,
    Informing,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            State::Init => "Init",
            State::Discovering => "Discovering",
            State::Requesting => "Requesting",
            State::Bound => "Bound",
            State::Renewing => "Renewing",
            State::Rebinding => "Rebinding",
            State::Reboot => "Reboot",
            State::RenewRequested => "RenewRequested",
            State::InitIpv4ll => "InitIpv4ll",
            State::Probing => "Probing",
            State::Announcing => "Announcing",
            State::Informing => "Informing",
        }
    }
}

/// Whose address an ARP probe is checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeTarget {
    Offer,
    Static,
    LinkLocal,
}

#[derive(Debug)]
struct LinkLocal {
    picker: ipv4ll::Picker,
    conflicts: u32,
    claimed: Option<Ipv4Addr>,
    gave_up_at: Option<Instant>,
}

pub struct Session {
    config: ClientConfig,
    catalog: Arc<Catalog>,
    iface: Interface,
    client_id: Vec<u8>,
    state: State,
    xid: u32,
    backoff: Backoff,
    nak: NakBackoff,
    carrier: bool,
    lease: Lease,
    /// Previously bound reply, kept for one transition.
    old: Option<Message>,
    /// Currently bound reply.
    new: Option<Message>,
    /// Reply being evaluated, moved into `new` at bind time.
    offer: Option<Message>,
    /// State the pending offer was accepted in.
    accepted_in: State,
    timers: Timers,
    probe: Option<(ArpProbe, ProbeTarget)>,
    link_local: LinkLocal,
    defender: Defender,
    started: Instant,
    transport_open: bool,
    arp_open: bool,
    rng: StdRng,
}

impl Session {
    pub fn new(config: ClientConfig, iface: Interface, catalog: Arc<Catalog>) -> Self {
        Self::with_rng(config, iface, catalog, StdRng::from_os_rng())
    }

    /// Builds a session drawing transaction ids and jitter from `rng`.
    pub fn with_rng(
        config: ClientConfig,
        iface: Interface,
        catalog: Arc<Catalog>,
        mut rng: StdRng,
    ) -> Self {
        let client_id = build::client_id(&config, &iface);
        let xid = rng.random();
        let picker = ipv4ll::Picker::new(&iface.hwaddr);
        Self {
            config,
            catalog,
            iface,
            client_id,
            state: State::Init,
            xid,
            backoff: Backoff::default(),
            nak: NakBackoff::default(),
            carrier: true,
            lease: Lease::default(),
            old: None,
            new: None,
            offer: None,
            accepted_in: State::Init,
            timers: Timers::default(),
            probe: None,
            link_local: LinkLocal {
                picker,
                conflicts: 0,
                claimed: None,
                gave_up_at: None,
            },
            defender: Defender::default(),
            started: Instant::now(),
            transport_open: false,
            arp_open: false,
            rng,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn bound_message(&self) -> Option<&Message> {
        self.new.as_ref()
    }

    pub fn offer(&self) -> Option<&Message> {
        self.offer.as_ref()
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn interface(&self) -> &Interface {
        &self.iface
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Link-local conflicts seen since the last reset.
    pub fn conflicts(&self) -> u32 {
        self.link_local.conflicts
    }

    /// Address currently being probed.
    pub fn probe_addr(&self) -> Option<Ipv4Addr> {
        self.probe.as_ref().map(|(probe, _)| probe.addr())
    }

    pub fn link_local_addr(&self) -> Option<Ipv4Addr> {
        self.link_local.claimed
    }

    pub fn nak_backoff(&self) -> Duration {
        self.nak.current()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next().map(|(at, _)| at)
    }

    /// Starts the session, rebooting `persisted` when it is still usable.
    pub fn start(&mut self, now: Instant, persisted: Option<StoredLease>) -> Vec<Action> {
        let mut out = Vec::new();
        self.started = now;
        if !self.config.timeout.is_zero() {
            self.timers.arm(TimerKind::Exit, now + self.config.timeout);
        }
        info!(
            "{}: starting with hardware address {}",
            self.iface.name,
            hwaddr_to_string(&self.iface.hwaddr)
        );

        if let Some(net) = self.config.inform_address {
            self.start_inform(now, net, &mut out);
        } else if let Some(net) = self.config.static_address {
            self.start_static(now, net, &mut out);
        } else if persisted.is_some_and(|stored| self.load_persisted(stored)) {
            self.reboot(now, &mut out);
        } else {
            self.discover(now, &mut out);
        }
        out
    }

    /// Feeds one event to the machine.
    pub fn advance(&mut self, now: Instant, event: Event) -> Vec<Action> {
        let mut out = Vec::new();
        let before = self.state;
        match event {
            Event::Timeout => self.on_timeout(now, &mut out),
            Event::Packet { bytes, from } => self.on_packet(now, &bytes, from, &mut out),
            Event::Arp(bytes) => self.on_arp(now, &bytes, &mut out),
            Event::Signal(signal) => self.on_signal(now, signal, &mut out),
            Event::Link(link) => self.on_link(now, link, &mut out),
            Event::TransportError => self.on_transport_error(now, &mut out),
            Event::ArpError => self.on_arp_error(now, &mut out),
        }
        if before != self.state {
            debug!(
                "{}: {} -> {}",
                self.iface.name,
                before.name(),
                self.state.name()
            );
        }
        out
    }

    fn load_persisted(&mut self, stored: StoredLease) -> bool {
        match Lease::from_persisted(&stored.message, stored.age, self.config.persistent) {
            None => {
                debug!("{}: discarding expired lease", self.iface.name);
                false
            }
            Some(lease) if !lease.is_dhcp => false,
            Some(lease) => {
                debug!(
                    "{}: loaded lease of {} written {} seconds ago",
                    self.iface.name,
                    lease.addr,
                    stored.age.as_secs()
                );
                self.lease = lease;
                self.offer = Some(stored.message);
                true
            }
        }
    }

    fn new_xid(&mut self) {
        self.xid = self.rng.random();
    }

    fn request(&self, now: Instant) -> Request<'_> {
        Request {
            config: &self.config,
            catalog: &self.catalog,
            iface: &self.iface,
            lease: &self.lease,
            xid: self.xid,
            elapsed: now.saturating_duration_since(self.started),
            client_id: &self.client_id,
        }
    }

    /// Encodes and queues one message. Nothing is sent without carrier.
    fn transmit(
        &mut self,
        now: Instant,
        kind: MessageType,
        to: Destination,
        out: &mut Vec<Action>,
    ) -> bool {
        if !self.carrier {
            debug!("{}: no carrier, not sending {:?}", self.iface.name, kind);
            return false;
        }
        let packet = match build::encode(kind, &self.request(now)) {
            Ok(packet) => packet,
            Err(e) => {
                error!("{}: failed to build {:?}: {}", self.iface.name, kind, e);
                return false;
            }
        };
        if !self.transport_open {
            out.push(Action::OpenTransport);
            self.transport_open = true;
        }
        debug!(
            "{}: sending {:?} with xid 0x{:08x}",
            self.iface.name, kind, self.xid
        );
        out.push(Action::Send { packet, to });
        true
    }

    /// Sends the message for the current phase and schedules its retransmit.
    fn send_current(&mut self, now: Instant, out: &mut Vec<Action>) {
        let kind = match self.state {
            State::Discovering => MessageType::Discover,
            State::Requesting
            | State::Reboot
            | State::Renewing
            | State::Rebinding
            | State::RenewRequested => MessageType::Request,
            State::Informing => MessageType::Inform,
            _ => return,
        };
        let unicast = matches!(self.state, State::Renewing | State::RenewRequested)
            && !self.lease.server.is_unspecified()
            && self.iface.has_address(self.lease.addr);
        let to = if unicast {
            Destination::Unicast(self.lease.server)
        } else {
            Destination::Broadcast
        };
        self.transmit(now, kind, to, out);

        let delay = self.backoff.next_delay(&mut self.rng);
        trace!(
            "{}: next {:?} in {} ms",
            self.iface.name,
            kind,
            delay.as_millis()
        );
        self.timers.arm(TimerKind::Retransmit, now + delay);
    }

    fn open_arp(&mut self, out: &mut Vec<Action>) {
        if !self.arp_open {
            out.push(Action::OpenArp);
            self.arp_open = true;
        }
    }

    fn send_arp(&mut self, packet: ArpPacket, out: &mut Vec<Action>) {
        if self.carrier {
            self.open_arp(out);
            out.push(Action::SendArp(packet.to_bytes()));
        }
    }

    fn close_all(&mut self, out: &mut Vec<Action>) {
        if self.transport_open {
            out.push(Action::CloseTransport);
            self.transport_open = false;
        }
        if self.arp_open {
            out.push(Action::CloseArp);
            self.arp_open = false;
        }
    }

    fn discover(&mut self, now: Instant, out: &mut Vec<Action>) {
        self.timers.cancel(TimerKind::Retransmit);
        self.timers.cancel(TimerKind::Stop);
        self.timers.cancel(TimerKind::Restart);
        if !self.carrier {
            self.state = State::Init;
            return;
        }
        self.state = State::Discovering;
        self.new_xid();
        self.backoff.reset();
        match self.config.requested_address {
            Some(addr) => info!("{}: soliciting a lease for {}", self.iface.name, addr),
            None => info!("{}: soliciting a DHCP lease", self.iface.name),
        }
        if self.config.ipv4ll && self.link_local.claimed.is_none() && self.new.is_none() {
            self.timers
                .arm(TimerKind::Stop, now + self.config.initial_timeout);
        }
        self.send_current(now, out);
    }

    fn start_request(&mut self, now: Instant, out: &mut Vec<Action>) {
        self.state = State::Requesting;
        self.backoff.reset();
        self.timers
            .arm(TimerKind::Stop, now + self.config.request_timeout);
        self.send_current(now, out);
    }

    fn reboot(&mut self, now: Instant, out: &mut Vec<Action>) {
        self.state = State::Reboot;
        self.new_xid();
        self.backoff.reset();
        // INIT-REBOOT must not name a server.
        self.lease.server = Ipv4Addr::UNSPECIFIED;
        info!("{}: rebooting with lease of {}", self.iface.name, self.lease.addr);
        self.timers
            .arm(TimerKind::Stop, now + self.config.initial_timeout);
        self.send_current(now, out);
    }

    fn renew_requested(&mut self, now: Instant, out: &mut Vec<Action>) {
        self.timers.cancel(TimerKind::Retransmit);
        self.timers.cancel(TimerKind::Stop);
        self.timers.cancel(TimerKind::Restart);
        self.state = State::RenewRequested;
        self.new_xid();
        self.backoff.reset();
        info!(
            "{}: renewing lease of {} on request",
            self.iface.name, self.lease.addr
        );
        self.send_current(now, out);
    }

    fn start_inform(&mut self, now: Instant, net: Ipv4Net, out: &mut Vec<Action>) {
        self.state = State::Informing;
        self.new_xid();
        self.backoff.reset();
        self.lease = Lease::from_message(&Message::synthetic(net.addr, net.mask));
        self.iface.addr.get_or_insert(net);
        info!("{}: informing address of {}", self.iface.name, net);
        self.send_current(now, out);
    }

    fn start_static(&mut self, now: Instant, net: Ipv4Net, out: &mut Vec<Action>) {
        let msg = Message::synthetic(net.addr, net.mask);
        self.lease = Lease::from_message(&msg);
        self.offer = Some(msg);
        self.start_bind(now, out);
    }

    /// Picks what a restart means given the configuration and lease.
    fn restart(&mut self, now: Instant, out: &mut Vec<Action>) {
        if let Some(net) = self.config.static_address {
            self.start_static(now, net, out);
        } else if let Some(net) = self.config.inform_address {
            self.start_inform(now, net, out);
        } else if self.new.is_some() && !self.lease.is_empty() {
            self.renew_requested(now, out);
        } else {
            self.discover(now, out);
        }
    }

    fn on_timeout(&mut self, now: Instant, out: &mut Vec<Action>) {
        for kind in TimerKind::ALL {
            // A handler earlier in this pass may have cancelled the slot.
            if !self.timers.take_expired(kind, now) {
                continue;
            }
            trace!("{}: {:?} timer expired", self.iface.name, kind);
            match kind {
                TimerKind::Exit => self.on_exit_timer(out),
                TimerKind::Expire => self.expire(now, out),
                TimerKind::Rebind => self.rebind(now, out),
                TimerKind::Renew => self.start_renew(now, out),
                TimerKind::Stop => self.on_stop_timer(now, out),
                TimerKind::Restart => self.restart(now, out),
                TimerKind::Arp => self.arp_tick(now, out),
                TimerKind::Retransmit => self.send_current(now, out),
            }
            if matches!(out.last(), Some(Action::Exit(_))) {
                break;
            }
        }
    }

    fn on_exit_timer(&mut self, out: &mut Vec<Action>) {
        if self.new.is_some() || self.link_local.claimed.is_some() {
            return;
        }
        if matches!(self.probe, Some((_, ProbeTarget::LinkLocal))) {
            return;
        }
        error!("{}: timed out", self.iface.name);
        out.push(Action::RunScript {
            reason: Reason::Fail,
            old: None,
            new: None,
        });
        self.close_all(out);
        out.push(Action::Exit(ExitStatus::Failure));
    }

    fn expire(&mut self, now: Instant, out: &mut Vec<Action>) {
        error!("{}: DHCP lease expired", self.iface.name);
        self.drop_lease(Reason::Expire, out);
        out.push(Action::RemoveLease);
        self.discover(now, out);
    }

    fn rebind(&mut self, now: Instant, out: &mut Vec<Action>) {
        if self.new.is_none() {
            return;
        }
        warn!(
            "{}: failed to renew DHCP, rebinding {}",
            self.iface.name, self.lease.addr
        );
        self.timers.cancel(TimerKind::Renew);
        self.timers.cancel(TimerKind::Retransmit);
        self.state = State::Rebinding;
        self.lease.server = Ipv4Addr::UNSPECIFIED;
        self.backoff.reset();
        self.send_current(now, out);
    }

    fn start_renew(&mut self, now: Instant, out: &mut Vec<Action>) {
        if self.new.is_none() {
            return;
        }
        info!("{}: renewing lease of {}", self.iface.name, self.lease.addr);
        self.timers.cancel(TimerKind::Retransmit);
        self.state = State::Renewing;
        self.new_xid();
        self.backoff.reset();
        self.send_current(now, out);
    }

    fn on_stop_timer(&mut self, now: Instant, out: &mut Vec<Action>) {
        match self.state {
            State::Discovering => self.start_ipv4ll(now, out),
            State::Requesting => {
                warn!("{}: no reply to REQUEST, rediscovering", self.iface.name);
                self.discover(now, out);
            }
            State::Reboot if self.config.last_lease && self.lease.from_info => {
                info!(
                    "{}: timed out contacting a DHCP server, using last lease",
                    self.iface.name
                );
                self.bind(now, out);
                if self.state == State::Bound {
                    self.discover(now, out);
                }
            }
            State::Reboot => self.expire(now, out),
            _ => {}
        }
    }

    /// Drops the bound lease and tells the script.
    fn drop_lease(&mut self, reason: Reason, out: &mut Vec<Action>) {
        self.timers.retain(|kind| kind == TimerKind::Exit);
        if matches!(self.probe, Some((_, ProbeTarget::Offer | ProbeTarget::Static))) {
            self.probe = None;
        }
        self.old = None;
        let old = self.new.take();
        if let Some(msg) = &old {
            info!(
                "{}: dropping lease of {}",
                self.iface.name,
                Lease::from_message(msg).addr
            );
        }
        out.push(Action::RunScript {
            reason,
            old,
            new: None,
        });
        self.offer = None;
        self.lease.clear();
        self.iface.addr = self
            .link_local
            .claimed
            .map(|addr| Ipv4Net::new(addr, ipv4ll::netmask()));
        self.state = State::Init;
    }

    fn on_packet(&mut self, now: Instant, bytes: &[u8], from: Ipv4Addr, out: &mut Vec<Action>) {
        let name = self.iface.name.clone();
        let msg = match Message::parse(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("{}: discarding malformed packet from {}: {}", name, from, e);
                return;
            }
        };
        if msg.op != BOOTREPLY {
            trace!("{}: ignoring BOOTREQUEST from {}", name, from);
            return;
        }
        if msg.xid != self.xid {
            debug!(
                "{}: wrong xid 0x{:08x} (expecting 0x{:08x}) from {}",
                name, msg.xid, self.xid, from
            );
            return;
        }
        if matches!(self.iface.family, ARPHRD_ETHER | ARPHRD_IEEE802)
            && !msg.chaddr_matches(&self.iface.hwaddr)
        {
            debug!(
                "{}: xid 0x{:08x} is for another hardware address",
                name, msg.xid
            );
            return;
        }

        let server = match msg.server_id() {
            Ok(server) => server,
            Err(e) => {
                debug!("{}: bad server identifier from {}: {}", name, from, e);
                return;
            }
        };
        if self.config.is_blacklisted(from)
            || server.is_some_and(|server| self.config.is_blacklisted(server))
        {
            warn!(
                "{}: ignoring reply from blacklisted server {}",
                name,
                server.unwrap_or(from)
            );
            return;
        }

        let kind = match msg.message_type() {
            Ok(kind) => kind,
            Err(e) => {
                debug!("{}: bad message type from {}: {}", name, from, e);
                return;
            }
        };
        if kind.map(u8::from) == Some(FORCERENEW) {
            warn!("{}: unauthenticated FORCERENEW from {}, ignoring", name, from);
            return;
        }

        if matches!(
            self.state,
            State::Init | State::InitIpv4ll | State::Bound | State::Probing | State::Announcing
        ) {
            debug!(
                "{}: not expecting a reply in state {}",
                name,
                self.state.name()
            );
            return;
        }

        self.backoff.reset();

        if let Some(rejected) = self.config.reject.iter().find(|&c| msg.has_option(c)) {
            warn!(
                "{}: reply from {} carries rejected option {}",
                name, from, rejected
            );
            return;
        }

        if kind == Some(MessageType::Nak) {
            self.on_nak(now, &msg, from, server, out);
            return;
        }

        let missing = self
            .config
            .require
            .iter()
            .filter(|&c| !(c == code::SERVER_ID && kind.is_none()))
            .find(|&c| !msg.has_option(c));
        if let Some(missing) = missing {
            warn!(
                "{}: reply from {} lacks required option {}",
                name, from, missing
            );
            return;
        }

        let offered = msg.yiaddr;
        if kind == Some(MessageType::Offer) && offered.is_unspecified() {
            self.on_empty_offer(now, &msg, from, out);
            return;
        }
        let unusable = |addr: Ipv4Addr| addr.is_unspecified() || addr.is_broadcast();
        if matches!(kind, None | Some(MessageType::Offer) | Some(MessageType::Ack))
            && unusable(msg.ciaddr)
            && unusable(offered)
        {
            warn!("{}: rejecting reply from {} without an address", name, from);
            return;
        }
        if !offered.is_unspecified() && !is_valid_address(offered) {
            warn!("{}: reply from {} offers invalid address {}", name, from, offered);
            return;
        }

        match kind {
            None | Some(MessageType::Offer) if self.state == State::Discovering => {
                self.on_offer(now, msg, server, out);
                return;
            }
            Some(MessageType::Ack) => {}
            Some(MessageType::Offer) => {
                debug!("{}: ignoring offer of {} from {}", name, offered, from);
                return;
            }
            other => {
                debug!("{}: ignoring {:?} from {}", name, other, from);
                return;
            }
        }

        if self.state == State::Discovering {
            let rapid = self.config.request.contains(code::RAPID_COMMIT)
                && msg.has_option(code::RAPID_COMMIT);
            if !rapid {
                debug!("{}: ignoring ACK of {} while discovering", name, offered);
                return;
            }
            info!("{}: rapid commit ACK of {} from {}", name, offered, from);
            self.state = State::Requesting;
        } else {
            debug!("{}: acknowledged {} from {}", name, offered, from);
        }
        self.accept(now, msg, out);
    }

    fn on_offer(
        &mut self,
        now: Instant,
        msg: Message,
        server: Option<Ipv4Addr>,
        out: &mut Vec<Action>,
    ) {
        let bootp = !msg.is_dhcp();
        self.lease = Lease::from_message(&msg);
        match server {
            Some(server) if !bootp => info!(
                "{}: offered {} from {}",
                self.iface.name, self.lease.addr, server
            ),
            _ => info!("{}: BOOTP offer of {}", self.iface.name, self.lease.addr),
        }

        if self.config.test {
            out.push(Action::RunScript {
                reason: Reason::Test,
                old: self.new.clone(),
                new: Some(msg),
            });
            self.close_all(out);
            out.push(Action::Exit(ExitStatus::Success));
            return;
        }

        self.timers.cancel(TimerKind::Retransmit);
        self.timers.cancel(TimerKind::Stop);
        if bootp {
            // BOOTP has no REQUEST phase.
            self.accept(now, msg, out);
        } else {
            self.offer = Some(msg);
            self.start_request(now, out);
        }
    }

    /// An OFFER without an address, possibly carrying RFC 2563 advice.
    fn on_empty_offer(&mut self, now: Instant, msg: &Message, from: Ipv4Addr, out: &mut Vec<Action>) {
        let name = self.iface.name.clone();
        warn!("{}: no address given by {}", name, from);
        if let Some(text) = msg.option_string(code::MESSAGE).ok().flatten() {
            warn!("{}: message: {}", name, text);
        }
        if self.state != State::Discovering || !self.config.ipv4ll {
            return;
        }
        let Some(advice) = msg.option_u8(code::AUTO_CONFIGURE).ok().flatten() else {
            return;
        };
        match advice {
            0 => {
                warn!("{}: IPv4LL disabled from {}", name, from);
                self.drop_ipv4ll(out);
            }
            1 => {
                warn!("{}: IPv4LL enabled from {}", name, from);
                self.start_ipv4ll(now, out);
            }
            other => error!("{}: unknown auto configuration option {}", name, other),
        }
        self.timers.cancel(TimerKind::Retransmit);
        self.timers.cancel(TimerKind::Stop);
        self.timers.arm(TimerKind::Restart, now + DHCP_MAX);
    }

    /// Abandons any link-local probe and gives up a claimed address.
    fn drop_ipv4ll(&mut self, out: &mut Vec<Action>) {
        if matches!(self.probe, Some((_, ProbeTarget::LinkLocal))) {
            self.probe = None;
            self.timers.cancel(TimerKind::Arp);
        }
        if let Some(addr) = self.link_local.claimed.take() {
            if self.new.is_none() {
                self.iface.addr = None;
            }
            out.push(Action::RunScript {
                reason: Reason::Expire,
                old: Some(Message::synthetic(addr, ipv4ll::netmask())),
                new: None,
            });
        }
        if self.probe.is_none() && self.arp_open && !(self.config.arp && self.new.is_some()) {
            out.push(Action::CloseArp);
            self.arp_open = false;
        }
    }

    fn on_nak(
        &mut self,
        now: Instant,
        msg: &Message,
        from: Ipv4Addr,
        server: Option<Ipv4Addr>,
        out: &mut Vec<Action>,
    ) {
        if self.config.require.contains(code::SERVER_ID) && server.is_none() {
            warn!("{}: ignoring NAK from {} without server id", self.iface.name, from);
            return;
        }
        match msg.option_string(code::MESSAGE).ok().flatten() {
            Some(text) => warn!("{}: NAK from {}: {}", self.iface.name, from, text),
            None => warn!("{}: NAK from {}", self.iface.name, from),
        }
        if self.state == State::Informing {
            return;
        }
        if self.config.test {
            self.timers.retain(|kind| kind == TimerKind::Exit);
            self.state = State::Init;
        } else {
            self.drop_lease(Reason::Nak, out);
            out.push(Action::RemoveLease);
        }
        let delay = self.nak.on_nak();
        info!(
            "{}: rediscovering in {} seconds",
            self.iface.name,
            delay.as_secs()
        );
        self.timers.arm(TimerKind::Restart, now + delay);
    }

    /// Takes an ACK (or BOOTP reply) as the lease to bind.
    fn accept(&mut self, now: Instant, msg: Message, out: &mut Vec<Action>) {
        self.nak.reset();
        let mut lease = Lease::from_message(&msg);
        if let Some(net) = self.config.inform_address {
            lease.addr = net.addr;
            if !msg.has_option(code::SUBNET_MASK) {
                lease.mask = net.mask;
                lease.broadcast = net.broadcast();
            }
        }
        self.lease = lease;
        self.offer = Some(msg);
        self.accepted_in = self.state;
        self.timers.retain(|kind| kind == TimerKind::Exit);
        self.start_bind(now, out);
    }

    /// Probes the address first when conflict detection applies.
    fn start_bind(&mut self, now: Instant, out: &mut Vec<Action>) {
        let addr = self.lease.addr;
        let probe = self.config.arp
            && self.carrier
            && self.config.inform_address.is_none()
            && !self.iface.has_address(addr);
        if probe {
            let target = if self.config.static_address.is_some() {
                ProbeTarget::Static
            } else {
                ProbeTarget::Offer
            };
            info!("{}: probing address {}", self.iface.name, addr);
            self.start_probe(now, addr, target, out);
        } else {
            self.bind(now, out);
        }
    }

    fn bind(&mut self, now: Instant, out: &mut Vec<Action>) {
        let name = self.iface.name.clone();
        let Some(offer) = self.offer.take() else {
            warn!("{}: nothing to bind", name);
            return;
        };
        let yiaddr = offer.yiaddr;
        self.old = self.new.take();
        self.new = Some(offer);

        let mut reason = None;
        if self.config.static_address.is_some() {
            info!("{}: using static address {}", name, self.lease.net());
            self.lease.lease_time = INFINITE_LEASE;
            reason = Some(Reason::Static);
        } else if self.config.inform_address.is_some() {
            info!("{}: received approval for {}", name, self.lease.addr);
            self.lease.lease_time = INFINITE_LEASE;
            reason = Some(Reason::Inform);
        } else if self.lease.from_info {
            reason = Some(Reason::Timeout);
        }

        let adjusted = self.lease.normalize();
        if adjusted.lease_raised {
            warn!("{}: minimum lease is {} seconds", name, MIN_LEASE_SECS);
        }
        if adjusted.rebind_forced {
            warn!(
                "{}: rebind time greater than lease time, forcing to {} seconds",
                name, self.lease.rebind_time
            );
        }
        if adjusted.renewal_forced {
            warn!(
                "{}: renewal time greater than rebind time, forcing to {} seconds",
                name, self.lease.renewal_time
            );
        }
        if reason.is_none() || reason == Some(Reason::Timeout) {
            if self.lease.is_infinite() {
                info!("{}: leased {} for infinity", name, self.lease.addr);
            } else {
                info!(
                    "{}: leased {} for {} seconds",
                    name, self.lease.addr, self.lease.lease_time
                );
            }
        }

        if self.config.test {
            out.push(Action::RunScript {
                reason: Reason::Test,
                old: self.old.clone(),
                new: self.new.clone(),
            });
            self.close_all(out);
            out.push(Action::Exit(ExitStatus::Success));
            return;
        }

        let reason = reason.unwrap_or_else(|| match &self.old {
            Some(old)
                if old.yiaddr == yiaddr
                    && !self.lease.server.is_unspecified()
                    && self.accepted_in != State::Rebinding =>
            {
                Reason::Renew
            }
            Some(_) => Reason::Rebind,
            None if self.accepted_in == State::Reboot => Reason::Reboot,
            None => Reason::Bound,
        });

        // Clears the overall deadline too: a bound session no longer times out.
        self.timers = Timers::default();
        if let Some((renew, rebind, expire)) = self.lease.deadlines(now) {
            self.timers.arm(TimerKind::Renew, renew);
            self.timers.arm(TimerKind::Rebind, rebind);
            self.timers.arm(TimerKind::Expire, expire);
            debug!(
                "{}: renew in {} seconds, rebind in {} seconds",
                name, self.lease.renewal_time, self.lease.rebind_time
            );
        }
        self.lease.bound_at = Some(now);
        self.state = State::Bound;
        self.backoff.reset();
        self.iface.addr = Some(self.lease.net());

        let mut script_old = self.old.clone();
        if let Some(addr) = self.link_local.claimed.take() {
            info!("{}: dropping IPv4LL address {}", name, addr);
            script_old.get_or_insert_with(|| Message::synthetic(addr, ipv4ll::netmask()));
        }
        if !self.config.arp && self.arp_open {
            out.push(Action::CloseArp);
            self.arp_open = false;
        }

        let persist = !self.lease.from_info
            && self.config.inform_address.is_none()
            && self.config.static_address.is_none();
        if persist {
            if let Some(new) = &self.new {
                out.push(Action::WriteLease(new.clone()));
            }
        }
        out.push(Action::RunScript {
            reason,
            old: script_old,
            new: self.new.clone(),
        });
    }

    fn start_ipv4ll(&mut self, now: Instant, out: &mut Vec<Action>) {
        if !self.config.ipv4ll || self.link_local.claimed.is_some() || self.new.is_some() {
            return;
        }
        if let Some(at) = self.link_local.gave_up_at {
            let resume = at + arp::RATE_LIMIT_INTERVAL;
            if now < resume {
                self.timers.arm(TimerKind::Stop, resume);
                return;
            }
            self.link_local.gave_up_at = None;
            self.link_local.conflicts = 0;
        }
        self.state = State::InitIpv4ll;
        let addr = self.link_local.picker.pick();
        info!("{}: probing for an IPv4LL address {}", self.iface.name, addr);
        self.start_probe(now, addr, ProbeTarget::LinkLocal, out);
    }

    fn start_probe(
        &mut self,
        now: Instant,
        addr: Ipv4Addr,
        target: ProbeTarget,
        out: &mut Vec<Action>,
    ) {
        let probe = ArpProbe::new(addr, u16::from(self.iface.family), self.iface.hwaddr.clone());
        let delay = probe.initial_delay(&mut self.rng);
        self.open_arp(out);
        self.timers.arm(TimerKind::Arp, now + delay);
        self.probe = Some((probe, target));
        self.state = State::Probing;
    }

    fn arp_tick(&mut self, now: Instant, out: &mut Vec<Action>) {
        let step = match self.probe.as_mut() {
            Some((probe, _)) => probe.step(&mut self.rng),
            None => return,
        };
        match step {
            Step::Probe { packet, next } => {
                debug!("{}: ARP probing {}", self.iface.name, packet.tpa);
                self.send_arp(packet, out);
                self.timers.arm(TimerKind::Arp, now + next);
            }
            Step::Announce { packet, next } => {
                self.state = State::Announcing;
                debug!("{}: ARP announcing {}", self.iface.name, packet.spa);
                self.send_arp(packet, out);
                match next {
                    Some(delay) => self.timers.arm(TimerKind::Arp, now + delay),
                    None => self.probe_claimed(now, out),
                }
            }
        }
    }

    fn probe_claimed(&mut self, now: Instant, out: &mut Vec<Action>) {
        let Some((probe, target)) = self.probe.take() else {
            return;
        };
        match target {
            ProbeTarget::Offer | ProbeTarget::Static => self.bind(now, out),
            ProbeTarget::LinkLocal => self.bind_ipv4ll(now, probe.addr(), out),
        }
    }

    fn bind_ipv4ll(&mut self, now: Instant, addr: Ipv4Addr, out: &mut Vec<Action>) {
        info!("{}: using IPv4LL address {}", self.iface.name, addr);
        self.link_local.claimed = Some(addr);
        self.iface.addr = Some(Ipv4Net::new(addr, ipv4ll::netmask()));
        self.timers.cancel(TimerKind::Exit);
        out.push(Action::RunScript {
            reason: Reason::Ipv4ll,
            old: None,
            new: Some(Message::synthetic(addr, ipv4ll::netmask())),
        });
        // DHCP keeps looking for a server in the background.
        self.discover(now, out);
    }

    fn on_arp(&mut self, now: Instant, bytes: &[u8], out: &mut Vec<Action>) {
        let packet = match ArpPacket::parse(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("{}: ignoring ARP packet: {}", self.iface.name, e);
                return;
            }
        };
        if packet.sha == self.iface.hwaddr {
            return;
        }

        if let Some((probe, target)) = &self.probe {
            if probe.is_conflict(&packet) {
                let (addr, target) = (probe.addr(), *target);
                self.probe_conflict(now, addr, target, &packet, out);
                return;
            }
        }

        if self.new.is_some()
            && !self.lease.is_empty()
            && arp::claims_address(&packet, self.lease.addr, &self.iface.hwaddr)
        {
            self.defend(now, self.lease.addr, false, &packet, out);
            return;
        }
        if let Some(addr) = self.link_local.claimed {
            if arp::claims_address(&packet, addr, &self.iface.hwaddr) {
                self.defend(now, addr, true, &packet, out);
            }
        }
    }

    fn probe_conflict(
        &mut self,
        now: Instant,
        addr: Ipv4Addr,
        target: ProbeTarget,
        packet: &ArpPacket,
        out: &mut Vec<Action>,
    ) {
        warn!(
            "{}: address {} is in use by {}",
            self.iface.name,
            addr,
            hwaddr_to_string(&packet.sha)
        );
        self.probe = None;
        self.timers.cancel(TimerKind::Arp);

        match target {
            ProbeTarget::Offer => {
                if !self.lease.from_info {
                    self.transmit(now, MessageType::Decline, Destination::Broadcast, out);
                }
                out.push(Action::RemoveLease);
                self.offer = None;
                self.lease.clear();
                self.state = State::Init;
                self.timers.arm(TimerKind::Restart, now + DECLINE_RETRY);
            }
            ProbeTarget::Static => {
                error!("{}: static address {} is taken", self.iface.name, addr);
                self.offer = None;
                self.state = State::Init;
                self.timers
                    .arm(TimerKind::Restart, now + arp::RATE_LIMIT_INTERVAL);
            }
            ProbeTarget::LinkLocal => {
                self.link_local.conflicts += 1;
                if self.link_local.conflicts <= arp::MAX_CONFLICTS {
                    let next = self.link_local.picker.pick();
                    info!("{}: trying IPv4LL address {}", self.iface.name, next);
                    self.start_probe(now, next, ProbeTarget::LinkLocal, out);
                } else {
                    warn!(
                        "{}: {} IPv4LL conflicts, giving up for now",
                        self.iface.name, self.link_local.conflicts
                    );
                    self.link_local.gave_up_at = Some(now);
                    self.discover(now, out);
                }
            }
        }
    }

    fn defend(
        &mut self,
        now: Instant,
        addr: Ipv4Addr,
        link_local: bool,
        packet: &ArpPacket,
        out: &mut Vec<Action>,
    ) {
        let name = self.iface.name.clone();
        match self.defender.on_conflict(now) {
            Defense::Defend => {
                info!(
                    "{}: defending {} against {}",
                    name,
                    addr,
                    hwaddr_to_string(&packet.sha)
                );
                let announce =
                    ArpPacket::announce(u16::from(self.iface.family), &self.iface.hwaddr, addr);
                self.send_arp(announce, out);
            }
            Defense::Yield => {
                error!("{}: lost {} to {}", name, addr, hwaddr_to_string(&packet.sha));
                self.defender.reset();
                if link_local {
                    self.link_local.claimed = None;
                    self.link_local.conflicts += 1;
                    if self.new.is_none() {
                        self.iface.addr = None;
                    }
                    out.push(Action::RunScript {
                        reason: Reason::Expire,
                        old: Some(Message::synthetic(addr, ipv4ll::netmask())),
                        new: None,
                    });
                    self.start_ipv4ll(now, out);
                } else {
                    self.drop_lease(Reason::Expire, out);
                    out.push(Action::RemoveLease);
                    self.discover(now, out);
                }
            }
        }
    }

    fn on_signal(&mut self, now: Instant, signal: Signal, out: &mut Vec<Action>) {
        match signal {
            Signal::Stop => {
                if self.config.persistent {
                    info!("{}: exiting, configuration kept", self.iface.name);
                    self.close_all(out);
                    out.push(Action::Exit(ExitStatus::Success));
                } else if self.config.release_on_stop {
                    self.release(now, out);
                } else {
                    self.drop_lease(Reason::Stop, out);
                    self.close_all(out);
                    out.push(Action::Exit(ExitStatus::Success));
                }
            }
            Signal::Release => self.release(now, out),
            Signal::Renew => {
                if self.new.is_some() && !self.lease.is_empty() {
                    self.renew_requested(now, out);
                } else {
                    self.discover(now, out);
                }
            }
        }
    }

    /// Releases the lease to its server and ends the session.
    fn release(&mut self, now: Instant, out: &mut Vec<Action>) {
        if self.new.is_some() && self.lease.is_dhcp && !self.lease.is_empty() {
            if self.lease.server.is_unspecified() {
                if let Some(server) = self.new.as_ref().and_then(|m| m.server_id().ok().flatten()) {
                    self.lease.server = server;
                }
            }
            info!("{}: releasing lease of {}", self.iface.name, self.lease.addr);
            self.new_xid();
            let to = if self.lease.server.is_unspecified() {
                Destination::Broadcast
            } else {
                Destination::Unicast(self.lease.server)
            };
            self.transmit(now, MessageType::Release, to, out);
        }
        self.drop_lease(Reason::Release, out);
        out.push(Action::RemoveLease);
        self.close_all(out);
        out.push(Action::Exit(ExitStatus::Success));
    }

    fn on_link(&mut self, now: Instant, link: LinkState, out: &mut Vec<Action>) {
        match link {
            LinkState::Down => {
                if !self.carrier {
                    return;
                }
                self.carrier = false;
                info!("{}: carrier lost", self.iface.name);
                self.close_all(out);
                if matches!(self.probe, Some((_, ProbeTarget::Offer))) {
                    self.offer = None;
                }
                self.probe = None;
                if let Some(addr) = self.link_local.claimed.take() {
                    debug!("{}: forgetting IPv4LL address {}", self.iface.name, addr);
                }
                self.timers
                    .retain(|kind| kind.is_lease_timer() || kind == TimerKind::Exit);
                self.state = if self.new.is_some() {
                    State::Bound
                } else {
                    State::Init
                };
                out.push(Action::RunScript {
                    reason: Reason::NoCarrier,
                    old: None,
                    new: None,
                });
            }
            LinkState::Up => {
                if self.carrier {
                    return;
                }
                self.carrier = true;
                info!("{}: carrier acquired", self.iface.name);
                out.push(Action::RunScript {
                    reason: Reason::Carrier,
                    old: None,
                    new: None,
                });
                self.restart(now, out);
            }
        }
    }

    fn on_transport_error(&mut self, now: Instant, out: &mut Vec<Action>) {
        warn!(
            "{}: transport failed, restarting in {} seconds",
            self.iface.name,
            TRANSPORT_RETRY.as_secs()
        );
        if self.transport_open {
            out.push(Action::CloseTransport);
            self.transport_open = false;
        }
        if matches!(self.probe, Some((_, ProbeTarget::Offer | ProbeTarget::Static))) {
            self.probe = None;
            self.offer = None;
        }
        self.timers
            .retain(|kind| kind.is_lease_timer() || kind == TimerKind::Exit);
        self.state = State::Init;
        self.timers.arm(TimerKind::Restart, now + TRANSPORT_RETRY);
    }

    /// Closes the ARP channel. It is reopened by the next probe or defense.
    fn on_arp_error(&mut self, now: Instant, out: &mut Vec<Action>) {
        if self.arp_open {
            out.push(Action::CloseArp);
            self.arp_open = false;
        }
        self.timers.cancel(TimerKind::Arp);
        match self.probe.take() {
            Some((probe, ProbeTarget::Offer | ProbeTarget::Static)) => {
                warn!(
                    "{}: ARP failed, using {} without conflict detection",
                    self.iface.name,
                    probe.addr()
                );
                self.bind(now, out);
            }
            Some((probe, ProbeTarget::LinkLocal)) => {
                warn!(
                    "{}: ARP failed, abandoning IPv4LL address {}",
                    self.iface.name,
                    probe.addr()
                );
                self.link_local.gave_up_at = Some(now);
                self.discover(now, out);
            }
            None => debug!("{}: ARP channel closed", self.iface.name),
        }
    }
}

fn is_valid_address(addr: Ipv4Addr) -> bool {
    !(addr.is_multicast() || addr.is_broadcast() || addr.is_loopback() || addr.octets()[0] == 0)
}

impl DhcpStateMachine for Session {
    fn start(&mut self, now: Instant, persisted: Option<StoredLease>) -> Vec<Action> {
        Session::start(self, now, persisted)
    }

    fn handle_event(&mut self, now: Instant, event: Event) -> Vec<Action> {
        self.advance(now, event)
    }

    fn next_deadline(&self) -> Option<Instant> {
        Session::next_deadline(self)
    }

    fn state_name(&self) -> &'static str {
        self.state.name()
    }
}
