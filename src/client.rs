//! DHCP client driver
//!
//! The state machine decides; this module does. `DhcpClient` waits on the
//! transport, the signal and link channels and the machine's next deadline,
//! feeds whichever fires into the machine and carries out the actions it
//! returns, in order.

use crate::{
    config::ClientConfig,
    interface::Interface,
    network::{Destination, Received, SocketError, Transport},
    script::{self, Reason},
    v4::{
        handler::Session,
        leasefile::{self, StoredLease},
        message::Message,
        options::Catalog,
    },
};
use bytes::Bytes;
use std::{collections::VecDeque, net::Ipv4Addr, sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Operator requests delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop, dropping (or releasing) the lease unless persistent.
    Stop,
    /// Renew the current lease now.
    Renew,
    /// Release the lease to the server and stop.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// External events the state machine responds to.
#[derive(Debug, Clone)]
pub enum Event {
    /// The deadline reported by `next_deadline` has passed.
    Timeout,
    Packet { bytes: Bytes, from: Ipv4Addr },
    Arp(Bytes),
    Signal(Signal),
    Link(LinkState),
    TransportError,
    /// The ARP channel failed; the DHCP transport is unaffected.
    ArpError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

/// Actions the state machine returns, carried out by the driver.
#[derive(Debug, Clone)]
pub enum Action {
    Send { packet: Bytes, to: Destination },
    SendArp(Bytes),
    OpenTransport,
    CloseTransport,
    OpenArp,
    CloseArp,
    RunScript {
        reason: Reason,
        old: Option<Message>,
        new: Option<Message>,
    },
    WriteLease(Message),
    RemoveLease,
    Exit(ExitStatus),
}

/// Common interface of a DHCP state machine.
pub trait DhcpStateMachine {
    /// Begins operation, optionally from a lease read back from disk.
    fn start(&mut self, now: Instant, persisted: Option<StoredLease>) -> Vec<Action>;
    /// Handles one event and returns what to do about it.
    fn handle_event(&mut self, now: Instant, event: Event) -> Vec<Action>;
    /// When the machine next wants a `Timeout`.
    fn next_deadline(&self) -> Option<Instant>;
    /// Current state name (for logging).
    fn state_name(&self) -> &'static str;
}

pub struct DhcpClient<T: Transport> {
    config: ClientConfig,
    catalog: Arc<Catalog>,
    transport: T,
    state_machine: Box<dyn DhcpStateMachine + Send>,
    signals: mpsc::Receiver<Signal>,
    links: mpsc::Receiver<LinkState>,
}

impl<T: Transport> DhcpClient<T> {
    pub fn new(
        config: ClientConfig,
        transport: T,
        signals: mpsc::Receiver<Signal>,
        links: mpsc::Receiver<LinkState>,
    ) -> Self {
        let catalog = Arc::new(Catalog::standard());
        let mut iface = Interface::new(config.interface.clone(), config.mac_address.clone());
        iface.family = config.hwtype;
        iface.mtu = config.mtu;
        let session = Session::new(config.clone(), iface, Arc::clone(&catalog));
        Self::with_state_machine(config, catalog, transport, Box::new(session), signals, links)
    }

    pub fn with_state_machine(
        config: ClientConfig,
        catalog: Arc<Catalog>,
        transport: T,
        state_machine: Box<dyn DhcpStateMachine + Send>,
        signals: mpsc::Receiver<Signal>,
        links: mpsc::Receiver<LinkState>,
    ) -> Self {
        Self {
            config,
            catalog,
            transport,
            state_machine,
            signals,
            links,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn load_lease(&self) -> Option<StoredLease> {
        if self.config.static_address.is_some() || self.config.inform_address.is_some() {
            return None;
        }
        match leasefile::read_lease(&self.config.lease_file).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    "{}: ignoring lease file {}: {}",
                    self.config.interface,
                    self.config.lease_file.display(),
                    e
                );
                None
            }
        }
    }

    /// Runs until the state machine asks to exit.
    pub async fn run(&mut self) -> ExitStatus {
        let persisted = self.load_lease().await;
        let mut queue: VecDeque<Action> = self
            .state_machine
            .start(Instant::now(), persisted)
            .into();

        loop {
            while let Some(action) = queue.pop_front() {
                if let Some(status) = self.execute(action, &mut queue).await {
                    info!(
                        "{}: exiting in state {}",
                        self.config.interface,
                        self.state_machine.state_name()
                    );
                    self.transport.close_udp();
                    self.transport.close_arp();
                    return status;
                }
            }

            let deadline = self.state_machine.next_deadline();
            let event = tokio::select! {
                biased;
                Some(signal) = self.signals.recv() => {
                    info!("{}: received {:?}", self.config.interface, signal);
                    Event::Signal(signal)
                }
                Some(link) = self.links.recv() => Event::Link(link),
                received = self.transport.recv() => match received {
                    Ok(Received::Udp { bytes, from }) => Event::Packet { bytes, from },
                    Ok(Received::Arp(bytes)) => Event::Arp(bytes),
                    Err(e @ SocketError::ArpReceive(_)) => {
                        error!("{}: {}", self.config.interface, e);
                        Event::ArpError
                    }
                    Err(e) => {
                        error!("{}: {}", self.config.interface, e);
                        Event::TransportError
                    }
                },
                _ = sleep_until(deadline) => Event::Timeout,
            };
            queue.extend(self.state_machine.handle_event(Instant::now(), event));
        }
    }

    /// Carries out one action; returns the exit status when it is `Exit`.
    async fn execute(&mut self, action: Action, queue: &mut VecDeque<Action>) -> Option<ExitStatus> {
        let name = self.config.interface.as_str();
        match action {
            Action::OpenTransport => {
                if let Err(e) = self.transport.open_udp() {
                    error!("{}: {}", name, e);
                    queue.extend(
                        self.state_machine
                            .handle_event(Instant::now(), Event::TransportError),
                    );
                }
            }
            Action::CloseTransport => self.transport.close_udp(),
            Action::OpenArp => {
                if let Err(e) = self.transport.open_arp() {
                    warn!("{}: ARP unavailable: {}", name, e);
                }
            }
            Action::CloseArp => self.transport.close_arp(),
            Action::Send { packet, to } => match self.transport.send(&packet, to).await {
                Ok(()) => {}
                // The retransmit timer tries again.
                Err(SocketError::WouldBlock) => debug!("{}: send to {:?} would block", name, to),
                Err(e) => {
                    error!("{}: send to {:?} failed: {}", name, to, e);
                    queue.extend(
                        self.state_machine
                            .handle_event(Instant::now(), Event::TransportError),
                    );
                }
            },
            Action::SendArp(packet) => {
                if let Err(e) = self.transport.send_arp(&packet).await {
                    debug!("{}: ARP send failed: {}", name, e);
                }
            }
            Action::RunScript { reason, old, new } => {
                self.run_script(reason, old.as_ref(), new.as_ref()).await;
            }
            Action::WriteLease(msg) => {
                if let Err(e) = leasefile::write_lease(&self.config.lease_file, &msg).await {
                    error!(
                        "{}: writing {}: {}",
                        name,
                        self.config.lease_file.display(),
                        e
                    );
                }
            }
            Action::RemoveLease => {
                if let Err(e) = leasefile::remove_lease(&self.config.lease_file).await {
                    error!(
                        "{}: removing {}: {}",
                        name,
                        self.config.lease_file.display(),
                        e
                    );
                }
            }
            Action::Exit(status) => return Some(status),
        }
        None
    }

    async fn run_script(&self, reason: Reason, old: Option<&Message>, new: Option<&Message>) {
        let name = self.config.interface.as_str();
        let Some(path) = &self.config.script else {
            debug!("{}: {} (no script configured)", name, reason);
            return;
        };
        let env = script::build_env(
            &self.catalog,
            name,
            &self.config.mac_address,
            reason,
            old,
            new,
        );
        debug!("{}: executing {} {}", name, path.display(), reason);
        match script::run(path, &env).await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("{}: {} exited with {}", name, path.display(), status),
            Err(e) => error!("{}: failed to run {}: {}", name, path.display(), e),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
