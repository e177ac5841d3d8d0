//! Sockets for DHCP and ARP traffic on one interface.
//!
//! The session only knows the `Transport` trait. `LinuxTransport` is the
//! real implementation; tests substitute their own.

pub mod link;
#[cfg(target_os = "linux")]
mod raw;

use bytes::Bytes;
use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket},
};
use thiserror::Error;
use tokio::net::UdpSocket as TokioUdpSocket;
use tracing::debug;

/// Largest datagram read from either socket.
pub const RECV_BUFFER: usize = 4096;

/// Defines all possible errors for socket operations.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Failed to create a new socket")]
    CreateSocket(#[source] io::Error),

    #[error("Failed to enable broadcast on socket")]
    SetBroadcast(#[source] io::Error),

    #[error("Failed to set SO_BINDTODEVICE on interface '{interface}'")]
    BindToDevice {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Interface '{interface}' has no index")]
    InterfaceIndex {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind socket to address")]
    BindSocket(#[source] io::Error),

    #[error("Failed to set SO_REUSEADDR on socket")]
    SetReuseAddress(#[source] io::Error),

    #[error("Failed to set socket to non-blocking mode")]
    SetNonBlocking(#[source] io::Error),

    #[error("Failed to convert socket to TokioUdpSocket")]
    ConvertToTokio(#[source] io::Error),

    #[error("Failed to send packet")]
    Send(#[source] io::Error),

    #[error("Failed to receive packet")]
    Receive(#[source] io::Error),

    #[error("Failed to receive ARP packet")]
    ArpReceive(#[source] io::Error),

    #[error("Socket would block")]
    WouldBlock,

    #[error("Socket is not open")]
    NotOpen,

    #[error("Raw sockets are not implemented on this platform")]
    NotImplemented,
}

/// Where a DHCP message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Unicast(Ipv4Addr),
}

/// One datagram read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Udp { bytes: Bytes, from: Ipv4Addr },
    Arp(Bytes),
}

/// Packet I/O used by the client driver.
///
/// `recv` must be cancel safe: the driver races it against timers and
/// signals. With nothing open it never completes.
#[allow(async_fn_in_trait)]
pub trait Transport {
    fn open_udp(&mut self) -> Result<(), SocketError>;
    fn close_udp(&mut self);
    fn open_arp(&mut self) -> Result<(), SocketError>;
    fn close_arp(&mut self);
    async fn send(&mut self, packet: &[u8], to: Destination) -> Result<(), SocketError>;
    async fn send_arp(&mut self, packet: &[u8]) -> Result<(), SocketError>;
    async fn recv(&mut self) -> Result<Received, SocketError>;
}

/// Creates a new `tokio::net::UdpSocket` bound to a specific network device and port.
///
/// Broadcast is enabled so DISCOVER and REQUEST can leave an interface
/// that has no address yet.
#[cfg(target_os = "linux")]
pub fn new_tokio_socket_bound_to_device(
    interface: &str,
    port: u16,
) -> Result<TokioUdpSocket, SocketError> {
    use socket2::{Domain, Socket, Type};
    use std::os::fd::AsRawFd;

    let socket2 =
        Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(SocketError::CreateSocket)?;
    socket2
        .set_broadcast(true)
        .map_err(SocketError::SetBroadcast)?;
    socket2
        .set_reuse_address(true)
        .map_err(SocketError::SetReuseAddress)?;

    // SAFETY: the fd is owned by `socket2` and the option value is a byte
    // string of the given length.
    let ret = unsafe {
        libc::setsockopt(
            socket2.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SocketError::BindToDevice {
            interface: interface.to_string(),
            source: io::Error::last_os_error(),
        });
    }

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket2.bind(&addr.into()).map_err(SocketError::BindSocket)?;

    let std_socket: StdUdpSocket = socket2.into();
    std_socket
        .set_nonblocking(true)
        .map_err(SocketError::SetNonBlocking)?;
    TokioUdpSocket::from_std(std_socket).map_err(SocketError::ConvertToTokio)
}

/// Fallback for non-Linux systems where `SO_BINDTODEVICE` is not available.
#[cfg(not(target_os = "linux"))]
pub fn new_tokio_socket_bound_to_device(
    _interface: &str,
    _port: u16,
) -> Result<TokioUdpSocket, SocketError> {
    Err(SocketError::NotImplemented)
}

/// UDP ports 68/67 plus an `AF_PACKET` socket for ARP.
#[derive(Debug)]
pub struct LinuxTransport {
    interface: String,
    client_port: u16,
    server_port: u16,
    broadcast: Ipv4Addr,
    udp: Option<TokioUdpSocket>,
    #[cfg(target_os = "linux")]
    arp: Option<raw::ArpSocket>,
}

impl LinuxTransport {
    pub fn new(interface: &str, client_port: u16, server_port: u16, broadcast: Ipv4Addr) -> Self {
        Self {
            interface: interface.to_string(),
            client_port,
            server_port,
            broadcast,
            udp: None,
            #[cfg(target_os = "linux")]
            arp: None,
        }
    }

    pub fn from_config(config: &crate::config::ClientConfig) -> Self {
        Self::new(
            &config.interface,
            config.client_port,
            config.server_port,
            config.broadcast_address,
        )
    }

    fn arp_open(&self) -> bool {
        #[cfg(target_os = "linux")]
        return self.arp.is_some();
        #[cfg(not(target_os = "linux"))]
        return false;
    }
}

async fn recv_udp(socket: &TokioUdpSocket, buf: &mut [u8]) -> Result<Received, SocketError> {
    loop {
        let (len, from) = socket.recv_from(buf).await.map_err(SocketError::Receive)?;
        match from {
            SocketAddr::V4(from) => {
                return Ok(Received::Udp {
                    bytes: Bytes::copy_from_slice(&buf[..len]),
                    from: *from.ip(),
                })
            }
            SocketAddr::V6(from) => debug!("ignoring datagram from {}", from),
        }
    }
}

/// Waits for either channel; DHCP traffic wins when both are ready.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
async fn udp_first(
    udp: impl Future<Output = Result<Received, SocketError>>,
    arp: impl Future<Output = Result<Bytes, SocketError>>,
) -> Result<Received, SocketError> {
    tokio::select! {
        biased;
        received = udp => received,
        received = arp => received.map(Received::Arp),
    }
}

impl Transport for LinuxTransport {
    fn open_udp(&mut self) -> Result<(), SocketError> {
        if self.udp.is_none() {
            self.udp = Some(new_tokio_socket_bound_to_device(
                &self.interface,
                self.client_port,
            )?);
            debug!("{}: opened UDP port {}", self.interface, self.client_port);
        }
        Ok(())
    }

    fn close_udp(&mut self) {
        if self.udp.take().is_some() {
            debug!("{}: closed UDP port {}", self.interface, self.client_port);
        }
    }

    #[cfg(target_os = "linux")]
    fn open_arp(&mut self) -> Result<(), SocketError> {
        if self.arp.is_none() {
            self.arp = Some(raw::ArpSocket::open(&self.interface)?);
            debug!("{}: opened ARP socket", self.interface);
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn open_arp(&mut self) -> Result<(), SocketError> {
        Err(SocketError::NotImplemented)
    }

    fn close_arp(&mut self) {
        #[cfg(target_os = "linux")]
        if self.arp.take().is_some() {
            debug!("{}: closed ARP socket", self.interface);
        }
    }

    async fn send(&mut self, packet: &[u8], to: Destination) -> Result<(), SocketError> {
        let udp = self.udp.as_ref().ok_or(SocketError::NotOpen)?;
        let ip = match to {
            Destination::Broadcast => self.broadcast,
            Destination::Unicast(addr) => addr,
        };
        let target = SocketAddr::V4(SocketAddrV4::new(ip, self.server_port));
        match udp.try_send_to(packet, target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(SocketError::WouldBlock),
            Err(e) => Err(SocketError::Send(e)),
        }
    }

    #[cfg(target_os = "linux")]
    async fn send_arp(&mut self, packet: &[u8]) -> Result<(), SocketError> {
        let arp = self.arp.as_ref().ok_or(SocketError::NotOpen)?;
        arp.send(packet).await
    }

    #[cfg(not(target_os = "linux"))]
    async fn send_arp(&mut self, _packet: &[u8]) -> Result<(), SocketError> {
        Err(SocketError::NotImplemented)
    }

    async fn recv(&mut self) -> Result<Received, SocketError> {
        let mut udp_buf = vec![0u8; RECV_BUFFER];
        if !self.arp_open() {
            return match &self.udp {
                Some(udp) => recv_udp(udp, &mut udp_buf).await,
                None => std::future::pending().await,
            };
        }

        #[cfg(target_os = "linux")]
        {
            let mut arp_buf = vec![0u8; RECV_BUFFER];
            if let (Some(udp), Some(arp)) = (&self.udp, &self.arp) {
                return udp_first(recv_udp(udp, &mut udp_buf), arp.recv(&mut arp_buf)).await;
            }
            if let Some(arp) = &self.arp {
                return arp.recv(&mut arp_buf).await.map(Received::Arp);
            }
        }
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::{pending, ready};

    #[tokio::test]
    async fn test_udp_wins_when_both_ready() {
        for _ in 0..16 {
            let udp = ready(Ok(Received::Udp {
                bytes: Bytes::from_static(b"dhcp"),
                from: Ipv4Addr::new(10, 0, 0, 1),
            }));
            let arp = ready(Ok(Bytes::from_static(b"arp")));
            let received = udp_first(udp, arp).await.unwrap();
            assert!(matches!(received, Received::Udp { .. }));
        }
    }

    #[tokio::test]
    async fn test_arp_delivered_while_udp_idle() {
        let arp = ready(Ok(Bytes::from_static(b"arp")));
        let udp = pending::<Result<Received, SocketError>>();
        let received = udp_first(udp, arp).await.unwrap();
        assert_eq!(received, Received::Arp(Bytes::from_static(b"arp")));
    }
}
