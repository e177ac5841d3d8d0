use super::SocketError;
use bytes::Bytes;
use std::{
    ffi::CString,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};
use tokio::io::unix::AsyncFd;

const ETH_P_ARP: u16 = libc::ETH_P_ARP as u16;

/// An `AF_PACKET` datagram socket that carries ARP payloads without the
/// link header. Outgoing packets go to the link broadcast address.
#[derive(Debug)]
pub(super) struct ArpSocket {
    fd: AsyncFd<OwnedFd>,
    ifindex: i32,
}

fn link_addr(ifindex: i32) -> libc::sockaddr_ll {
    // SAFETY: sockaddr_ll is plain data; all-zero is a valid value.
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = ETH_P_ARP.to_be();
    addr.sll_ifindex = ifindex;
    addr
}

fn interface_index(interface: &str) -> Result<i32, SocketError> {
    let index_error = |source| SocketError::InterfaceIndex {
        interface: interface.to_string(),
        source,
    };
    let name = CString::new(interface)
        .map_err(|e| index_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    // SAFETY: `name` is a valid NUL terminated string.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(index_error(io::Error::last_os_error()));
    }
    i32::try_from(index).map_err(|e| index_error(io::Error::new(io::ErrorKind::InvalidData, e)))
}

impl ArpSocket {
    pub(super) fn open(interface: &str) -> Result<Self, SocketError> {
        let ifindex = interface_index(interface)?;

        // SAFETY: plain socket(2) call; the result is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                i32::from(ETH_P_ARP.to_be()),
            )
        };
        if raw < 0 {
            return Err(SocketError::CreateSocket(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = link_addr(ifindex);
        // SAFETY: `addr` is a valid sockaddr_ll and the length matches.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(SocketError::BindSocket(io::Error::last_os_error()));
        }

        let fd = AsyncFd::new(fd).map_err(SocketError::ConvertToTokio)?;
        Ok(Self { fd, ifindex })
    }

    pub(super) async fn send(&self, packet: &[u8]) -> Result<(), SocketError> {
        let mut addr = link_addr(self.ifindex);
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&[0xff; 6]);

        loop {
            let mut guard = self.fd.writable().await.map_err(SocketError::Send)?;
            let sent = guard.try_io(|fd| {
                // SAFETY: buffer and address are valid for the given lengths.
                let n = unsafe {
                    libc::sendto(
                        fd.get_ref().as_raw_fd(),
                        packet.as_ptr() as *const libc::c_void,
                        packet.len(),
                        0,
                        &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
            match sent {
                Ok(result) => return result.map_err(SocketError::Send),
                Err(_would_block) => continue,
            }
        }
    }

    pub(super) async fn recv(&self, buf: &mut [u8]) -> Result<Bytes, SocketError> {
        loop {
            let mut guard = self.fd.readable().await.map_err(SocketError::ArpReceive)?;
            let read = guard.try_io(|fd| {
                // SAFETY: `buf` is valid for writes of its length.
                let n = unsafe {
                    libc::recv(
                        fd.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match read {
                Ok(result) => {
                    let len = result.map_err(SocketError::ArpReceive)?;
                    return Ok(Bytes::copy_from_slice(&buf[..len]));
                }
                Err(_would_block) => continue,
            }
        }
    }
}
