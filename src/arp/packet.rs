//! ARP packet codec for IPv4 addresses over any hardware type.

use crate::error::DecodeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

pub const ARPOP_REQUEST: u16 = 1;
pub const ARPOP_REPLY: u16 = 2;
const ETHERTYPE_IP: u16 = 0x0800;

/// An ARP packet for IPv4 over any hardware type, without the link header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub htype: u16,
    pub op: u16,
    pub sha: Bytes,
    pub spa: Ipv4Addr,
    pub tha: Bytes,
    pub tpa: Ipv4Addr,
}

impl ArpPacket {
    /// A probe asks who has `target` without claiming any sender address.
    pub fn probe(htype: u16, hwaddr: &Bytes, target: Ipv4Addr) -> Self {
        Self {
            htype,
            op: ARPOP_REQUEST,
            sha: hwaddr.clone(),
            spa: Ipv4Addr::UNSPECIFIED,
            tha: Bytes::from(vec![0; hwaddr.len()]),
            tpa: target,
        }
    }

    /// A gratuitous request claiming `addr`.
    pub fn announce(htype: u16, hwaddr: &Bytes, addr: Ipv4Addr) -> Self {
        Self {
            spa: addr,
            ..Self::probe(htype, hwaddr, addr)
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 8 {
            return Err(DecodeError::Truncated {
                needed: 8,
                available: data.len(),
            });
        }
        let mut buf = data;
        let htype = buf.get_u16();
        let ptype = buf.get_u16();
        let hlen = usize::from(buf.get_u8());
        let plen = buf.get_u8();
        let op = buf.get_u16();
        if ptype != ETHERTYPE_IP || plen != 4 {
            return Err(DecodeError::NotArp);
        }
        let needed = 8 + 2 * (hlen + 4);
        if data.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                available: data.len(),
            });
        }
        let sha = Bytes::copy_from_slice(&buf[..hlen]);
        buf.advance(hlen);
        let spa = Ipv4Addr::from(buf.get_u32());
        let tha = Bytes::copy_from_slice(&buf[..hlen]);
        buf.advance(hlen);
        let tpa = Ipv4Addr::from(buf.get_u32());
        Ok(Self {
            htype,
            op,
            sha,
            spa,
            tha,
            tpa,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 2 * (self.sha.len() + 4));
        buf.put_u16(self.htype);
        buf.put_u16(ETHERTYPE_IP);
        buf.put_u8(self.sha.len() as u8);
        buf.put_u8(4);
        buf.put_u16(self.op);
        buf.extend_from_slice(&self.sha);
        buf.put_u32(u32::from(self.spa));
        buf.extend_from_slice(&self.tha);
        buf.put_u32(u32::from(self.tpa));
        buf.freeze()
    }
}
