//! The fixed layout BOOTP/DHCP wire record and option lookup.

use super::options::{code, Catalog, OptionKind, OptionValue};
use crate::error::DecodeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dhcproto::v4::MessageType;
use std::{borrow::Cow, net::Ipv4Addr};

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const MAGIC_COOKIE: u32 = 0x6382_5363;
pub const BROADCAST_FLAG: u16 = 0x8000;

/// Bytes before the vendor area.
pub const HEADER_LEN: usize = 236;
/// Header plus magic cookie.
pub const DHCP_FIXED_LEN: usize = HEADER_LEN + 4;
/// Smallest message a BOOTP relay is required to accept.
pub const BOOTP_MIN_LEN: usize = 300;
/// IPv4 and UDP header overhead.
pub const IP_UDP_SIZE: usize = 28;
/// Limit on an RFC 3396 reassembled option.
pub const MAX_CONCAT_LEN: usize = 64 * 1024;

const SNAME_LEN: usize = 64;
const FILE_LEN: usize = 128;

const OVERLOAD_FILE: u8 = 1;
const OVERLOAD_SNAME: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; SNAME_LEN],
    pub file: [u8; FILE_LEN],
    /// Zero when the sender is a plain BOOTP peer.
    pub cookie: u32,
    /// Option bytes following the cookie.
    pub options: Vec<u8>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            op: BOOTREQUEST,
            htype: 0,
            hlen: 0,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; 16],
            sname: [0; SNAME_LEN],
            file: [0; FILE_LEN],
            cookie: 0,
            options: Vec::new(),
        }
    }
}

/// A decoded option with its reassembled length and catalog type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedOption {
    pub value: OptionValue,
    pub len: usize,
    pub kind: Option<OptionKind>,
}

impl Message {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                available: data.len(),
            });
        }
        let mut buf = data;
        let mut msg = Message {
            op: buf.get_u8(),
            htype: buf.get_u8(),
            hlen: buf.get_u8(),
            hops: buf.get_u8(),
            xid: buf.get_u32(),
            secs: buf.get_u16(),
            flags: buf.get_u16(),
            ciaddr: Ipv4Addr::from(buf.get_u32()),
            yiaddr: Ipv4Addr::from(buf.get_u32()),
            siaddr: Ipv4Addr::from(buf.get_u32()),
            giaddr: Ipv4Addr::from(buf.get_u32()),
            ..Message::default()
        };
        buf.copy_to_slice(&mut msg.chaddr);
        buf.copy_to_slice(&mut msg.sname);
        buf.copy_to_slice(&mut msg.file);
        if buf.remaining() >= 4 {
            msg.cookie = buf.get_u32();
            msg.options = buf.to_vec();
        }
        Ok(msg)
    }

    /// Serializes the message exactly as held, without padding.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DHCP_FIXED_LEN + self.options.len());
        self.put_header(&mut buf);
        if self.cookie != 0 || !self.options.is_empty() {
            buf.put_u32(self.cookie);
            buf.extend_from_slice(&self.options);
        }
        buf.freeze()
    }

    /// Header and options up to and including the end marker.
    ///
    /// This is what gets persisted, so trailing padding or garbage after
    /// the end option never reaches disk.
    pub fn persisted_bytes(&self) -> Bytes {
        let mut cursor = Cursor::new(&self.options);
        for _ in cursor.by_ref() {}
        let used = if cursor.ended() {
            cursor.position()
        } else {
            self.options.len()
        };
        let mut buf = BytesMut::with_capacity(DHCP_FIXED_LEN + used);
        self.put_header(&mut buf);
        buf.put_u32(self.cookie);
        buf.extend_from_slice(&self.options[..used]);
        buf.freeze()
    }

    fn put_header(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op);
        buf.put_u8(self.htype);
        buf.put_u8(self.hlen);
        buf.put_u8(self.hops);
        buf.put_u32(self.xid);
        buf.put_u16(self.secs);
        buf.put_u16(self.flags);
        buf.put_u32(u32::from(self.ciaddr));
        buf.put_u32(u32::from(self.yiaddr));
        buf.put_u32(u32::from(self.siaddr));
        buf.put_u32(u32::from(self.giaddr));
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&self.sname);
        buf.extend_from_slice(&self.file);
    }

    pub fn is_dhcp(&self) -> bool {
        self.cookie == MAGIC_COOKIE
    }

    /// Compares the client hardware address field against `hwaddr`.
    pub fn chaddr_matches(&self, hwaddr: &[u8]) -> bool {
        hwaddr.len() <= self.chaddr.len()
            && usize::from(self.hlen) == hwaddr.len()
            && &self.chaddr[..hwaddr.len()] == hwaddr
    }

    pub fn sname_str(&self) -> String {
        c_string(&self.sname)
    }

    pub fn file_str(&self) -> String {
        c_string(&self.file)
    }

    /// Locates `code`, honoring option overload and RFC 3396 concatenation.
    ///
    /// The options area is scanned first. Only once its end marker is seen
    /// does an overload flag send the scan into the file field and then the
    /// server name field. Repeated occurrences are joined into a buffer that
    /// belongs to this call.
    pub fn raw_option(&self, code: u8) -> Result<Option<Cow<'_, [u8]>>, DecodeError> {
        if !self.is_dhcp() {
            return Ok(None);
        }

        let mut found: Option<Cow<'_, [u8]>> = None;
        let mut overload = 0u8;
        let mut cursor = Cursor::new(&self.options);
        while let Some(step) = cursor.next() {
            let (tag, data) = step?;
            if tag == code::OPTION_OVERLOAD && data.len() == 1 {
                overload = data[0];
            }
            if tag == code {
                append(&mut found, code, data)?;
            }
        }
        if !cursor.ended() {
            overload = 0;
        }

        let mut spill: Vec<&[u8]> = Vec::with_capacity(2);
        if overload & OVERLOAD_FILE != 0 {
            spill.push(&self.file);
        }
        if overload & OVERLOAD_SNAME != 0 {
            spill.push(&self.sname);
        }
        for area in spill {
            for step in Cursor::new(area) {
                let (tag, data) = step?;
                if tag == code {
                    append(&mut found, code, data)?;
                }
            }
        }
        Ok(found)
    }

    pub fn has_option(&self, code: u8) -> bool {
        matches!(self.raw_option(code), Ok(Some(_)))
    }

    /// Looks up and decodes `code` using the catalog's type for it.
    pub fn decode_option(
        &self,
        catalog: &Catalog,
        code: u8,
    ) -> Result<Option<DecodedOption>, DecodeError> {
        let Some(raw) = self.raw_option(code)? else {
            return Ok(None);
        };
        let def = catalog.get(code);
        let value = OptionValue::decode(def, &raw)?;
        Ok(Some(DecodedOption {
            value,
            len: raw.len(),
            kind: def.map(|d| d.kind),
        }))
    }

    fn fixed<const N: usize>(&self, code: u8) -> Result<Option<[u8; N]>, DecodeError> {
        match self.raw_option(code)? {
            None => Ok(None),
            Some(raw) => <[u8; N]>::try_from(raw.as_ref())
                .map(Some)
                .map_err(|_| DecodeError::OptionLength {
                    code,
                    len: raw.len(),
                }),
        }
    }

    pub fn option_u8(&self, code: u8) -> Result<Option<u8>, DecodeError> {
        Ok(self.fixed::<1>(code)?.map(|b| b[0]))
    }

    pub fn option_u16(&self, code: u8) -> Result<Option<u16>, DecodeError> {
        Ok(self.fixed::<2>(code)?.map(u16::from_be_bytes))
    }

    pub fn option_u32(&self, code: u8) -> Result<Option<u32>, DecodeError> {
        Ok(self.fixed::<4>(code)?.map(u32::from_be_bytes))
    }

    pub fn option_addr(&self, code: u8) -> Result<Option<Ipv4Addr>, DecodeError> {
        Ok(self.fixed::<4>(code)?.map(Ipv4Addr::from))
    }

    pub fn option_string(&self, code: u8) -> Result<Option<String>, DecodeError> {
        Ok(self.raw_option(code)?.map(|raw| c_string(&raw)))
    }

    /// The DHCP message type, or `None` for a BOOTP message.
    pub fn message_type(&self) -> Result<Option<MessageType>, DecodeError> {
        Ok(self.option_u8(code::MESSAGE_TYPE)?.map(MessageType::from))
    }

    pub fn server_id(&self) -> Result<Option<Ipv4Addr>, DecodeError> {
        self.option_addr(code::SERVER_ID)
    }

    /// Codes of every option present, in first appearance order.
    pub fn option_codes(&self) -> Vec<u8> {
        let mut seen = Vec::new();
        if !self.is_dhcp() {
            return seen;
        }
        let mut areas: Vec<&[u8]> = vec![&self.options];
        if let Ok(Some(overload)) = self.option_u8(code::OPTION_OVERLOAD) {
            if overload & OVERLOAD_FILE != 0 {
                areas.push(&self.file);
            }
            if overload & OVERLOAD_SNAME != 0 {
                areas.push(&self.sname);
            }
        }
        for area in areas {
            for (tag, _) in Cursor::new(area).map_while(Result::ok) {
                if !seen.contains(&tag) {
                    seen.push(tag);
                }
            }
        }
        seen
    }

    /// A reply stand in for a statically configured address.
    pub fn synthetic(addr: Ipv4Addr, mask: Ipv4Addr) -> Self {
        let mut options = Vec::with_capacity(7);
        options.extend_from_slice(&[code::SUBNET_MASK, 4]);
        options.extend_from_slice(&mask.octets());
        options.push(code::END);
        Message {
            op: BOOTREPLY,
            yiaddr: addr,
            cookie: MAGIC_COOKIE,
            options,
            ..Message::default()
        }
    }
}

fn append<'a>(
    found: &mut Option<Cow<'a, [u8]>>,
    code: u8,
    data: &'a [u8],
) -> Result<(), DecodeError> {
    match found {
        None => *found = Some(Cow::Borrowed(data)),
        Some(existing) => {
            let total = existing.len() + data.len();
            if total > MAX_CONCAT_LEN {
                return Err(DecodeError::ConcatOverflow {
                    code,
                    limit: MAX_CONCAT_LEN,
                });
            }
            existing.to_mut().extend_from_slice(data);
        }
    }
    Ok(())
}

fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Bounds checked walk over one option area.
///
/// Yields `(tag, payload)` for every option, skipping pads, and stops at the
/// end marker. A length that runs past the area yields an error and ends
/// the walk.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    ended: bool,
    failed: bool,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            ended: false,
            failed: false,
        }
    }

    /// True once the end marker has been consumed.
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Offset just past the last consumed byte.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = Result<(u8, &'a [u8]), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.ended && !self.failed {
            let &tag = self.data.get(self.pos)?;
            self.pos += 1;
            match tag {
                code::PAD => continue,
                code::END => {
                    self.ended = true;
                    return None;
                }
                _ => {}
            }
            let Some(&len) = self.data.get(self.pos) else {
                self.failed = true;
                return Some(Err(DecodeError::OptionOverrun { code: tag }));
            };
            let start = self.pos + 1;
            let end = start + usize::from(len);
            let Some(payload) = self.data.get(start..end) else {
                self.failed = true;
                return Some(Err(DecodeError::OptionOverrun { code: tag }));
            };
            self.pos = end;
            return Some(Ok((tag, payload)));
        }
        None
    }
}
