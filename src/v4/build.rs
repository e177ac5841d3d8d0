//! Outgoing message construction.

use super::{
    lease::Lease,
    message::{Message, BOOTP_MIN_LEN, BROADCAST_FLAG, DHCP_FIXED_LEN, IP_UDP_SIZE, MAGIC_COOKIE},
    options::{code, Catalog},
    rfc,
};
use crate::{
    config::{ClientConfig, FqdnMode},
    error::EncodeError,
    interface::{Interface, ARPHRD_ETHER, ARPHRD_IEEE802},
};
use bytes::{BufMut, Bytes, BytesMut};
use dhcproto::v4::MessageType;
use std::time::Duration;

/// Smallest MTU every IPv4 host must handle.
pub const MTU_MIN: u16 = 576;
const DAD_MESSAGE: &[u8] = b"Duplicate address detected";

/// Everything a message is built from besides its type.
pub struct Request<'a> {
    pub config: &'a ClientConfig,
    pub catalog: &'a Catalog,
    pub iface: &'a Interface,
    /// The lease the message is about: the offer, the bound lease or the
    /// address being declined.
    pub lease: &'a Lease,
    pub xid: u32,
    /// Time since the session started, for the secs field.
    pub elapsed: Duration,
    pub client_id: &'a [u8],
}

/// Derives the client identifier.
///
/// An explicit identifier wins, then an RFC 4361 identifier built from the
/// DUID, then the hardware family and address.
pub fn client_id(config: &ClientConfig, iface: &Interface) -> Vec<u8> {
    if let Some(id) = &config.client_id {
        return id.clone();
    }
    if let Some(duid) = &config.duid {
        let mut id = Vec::with_capacity(5 + duid.len());
        id.push(255);
        id.extend_from_slice(&iaid(&iface.hwaddr).to_be_bytes());
        id.extend_from_slice(duid);
        return id;
    }
    let mut id = Vec::with_capacity(1 + iface.hwlen());
    id.push(iface.family);
    id.extend_from_slice(&iface.hwaddr);
    id
}

/// IAID from the last four octets of the hardware address.
fn iaid(hwaddr: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let tail = &hwaddr[hwaddr.len().saturating_sub(4)..];
    buf[4 - tail.len()..].copy_from_slice(tail);
    u32::from_be_bytes(buf)
}

fn put_option(buf: &mut BytesMut, code: u8, data: &[u8]) {
    // Anything over 255 octets is split per RFC 3396.
    let mut chunks = data.chunks(255).peekable();
    if chunks.peek().is_none() {
        buf.put_u8(code);
        buf.put_u8(0);
    }
    for chunk in chunks {
        buf.put_u8(code);
        buf.put_u8(chunk.len() as u8);
        buf.extend_from_slice(chunk);
    }
}

/// Builds a message of type `kind`.
pub fn encode(kind: MessageType, req: &Request<'_>) -> Result<Bytes, EncodeError> {
    let config = req.config;
    let iface = req.iface;
    let lease = req.lease;
    let configured = iface.addr;

    let mut msg = Message {
        xid: req.xid,
        cookie: MAGIC_COOKIE,
        ..Message::default()
    };

    let lease_is_configured = configured
        .is_some_and(|net| net.addr == lease.addr && net.mask == lease.mask);
    match kind {
        MessageType::Inform => {
            msg.ciaddr = configured.map_or(lease.addr, |net| net.addr);
        }
        MessageType::Release => {
            msg.ciaddr = lease.addr;
        }
        MessageType::Request if lease_is_configured && lease.is_dhcp => {
            msg.ciaddr = lease.addr;
        }
        _ => {}
    }

    msg.htype = iface.family;
    if matches!(iface.family, ARPHRD_ETHER | ARPHRD_IEEE802) && iface.hwlen() <= msg.chaddr.len()
    {
        msg.hlen = iface.hwlen() as u8;
        msg.chaddr[..iface.hwlen()].copy_from_slice(&iface.hwaddr);
    }

    let is_drop = matches!(kind, MessageType::Decline | MessageType::Release);
    if config.broadcast && msg.ciaddr.is_unspecified() && !is_drop {
        msg.flags = BROADCAST_FLAG;
    }
    if !is_drop {
        msg.secs = u16::try_from(req.elapsed.as_secs()).unwrap_or(u16::MAX);
    }

    let mtu = iface.mtu.max(MTU_MIN);
    let mut opts = BytesMut::with_capacity(usize::from(mtu));
    opts.put_u8(code::MESSAGE_TYPE);
    opts.put_u8(1);
    opts.put_u8(u8::from(kind));

    if !req.client_id.is_empty() {
        put_option(&mut opts, code::CLIENT_ID, req.client_id);
    }

    if !lease.is_empty() && lease.is_dhcp {
        let asks_for_lease = kind == MessageType::Request && !iface.has_address(lease.addr);
        if kind == MessageType::Decline || asks_for_lease {
            put_option(&mut opts, code::REQUESTED_ADDRESS, &lease.addr.octets());
            if !lease.server.is_unspecified() {
                put_option(&mut opts, code::SERVER_ID, &lease.server.octets());
            }
        }
        if kind == MessageType::Release && !lease.server.is_unspecified() {
            put_option(&mut opts, code::SERVER_ID, &lease.server.octets());
        }
    }

    if kind == MessageType::Decline {
        put_option(&mut opts, code::MESSAGE, DAD_MESSAGE);
    }

    if kind == MessageType::Discover {
        if !config.test && config.request.contains(code::RAPID_COMMIT) {
            put_option(&mut opts, code::RAPID_COMMIT, &[]);
        }
        if let Some(addr) = config.requested_address {
            put_option(&mut opts, code::REQUESTED_ADDRESS, &addr.octets());
        }
        if config.ipv4ll {
            put_option(&mut opts, code::AUTO_CONFIGURE, &[1]);
        }
    }

    if matches!(
        kind,
        MessageType::Discover | MessageType::Inform | MessageType::Request
    ) {
        let max_size = mtu - IP_UDP_SIZE as u16;
        put_option(&mut opts, code::MAX_MESSAGE_SIZE, &max_size.to_be_bytes());

        if let Some(class) = &config.user_class {
            put_option(&mut opts, code::USER_CLASS, class);
        }
        if let Some(vendor) = &config.vendor_class_id {
            put_option(&mut opts, code::VENDOR_CLASS_ID, vendor);
        }
        if kind != MessageType::Inform {
            if let Some(secs) = config.lease_time {
                put_option(&mut opts, code::LEASE_TIME, &secs.to_be_bytes());
            }
        }

        let hostname = config.hostname.as_deref().filter(|h| !h.is_empty());
        if config.fqdn != FqdnMode::Disable {
            let mut fqdn = Vec::with_capacity(3 + hostname.map_or(0, |h| h.len() + 2));
            let flags = if hostname.is_some() {
                config.fqdn.flags()
            } else {
                FqdnMode::None.flags()
            };
            fqdn.extend_from_slice(&[flags, 0, 0]);
            if let Some(name) = hostname {
                fqdn.extend_from_slice(&rfc::encode_rfc1035(name)?);
            }
            put_option(&mut opts, code::FQDN, &fqdn);
        } else if let Some(name) = hostname {
            put_option(&mut opts, code::HOST_NAME, name.as_bytes());
        }

        // The configured mask is authoritative; it starts from the catalog
        // defaults.
        let prl: Vec<u8> = config
            .request
            .iter()
            .filter(|&c| !req.catalog.get(c).is_some_and(|def| def.no_request))
            .filter(|&c| !config.no_request.contains(c))
            .filter(|&c| {
                kind != MessageType::Inform || !matches!(c, code::RENEWAL_TIME | code::REBIND_TIME)
            })
            .collect();
        if !prl.is_empty() {
            put_option(&mut opts, code::PARAMETER_REQUEST_LIST, &prl);
        }
    }

    opts.put_u8(code::END);

    let needed = DHCP_FIXED_LEN + opts.len();
    let available = usize::from(mtu) - IP_UDP_SIZE;
    if needed > available {
        return Err(EncodeError::TooBig { needed, available });
    }
    // Some relays drop anything shorter than a BOOTP message.
    if needed < BOOTP_MIN_LEN {
        opts.put_bytes(code::PAD, BOOTP_MIN_LEN - needed);
    }

    msg.options = opts.to_vec();
    Ok(msg.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const MAC: [u8; 6] = [0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4];
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const LEASED: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn config() -> ClientConfig {
        ClientConfig::new("eth0".to_string(), Bytes::from_static(&MAC))
    }

    fn iface() -> Interface {
        Interface::new("eth0", Bytes::from_static(&MAC))
    }

    fn leased() -> Lease {
        Lease {
            addr: LEASED,
            mask: Ipv4Addr::new(255, 255, 255, 0),
            server: SERVER,
            lease_time: 3600,
            is_dhcp: true,
            ..Lease::default()
        }
    }

    fn build(kind: MessageType, config: &ClientConfig, lease: &Lease) -> Message {
        let catalog = Catalog::standard();
        let iface = iface();
        let client_id = client_id(config, &iface);
        let req = Request {
            config,
            catalog: &catalog,
            iface: &iface,
            lease,
            xid: 0x1234_5678,
            elapsed: Duration::from_secs(3),
            client_id: &client_id,
        };
        Message::parse(&encode(kind, &req).unwrap()).unwrap()
    }

    fn prl(msg: &Message) -> Vec<u8> {
        msg.raw_option(code::PARAMETER_REQUEST_LIST)
            .unwrap()
            .unwrap()
            .into_owned()
    }

    #[test]
    fn test_long_option_is_split_and_reassembled() {
        let data: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let mut buf = BytesMut::new();
        put_option(&mut buf, code::USER_CLASS, &data);
        assert_eq!(buf.len(), 600 + 3 * 2);
        assert_eq!(&buf[..2], &[code::USER_CLASS, 255]);

        let mut config = config();
        config.user_class = Some(data.clone());
        let msg = build(MessageType::Discover, &config, &Lease::default());
        assert_eq!(
            msg.raw_option(code::USER_CLASS).unwrap().as_deref(),
            Some(&data[..])
        );
    }

    #[test]
    fn test_client_id_forms() {
        let mut config = config();
        assert_eq!(client_id(&config, &iface()), [&[1u8][..], &MAC[..]].concat());

        config.duid = Some(vec![0, 3, 0, 1, 0xaa, 0xbb]);
        assert_eq!(
            client_id(&config, &iface()),
            vec![255, 0x29, 0xa8, 0x92, 0xf4, 0, 3, 0, 1, 0xaa, 0xbb]
        );

        config.client_id = Some(b"lab-box".to_vec());
        assert_eq!(client_id(&config, &iface()), b"lab-box".to_vec());
    }

    #[test]
    fn test_fqdn_replaces_host_name() {
        let mut config = config();
        config.hostname = Some("box".to_string());
        config.fqdn = FqdnMode::Both;
        let msg = build(MessageType::Request, &config, &leased());
        assert_eq!(
            msg.raw_option(code::FQDN).unwrap().as_deref(),
            Some(&[0x05, 0, 0, 3, b'b', b'o', b'x'][..])
        );
        assert!(!msg.has_option(code::HOST_NAME));

        config.fqdn = FqdnMode::Disable;
        let msg = build(MessageType::Request, &config, &leased());
        assert_eq!(
            msg.option_string(code::HOST_NAME).unwrap().as_deref(),
            Some("box")
        );
        assert!(!msg.has_option(code::FQDN));
    }

    #[test]
    fn test_short_messages_are_padded() {
        let catalog = Catalog::standard();
        let config = config();
        let iface = iface();
        let lease = leased();
        let req = Request {
            config: &config,
            catalog: &catalog,
            iface: &iface,
            lease: &lease,
            xid: 1,
            elapsed: Duration::ZERO,
            client_id: &[],
        };
        let packet = encode(MessageType::Release, &req).unwrap();
        assert_eq!(packet.len(), BOOTP_MIN_LEN);

        let msg = Message::parse(&packet).unwrap();
        assert_eq!(msg.ciaddr, LEASED);
        assert_eq!(msg.server_id().unwrap(), Some(SERVER));
        assert_eq!(msg.secs, 0);
        assert!(!msg.has_option(code::PARAMETER_REQUEST_LIST));
    }

    #[test]
    fn test_inform_does_not_ask_for_lease_timers() {
        let config = config();
        let discover = build(MessageType::Discover, &config, &Lease::default());
        assert!(prl(&discover).contains(&code::RENEWAL_TIME));
        assert!(prl(&discover).contains(&code::REBIND_TIME));
        assert_eq!(discover.secs, 3);

        let inform = build(MessageType::Inform, &config, &leased());
        assert_eq!(inform.ciaddr, LEASED);
        assert!(!prl(&inform).contains(&code::RENEWAL_TIME));
        assert!(!prl(&inform).contains(&code::REBIND_TIME));
        assert!(prl(&inform).contains(&code::SUBNET_MASK));
    }

    #[test]
    fn test_request_list_follows_configured_mask() {
        let mut config = config();
        let list = prl(&build(MessageType::Discover, &config, &Lease::default()));
        assert!(list.contains(&code::ROUTER));

        config.request.remove(code::ROUTER);
        config.request.insert(224);
        let list = prl(&build(MessageType::Discover, &config, &Lease::default()));
        assert!(!list.contains(&code::ROUTER));
        assert!(list.contains(&224));
        assert!(!list.contains(&code::RAPID_COMMIT));
    }
}
