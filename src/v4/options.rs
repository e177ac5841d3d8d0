//! DHCP option catalog and option sets.
//!
//! The catalog is an immutable table built once and passed by reference to
//! the codec. It drives length validation on decode, the parameter request
//! list on encode and the script environment.

use super::rfc::{self, Route, SipServers};
use crate::error::DecodeError;
use std::{fmt, net::Ipv4Addr};

/// Well known option codes.
pub mod code {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVER: u8 = 6;
    pub const HOST_NAME: u8 = 12;
    pub const DOMAIN_NAME: u8 = 15;
    pub const INTERFACE_MTU: u8 = 26;
    pub const BROADCAST: u8 = 28;
    pub const STATIC_ROUTE: u8 = 33;
    pub const VENDOR: u8 = 43;
    pub const REQUESTED_ADDRESS: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const OPTION_OVERLOAD: u8 = 52;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_REQUEST_LIST: u8 = 55;
    pub const MESSAGE: u8 = 56;
    pub const MAX_MESSAGE_SIZE: u8 = 57;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBIND_TIME: u8 = 59;
    pub const VENDOR_CLASS_ID: u8 = 60;
    pub const CLIENT_ID: u8 = 61;
    pub const USER_CLASS: u8 = 77;
    pub const RAPID_COMMIT: u8 = 80;
    pub const FQDN: u8 = 81;
    pub const AUTO_CONFIGURE: u8 = 116;
    pub const DOMAIN_SEARCH: u8 = 119;
    pub const SIP_SERVER: u8 = 120;
    pub const CLASSLESS_ROUTES: u8 = 121;
    pub const MS_CLASSLESS_ROUTES: u8 = 249;
    pub const END: u8 = 255;
}

/// A set over the full 0..=255 option tag range.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionSet {
    bits: [u64; 4],
}

impl OptionSet {
    pub const fn new() -> Self {
        Self { bits: [0; 4] }
    }

    pub fn contains(&self, code: u8) -> bool {
        self.bits[usize::from(code >> 6)] & (1u64 << (code & 63)) != 0
    }

    pub fn insert(&mut self, code: u8) {
        self.bits[usize::from(code >> 6)] |= 1u64 << (code & 63);
    }

    pub fn remove(&mut self, code: u8) {
        self.bits[usize::from(code >> 6)] &= !(1u64 << (code & 63));
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8).filter(move |&c| self.contains(c))
    }
}

impl FromIterator<u8> for OptionSet {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut set = OptionSet::new();
        for code in iter {
            set.insert(code);
        }
        set
    }
}

impl fmt::Debug for OptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Semantic type of an option payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Flag,
    U8,
    U16,
    U32,
    I16,
    I32,
    Addr,
    /// Destination/gateway address pairs (RFC 2132 static routes).
    AddrPair,
    String,
    Binary,
    /// RFC 3397 compressed domain search list.
    DomainList,
    /// RFC 3442 classless static routes.
    ClasslessRoutes,
    /// RFC 3361 SIP servers.
    SipServers,
    /// RFC 4702 client FQDN.
    Fqdn,
}

impl OptionKind {
    /// Element width for fixed size types.
    pub fn width(self) -> Option<usize> {
        match self {
            OptionKind::Flag => Some(0),
            OptionKind::U8 => Some(1),
            OptionKind::U16 | OptionKind::I16 => Some(2),
            OptionKind::U32 | OptionKind::I32 | OptionKind::Addr => Some(4),
            OptionKind::AddrPair => Some(8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OptionDef {
    pub code: u8,
    pub name: &'static str,
    pub kind: OptionKind,
    pub array: bool,
    /// Requested by default.
    pub request: bool,
    /// Never placed in the parameter request list.
    pub no_request: bool,
}

impl OptionDef {
    const fn new(code: u8, name: &'static str, kind: OptionKind) -> Self {
        Self {
            code,
            name,
            kind,
            array: false,
            request: false,
            no_request: false,
        }
    }

    const fn array(mut self) -> Self {
        self.array = true;
        self
    }

    const fn request(mut self) -> Self {
        self.request = true;
        self
    }

    const fn no_request(mut self) -> Self {
        self.no_request = true;
        self
    }

    /// Checks a decoded payload length against this definition.
    pub fn validate(&self, len: usize) -> Result<(), DecodeError> {
        let ok = match self.kind.width() {
            Some(0) => len == 0,
            Some(width) if self.array || self.kind == OptionKind::AddrPair => {
                len != 0 && len % width == 0
            }
            Some(width) => len == width,
            None => len != 0,
        };
        if ok {
            Ok(())
        } else {
            Err(DecodeError::OptionLength {
                code: self.code,
                len,
            })
        }
    }
}

fn definitions() -> Vec<OptionDef> {
    use OptionKind::*;
    vec![
        OptionDef::new(1, "subnet_mask", Addr).request(),
        OptionDef::new(2, "time_offset", I32),
        OptionDef::new(3, "routers", Addr).array().request(),
        OptionDef::new(4, "time_servers", Addr).array(),
        OptionDef::new(5, "ien116_name_servers", Addr).array(),
        OptionDef::new(6, "domain_name_servers", Addr).array().request(),
        OptionDef::new(7, "log_servers", Addr).array(),
        OptionDef::new(8, "cookie_servers", Addr).array(),
        OptionDef::new(9, "lpr_servers", Addr).array(),
        OptionDef::new(10, "impress_servers", Addr).array(),
        OptionDef::new(11, "resource_location_servers", Addr).array(),
        OptionDef::new(12, "host_name", String).request(),
        OptionDef::new(13, "boot_size", U16),
        OptionDef::new(14, "merit_dump", String),
        OptionDef::new(15, "domain_name", String).request(),
        OptionDef::new(16, "swap_server", Addr),
        OptionDef::new(17, "root_path", String),
        OptionDef::new(18, "extensions_path", String),
        OptionDef::new(19, "ip_forwarding", U8),
        OptionDef::new(20, "non_local_source_routing", U8),
        OptionDef::new(21, "policy_filter", AddrPair),
        OptionDef::new(22, "max_dgram_reassembly", U16),
        OptionDef::new(23, "default_ip_ttl", U8),
        OptionDef::new(24, "path_mtu_aging_timeout", U32),
        OptionDef::new(25, "path_mtu_plateau_table", U16).array(),
        OptionDef::new(26, "interface_mtu", U16).request(),
        OptionDef::new(27, "all_subnets_local", U8),
        OptionDef::new(28, "broadcast_address", Addr).request(),
        OptionDef::new(29, "perform_mask_discovery", U8),
        OptionDef::new(30, "mask_supplier", U8),
        OptionDef::new(31, "router_discovery", U8),
        OptionDef::new(32, "router_solicitation_address", Addr),
        OptionDef::new(33, "static_routes", AddrPair).request(),
        OptionDef::new(34, "trailer_encapsulation", U8),
        OptionDef::new(35, "arp_cache_timeout", U32),
        OptionDef::new(36, "ieee802_3_encapsulation", U8),
        OptionDef::new(37, "default_tcp_ttl", U8),
        OptionDef::new(38, "tcp_keepalive_interval", U32),
        OptionDef::new(39, "tcp_keepalive_garbage", U8),
        OptionDef::new(40, "nis_domain", String),
        OptionDef::new(41, "nis_servers", Addr).array(),
        OptionDef::new(42, "ntp_servers", Addr).array().request(),
        OptionDef::new(43, "vendor_encapsulated_options", Binary),
        OptionDef::new(44, "netbios_name_servers", Addr).array(),
        OptionDef::new(45, "netbios_dd_server", Addr).array(),
        OptionDef::new(46, "netbios_node_type", U8),
        OptionDef::new(47, "netbios_scope", String),
        OptionDef::new(48, "font_servers", Addr).array(),
        OptionDef::new(49, "x_display_manager", Addr).array(),
        OptionDef::new(50, "dhcp_requested_address", Addr).no_request(),
        OptionDef::new(51, "dhcp_lease_time", U32).request(),
        OptionDef::new(52, "dhcp_option_overloaded", U8).no_request(),
        OptionDef::new(53, "dhcp_message_type", U8).no_request(),
        OptionDef::new(54, "dhcp_server_identifier", Addr).request(),
        OptionDef::new(55, "dhcp_parameter_request_list", Binary).no_request(),
        OptionDef::new(56, "dhcp_message", String).no_request(),
        OptionDef::new(57, "dhcp_max_message_size", U16).no_request(),
        OptionDef::new(58, "dhcp_renewal_time", U32).request(),
        OptionDef::new(59, "dhcp_rebinding_time", U32).request(),
        OptionDef::new(60, "vendor_class_identifier", Binary).no_request(),
        OptionDef::new(61, "dhcp_client_identifier", Binary).no_request(),
        OptionDef::new(64, "nisplus_domain", String),
        OptionDef::new(65, "nisplus_servers", Addr).array(),
        OptionDef::new(66, "tftp_server_name", String),
        OptionDef::new(67, "bootfile_name", String),
        OptionDef::new(68, "mobile_ip_home_agent", Addr).array(),
        OptionDef::new(69, "smtp_server", Addr).array(),
        OptionDef::new(70, "pop_server", Addr).array(),
        OptionDef::new(71, "nntp_server", Addr).array(),
        OptionDef::new(72, "www_server", Addr).array(),
        OptionDef::new(73, "finger_server", Addr).array(),
        OptionDef::new(74, "irc_server", Addr).array(),
        OptionDef::new(75, "streettalk_server", Addr).array(),
        OptionDef::new(76, "streettalk_directory_assistance_server", Addr).array(),
        OptionDef::new(77, "user_class", Binary).no_request(),
        OptionDef::new(80, "rapid_commit", Flag).no_request(),
        OptionDef::new(81, "fqdn", Fqdn),
        OptionDef::new(85, "nds_servers", Addr).array(),
        OptionDef::new(86, "nds_tree_name", String),
        OptionDef::new(87, "nds_context", String),
        OptionDef::new(100, "posix_timezone", String),
        OptionDef::new(101, "tzdb_timezone", String),
        OptionDef::new(116, "auto_configure", U8).no_request(),
        OptionDef::new(118, "subnet_selection", Addr),
        OptionDef::new(119, "domain_search", DomainList).request(),
        OptionDef::new(120, "sip_server", OptionKind::SipServers),
        OptionDef::new(121, "classless_static_routes", ClasslessRoutes).request(),
        OptionDef::new(249, "ms_classless_static_routes", ClasslessRoutes),
        OptionDef::new(252, "wpad_url", String),
    ]
}

/// Immutable option lookup table.
#[derive(Debug, Clone)]
pub struct Catalog {
    defs: Vec<OptionDef>,
    index: [Option<u8>; 256],
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl Catalog {
    /// The RFC 2132 family of options understood by the client.
    pub fn standard() -> Self {
        Self::from_defs(definitions())
    }

    pub fn from_defs(defs: Vec<OptionDef>) -> Self {
        let mut index = [None; 256];
        for (i, def) in defs.iter().enumerate().take(usize::from(u8::MAX)) {
            index[usize::from(def.code)] = Some(i as u8);
        }
        Self { defs, index }
    }

    pub fn get(&self, code: u8) -> Option<&OptionDef> {
        self.index[usize::from(code)].map(|i| &self.defs[usize::from(i)])
    }

    pub fn find(&self, name: &str) -> Option<&OptionDef> {
        self.defs.iter().find(|def| def.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionDef> {
        self.defs.iter()
    }

    pub fn default_request_mask(&self) -> OptionSet {
        self.defs
            .iter()
            .filter(|def| def.request)
            .map(|def| def.code)
            .collect()
    }

    /// Resolves an option given either by number or by catalog name.
    pub fn parse_code(&self, text: &str) -> Option<u8> {
        text.parse::<u8>()
            .ok()
            .or_else(|| self.find(text).map(|def| def.code))
    }
}

/// A decoded option payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Flag,
    U8(u8),
    U16(u16),
    U32(u32),
    I16(i16),
    I32(i32),
    Addr(Ipv4Addr),
    U8s(Vec<u8>),
    U16s(Vec<u16>),
    U32s(Vec<u32>),
    Addrs(Vec<Ipv4Addr>),
    String(String),
    Binary(Vec<u8>),
    DomainList(Vec<String>),
    Routes(Vec<Route>),
    Sip(SipServers),
    Fqdn { flags: u8, name: String },
}

impl OptionValue {
    /// Decodes `data` according to `def`, validating its length first.
    ///
    /// Options missing from the catalog decode as opaque bytes.
    pub fn decode(def: Option<&OptionDef>, data: &[u8]) -> Result<OptionValue, DecodeError> {
        let Some(def) = def else {
            return Ok(OptionValue::Binary(data.to_vec()));
        };
        def.validate(data.len())?;

        let value = match def.kind {
            OptionKind::Flag => OptionValue::Flag,
            OptionKind::U8 if def.array => OptionValue::U8s(data.to_vec()),
            OptionKind::U8 => OptionValue::U8(data[0]),
            OptionKind::U16 if def.array => OptionValue::U16s(
                data.chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect(),
            ),
            OptionKind::U16 => OptionValue::U16(u16::from_be_bytes([data[0], data[1]])),
            OptionKind::I16 => OptionValue::I16(i16::from_be_bytes([data[0], data[1]])),
            OptionKind::U32 if def.array => OptionValue::U32s(
                data.chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            OptionKind::U32 => {
                OptionValue::U32(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            OptionKind::I32 => {
                OptionValue::I32(i32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            OptionKind::Addr if def.array => OptionValue::Addrs(addrs(data)),
            OptionKind::Addr => OptionValue::Addr(Ipv4Addr::new(data[0], data[1], data[2], data[3])),
            OptionKind::AddrPair => OptionValue::Addrs(addrs(data)),
            OptionKind::String => OptionValue::String(printable(data)),
            OptionKind::Binary => OptionValue::Binary(data.to_vec()),
            OptionKind::DomainList => OptionValue::DomainList(rfc::domain_list(data)?),
            OptionKind::ClasslessRoutes => OptionValue::Routes(rfc::classless_routes(data)?),
            OptionKind::SipServers => OptionValue::Sip(rfc::sip_servers(data)?),
            OptionKind::Fqdn => {
                if data.len() < 3 {
                    return Err(DecodeError::OptionLength {
                        code: def.code,
                        len: data.len(),
                    });
                }
                // The E flag selects wire format names over ASCII.
                let name = if data[0] & 0x04 != 0 {
                    rfc::domain_list(&data[3..])?.join(" ")
                } else {
                    printable(&data[3..])
                };
                OptionValue::Fqdn {
                    flags: data[0],
                    name,
                }
            }
        };
        Ok(value)
    }
}

fn addrs(data: &[u8]) -> Vec<Ipv4Addr> {
    data.chunks_exact(4)
        .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
        .collect()
}

/// Converts option text to a shell safe string, stopping at the first NUL.
fn printable(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let mut out = String::with_capacity(end);
    for &b in &data[..end] {
        match b {
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => out.push_str(&format!("\\{b:03o}")),
        }
    }
    out
}

fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Flag => f.write_str("1"),
            OptionValue::U8(v) => write!(f, "{v}"),
            OptionValue::U16(v) => write!(f, "{v}"),
            OptionValue::U32(v) => write!(f, "{v}"),
            OptionValue::I16(v) => write!(f, "{v}"),
            OptionValue::I32(v) => write!(f, "{v}"),
            OptionValue::Addr(a) => write!(f, "{a}"),
            OptionValue::U8s(v) => join(f, v),
            OptionValue::U16s(v) => join(f, v),
            OptionValue::U32s(v) => join(f, v),
            OptionValue::Addrs(v) => join(f, v),
            OptionValue::String(s) => f.write_str(s),
            OptionValue::Binary(bytes) => {
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            OptionValue::DomainList(names) => join(f, names),
            OptionValue::Routes(routes) => join(f, routes),
            OptionValue::Sip(sip) => write!(f, "{sip}"),
            OptionValue::Fqdn { name, .. } => f.write_str(name),
        }
    }
}
