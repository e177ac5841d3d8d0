use crate::{
    error::ClientError,
    interface::{Ipv4Net, ARPHRD_ETHER},
    v4::options::{code, Catalog, OptionSet},
};
use clap::{Parser, ValueEnum};
use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The network interface to bind to (e.g., 'eth0', 'lo')
    #[arg(short, long)]
    pub interface: String,

    /// Host name to send to the server
    #[arg(long)]
    pub hostname: Option<String>,

    /// Send the client FQDN option instead of the host name
    #[arg(short = 'F', long, value_enum, default_value_t = FqdnMode::Disable)]
    pub fqdn: FqdnMode,

    /// Client identifier, hex octets separated by ':' or a plain string
    #[arg(short = 'I', long)]
    pub client_id: Option<String>,

    /// DUID in hex octets, enables RFC 4361 client identifiers
    #[arg(long)]
    pub duid: Option<String>,

    /// Vendor class identifier
    #[arg(long)]
    pub vendor_class_id: Option<String>,

    /// User class (RFC 3004)
    #[arg(long)]
    pub user_class: Option<String>,

    /// Extra option to request, by number or name
    #[arg(short = 'o', long = "request")]
    pub request: Vec<String>,

    /// Option the server must supply
    #[arg(short = 'Q', long = "require")]
    pub require: Vec<String>,

    /// Option never to request
    #[arg(short = 'O', long = "no-request")]
    pub no_request: Vec<String>,

    /// Reject replies carrying this option
    #[arg(long = "reject")]
    pub reject: Vec<String>,

    /// Skip ARP conflict detection
    #[arg(short = 'A', long)]
    pub no_arp: bool,

    /// Do not fall back to IPv4 link-local addressing
    #[arg(short = 'L', long)]
    pub no_ipv4ll: bool,

    /// Keep the address configured when exiting
    #[arg(short, long)]
    pub persistent: bool,

    /// Release the lease on stop
    #[arg(long)]
    pub release: bool,

    /// Use a static address instead of DHCP
    #[arg(short = 'S', long = "static")]
    pub static_address: Option<Ipv4Net>,

    /// Inform the server of an already configured address
    #[arg(short = 's', long)]
    pub inform: Option<Ipv4Net>,

    /// Address to ask for in DISCOVER
    #[arg(short = 'r', long)]
    pub request_address: Option<Ipv4Addr>,

    /// Lease time to ask for, in seconds
    #[arg(short = 'l', long)]
    pub lease_time: Option<u32>,

    /// Ignore servers in this network
    #[arg(short = 'X', long)]
    pub blacklist: Vec<Ipv4Net>,

    /// Only accept servers in this network
    #[arg(long)]
    pub whitelist: Vec<Ipv4Net>,

    /// Overall timeout in seconds, 0 waits forever
    #[arg(short, long, default_value_t = 30)]
    pub timeout: u64,

    /// Seconds to try rebooting a previous lease
    #[arg(short = 'y', long, default_value_t = 5)]
    pub reboot: u64,

    /// Seconds to wait for an ACK before rediscovering
    #[arg(long, default_value_t = 10)]
    pub request_timeout: u64,

    /// Interface MTU used to size messages
    #[arg(long, default_value_t = 1500)]
    pub mtu: u16,

    /// Lease file path
    #[arg(long)]
    pub lease_file: Option<PathBuf>,

    /// Configuration script
    #[arg(short = 'c', long)]
    pub script: Option<PathBuf>,

    /// Run the script with reason TEST on the first reply and exit
    #[arg(short = 'T', long)]
    pub test: bool,

    /// Fall back to the last lease when no server answers
    #[arg(short = 'E', long)]
    pub last_lease: bool,

    /// Ask servers to broadcast their replies
    #[arg(short = 'b', long)]
    pub broadcast: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

/// How the client FQDN option (RFC 4702) is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FqdnMode {
    /// Send the host name option instead
    Disable,
    /// Ask the server not to update DNS
    None,
    /// Ask the server to update only the PTR record
    Ptr,
    /// Ask the server to update both records
    Both,
}

impl FqdnMode {
    /// The N/E/O/S flag octet, always with canonical wire encoding.
    pub fn flags(self) -> u8 {
        let base = match self {
            FqdnMode::Disable | FqdnMode::Ptr => 0x00,
            FqdnMode::None => 0x08,
            FqdnMode::Both => 0x01,
        };
        base | 0x04
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub interface: String,
    pub mac_address: bytes::Bytes,
    pub hwtype: u8,
    pub client_port: u16,
    pub server_port: u16,
    pub broadcast_address: Ipv4Addr,
    pub client_id: Option<Vec<u8>>,
    pub duid: Option<Vec<u8>>,
    pub hostname: Option<String>,
    pub fqdn: FqdnMode,
    pub vendor_class_id: Option<Vec<u8>>,
    /// Already in RFC 3004 length prefixed form.
    pub user_class: Option<Vec<u8>>,
    pub request: OptionSet,
    pub require: OptionSet,
    pub no_request: OptionSet,
    pub reject: OptionSet,
    pub arp: bool,
    pub ipv4ll: bool,
    pub persistent: bool,
    pub release_on_stop: bool,
    pub static_address: Option<Ipv4Net>,
    pub inform_address: Option<Ipv4Net>,
    pub requested_address: Option<Ipv4Addr>,
    pub lease_time: Option<u32>,
    pub blacklist: Vec<Ipv4Net>,
    pub whitelist: Vec<Ipv4Net>,
    /// Overall deadline; zero waits forever.
    pub timeout: Duration,
    /// How long DISCOVER or INIT-REBOOT runs before falling back.
    pub initial_timeout: Duration,
    pub request_timeout: Duration,
    pub mtu: u16,
    pub lease_file: PathBuf,
    pub script: Option<PathBuf>,
    pub test: bool,
    pub last_lease: bool,
    pub broadcast: bool,
}

impl ClientConfig {
    pub fn new(interface: String, mac_address: bytes::Bytes) -> Self {
        let catalog = Catalog::standard();
        let lease_file = default_lease_file(&interface);
        Self {
            interface,
            mac_address,
            hwtype: ARPHRD_ETHER,
            client_port: 68,
            server_port: 67,
            broadcast_address: Ipv4Addr::BROADCAST,
            client_id: None,
            duid: None,
            hostname: None,
            fqdn: FqdnMode::Disable,
            vendor_class_id: None,
            user_class: None,
            request: catalog.default_request_mask(),
            require: [code::SERVER_ID].into_iter().collect(),
            no_request: OptionSet::new(),
            reject: OptionSet::new(),
            arp: true,
            ipv4ll: true,
            persistent: false,
            release_on_stop: false,
            static_address: None,
            inform_address: None,
            requested_address: None,
            lease_time: None,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            timeout: Duration::from_secs(30),
            initial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            mtu: 1500,
            lease_file,
            script: None,
            test: false,
            last_lease: false,
            broadcast: false,
        }
    }

    pub fn from_args(args: &Args, mac_address: bytes::Bytes) -> Result<Self, ClientError> {
        let catalog = Catalog::standard();
        let mut config = Self::new(args.interface.clone(), mac_address);

        let resolve = |names: &[String]| -> Result<Vec<u8>, ClientError> {
            names
                .iter()
                .map(|name| {
                    catalog
                        .parse_code(name)
                        .ok_or_else(|| ClientError::Config(format!("unknown option '{name}'")))
                })
                .collect()
        };
        for c in resolve(&args.request)? {
            config.request.insert(c);
        }
        for c in resolve(&args.require)? {
            config.require.insert(c);
            config.request.insert(c);
        }
        for c in resolve(&args.no_request)? {
            config.no_request.insert(c);
            config.request.remove(c);
        }
        for c in resolve(&args.reject)? {
            config.reject.insert(c);
        }

        config.hostname = args.hostname.clone();
        config.fqdn = args.fqdn;
        config.client_id = args.client_id.as_deref().map(parse_client_id);
        config.duid = args.duid.as_deref().map(parse_hex).transpose()?;
        config.vendor_class_id = args.vendor_class_id.as_ref().map(|s| s.as_bytes().to_vec());
        config.user_class = args
            .user_class
            .as_deref()
            .map(encode_user_class)
            .transpose()?;
        config.arp = !args.no_arp;
        config.ipv4ll = !args.no_ipv4ll;
        config.persistent = args.persistent;
        config.release_on_stop = args.release;
        config.static_address = args.static_address;
        config.inform_address = args.inform;
        config.requested_address = args.request_address;
        config.lease_time = args.lease_time;
        config.blacklist = args.blacklist.clone();
        config.whitelist = args.whitelist.clone();
        config.timeout = Duration::from_secs(args.timeout);
        config.initial_timeout = Duration::from_secs(args.reboot);
        config.request_timeout = Duration::from_secs(args.request_timeout);
        config.mtu = args.mtu;
        if let Some(path) = &args.lease_file {
            config.lease_file = path.clone();
        }
        config.script = args.script.clone();
        config.test = args.test;
        config.last_lease = args.last_lease;
        config.broadcast = args.broadcast;

        if config.static_address.is_some() && config.inform_address.is_some() {
            return Err(ClientError::Config(
                "--static and --inform are mutually exclusive".to_string(),
            ));
        }
        Ok(config)
    }

    /// True when replies from `addr` must be ignored.
    pub fn is_blacklisted(&self, addr: Ipv4Addr) -> bool {
        if !self.whitelist.is_empty() {
            return !self.whitelist.iter().any(|net| net.contains(addr));
        }
        self.blacklist.iter().any(|net| net.contains(addr))
    }
}

fn default_lease_file(interface: &str) -> PathBuf {
    PathBuf::from(format!("/var/lib/dhcp4c/{interface}.lease"))
}

/// Parses hex octets written as `01:02:ab`.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, ClientError> {
    text.split(':')
        .map(|part| {
            u8::from_str_radix(part, 16)
                .map_err(|e| ClientError::Config(format!("invalid hex octet '{part}': {e}")))
        })
        .collect()
}

/// Hex input is used as is, anything else becomes a type 0 identifier.
fn parse_client_id(text: &str) -> Vec<u8> {
    match parse_hex(text) {
        Ok(bytes) if text.contains(':') => bytes,
        _ => {
            let mut id = Vec::with_capacity(text.len() + 1);
            id.push(0);
            id.extend_from_slice(text.as_bytes());
            id
        }
    }
}

/// Encodes comma separated classes as RFC 3004 length prefixed items.
fn encode_user_class(text: &str) -> Result<Vec<u8>, ClientError> {
    let mut out = Vec::with_capacity(text.len() + 1);
    for class in text.split(',').filter(|c| !c.is_empty()) {
        let len = u8::try_from(class.len())
            .map_err(|_| ClientError::Config(format!("user class '{class}' too long")))?;
        out.push(len);
        out.extend_from_slice(class.as_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["dhcp4c", "-i", "eth0"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_from_args_option_sets() {
        let mac = bytes::Bytes::from_static(&[0, 1, 2, 3, 4, 5]);
        let config = ClientConfig::from_args(
            &args(&["-o", "42", "-Q", "domain_search", "-O", "routers"]),
            mac,
        )
        .unwrap();
        assert!(config.request.contains(42));
        assert!(config.require.contains(code::DOMAIN_SEARCH));
        assert!(config.require.contains(code::SERVER_ID));
        assert!(!config.request.contains(code::ROUTER));
        assert!(config.no_request.contains(code::ROUTER));
    }

    #[test]
    fn test_from_args_rejects_unknown_option() {
        let mac = bytes::Bytes::from_static(&[0, 1, 2, 3, 4, 5]);
        let err = ClientConfig::from_args(&args(&["-o", "bogus"]), mac).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_client_id_forms() {
        assert_eq!(parse_client_id("01:aa:bb"), vec![1, 0xaa, 0xbb]);
        assert_eq!(parse_client_id("box"), vec![0, b'b', b'o', b'x']);
    }

    #[test]
    fn test_user_class_encoding() {
        assert_eq!(
            encode_user_class("ab,c").unwrap(),
            vec![2, b'a', b'b', 1, b'c']
        );
    }

    #[test]
    fn test_blacklist_and_whitelist() {
        let mac = bytes::Bytes::from_static(&[0, 1, 2, 3, 4, 5]);
        let mut config = ClientConfig::new("eth0".to_string(), mac);
        config.blacklist.push("10.0.0.1".parse().unwrap());
        assert!(config.is_blacklisted(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!config.is_blacklisted(Ipv4Addr::new(10, 0, 0, 2)));

        config.whitelist.push("192.168.0.0/16".parse().unwrap());
        assert!(config.is_blacklisted(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(!config.is_blacklisted(Ipv4Addr::new(192, 168, 4, 4)));
    }
}
