use crate::network::SocketError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Socket operation failed")]
    Socket(#[from] SocketError),

    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("Malformed DHCP data")]
    Decode(#[from] DecodeError),

    #[error("Failed to build DHCP message")]
    Encode(#[from] EncodeError),

    #[error("Failed to parse MAC address: {0}")]
    MacParse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Interface '{0}' not found or has no MAC address")]
    InterfaceInvalid(String),
}

/// Failures while reading attacker or server controlled bytes.
///
/// None of these are fatal: the session drops the offending packet or lease
/// file and carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer truncated: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("missing DHCP magic cookie")]
    NotDhcp,

    #[error("option {code} has invalid length {len}")]
    OptionLength { code: u8, len: usize },

    #[error("option {code} overruns its area")]
    OptionOverrun { code: u8 },

    #[error("concatenated option {code} exceeds {limit} bytes")]
    ConcatOverflow { code: u8, limit: usize },

    #[error("domain name compression loop")]
    PointerLoop,

    #[error("domain name label is malformed")]
    BadLabel,

    #[error("invalid prefix length {0}")]
    BadPrefix(u8),

    #[error("output buffer too small: needed {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("unknown encoding {0}")]
    UnknownEncoding(u8),

    #[error("not an ARP packet for IPv4")]
    NotArp,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("message too big: needed {needed} bytes, area is {available}")]
    TooBig { needed: usize, available: usize },

    #[error("domain name label longer than 63 bytes")]
    LabelTooLong,
}
