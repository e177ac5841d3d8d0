//! Composite option encodings.
//!
//! The text decoders share a two-pass shape: called without an output buffer
//! they only measure, called with one they write into it. Both passes return
//! the number of bytes the text occupies, so callers can size buffers
//! exactly.

use crate::error::{DecodeError, EncodeError};
use std::{fmt, net::Ipv4Addr};

/// Upper bound on compression pointer jumps within one name.
pub const MAX_POINTER_JUMPS: usize = 255;
const MAX_LABEL: usize = 63;
const MAX_NAME: usize = 255;

/// Writes text into an optional caller buffer while counting its length.
struct Sink<'a> {
    out: Option<&'a mut [u8]>,
    len: usize,
}

impl<'a> Sink<'a> {
    fn new(out: Option<&'a mut [u8]>) -> Self {
        Self { out, len: 0 }
    }

    fn push(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        if let Some(out) = self.out.as_deref_mut() {
            let end = self.len + bytes.len();
            if end > out.len() {
                return Err(DecodeError::BufferTooSmall {
                    needed: end,
                    available: out.len(),
                });
            }
            out[self.len..end].copy_from_slice(bytes);
        }
        self.len += bytes.len();
        Ok(())
    }

    fn push_display(&mut self, value: impl fmt::Display) -> Result<(), DecodeError> {
        self.push(value.to_string().as_bytes())
    }

    fn push_label(&mut self, label: &[u8]) -> Result<(), DecodeError> {
        for &b in label {
            match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => self.push(&[b])?,
                _ => self.push(format!("\\{b:03o}").as_bytes())?,
            }
        }
        Ok(())
    }
}

/// One step of a name walk.
enum NamePart<'a> {
    Label(&'a [u8]),
    End,
}

/// Walks a sequence of RFC 1035 names with compression pointers relative to
/// the start of `data`.
fn walk_names<'a>(
    data: &'a [u8],
    mut visit: impl FnMut(NamePart<'a>) -> Result<(), DecodeError>,
) -> Result<(), DecodeError> {
    let mut pos = 0;
    while pos < data.len() {
        let mut cursor = pos;
        let mut resume = None;
        let mut jumps = 0;
        let mut name_len = 0;
        loop {
            let Some(&len) = data.get(cursor) else {
                // Name ran off the end without a root label.
                break;
            };
            cursor += 1;
            if len == 0 {
                break;
            }
            match len & 0xc0 {
                0xc0 => {
                    let low = *data.get(cursor).ok_or(DecodeError::Truncated {
                        needed: cursor + 1,
                        available: data.len(),
                    })?;
                    cursor += 1;
                    if resume.is_none() {
                        resume = Some(cursor);
                    }
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(DecodeError::PointerLoop);
                    }
                    let target = (usize::from(len & 0x3f) << 8) | usize::from(low);
                    if target >= data.len() {
                        return Err(DecodeError::Truncated {
                            needed: target + 1,
                            available: data.len(),
                        });
                    }
                    cursor = target;
                }
                0x00 => {
                    let len = usize::from(len);
                    let label = data.get(cursor..cursor + len).ok_or(DecodeError::Truncated {
                        needed: cursor + len,
                        available: data.len(),
                    })?;
                    if len > MAX_LABEL {
                        return Err(DecodeError::BadLabel);
                    }
                    name_len += len + 1;
                    if name_len > MAX_NAME + 1 {
                        return Err(DecodeError::BadLabel);
                    }
                    visit(NamePart::Label(label))?;
                    cursor += len;
                }
                _ => return Err(DecodeError::BadLabel),
            }
        }
        visit(NamePart::End)?;
        pos = resume.unwrap_or(cursor);
    }
    Ok(())
}

/// Decodes RFC 1035 names into space separated text.
pub fn decode_rfc1035(data: &[u8], out: Option<&mut [u8]>) -> Result<usize, DecodeError> {
    let mut sink = Sink::new(out);
    let mut names = 0usize;
    let mut labels = 0usize;
    walk_names(data, |part| match part {
        NamePart::Label(label) => {
            if labels == 0 && names > 0 {
                sink.push(b" ")?;
            } else if labels > 0 {
                sink.push(b".")?;
            }
            labels += 1;
            sink.push_label(label)
        }
        NamePart::End => {
            if labels > 0 {
                names += 1;
            }
            labels = 0;
            Ok(())
        }
    })?;
    Ok(sink.len)
}

/// RFC 3397 domain search list as text. The encoding is RFC 1035 names with
/// compression, so this is [`decode_rfc1035`] under its option's name.
pub fn decode_rfc3397(data: &[u8], out: Option<&mut [u8]>) -> Result<usize, DecodeError> {
    decode_rfc1035(data, out)
}

/// Decodes an RFC 3397 search list into its names.
pub fn domain_list(data: &[u8]) -> Result<Vec<String>, DecodeError> {
    let mut names = Vec::new();
    let mut current = String::new();
    walk_names(data, |part| {
        match part {
            NamePart::Label(label) => {
                if !current.is_empty() {
                    current.push('.');
                }
                let mut sink = Sink::new(None);
                sink.push_label(label)?;
                let mut buf = vec![0u8; sink.len];
                let mut sink = Sink::new(Some(&mut buf));
                sink.push_label(label)?;
                current.push_str(&String::from_utf8_lossy(&buf));
            }
            NamePart::End => {
                if !current.is_empty() {
                    names.push(std::mem::take(&mut current));
                }
            }
        }
        Ok(())
    })?;
    Ok(names)
}

/// Encodes a host or domain name as RFC 1035 labels.
///
/// A trailing dot marks the name fully qualified and emits the root label.
pub fn encode_rfc1035(name: &str) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(name.len() + 2);
    let fully_qualified = name.ends_with('.');
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > MAX_LABEL {
            return Err(EncodeError::LabelTooLong);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    if fully_qualified {
        out.push(0);
    }
    Ok(out)
}

/// A classless static route (RFC 3442).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub dest: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Ipv4Addr,
}

impl Route {
    pub fn netmask(&self) -> Ipv4Addr {
        crate::interface::Ipv4Net::mask_from_prefix(self.prefix)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.dest, self.prefix, self.gateway)
    }
}

fn walk_routes(
    data: &[u8],
    mut visit: impl FnMut(Route) -> Result<(), DecodeError>,
) -> Result<(), DecodeError> {
    // The smallest route is a prefix length and a router.
    if data.len() < 5 {
        return Err(DecodeError::OptionLength {
            code: super::options::code::CLASSLESS_ROUTES,
            len: data.len(),
        });
    }
    let mut pos = 0;
    while pos < data.len() {
        let prefix = data[pos];
        pos += 1;
        if prefix > 32 {
            return Err(DecodeError::BadPrefix(prefix));
        }
        let octets = usize::from(prefix).div_ceil(8);
        let end = pos + octets + 4;
        if end > data.len() {
            return Err(DecodeError::Truncated {
                needed: end,
                available: data.len(),
            });
        }
        let mut dest = [0u8; 4];
        dest[..octets].copy_from_slice(&data[pos..pos + octets]);
        pos += octets;
        let gateway = Ipv4Addr::new(data[pos], data[pos + 1], data[pos + 2], data[pos + 3]);
        pos += 4;
        visit(Route {
            dest: Ipv4Addr::from(dest),
            prefix,
            gateway,
        })?;
    }
    Ok(())
}

/// RFC 3442 routes as `dest/prefix gateway` text.
pub fn decode_rfc3442(data: &[u8], out: Option<&mut [u8]>) -> Result<usize, DecodeError> {
    let mut sink = Sink::new(out);
    let mut first = true;
    walk_routes(data, |route| {
        if !first {
            sink.push(b" ")?;
        }
        first = false;
        sink.push_display(route)
    })?;
    Ok(sink.len)
}

pub fn classless_routes(data: &[u8]) -> Result<Vec<Route>, DecodeError> {
    let mut routes = Vec::new();
    walk_routes(data, |route| {
        routes.push(route);
        Ok(())
    })?;
    Ok(routes)
}

/// SIP servers (RFC 3361), either as names or addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipServers {
    Names(Vec<String>),
    Addrs(Vec<Ipv4Addr>),
}

impl fmt::Display for SipServers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = match self {
            SipServers::Names(names) => names.clone(),
            SipServers::Addrs(addrs) => addrs.iter().map(ToString::to_string).collect(),
        };
        f.write_str(&items.join(" "))
    }
}

fn sip_addrs(data: &[u8]) -> Result<Vec<Ipv4Addr>, DecodeError> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Err(DecodeError::OptionLength {
            code: super::options::code::SIP_SERVER,
            len: data.len() + 1,
        });
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
        .collect())
}

fn sip_split(data: &[u8]) -> Result<(u8, &[u8]), DecodeError> {
    match data {
        [enc, rest @ ..] if !rest.is_empty() => Ok((*enc, rest)),
        _ => Err(DecodeError::OptionLength {
            code: super::options::code::SIP_SERVER,
            len: data.len(),
        }),
    }
}

/// RFC 3361 SIP servers as text.
pub fn decode_rfc3361(data: &[u8], out: Option<&mut [u8]>) -> Result<usize, DecodeError> {
    let (enc, rest) = sip_split(data)?;
    match enc {
        0 => decode_rfc1035(rest, out),
        1 => {
            let mut sink = Sink::new(out);
            for (i, addr) in sip_addrs(rest)?.iter().enumerate() {
                if i > 0 {
                    sink.push(b" ")?;
                }
                sink.push_display(addr)?;
            }
            Ok(sink.len)
        }
        other => Err(DecodeError::UnknownEncoding(other)),
    }
}

pub fn sip_servers(data: &[u8]) -> Result<SipServers, DecodeError> {
    let (enc, rest) = sip_split(data)?;
    match enc {
        0 => Ok(SipServers::Names(domain_list(rest)?)),
        1 => Ok(SipServers::Addrs(sip_addrs(rest)?)),
        other => Err(DecodeError::UnknownEncoding(other)),
    }
}

/// Measures then decodes, the way callers size buffers for the text forms.
pub fn to_text(
    decode: fn(&[u8], Option<&mut [u8]>) -> Result<usize, DecodeError>,
    data: &[u8],
) -> Result<String, DecodeError> {
    let len = decode(data, None)?;
    let mut buf = vec![0u8; len];
    decode(data, Some(&mut buf))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    // "example.com" then "sub" + pointer to "example.com".
    const SEARCH: &[u8] = &[
        7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0, 3, b's', b'u', b'b',
        0xc0, 0x00,
    ];

    #[test]
    fn test_rfc3397_compressed_list() {
        assert_eq!(
            domain_list(SEARCH).unwrap(),
            vec!["example.com".to_string(), "sub.example.com".to_string()]
        );
        assert_eq!(
            to_text(decode_rfc3397, SEARCH).unwrap(),
            "example.com sub.example.com"
        );
    }

    #[test]
    fn test_rfc3397_measure_matches_write() {
        let needed = decode_rfc3397(SEARCH, None).unwrap();
        let mut buf = vec![0u8; needed];
        assert_eq!(decode_rfc3397(SEARCH, Some(&mut buf)).unwrap(), needed);

        let mut small = vec![0u8; needed - 1];
        assert!(matches!(
            decode_rfc3397(SEARCH, Some(&mut small)),
            Err(DecodeError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_rfc3397_rejects_pointer_loop() {
        // A name that points at itself.
        let data = [0xc0, 0x00];
        assert_eq!(domain_list(&data), Err(DecodeError::PointerLoop));
        assert_eq!(decode_rfc3397(&data, None), Err(DecodeError::PointerLoop));
    }

    #[test]
    fn test_rfc3397_rejects_bad_pointer_and_label() {
        assert!(matches!(
            domain_list(&[0xc0, 0x10]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            domain_list(&[5, b'a', b'b']),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(domain_list(&[0x40]), Err(DecodeError::BadLabel));
    }

    #[test]
    fn test_encode_rfc1035() {
        assert_eq!(
            encode_rfc1035("host.example.").unwrap(),
            vec![4, b'h', b'o', b's', b't', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0]
        );
        assert_eq!(encode_rfc1035("host").unwrap(), vec![4, b'h', b'o', b's', b't']);
        assert_eq!(
            encode_rfc1035(&"a".repeat(64)),
            Err(EncodeError::LabelTooLong)
        );
    }

    #[test]
    fn test_rfc3442_routes() {
        let data = [
            24, 192, 168, 5, 10, 0, 0, 1, // 192.168.5.0/24 via 10.0.0.1
            0, 10, 0, 0, 254, // default via 10.0.0.254
        ];
        let routes = classless_routes(&data).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].dest, Ipv4Addr::new(192, 168, 5, 0));
        assert_eq!(routes[0].netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(routes[1].prefix, 0);
        assert_eq!(
            to_text(decode_rfc3442, &data).unwrap(),
            "192.168.5.0/24 10.0.0.1 0.0.0.0/0 10.0.0.254"
        );
    }

    #[test]
    fn test_rfc3442_rejects_invalid() {
        assert!(matches!(
            classless_routes(&[0, 1, 2, 3]),
            Err(DecodeError::OptionLength { .. })
        ));
        assert_eq!(
            classless_routes(&[33, 1, 2, 3, 4, 5, 6, 7, 8]),
            Err(DecodeError::BadPrefix(33))
        );
        assert!(matches!(
            classless_routes(&[24, 192, 168, 5, 10, 0]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rfc3361_sip_servers() {
        let addrs = [1, 10, 0, 0, 1, 10, 0, 0, 2];
        assert_eq!(
            sip_servers(&addrs).unwrap(),
            SipServers::Addrs(vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)])
        );
        assert_eq!(to_text(decode_rfc3361, &addrs).unwrap(), "10.0.0.1 10.0.0.2");

        let mut names = vec![0u8];
        names.extend_from_slice(&[3, b's', b'i', b'p', 0]);
        assert_eq!(
            sip_servers(&names).unwrap(),
            SipServers::Names(vec!["sip".to_string()])
        );

        assert_eq!(sip_servers(&[2, 1]), Err(DecodeError::UnknownEncoding(2)));
        assert!(sip_servers(&[1, 10, 0, 0]).is_err());
        assert!(sip_servers(&[1]).is_err());
    }
}
