use bytes::Bytes;
use clap::Parser;
use dhcp4c::{
    config::FqdnMode,
    network::{Destination, Received, SocketError, Transport},
    v4::{
        leasefile,
        message::{Message, BOOTREPLY, MAGIC_COOKIE},
        options::code,
    },
    Args, ClientConfig, DhcpClient, ExitStatus, Signal,
};
use dhcproto::v4::MessageType;
use std::{
    net::Ipv4Addr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::mpsc;

const MAC: [u8; 6] = [0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4];
const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
const OFFERED: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);

/// Answers DISCOVER with OFFER and REQUEST with ACK.
struct MockTransport {
    udp_open: bool,
    sent: Vec<(MessageType, Message, Destination)>,
    replies_tx: mpsc::UnboundedSender<Received>,
    replies_rx: mpsc::UnboundedReceiver<Received>,
}

impl MockTransport {
    fn new() -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            udp_open: false,
            sent: Vec::new(),
            replies_tx,
            replies_rx,
        }
    }

    fn kinds(&self) -> Vec<MessageType> {
        self.sent.iter().map(|(kind, _, _)| *kind).collect()
    }
}

fn server_reply(request: &Message, kind: MessageType) -> Message {
    let mut options = vec![code::MESSAGE_TYPE, 1, u8::from(kind), code::SERVER_ID, 4];
    options.extend_from_slice(&SERVER.octets());
    options.extend_from_slice(&[code::LEASE_TIME, 4, 0, 0, 0x0e, 0x10]);
    options.extend_from_slice(&[code::SUBNET_MASK, 4, 255, 255, 255, 0]);
    options.extend_from_slice(&[code::ROUTER, 4, 192, 168, 1, 1]);
    options.push(code::END);
    Message {
        op: BOOTREPLY,
        htype: request.htype,
        hlen: request.hlen,
        xid: request.xid,
        chaddr: request.chaddr,
        yiaddr: OFFERED,
        cookie: MAGIC_COOKIE,
        options,
        ..Message::default()
    }
}

impl Transport for MockTransport {
    fn open_udp(&mut self) -> Result<(), SocketError> {
        self.udp_open = true;
        Ok(())
    }

    fn close_udp(&mut self) {
        self.udp_open = false;
    }

    fn open_arp(&mut self) -> Result<(), SocketError> {
        Err(SocketError::NotImplemented)
    }

    fn close_arp(&mut self) {}

    async fn send(&mut self, packet: &[u8], to: Destination) -> Result<(), SocketError> {
        if !self.udp_open {
            return Err(SocketError::NotOpen);
        }
        let msg = Message::parse(packet).unwrap();
        let kind = msg.message_type().unwrap().unwrap();
        let answer = match kind {
            MessageType::Discover => Some(MessageType::Offer),
            MessageType::Request => Some(MessageType::Ack),
            _ => None,
        };
        if let Some(answer) = answer {
            let reply = server_reply(&msg, answer);
            self.replies_tx
                .send(Received::Udp {
                    bytes: reply.to_bytes(),
                    from: SERVER,
                })
                .unwrap();
        }
        self.sent.push((kind, msg, to));
        Ok(())
    }

    async fn send_arp(&mut self, _packet: &[u8]) -> Result<(), SocketError> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<Received, SocketError> {
        match self.replies_rx.recv().await {
            Some(received) => Ok(received),
            None => std::future::pending().await,
        }
    }
}

fn test_config(dir: &Path) -> ClientConfig {
    let mut config = ClientConfig::new("eth0".to_string(), Bytes::from_static(&MAC));
    config.arp = false;
    config.ipv4ll = false;
    config.lease_file = dir.join("eth0.lease");
    config
}

/// A hook script that appends each reason and new address to `log`.
fn write_script(dir: &Path) -> (PathBuf, PathBuf) {
    let script = dir.join("hook.sh");
    let log = dir.join("hook.log");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\necho \"$reason $new_ip_address $new_routers\" >> {}\n",
            log.display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    (script, log)
}

async fn wait_for(path: &Path) {
    for _ in 0..500 {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never appeared", path.display());
}

#[tokio::test]
async fn test_client_binds_persists_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    let (script, log) = write_script(dir.path());
    config.script = Some(script);
    let lease_file = config.lease_file.clone();

    let (signal_tx, signals) = mpsc::channel(4);
    let (_link_tx, links) = mpsc::channel(4);
    let mut client = DhcpClient::new(config, MockTransport::new(), signals, links);

    let controller = async {
        wait_for(&lease_file).await;
        signal_tx.send(Signal::Stop).await.unwrap();
    };
    let (status, ()) = tokio::join!(client.run(), controller);
    assert_eq!(status, ExitStatus::Success);

    let transport = client.transport();
    assert_eq!(
        transport.kinds(),
        vec![MessageType::Discover, MessageType::Request]
    );
    assert!(transport
        .sent
        .iter()
        .all(|(_, _, to)| *to == Destination::Broadcast));
    assert!(!transport.udp_open);

    let stored = leasefile::read_lease(&lease_file).await.unwrap().unwrap();
    assert_eq!(stored.message.yiaddr, OFFERED);

    let log = std::fs::read_to_string(log).unwrap();
    let lines: Vec<&str> = log.lines().map(str::trim).collect();
    assert_eq!(lines, vec!["BOUND 192.168.1.100 192.168.1.1", "STOP"]);
}

#[tokio::test]
async fn test_release_removes_lease_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let lease_file = config.lease_file.clone();

    let (signal_tx, signals) = mpsc::channel(4);
    let (_link_tx, links) = mpsc::channel(4);
    let mut client = DhcpClient::new(config, MockTransport::new(), signals, links);

    let controller = async {
        wait_for(&lease_file).await;
        signal_tx.send(Signal::Release).await.unwrap();
    };
    let (status, ()) = tokio::join!(client.run(), controller);
    assert_eq!(status, ExitStatus::Success);

    let transport = client.transport();
    let (kind, release, to) = transport.sent.last().unwrap();
    assert_eq!(*kind, MessageType::Release);
    assert_eq!(*to, Destination::Unicast(SERVER));
    assert_eq!(release.ciaddr, OFFERED);
    assert!(!lease_file.exists());
}

#[tokio::test]
async fn test_stored_lease_is_rebooted() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let lease_file = config.lease_file.clone();

    let mut request = Message::default();
    request.hlen = 6;
    request.chaddr[..6].copy_from_slice(&MAC);
    leasefile::write_lease(&lease_file, &server_reply(&request, MessageType::Ack))
        .await
        .unwrap();

    let (signal_tx, signals) = mpsc::channel(4);
    let (_link_tx, links) = mpsc::channel(4);
    let mut client = DhcpClient::new(config, MockTransport::new(), signals, links);

    let controller = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        signal_tx.send(Signal::Stop).await.unwrap();
    };
    let (status, ()) = tokio::join!(client.run(), controller);
    assert_eq!(status, ExitStatus::Success);

    let transport = client.transport();
    let (kind, request, _) = &transport.sent[0];
    assert_eq!(*kind, MessageType::Request);
    assert_eq!(
        request.option_addr(code::REQUESTED_ADDRESS).unwrap(),
        Some(OFFERED)
    );
    assert!(!request.has_option(code::SERVER_ID));
}

#[test]
fn test_config_creation() {
    let mac_addr = Bytes::from_static(&MAC);
    let config = ClientConfig::new("eth0".to_string(), mac_addr.clone());

    assert_eq!(config.interface, "eth0");
    assert_eq!(config.mac_address, mac_addr);
    assert_eq!(config.client_port, 68);
    assert_eq!(config.server_port, 67);
    assert_eq!(config.timeout, Duration::from_secs(30));
    assert_eq!(config.initial_timeout, Duration::from_secs(5));
    assert_eq!(config.request_timeout, Duration::from_secs(10));
    assert!(config.arp);
    assert!(config.ipv4ll);
    assert!(config.require.contains(code::SERVER_ID));
    assert_eq!(config.lease_file, PathBuf::from("/var/lib/dhcp4c/eth0.lease"));
}

#[test]
fn test_config_from_command_line() {
    let args = Args::try_parse_from([
        "dhcp4c",
        "-i",
        "wlan0",
        "--hostname",
        "box",
        "-F",
        "both",
        "-o",
        "domain_search",
        "-O",
        "3",
        "-X",
        "10.0.0.0/8",
        "-A",
        "--lease-file",
        "/tmp/wlan0.lease",
        "-t",
        "0",
    ])
    .unwrap();
    let config = ClientConfig::from_args(&args, Bytes::from_static(&MAC)).unwrap();

    assert_eq!(config.interface, "wlan0");
    assert_eq!(config.hostname.as_deref(), Some("box"));
    assert_eq!(config.fqdn, FqdnMode::Both);
    assert!(config.request.contains(code::DOMAIN_SEARCH));
    assert!(config.no_request.contains(code::ROUTER));
    assert!(!config.request.contains(code::ROUTER));
    assert!(!config.arp);
    assert!(config.is_blacklisted(Ipv4Addr::new(10, 1, 2, 3)));
    assert!(!config.is_blacklisted(SERVER));
    assert_eq!(config.lease_file, PathBuf::from("/tmp/wlan0.lease"));
    assert!(config.timeout.is_zero());
}

#[test]
fn test_config_rejects_bad_input() {
    let args = Args::try_parse_from(["dhcp4c", "-i", "eth0", "-o", "no_such_option"]).unwrap();
    assert!(ClientConfig::from_args(&args, Bytes::from_static(&MAC)).is_err());

    let args = Args::try_parse_from([
        "dhcp4c",
        "-i",
        "eth0",
        "-S",
        "192.168.1.5/24",
        "-s",
        "192.168.1.5/24",
    ])
    .unwrap();
    assert!(ClientConfig::from_args(&args, Bytes::from_static(&MAC)).is_err());

    assert!(Args::try_parse_from(["dhcp4c", "-i", "eth0", "-X", "10.0.0.0/40"]).is_err());
}
