use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use dhcp4c::{
    network::link, Args, ClientConfig, ClientError, DhcpClient, ExitStatus, LinuxTransport, Signal,
};
use std::process::ExitCode;
use tokio::{
    fs,
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Parses a MAC address string (e.g., "0a:1b:2c:3d:4e:5f") into a `Bytes` object.
fn parse_mac_address(mac_str: &str) -> Result<Bytes, ClientError> {
    let mut bytes = BytesMut::new();
    for byte_str in mac_str.split(':') {
        if !byte_str.is_empty() {
            let byte = u8::from_str_radix(byte_str, 16)
                .map_err(|e| ClientError::MacParse(format!("'{mac_str}': {e}")))?;
            bytes.put_u8(byte);
        }
    }
    if bytes.is_empty() {
        return Err(ClientError::MacParse(format!("'{mac_str}' is empty")));
    }
    Ok(bytes.freeze())
}

async fn read_sysfs(interface: &str, attr: &str) -> Result<String, ClientError> {
    let path = format!("/sys/class/net/{interface}/{attr}");
    let text = fs::read_to_string(&path)
        .await
        .map_err(|e| ClientError::InterfaceInvalid(format!("{path}: {e}")))?;
    Ok(text.trim().to_string())
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Forwards SIGTERM/SIGINT, SIGALRM and SIGHUP to the client.
fn forward_signals(tx: mpsc::Sender<Signal>) -> Result<(), ClientError> {
    let kinds = [
        (SignalKind::terminate(), Signal::Stop),
        (SignalKind::interrupt(), Signal::Stop),
        (SignalKind::alarm(), Signal::Renew),
        (SignalKind::hangup(), Signal::Release),
    ];
    for (kind, request) in kinds {
        let mut stream = signal(kind)?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(request).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(())
}

async fn run(args: Args) -> Result<ExitStatus, ClientError> {
    let mac = read_sysfs(&args.interface, "address").await?;
    let mac_addr = parse_mac_address(&mac)?;
    info!("{}: hardware address {}", args.interface, mac);

    let mut config = ClientConfig::from_args(&args, mac_addr)?;
    match read_sysfs(&args.interface, "type").await.map(|t| t.parse::<u8>()) {
        Ok(Ok(hwtype)) => config.hwtype = hwtype,
        other => debug!("{}: keeping hardware type {}: {:?}", args.interface, config.hwtype, other),
    }

    let (signal_tx, signal_rx) = mpsc::channel(8);
    forward_signals(signal_tx)?;

    let (link_tx, link_rx) = mpsc::channel(8);
    tokio::spawn(link::watch_carrier(
        link::carrier_path(&config.interface),
        link::POLL_INTERVAL,
        link_tx,
    ));

    let transport = LinuxTransport::from_config(&config);
    let mut client = DhcpClient::new(config, transport, signal_rx, link_rx);
    Ok(client.run().await)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.debug);

    match run(args).await {
        Ok(ExitStatus::Success) => ExitCode::SUCCESS,
        Ok(ExitStatus::Failure) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
