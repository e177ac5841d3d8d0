//! The configuration script boundary.
//!
//! The script applies and removes addresses. It is told why it runs and gets
//! the old and new lease as environment variables; its exit status is only
//! logged.

use crate::{
    interface::hwaddr_to_string,
    v4::{
        lease::Lease,
        message::Message,
        options::{code, Catalog},
    },
};
use std::{fmt, path::Path, process::ExitStatus};
use tokio::process::Command;

/// Why the script is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Bound,
    Renew,
    Rebind,
    Reboot,
    Expire,
    Fail,
    Stop,
    Release,
    Nak,
    Test,
    Inform,
    Static,
    Timeout,
    Ipv4ll,
    Carrier,
    NoCarrier,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Bound => "BOUND",
            Reason::Renew => "RENEW",
            Reason::Rebind => "REBIND",
            Reason::Reboot => "REBOOT",
            Reason::Expire => "EXPIRE",
            Reason::Fail => "FAIL",
            Reason::Stop => "STOP",
            Reason::Release => "RELEASE",
            Reason::Nak => "NAK",
            Reason::Test => "TEST",
            Reason::Inform => "INFORM",
            Reason::Static => "STATIC",
            Reason::Timeout => "TIMEOUT",
            Reason::Ipv4ll => "IPV4LL",
            Reason::Carrier => "CARRIER",
            Reason::NoCarrier => "NOCARRIER",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment variables describing one message, each prefixed.
pub fn message_env(catalog: &Catalog, prefix: &str, msg: &Message) -> Vec<(String, String)> {
    let lease = Lease::from_message(msg);
    let net = lease.net();
    let mut env = vec![
        (format!("{prefix}_ip_address"), lease.addr.to_string()),
        (format!("{prefix}_subnet_cidr"), net.prefix_len().to_string()),
        (format!("{prefix}_network_number"), net.network().to_string()),
        (format!("{prefix}_broadcast_address"), lease.broadcast.to_string()),
    ];
    if !msg.siaddr.is_unspecified() {
        env.push((format!("{prefix}_next_server"), msg.siaddr.to_string()));
    }
    let file = msg.file_str();
    if !file.is_empty() {
        env.push((format!("{prefix}_filename"), file));
    }
    let sname = msg.sname_str();
    if !sname.is_empty() {
        env.push((format!("{prefix}_server_name"), sname));
    }

    for tag in msg.option_codes() {
        let Some(def) = catalog.get(tag) else {
            continue;
        };
        // Mask and broadcast carry the defaults the lease applied.
        let value = match tag {
            code::SUBNET_MASK => Some(lease.mask.to_string()),
            code::BROADCAST => Some(lease.broadcast.to_string()),
            _ => None,
        };
        if let Some(value) = value {
            env.push((format!("{prefix}_{}", def.name), value));
            continue;
        }
        match msg.decode_option(catalog, tag) {
            Ok(Some(decoded)) => {
                env.push((format!("{prefix}_{}", def.name), decoded.value.to_string()));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("skipping option {} in script environment: {}", def.name, e);
            }
        }
    }
    env
}

/// The complete environment for one script run.
pub fn build_env(
    catalog: &Catalog,
    interface: &str,
    hwaddr: &[u8],
    reason: Reason,
    old: Option<&Message>,
    new: Option<&Message>,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("interface".to_string(), interface.to_string()),
        ("reason".to_string(), reason.to_string()),
        ("hwaddr".to_string(), hwaddr_to_string(hwaddr)),
        ("pid".to_string(), std::process::id().to_string()),
    ];
    if let Some(msg) = old {
        env.extend(message_env(catalog, "old", msg));
    }
    if let Some(msg) = new {
        env.extend(message_env(catalog, "new", msg));
    }
    env
}

/// Runs `script` with `env` and waits for it.
pub async fn run(script: &Path, env: &[(String, String)]) -> std::io::Result<ExitStatus> {
    Command::new(script)
        .env_clear()
        .env("PATH", "/usr/bin:/bin:/usr/sbin:/sbin")
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .status()
        .await
}
