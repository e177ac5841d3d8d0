//! # dhcp4c - a DHCPv4 client with link-local fallback
//!
//! dhcp4c acquires and maintains an IPv4 lease on one interface. It follows
//! the RFC 2131 state machine (DISCOVER, OFFER, REQUEST, ACK, then renewing
//! and rebinding), checks every new address with ARP before using it, and
//! falls back to an RFC 3927 link-local address while no server answers.
//!
//! The protocol logic in [`v4::Session`] is a pure state machine: it takes
//! events stamped with the current time and returns [`client::Action`]s.
//! [`DhcpClient`] drives it over a [`network::Transport`], runs the
//! configuration script and persists the lease.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dhcp4c::{ClientConfig, DhcpClient, LinuxTransport};
//! use bytes::Bytes;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mac_addr = Bytes::from_static(&[0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4]);
//!     let config = ClientConfig::new("eth0".to_string(), mac_addr);
//!     let transport = LinuxTransport::from_config(&config);
//!     let (_signal_tx, signals) = mpsc::channel(4);
//!     let (_link_tx, links) = mpsc::channel(4);
//!     let mut client = DhcpClient::new(config, transport, signals, links);
//!     let status = client.run().await;
//!     println!("client exited: {:?}", status);
//! }
//! ```

pub mod arp;
pub mod client;
pub mod config;
pub mod error;
pub mod interface;
pub mod network;
pub mod script;
pub mod timer;
pub mod v4;

pub use client::{Action, DhcpClient, Event, ExitStatus, LinkState, Signal};
pub use config::{Args, ClientConfig};
pub use error::ClientError;
pub use network::{LinuxTransport, Transport};
