//! DHCPv4 protocol implementation
//!
//! - `message` and `rfc`: wire format and option decoding
//! - `options`: the option catalog
//! - `build`: outgoing message construction
//! - `lease` and `leasefile`: lease timing and persistence
//! - `handler`: the per-interface state machine

pub mod build;
pub mod handler;
pub mod lease;
pub mod leasefile;
pub mod message;
pub mod options;
pub mod rfc;


pub use handler::{Session, State};
pub use lease::Lease;
pub use message::Message;
