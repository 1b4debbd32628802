//! # Zone Mesh Host Library
//!
//! A host is a peer process in a zone mesh. It plays two roles at once:
//!
//! ### Subject Host
//! It simulates a set of subjects moving through the world. For each subject
//! it resolves the partition the subject stands in and keeps the subject
//! registered with every authority of that partition, handing it over when
//! the subject crosses a boundary or the partition map changes.
//!
//! ### Authority Host
//! The coordinator may delegate authority over partitions to this host. For
//! each delegation it accepts registrations, fetches the subjects' committed
//! state, reports their state for commit, and, when it is the partition's
//! master authority, broadcasts world snapshots.
//!
//! ## Module Organization
//!
//! - `world`: local subjects and their motion
//! - `handoff`: per-subject registration state machine
//! - `authority`: the serving side of delegations
//! - `peer`: packet dispatch and timers, free of socket I/O
//! - `network`: UDP socket, login with backoff, poll loop and drain
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use host::network::Host;
//! use shared::transport::drain_channel;
//! use shared::ZoneConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut host = Host::new("127.0.0.1:0", "127.0.0.1:8080", ZoneConfig::default(), 4).await?;
//!
//!     let (trigger, drain) = drain_channel();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         trigger.trigger();
//!     });
//!
//!     // Logs in, then simulates and serves until drained.
//!     host.run(drain).await?;
//!     Ok(())
//! }
//! ```

pub mod authority;
pub mod handoff;
pub mod network;
pub mod peer;
pub mod world;

use shared::Packet;
use std::net::SocketAddr;

/// A packet addressed to the coordinator or to another host.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub addr: SocketAddr,
    pub packet: Packet,
}

impl Outgoing {
    pub fn new(addr: SocketAddr, packet: Packet) -> Self {
        Self { addr, packet }
    }
}
