//! # Zone Mesh Coordinator Library
//!
//! The coordinator owns the authoritative partition map of a zone mesh. It
//! authenticates peer hosts, decides which hosts hold authority over which
//! partition, and arbitrates the state that authorities report for their
//! subjects.
//!
//! ## Core Responsibilities
//!
//! ### Primary Election
//! Several coordinator instances may share one durable store. Each instance
//! refreshes its row in the store's coordinator roster on a fixed interval;
//! the live instance with the lowest id is primary. Only the primary mutates
//! the partition map and resolves commits. Secondaries keep a copy of the
//! map pulled from the store so they can take over at any time.
//!
//! ### Partition Balancing
//! On every balancer pass the primary:
//! 1. drops delegations held by hosts that logged out or timed out,
//! 2. splits overpopulated leaves and merges underpopulated sibling pairs,
//!    unless a subject is still reported in a partition that no longer
//!    exists as a leaf,
//! 3. gives every leaf short of its authority quota one more authority,
//!    chosen as the least-burdened available host,
//! 4. persists the new map and broadcasts it to every host.
//!
//! ### Commit Quorum
//! Authorities report subject state for commit. Reports are grouped per
//! subject and partition and resolved once enough authorities reported or
//! the oldest report timed out. A state is written only when two reports
//! agree within the configured tolerance.
//!
//! ## Module Organization
//!
//! - `store`: durable store interface and the in-process implementation
//! - `roster`: hosts logged in to this instance
//! - `leader`: primary election and bootstrap pull
//! - `balancer`: split/merge policy and authority assignment
//! - `quorum`: commit resolution
//! - `coordinator`: packet dispatch and timer handlers, free of socket I/O
//! - `network`: UDP tasks and the poll loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use coordinator::coordinator::Coordinator;
//! use coordinator::network::CoordinatorServer;
//! use coordinator::store::{CoordinatorId, MemoryStore};
//! use shared::transport::drain_channel;
//! use shared::ZoneConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let coordinator = Coordinator::new(CoordinatorId(1), store, ZoneConfig::default(), 64);
//!     let mut server = CoordinatorServer::new("127.0.0.1:8080", coordinator).await?;
//!
//!     let (trigger, drain) = drain_channel();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         trigger.trigger();
//!     });
//!
//!     server.run(drain).await?;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod coordinator;
pub mod leader;
pub mod network;
pub mod quorum;
pub mod roster;
pub mod store;
