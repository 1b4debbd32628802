//! # Zone Mesh Shared Library
//!
//! Types and pure algorithms used by both the coordinator and the peer
//! hosts: the spatial partition tree, authority delegations, subject state,
//! the wire protocol, replicated configuration and transport helpers.
//!
//! Nothing in this crate performs socket or storage I/O; the coordinator and
//! host crates own their event loops and call into these types from them.

pub mod authority;
pub mod config;
pub mod error;
pub mod geometry;
pub mod packets;
pub mod partition;
pub mod subject;
pub mod transport;
pub mod utils;

pub use authority::{Authority, AuthorityId, AuthorityRegistry, HostId};
pub use config::ZoneConfig;
pub use error::{ZoneError, ZoneResult};
pub use geometry::{Rect, SplitAxis};
pub use packets::Packet;
pub use partition::{Occupancy, PartitionId, PartitionMap, PartitionTree, PopulationLimits};
pub use subject::{SubjectId, SubjectState};

pub const WORLD_WIDTH: f32 = 800.0;
pub const WORLD_HEIGHT: f32 = 600.0;
pub const SUBJECT_SPEED: f32 = 120.0;
