//! Error type shared by the coordinator and host libraries.

use crate::authority::HostId;
use crate::partition::PartitionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),

    #[error("partition {0} is not a leaf")]
    NotALeaf(PartitionId),

    #[error("partition {0} cannot be merged")]
    NotMergeable(PartitionId),

    #[error("host {host} already holds a delegation for partition {partition}")]
    DuplicateDelegation { host: HostId, partition: PartitionId },

    /// The handoff state machine and its peer disagree about a registration.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid value {value:?} for setting {name}")]
    InvalidSetting { name: String, value: String },

    #[error("malformed partition map: {0}")]
    MalformedMap(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request {0} timed out")]
    Timeout(u64),

    #[error("peer {0} unavailable")]
    Unavailable(String),
}

pub type ZoneResult<T> = Result<T, ZoneError>;
