//! Wire messages exchanged between coordinators and hosts, and between a
//! subject's host and the hosts holding authority over its partition.
//!
//! Every request that expects a reply carries a `request_id` chosen by the
//! sender; the reply echoes it back so the sender can correlate it.

use crate::authority::{AuthorityId, HostId};
use crate::partition::{PartitionId, PartitionMap};
use crate::subject::{SubjectId, SubjectState};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    // Host -> coordinator
    /// `host_id` is the identity of a previous session to resume, for a host
    /// logging in again or failing over to another coordinator.
    Login {
        protocol_version: u32,
        host_id: Option<HostId>,
    },
    Heartbeat {
        timestamp: u64,
    },
    OccupancyReport {
        occupants: Vec<(SubjectId, PartitionId)>,
    },
    ZoneChanged {
        subject: SubjectId,
        from: Option<PartitionId>,
        to: PartitionId,
    },
    StateRetrieve {
        request_id: u64,
        subject: SubjectId,
    },
    StateStore {
        request_id: u64,
        partition: PartitionId,
        subject: SubjectId,
        authority: AuthorityId,
        snapshot: Vec<u8>,
    },
    /// Sent when a host starts draining so it receives no new delegations.
    Availability {
        available: bool,
    },
    Disconnect,

    // Coordinator -> host
    LoginAccepted {
        host_id: HostId,
        settings: Vec<(String, String)>,
    },
    LoginRejected {
        reason: String,
    },
    HeartbeatAck {
        timestamp: u64,
    },
    PartitionMap {
        map: PartitionMap,
    },
    StateRetrieveReply {
        request_id: u64,
        subject: SubjectId,
        snapshot: Option<Vec<u8>>,
    },
    StateStoreReply {
        request_id: u64,
        subject: SubjectId,
        success: bool,
    },

    // Subject host <-> authority host
    RegisterRequest {
        request_id: u64,
        subject: SubjectId,
        authority: AuthorityId,
    },
    /// `snapshot` is the subject's last committed state; `accepted` is
    /// false when the authority could not obtain it.
    RegisterReply {
        request_id: u64,
        subject: SubjectId,
        authority: AuthorityId,
        accepted: bool,
        snapshot: Option<Vec<u8>>,
    },
    RegisterAck {
        subject: SubjectId,
        authority: AuthorityId,
    },
    /// `report` asks the authority to submit the subject's state for commit
    /// before releasing it.
    UnregisterRequest {
        request_id: u64,
        subject: SubjectId,
        authority: AuthorityId,
        report: bool,
    },
    UnregisterReply {
        request_id: u64,
        subject: SubjectId,
        authority: AuthorityId,
        committed: bool,
    },
    SubjectUpdate {
        authority: AuthorityId,
        state: SubjectState,
    },
    WorldSnapshot {
        partition: PartitionId,
        tick: u32,
        subjects: Vec<SubjectState>,
    },
    /// Liveness ping between a subject's host and its authorities' hosts.
    PeerPing {
        timestamp: u64,
    },
    PeerPong {
        timestamp: u64,
    },
}

impl Packet {
    /// Short label for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Login { .. } => "login",
            Packet::Heartbeat { .. } => "heartbeat",
            Packet::OccupancyReport { .. } => "occupancy-report",
            Packet::ZoneChanged { .. } => "zone-changed",
            Packet::StateRetrieve { .. } => "state-retrieve",
            Packet::StateStore { .. } => "state-store",
            Packet::Availability { .. } => "availability",
            Packet::Disconnect => "disconnect",
            Packet::LoginAccepted { .. } => "login-accepted",
            Packet::LoginRejected { .. } => "login-rejected",
            Packet::HeartbeatAck { .. } => "heartbeat-ack",
            Packet::PartitionMap { .. } => "partition-map",
            Packet::StateRetrieveReply { .. } => "state-retrieve-reply",
            Packet::StateStoreReply { .. } => "state-store-reply",
            Packet::RegisterRequest { .. } => "register-request",
            Packet::RegisterReply { .. } => "register-reply",
            Packet::RegisterAck { .. } => "register-ack",
            Packet::UnregisterRequest { .. } => "unregister-request",
            Packet::UnregisterReply { .. } => "unregister-reply",
            Packet::SubjectUpdate { .. } => "subject-update",
            Packet::WorldSnapshot { .. } => "world-snapshot",
            Packet::PeerPing { .. } => "peer-ping",
            Packet::PeerPong { .. } => "peer-pong",
        }
    }
}
