//! The coordinator's poll-loop state.
//!
//! [`Coordinator`] owns the partition tree, the host sessions and the primary
//! election for one instance. It performs no socket I/O: every inbound
//! packet and timer tick is turned into a list of [`Outbound`] packets that
//! the network layer sends.
//!
//! Any instance accepts logins. Host ids and the live host roster live in
//! the durable store, so the primary balances and routes commit replies
//! for hosts logged in to any instance, and a new primary inherits them.

use crate::balancer::{HostCandidate, OccupancySnapshot, PartitionBalancer};
use crate::leader::{pull_state, LeaderElector, PullOutcome, RoleChange};
use crate::quorum::{CommitOutcome, CommitQuorum};
use crate::roster::HostRoster;
use crate::store::{CoordinatorId, DurableStore, HostRecord, PendingCommit, StoreTable};
use log::{debug, info, warn};
use shared::packets::PROTOCOL_VERSION;
use shared::{HostId, Packet, PartitionMap, PartitionTree, ZoneConfig, ZoneResult};
use std::net::SocketAddr;
use std::sync::Arc;

/// A packet addressed to one host.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub addr: SocketAddr,
    pub packet: Packet,
}

impl Outbound {
    pub fn new(addr: SocketAddr, packet: Packet) -> Self {
        Self { addr, packet }
    }
}

pub struct Coordinator<S: DurableStore> {
    store: Arc<S>,
    config: ZoneConfig,
    elector: LeaderElector,
    tree: PartitionTree,
    roster: HostRoster,
    balancer: PartitionBalancer,
    quorum: CommitQuorum,
    map_version: u64,
}

impl<S: DurableStore> Coordinator<S> {
    pub fn new(id: CoordinatorId, store: Arc<S>, config: ZoneConfig, max_hosts: usize) -> Self {
        Self {
            store,
            elector: LeaderElector::new(id, config.coordinator_stale_ms),
            tree: PartitionTree::new(config.world()),
            roster: HostRoster::new(max_hosts),
            balancer: PartitionBalancer::new(&config),
            quorum: CommitQuorum::new(&config),
            map_version: 0,
            config,
        }
    }

    pub fn id(&self) -> CoordinatorId {
        self.elector.id()
    }

    pub fn is_primary(&self) -> bool {
        self.elector.is_primary()
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    pub fn tree(&self) -> &PartitionTree {
        &self.tree
    }

    pub fn roster(&self) -> &HostRoster {
        &self.roster
    }

    pub fn map_version(&self) -> u64 {
        self.map_version
    }

    pub fn map(&self) -> PartitionMap {
        self.tree.to_map(self.map_version)
    }

    /// Initial role check. A primary seeds or adopts the stored state; a
    /// secondary pulls it, taking over if the pull times out and it became
    /// primary meanwhile.
    pub async fn bootstrap(&mut self, now_ms: u64) -> ZoneResult<()> {
        if self.elector.check(self.store.as_ref(), now_ms).is_primary() {
            return self.assume_primary();
        }

        let outcome = pull_state(
            self.store.as_ref(),
            &mut self.elector,
            ZoneConfig::duration(self.config.bootstrap_timeout_ms),
            ZoneConfig::duration(self.config.bootstrap_poll_ms),
        )
        .await?;

        match outcome {
            PullOutcome::Loaded { map, settings } => self.adopt(&map, &settings),
            PullOutcome::BecamePrimary => self.assume_primary(),
        }
    }

    /// Periodic role check. Returns the map broadcast owed to hosts when the
    /// local map changed.
    pub fn check_leadership(&mut self, now_ms: u64) -> ZoneResult<Vec<Outbound>> {
        let before = self.map_version;
        match self.elector.check(self.store.as_ref(), now_ms) {
            RoleChange::BecamePrimary => self.assume_primary()?,
            RoleChange::StillPrimary => {}
            RoleChange::BecameSecondary | RoleChange::StillSecondary => self.refresh()?,
        }

        if self.map_version != before {
            Ok(self.broadcast(&self.map_packet()))
        } else {
            Ok(Vec::new())
        }
    }

    /// Pushes in-memory state to the store if nothing is stored yet,
    /// otherwise adopts what is stored.
    fn assume_primary(&mut self) -> ZoneResult<()> {
        let store = Arc::clone(&self.store);
        store.exclusive(StoreTable::Partitions, || {
            let settings = store.load_config();
            if settings.is_empty() {
                store.save_config(&self.config.export_replicated());
            } else {
                self.apply_settings(&settings)?;
            }

            match store.load_partition_map()? {
                Some(map) if map.version >= self.map_version => {
                    info!("{} adopting stored map version {}", self.id(), map.version);
                    self.tree = PartitionTree::from_map(&map)?;
                    self.map_version = map.version;
                }
                Some(_) => {
                    store.save_partition_map(&self.map())?;
                }
                None => {
                    self.tree
                        .commit_provisional(|| store.allocate_partition_id())?;
                    self.map_version = self.map_version.max(1);
                    if store.seed_partition_map(&self.map())? {
                        info!("{} seeded partition map", self.id());
                    }
                }
            }
            Ok(())
        })
    }

    /// Pulls a newer map and settings written by the primary.
    fn refresh(&mut self) -> ZoneResult<()> {
        let settings = self.store.load_config();
        if !settings.is_empty() {
            self.apply_settings(&settings)?;
        }
        if let Some(map) = self.store.load_partition_map()? {
            if map.version > self.map_version {
                debug!("{} refreshed to map version {}", self.id(), map.version);
                self.tree = PartitionTree::from_map(&map)?;
                self.map_version = map.version;
            }
        }
        Ok(())
    }

    fn adopt(&mut self, map: &PartitionMap, settings: &[(String, String)]) -> ZoneResult<()> {
        self.apply_settings(settings)?;
        self.tree = PartitionTree::from_map(map)?;
        self.map_version = map.version;
        info!("{} loaded map version {}", self.id(), map.version);
        Ok(())
    }

    fn apply_settings(&mut self, settings: &[(String, String)]) -> ZoneResult<()> {
        self.config.apply_replicated(settings)?;
        self.balancer = PartitionBalancer::new(&self.config);
        self.quorum = CommitQuorum::new(&self.config);
        Ok(())
    }

    /// Dispatches one inbound packet.
    pub fn handle_packet(&mut self, packet: Packet, addr: SocketAddr, now_ms: u64) -> Vec<Outbound> {
        let host = self.roster.find_host_by_addr(addr);
        if let Some(host) = host {
            self.roster.touch(host, now_ms);
        }

        let out = match (packet, host) {
            (
                Packet::Login {
                    protocol_version,
                    host_id,
                },
                _,
            ) => return self.handle_login(protocol_version, host_id, addr, now_ms),

            (Packet::Heartbeat { timestamp }, Some(_)) => {
                vec![Outbound::new(addr, Packet::HeartbeatAck { timestamp })]
            }

            (Packet::OccupancyReport { occupants }, Some(host)) => {
                self.roster.record_occupancy(host, &occupants);
                Vec::new()
            }

            (Packet::ZoneChanged { subject, from, to }, Some(host)) => {
                debug!("{} of {} moved {:?} -> {}", subject, host, from, to);
                self.roster.record_zone_change(host, subject, to);
                Vec::new()
            }

            (Packet::Availability { available }, Some(host)) => {
                info!("{} availability set to {}", host, available);
                self.roster.set_available(host, available);
                Vec::new()
            }

            (Packet::StateRetrieve { request_id, subject }, Some(_)) => {
                let snapshot = self.store.read_subject_state(subject);
                vec![Outbound::new(
                    addr,
                    Packet::StateRetrieveReply {
                        request_id,
                        subject,
                        snapshot,
                    },
                )]
            }

            (
                Packet::StateStore {
                    request_id,
                    partition,
                    subject,
                    authority,
                    snapshot,
                },
                Some(host),
            ) => {
                let id = self.store.enqueue_commit(PendingCommit {
                    id: 0,
                    request_id,
                    partition,
                    subject,
                    authority,
                    origin: host,
                    snapshot,
                    received_ms: now_ms,
                });
                debug!(
                    "Buffered commit {} for {} in {} from {}",
                    id, subject, partition, authority
                );
                Vec::new()
            }

            (Packet::Disconnect, Some(host)) => {
                self.roster.remove_host(&host);
                self.store.remove_host(host);
                return Vec::new();
            }

            (Packet::Disconnect, None) => Vec::new(),

            (packet, None) => {
                warn!("Dropping {} from unknown host at {}", packet.kind(), addr);
                vec![Outbound::new(
                    addr,
                    Packet::LoginRejected {
                        reason: "Not logged in".to_string(),
                    },
                )]
            }

            (packet, Some(host)) => {
                warn!("Unexpected {} from {}", packet.kind(), host);
                Vec::new()
            }
        };

        if let Some(host) = host {
            self.publish_host(host);
        }
        out
    }

    /// Mirrors a session into the shared roster.
    fn publish_host(&self, host: HostId) {
        if let Some(entry) = self.roster.get(host) {
            self.store.upsert_host(entry.record());
        }
    }

    /// The durable row of a previous session, if `addr` may resume it.
    fn resumable(&self, host_id: Option<HostId>, addr: SocketAddr) -> Option<HostRecord> {
        host_id
            .and_then(|id| self.store.host(id))
            .filter(|record| record.addr == addr)
    }

    fn handle_login(
        &mut self,
        protocol_version: u32,
        resume: Option<HostId>,
        addr: SocketAddr,
        now_ms: u64,
    ) -> Vec<Outbound> {
        if protocol_version != PROTOCOL_VERSION {
            warn!(
                "Rejecting login from {}: protocol {} (expected {})",
                addr, protocol_version, PROTOCOL_VERSION
            );
            return vec![Outbound::new(
                addr,
                Packet::LoginRejected {
                    reason: format!("Unsupported protocol version {}", protocol_version),
                },
            )];
        }

        let resumed = self.resumable(resume, addr);
        if let Some(existing) = self.roster.find_host_by_addr(addr) {
            info!("Replacing {} logged in from {}", existing, addr);
            self.roster.remove_host(&existing);
            if resumed.as_ref().map(|r| r.id) != Some(existing) {
                self.store.remove_host(existing);
            }
        }

        if self.roster.is_full() {
            return vec![Outbound::new(
                addr,
                Packet::LoginRejected {
                    reason: "Coordinator full".to_string(),
                },
            )];
        }

        let host_id = match &resumed {
            Some(record) => {
                info!("{} resumed its session from {}", record.id, addr);
                record.id
            }
            None => self.store.allocate_host_id(),
        };
        self.roster.add_host(host_id, addr, now_ms);
        if let Some(record) = resumed {
            self.roster.set_available(host_id, record.available);
            self.roster.record_occupancy(host_id, &record.occupants);
        }
        self.publish_host(host_id);

        let mut out = vec![Outbound::new(
            addr,
            Packet::LoginAccepted {
                host_id,
                settings: self.config.export_replicated(),
            },
        )];
        if self.map_version > 0 {
            out.push(Outbound::new(addr, self.map_packet()));
        }
        out
    }

    /// Runs one balancer pass on the primary and broadcasts every map it
    /// published. Hosts and occupancy come from the shared roster.
    pub fn balance(&mut self, now_ms: u64) -> ZoneResult<Vec<Outbound>> {
        if !self.is_primary() {
            return Ok(Vec::new());
        }

        let (hosts, occupancy) = self.shared_roster(now_ms);
        let report = self.balancer.run_pass(
            &mut self.tree,
            &occupancy,
            &hosts,
            self.store.as_ref(),
            &mut self.map_version,
        )?;

        let mut out = Vec::new();
        for map in report.publications {
            out.extend(self.broadcast(&Packet::PartitionMap { map }));
        }
        Ok(out)
    }

    /// Candidates and occupancy from every instance's sessions. A row not
    /// refreshed within the host timeout still counts as live but is not
    /// eligible for new delegations.
    fn shared_roster(&self, now_ms: u64) -> (Vec<HostCandidate>, OccupancySnapshot) {
        let records = self.store.live_hosts();
        let occupancy = records
            .iter()
            .flat_map(|record| record.occupants.iter().copied())
            .collect();
        let hosts = records
            .into_iter()
            .map(|record| HostCandidate {
                id: record.id,
                addr: record.addr,
                logged_in: now_ms.saturating_sub(record.last_seen_ms) <= self.config.host_timeout_ms,
                available: record.available,
                last_active_ms: record.last_seen_ms,
            })
            .collect();
        (hosts, occupancy)
    }

    /// Resolves ready commit groups on the primary and replies to every
    /// reporting host, whichever instance it is logged in to.
    pub fn resolve_commits(&mut self, now_ms: u64) -> Vec<Outbound> {
        if !self.is_primary() {
            return Vec::new();
        }

        let mut out = Vec::new();
        for verdict in self.quorum.run(self.store.as_ref(), now_ms) {
            for resolution in verdict.resolutions {
                let commit = resolution.commit;
                let Some(addr) = self.store.host(commit.origin).map(|host| host.addr) else {
                    warn!(
                        "Unroutable commit reply for {}: {} is gone",
                        commit.subject, commit.origin
                    );
                    continue;
                };
                out.push(Outbound::new(
                    addr,
                    Packet::StateStoreReply {
                        request_id: commit.request_id,
                        subject: commit.subject,
                        success: resolution.outcome == CommitOutcome::Succeeded,
                    },
                ));
            }
        }
        out
    }

    /// Ends sessions that went silent here. Their shared rows are left to
    /// age out, since the host may have moved to another instance; the
    /// primary deletes rows not refreshed within the host timeout. The
    /// delegations of deleted hosts are removed by the next balancer pass.
    pub fn expire_hosts(&mut self, now_ms: u64) -> Vec<HostId> {
        let mut expired = self
            .roster
            .check_timeouts(ZoneConfig::duration(self.config.host_timeout_ms));
        for host in &expired {
            info!("{} timed out", host);
        }
        if self.is_primary() {
            let cutoff = now_ms.saturating_sub(self.config.host_timeout_ms);
            for host in self.store.delete_stale_hosts(cutoff) {
                info!("{} has no live session", host);
                if !expired.contains(&host) {
                    expired.push(host);
                }
            }
        }
        expired
    }

    pub fn map_packet(&self) -> Packet {
        Packet::PartitionMap { map: self.map() }
    }

    pub fn broadcast(&self, packet: &Packet) -> Vec<Outbound> {
        self.roster
            .get_host_addrs()
            .into_iter()
            .map(|(_, addr)| Outbound::new(addr, packet.clone()))
            .collect()
    }

    pub fn resign(&mut self) {
        self.elector.resign(self.store.as_ref());
    }
}
