//! Host poll-loop state: subjects, their handoffs and this host's
//! delegations, driven by inbound packets and timer ticks.

use crate::authority::AuthorityDuty;
use crate::handoff::{AuthorityHandoff, HandoffCommand};
use crate::world::LocalWorld;
use crate::Outgoing;
use log::{debug, error, info, warn};
use rand::Rng;
use shared::packets::PROTOCOL_VERSION;
use shared::transport::PendingRequests;
use shared::{
    AuthorityId, HostId, Packet, PartitionMap, PartitionTree, SubjectId, SubjectState,
    ZoneConfig, ZoneError, ZoneResult,
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

/// Subject ids are allocated in blocks of this size per host id.
const SUBJECTS_PER_HOST: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Register,
    Unregister,
}

#[derive(Debug)]
struct HandoffRequest {
    subject: SubjectId,
    authority: AuthorityId,
    kind: RequestKind,
}

#[derive(Debug)]
struct PeerLink {
    host: HostId,
    last_heard_ms: u64,
    unreachable: bool,
}

pub struct PeerHost {
    /// Coordinator instances in failover order; `active` is the one in use.
    coordinators: Vec<SocketAddr>,
    active: usize,
    coordinator_heard_ms: Option<u64>,
    config: ZoneConfig,
    host_id: Option<HostId>,
    needs_login: bool,
    tree: Option<PartitionTree>,
    map_version: u64,
    subject_count: u32,
    world: LocalWorld,
    handoffs: BTreeMap<SubjectId, AuthorityHandoff>,
    duty: AuthorityDuty,
    requests: PendingRequests<HandoffRequest>,
    peers: HashMap<SocketAddr, PeerLink>,
    draining: bool,
}

impl PeerHost {
    pub fn new(coordinator: SocketAddr, config: ZoneConfig, subject_count: u32) -> Self {
        Self {
            coordinators: vec![coordinator],
            active: 0,
            coordinator_heard_ms: None,
            host_id: None,
            needs_login: true,
            tree: None,
            map_version: 0,
            subject_count,
            world: LocalWorld::new(config.world()),
            handoffs: BTreeMap::new(),
            duty: AuthorityDuty::new(
                coordinator,
                config.request_timeout_ms,
                config.request_timeout_ms + config.handoff_grace_ms,
            ),
            requests: PendingRequests::new(config.request_timeout_ms),
            peers: HashMap::new(),
            draining: false,
            config,
        }
    }

    /// Adds standby coordinator instances to fail over to.
    pub fn with_standbys<I>(mut self, standbys: I) -> Self
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        self.coordinators.extend(standbys);
        self
    }

    pub fn coordinator(&self) -> SocketAddr {
        self.coordinators[self.active]
    }

    pub fn has_standbys(&self) -> bool {
        self.coordinators.len() > 1
    }

    /// Switches to the next coordinator instance and asks for a login there.
    /// The login resumes this host's id if the shared roster still has it.
    pub fn fail_over(&mut self) {
        let from = self.coordinator();
        self.active = (self.active + 1) % self.coordinators.len();
        self.coordinator_heard_ms = None;
        self.needs_login = true;
        self.duty.set_coordinator(self.coordinator());
        warn!("Failing over from {} to {}", from, self.coordinator());
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    pub fn host_id(&self) -> Option<HostId> {
        self.host_id
    }

    pub fn needs_login(&self) -> bool {
        self.needs_login
    }

    pub fn map_version(&self) -> u64 {
        self.map_version
    }

    pub fn tree(&self) -> Option<&PartitionTree> {
        self.tree.as_ref()
    }

    pub fn world(&self) -> &LocalWorld {
        &self.world
    }

    pub fn handoff(&self, subject: SubjectId) -> Option<&AuthorityHandoff> {
        self.handoffs.get(&subject)
    }

    pub fn login_packet(&self) -> Outgoing {
        Outgoing::new(
            self.coordinator(),
            Packet::Login {
                protocol_version: PROTOCOL_VERSION,
                host_id: self.host_id,
            },
        )
    }

    /// Applies the coordinator's settings and, on first login, spawns the
    /// subjects this host simulates.
    pub fn on_login_accepted<R: Rng>(
        &mut self,
        host_id: HostId,
        settings: &[(String, String)],
        rng: &mut R,
    ) -> ZoneResult<()> {
        self.config.apply_replicated(settings)?;
        self.world.set_bounds(self.config.world());
        self.requests.set_timeout(self.config.request_timeout_ms);
        self.duty.set_request_timeout(self.config.request_timeout_ms);
        for handoff in self.handoffs.values_mut() {
            handoff.set_grace(self.config.handoff_grace_ms);
        }

        info!("Logged in as {}", host_id);
        self.host_id = Some(host_id);
        self.needs_login = false;

        if self.world.is_empty() {
            let first = host_id.0.saturating_mul(SUBJECTS_PER_HOST);
            for i in 0..self.subject_count.min(SUBJECTS_PER_HOST) {
                let id = SubjectId(first + i);
                self.world.spawn(id, rng);
            }
        }
        for id in self.world.subject_ids() {
            self.handoffs
                .entry(id)
                .or_insert_with(|| AuthorityHandoff::new(id, self.config.handoff_grace_ms));
        }
        Ok(())
    }

    /// Dispatches one inbound packet.
    pub fn handle_packet(&mut self, packet: Packet, from: SocketAddr, now_ms: u64) -> Vec<Outgoing> {
        let from_coordinator = from == self.coordinator();
        if from_coordinator {
            self.coordinator_heard_ms = Some(now_ms);
        } else {
            self.heard_from(from, now_ms);
        }

        match packet {
            Packet::LoginAccepted { host_id, settings } => {
                if from_coordinator && (self.host_id.is_none() || self.needs_login) {
                    if let Err(e) = self.on_login_accepted(host_id, &settings, &mut rand::thread_rng()) {
                        error!("Rejected coordinator settings: {}", e);
                    }
                }
                Vec::new()
            }

            Packet::LoginRejected { reason } => {
                if from_coordinator {
                    warn!("Coordinator rejected this host: {}", reason);
                    self.needs_login = true;
                }
                Vec::new()
            }

            Packet::HeartbeatAck { .. } => Vec::new(),

            Packet::PartitionMap { map } => {
                self.apply_map(&map, now_ms);
                Vec::new()
            }

            Packet::StateRetrieveReply {
                request_id,
                snapshot,
                ..
            } => self.duty.on_state_retrieve_reply(request_id, snapshot),

            Packet::StateStoreReply {
                request_id,
                success,
                ..
            } => self.duty.on_state_store_reply(request_id, success),

            Packet::RegisterRequest {
                request_id,
                subject,
                authority,
            } => self
                .duty
                .on_register_request(request_id, subject, authority, from, now_ms),

            Packet::RegisterAck { subject, authority } => {
                self.duty.on_register_ack(subject, authority);
                Vec::new()
            }

            Packet::UnregisterRequest {
                request_id,
                subject,
                authority,
                report,
            } => match self
                .duty
                .on_unregister_request(request_id, subject, authority, report, from, now_ms)
            {
                Ok(out) => out,
                Err(e) => {
                    error!("{}", e);
                    vec![Outgoing::new(
                        from,
                        Packet::UnregisterReply {
                            request_id,
                            subject,
                            authority,
                            committed: false,
                        },
                    )]
                }
            },

            Packet::SubjectUpdate { authority, state } => {
                self.duty.on_subject_update(authority, state, from);
                Vec::new()
            }

            Packet::RegisterReply {
                request_id,
                subject,
                authority,
                accepted,
                snapshot,
            } => self.on_register_reply(request_id, subject, authority, accepted, snapshot, now_ms),

            Packet::UnregisterReply {
                request_id,
                subject,
                authority,
                committed,
            } => {
                if let Some(request) = self.claim(request_id, subject, authority, RequestKind::Unregister) {
                    if let Some(handoff) = self.handoffs.get_mut(&request.subject) {
                        if let Err(e) = handoff.on_unregister_reply(authority, committed) {
                            error!("{}", e);
                        }
                    }
                }
                Vec::new()
            }

            Packet::WorldSnapshot {
                partition,
                tick,
                subjects,
            } => {
                self.world.observe(partition, tick, subjects);
                Vec::new()
            }

            Packet::PeerPing { timestamp } => {
                vec![Outgoing::new(from, Packet::PeerPong { timestamp })]
            }

            Packet::PeerPong { .. } => Vec::new(),

            other => {
                warn!("Unexpected {} from {}", other.kind(), from);
                Vec::new()
            }
        }
    }

    fn on_register_reply(
        &mut self,
        request_id: u64,
        subject: SubjectId,
        authority: AuthorityId,
        accepted: bool,
        snapshot: Option<Vec<u8>>,
        now_ms: u64,
    ) -> Vec<Outgoing> {
        if self
            .claim(request_id, subject, authority, RequestKind::Register)
            .is_none()
        {
            return Vec::new();
        }
        let Some(handoff) = self.handoffs.get_mut(&subject) else {
            return Vec::new();
        };

        match handoff.on_register_reply(authority, accepted, now_ms) {
            Ok(Some(command)) => {
                if let Some(state) = snapshot.and_then(|bytes| SubjectState::from_snapshot(&bytes).ok()) {
                    self.world.restore(state);
                }
                self.execute(subject, command, now_ms)
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("{}", e);
                Vec::new()
            }
        }
    }

    /// Matches a reply to the request it answers. Replies to expired or
    /// unknown requests yield `None`.
    fn claim(
        &mut self,
        request_id: u64,
        subject: SubjectId,
        authority: AuthorityId,
        kind: RequestKind,
    ) -> Option<HandoffRequest> {
        let request = self.requests.complete(request_id);
        match request {
            Some(request)
                if request.subject == subject
                    && request.authority == authority
                    && request.kind == kind =>
            {
                Some(request)
            }
            Some(request) => {
                error!(
                    "{}",
                    ZoneError::ProtocolViolation(format!(
                        "reply {} for {} from {} does not match {:?}",
                        request_id, subject, authority, request
                    ))
                );
                None
            }
            None => {
                debug!("Ignoring late reply {} for {}", request_id, subject);
                None
            }
        }
    }

    fn apply_map(&mut self, map: &PartitionMap, now_ms: u64) {
        if map.version <= self.map_version {
            return;
        }
        match PartitionTree::from_map(map) {
            Ok(tree) => {
                debug!("Applied map version {}", map.version);
                if let Some(host) = self.host_id {
                    self.duty.sync_map(&tree, host, now_ms);
                }
                self.tree = Some(tree);
                self.map_version = map.version;
            }
            Err(e) => error!("Discarding map version {}: {}", map.version, e),
        }
    }

    fn heard_from(&mut self, addr: SocketAddr, now_ms: u64) {
        if let Some(link) = self.peers.get_mut(&addr) {
            link.last_heard_ms = now_ms;
            if link.unreachable {
                link.unreachable = false;
                info!("{} reachable again", link.host);
                for handoff in self.handoffs.values_mut() {
                    handoff.on_host_restored(link.host);
                }
            }
        }
    }

    /// Advances the simulation and every subject's handoff.
    pub fn tick<R: Rng>(&mut self, dt: f32, now_ms: u64, rng: &mut R) -> Vec<Outgoing> {
        self.world.step(dt, rng);

        let (Some(tree), Some(_)) = (self.tree.as_ref(), self.host_id) else {
            return Vec::new();
        };

        let coordinator = self.coordinator();
        let mut commands = Vec::new();
        let mut out = Vec::new();
        for (subject, handoff) in self.handoffs.iter_mut() {
            let Some(state) = self.world.subject(*subject) else {
                continue;
            };
            let tick = handoff.tick(
                tree,
                self.map_version,
                state.position(),
                self.config.authority_quota,
                now_ms,
            );
            if let Some((from, to)) = tick.zone_change {
                out.push(Outgoing::new(
                    coordinator,
                    Packet::ZoneChanged {
                        subject: *subject,
                        from,
                        to,
                    },
                ));
            }
            commands.extend(tick.commands.into_iter().map(|c| (*subject, c)));

            for authority in handoff.registered() {
                out.push(Outgoing::new(
                    authority.addr,
                    Packet::SubjectUpdate {
                        authority: authority.id,
                        state: state.clone(),
                    },
                ));
            }
        }

        for (subject, command) in commands {
            out.extend(self.execute(subject, command, now_ms));
        }
        out
    }

    fn execute(&mut self, subject: SubjectId, command: HandoffCommand, now_ms: u64) -> Vec<Outgoing> {
        match command {
            HandoffCommand::SendRegister { authority } => {
                let request_id = self.requests.insert(
                    HandoffRequest {
                        subject,
                        authority: authority.id,
                        kind: RequestKind::Register,
                    },
                    now_ms,
                );
                self.peers.entry(authority.addr).or_insert(PeerLink {
                    host: authority.host,
                    last_heard_ms: now_ms,
                    unreachable: false,
                });
                vec![Outgoing::new(
                    authority.addr,
                    Packet::RegisterRequest {
                        request_id,
                        subject,
                        authority: authority.id,
                    },
                )]
            }
            HandoffCommand::SendUnregister {
                authority,
                report,
                await_reply,
            } => {
                // A registration abandoned mid-flight gets no register reply.
                self.requests.cancel(|r| {
                    r.subject == subject
                        && r.authority == authority.id
                        && r.kind == RequestKind::Register
                });
                let request_id = if await_reply {
                    self.requests.insert(
                        HandoffRequest {
                            subject,
                            authority: authority.id,
                            kind: RequestKind::Unregister,
                        },
                        now_ms,
                    )
                } else {
                    0
                };
                vec![Outgoing::new(
                    authority.addr,
                    Packet::UnregisterRequest {
                        request_id,
                        subject,
                        authority: authority.id,
                        report,
                    },
                )]
            }
            HandoffCommand::AckRegistered { authority } => vec![Outgoing::new(
                authority.addr,
                Packet::RegisterAck {
                    subject,
                    authority: authority.id,
                },
            )],
            HandoffCommand::ForcedDisconnect { .. } => Vec::new(),
        }
    }

    /// Periodic work: heartbeat and occupancy to the coordinator, state
    /// reports and snapshots for delegations, peer pings and timeouts.
    pub fn report(&mut self, now_ms: u64) -> Vec<Outgoing> {
        let mut out = Vec::new();
        if self.host_id.is_none() {
            return out;
        }
        if let Some(heard) = self.coordinator_heard_ms {
            if now_ms.saturating_sub(heard) > self.config.host_timeout_ms {
                warn!("{} silent for {}ms", self.coordinator(), now_ms - heard);
                self.fail_over();
            }
        }

        out.push(Outgoing::new(
            self.coordinator(),
            Packet::Heartbeat { timestamp: now_ms },
        ));
        let occupants = self
            .handoffs
            .iter()
            .filter_map(|(subject, h)| h.partition().map(|p| (*subject, p)))
            .collect();
        out.push(Outgoing::new(
            self.coordinator(),
            Packet::OccupancyReport { occupants },
        ));

        out.extend(self.duty.periodic_reports(now_ms));
        if let Some(tree) = self.tree.as_ref() {
            let unreachable: Vec<HostId> = self
                .peers
                .values()
                .filter(|p| p.unreachable)
                .map(|p| p.host)
                .collect();
            out.extend(self.duty.snapshots(tree, |host| !unreachable.contains(&host)));
        }

        out.extend(self.ping_peers(now_ms));
        self.expire_requests(now_ms);
        out.extend(self.duty.expire(now_ms));
        out
    }

    fn ping_peers(&mut self, now_ms: u64) -> Vec<Outgoing> {
        let in_use: Vec<SocketAddr> = self
            .handoffs
            .values()
            .flat_map(|h| h.registered())
            .map(|a| a.addr)
            .collect();
        self.peers
            .retain(|addr, link| in_use.contains(addr) || now_ms.saturating_sub(link.last_heard_ms) < self.config.handoff_grace_ms);

        let silence_ms = self.config.report_interval_ms.saturating_mul(2);
        let mut out = Vec::new();
        for (addr, link) in self.peers.iter_mut() {
            if !link.unreachable && now_ms.saturating_sub(link.last_heard_ms) > silence_ms {
                warn!("{} silent for {}ms", link.host, now_ms - link.last_heard_ms);
                link.unreachable = true;
                for handoff in self.handoffs.values_mut() {
                    handoff.on_host_unreachable(link.host, link.last_heard_ms);
                }
            }
            if in_use.contains(addr) {
                out.push(Outgoing::new(*addr, Packet::PeerPing { timestamp: now_ms }));
            }
        }
        out
    }

    fn expire_requests(&mut self, now_ms: u64) {
        for (request_id, request) in self.requests.expire(now_ms) {
            debug!("Request {} for {} expired", request_id, request.subject);
            let Some(handoff) = self.handoffs.get_mut(&request.subject) else {
                continue;
            };
            match request.kind {
                RequestKind::Register => handoff.on_register_timeout(request.authority),
                RequestKind::Unregister => handoff.on_unregister_timeout(request.authority),
            }
        }
    }

    /// Starts the shutdown drain: no more delegations for this host and
    /// every subject unregisters, reporting state where a quorum is possible.
    pub fn begin_drain(&mut self, now_ms: u64) -> Vec<Outgoing> {
        self.draining = true;
        let mut out = vec![Outgoing::new(
            self.coordinator(),
            Packet::Availability { available: false },
        )];

        let mut commands = Vec::new();
        for (subject, handoff) in self.handoffs.iter_mut() {
            commands.extend(handoff.begin_drain(now_ms).into_iter().map(|c| (*subject, c)));
        }
        info!("Draining {} handoff requests", commands.len());
        for (subject, command) in commands {
            out.extend(self.execute(subject, command, now_ms));
        }
        out
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Every handoff settled and no request outstanding.
    pub fn is_drained(&self) -> bool {
        self.requests.is_empty() && self.handoffs.values().all(|h| h.is_settled())
    }

    pub fn disconnect_packet(&self) -> Outgoing {
        Outgoing::new(self.coordinator(), Packet::Disconnect)
    }
}
