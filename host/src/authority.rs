//! The host's side of its delegations.
//!
//! For every authority delegated to this host, [`AuthorityDuty`] serves the
//! subjects registered with it: it fetches their committed state from the
//! coordinator on registration, tracks the state their hosts stream to it,
//! reports that state for commit, and, when it is the partition's master,
//! broadcasts world snapshots.
//!
//! A delegation that disappears from the map is retired rather than
//! dropped, so subjects still registered with it can unregister and have
//! their state reported one last time.

use crate::Outgoing;
use log::{debug, info, warn};
use shared::transport::PendingRequests;
use shared::{
    Authority, AuthorityId, HostId, Packet, PartitionTree, SubjectId, SubjectState, ZoneError,
    ZoneResult,
};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

#[derive(Debug, Clone)]
struct ServedSubject {
    requester: SocketAddr,
    state: Option<SubjectState>,
    acknowledged: bool,
}

#[derive(Debug)]
struct Delegation {
    authority: Authority,
    subjects: BTreeMap<SubjectId, ServedSubject>,
    retired_at: Option<u64>,
}

#[derive(Debug)]
struct Retrieval {
    authority: AuthorityId,
    subject: SubjectId,
    requester: SocketAddr,
    register_request_id: u64,
}

#[derive(Debug)]
struct StoreContext {
    subject: SubjectId,
    /// The unregister request waiting on this commit, if any.
    reply_to: Option<(SocketAddr, AuthorityId, u64)>,
}

#[derive(Debug)]
pub struct AuthorityDuty {
    coordinator: SocketAddr,
    delegations: BTreeMap<AuthorityId, Delegation>,
    retrievals: PendingRequests<Retrieval>,
    stores: PendingRequests<StoreContext>,
    linger_ms: u64,
    snapshot_tick: u32,
}

impl AuthorityDuty {
    pub fn new(coordinator: SocketAddr, request_timeout_ms: u64, linger_ms: u64) -> Self {
        Self {
            coordinator,
            delegations: BTreeMap::new(),
            retrievals: PendingRequests::new(request_timeout_ms),
            stores: PendingRequests::new(request_timeout_ms),
            linger_ms,
            snapshot_tick: 0,
        }
    }

    pub fn set_request_timeout(&mut self, timeout_ms: u64) {
        self.retrievals.set_timeout(timeout_ms);
        self.stores.set_timeout(timeout_ms);
    }

    /// Points state retrievals and reports at another coordinator instance.
    pub fn set_coordinator(&mut self, coordinator: SocketAddr) {
        self.coordinator = coordinator;
    }

    /// Active delegations held by this host.
    pub fn delegations(&self) -> Vec<Authority> {
        self.delegations
            .values()
            .filter(|d| d.retired_at.is_none())
            .map(|d| d.authority.clone())
            .collect()
    }

    pub fn served(&self, authority: AuthorityId) -> Vec<SubjectId> {
        self.delegations
            .get(&authority)
            .map(|d| d.subjects.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn state_of(&self, authority: AuthorityId, subject: SubjectId) -> Option<&SubjectState> {
        self.delegations
            .get(&authority)?
            .subjects
            .get(&subject)?
            .state
            .as_ref()
    }

    /// Aligns delegations with a new map. Delegations no longer in the map
    /// are retired.
    pub fn sync_map(&mut self, tree: &PartitionTree, host: HostId, now_ms: u64) {
        let current: BTreeMap<AuthorityId, Authority> = tree
            .all_authorities()
            .into_iter()
            .filter(|a| a.host == host)
            .map(|a| (a.id, a))
            .collect();

        for (id, delegation) in self.delegations.iter_mut() {
            if delegation.retired_at.is_none() && !current.contains_key(id) {
                info!(
                    "Retiring {} of {} ({} subjects)",
                    id,
                    delegation.authority.partition,
                    delegation.subjects.len()
                );
                delegation.retired_at = Some(now_ms);
            }
        }
        self.delegations
            .retain(|_, d| d.retired_at.is_none() || !d.subjects.is_empty());

        for (id, authority) in current {
            if !self.delegations.contains_key(&id) {
                info!("Serving {} for {}", id, authority.partition);
                self.delegations.insert(
                    id,
                    Delegation {
                        authority,
                        subjects: BTreeMap::new(),
                        retired_at: None,
                    },
                );
            }
        }
    }

    pub fn on_register_request(
        &mut self,
        request_id: u64,
        subject: SubjectId,
        authority: AuthorityId,
        from: SocketAddr,
        now_ms: u64,
    ) -> Vec<Outgoing> {
        let Some(delegation) = self
            .delegations
            .get_mut(&authority)
            .filter(|d| d.retired_at.is_none())
        else {
            warn!("Refusing {} for {}: not served here", subject, authority);
            return vec![Outgoing::new(
                from,
                Packet::RegisterReply {
                    request_id,
                    subject,
                    authority,
                    accepted: false,
                    snapshot: None,
                },
            )];
        };

        delegation.subjects.insert(
            subject,
            ServedSubject {
                requester: from,
                state: None,
                acknowledged: false,
            },
        );
        let retrieve_id = self.retrievals.insert(
            Retrieval {
                authority,
                subject,
                requester: from,
                register_request_id: request_id,
            },
            now_ms,
        );
        debug!("{} fetching committed state of {}", authority, subject);
        vec![Outgoing::new(
            self.coordinator,
            Packet::StateRetrieve {
                request_id: retrieve_id,
                subject,
            },
        )]
    }

    /// Completes a registration once the coordinator supplied the subject's
    /// committed state.
    pub fn on_state_retrieve_reply(
        &mut self,
        request_id: u64,
        snapshot: Option<Vec<u8>>,
    ) -> Vec<Outgoing> {
        let Some(retrieval) = self.retrievals.complete(request_id) else {
            debug!("Ignoring stale state retrieval {}", request_id);
            return Vec::new();
        };

        let served = self
            .delegations
            .get_mut(&retrieval.authority)
            .and_then(|d| d.subjects.get_mut(&retrieval.subject));
        let accepted = match served {
            Some(served) => {
                if let Some(bytes) = &snapshot {
                    match SubjectState::from_snapshot(bytes) {
                        Ok(state) => served.state = Some(state),
                        Err(e) => warn!("Bad snapshot for {}: {}", retrieval.subject, e),
                    }
                }
                true
            }
            None => false,
        };

        vec![Outgoing::new(
            retrieval.requester,
            Packet::RegisterReply {
                request_id: retrieval.register_request_id,
                subject: retrieval.subject,
                authority: retrieval.authority,
                accepted,
                snapshot,
            },
        )]
    }

    pub fn on_register_ack(&mut self, subject: SubjectId, authority: AuthorityId) {
        if let Some(served) = self
            .delegations
            .get_mut(&authority)
            .and_then(|d| d.subjects.get_mut(&subject))
        {
            served.acknowledged = true;
        }
    }

    pub fn on_subject_update(&mut self, authority: AuthorityId, state: SubjectState, from: SocketAddr) {
        match self
            .delegations
            .get_mut(&authority)
            .and_then(|d| d.subjects.get_mut(&state.id))
        {
            Some(served) if served.requester == from => served.state = Some(state),
            _ => debug!("Ignoring update of {} for {} from {}", state.id, authority, from),
        }
    }

    /// Releases a subject. With `report` set, its last known state is first
    /// submitted for commit and the reply is sent once the quorum resolved.
    pub fn on_unregister_request(
        &mut self,
        request_id: u64,
        subject: SubjectId,
        authority: AuthorityId,
        report: bool,
        from: SocketAddr,
        now_ms: u64,
    ) -> ZoneResult<Vec<Outgoing>> {
        let delegation = self.delegations.get_mut(&authority).ok_or_else(|| {
            ZoneError::ProtocolViolation(format!(
                "unregister of {} from {} which is not served here",
                subject, authority
            ))
        })?;
        let served = delegation.subjects.remove(&subject).ok_or_else(|| {
            ZoneError::ProtocolViolation(format!(
                "unregister of {} which never registered with {}",
                subject, authority
            ))
        })?;
        let partition = delegation.authority.partition;

        if report {
            if let Some(state) = served.state {
                let snapshot = state.to_snapshot()?;
                let store_id = self.stores.insert(
                    StoreContext {
                        subject,
                        reply_to: Some((from, authority, request_id)),
                    },
                    now_ms,
                );
                return Ok(vec![Outgoing::new(
                    self.coordinator,
                    Packet::StateStore {
                        request_id: store_id,
                        partition,
                        subject,
                        authority,
                        snapshot,
                    },
                )]);
            }
        }

        Ok(vec![Outgoing::new(
            from,
            Packet::UnregisterReply {
                request_id,
                subject,
                authority,
                committed: false,
            },
        )])
    }

    pub fn on_state_store_reply(&mut self, request_id: u64, success: bool) -> Vec<Outgoing> {
        let Some(context) = self.stores.complete(request_id) else {
            debug!("Ignoring stale commit reply {}", request_id);
            return Vec::new();
        };

        match context.reply_to {
            Some((addr, authority, unregister_id)) => vec![Outgoing::new(
                addr,
                Packet::UnregisterReply {
                    request_id: unregister_id,
                    subject: context.subject,
                    authority,
                    committed: success,
                },
            )],
            None => {
                debug!("Periodic commit of {}: {}", context.subject, success);
                Vec::new()
            }
        }
    }

    /// State reports for every acknowledged subject of every active
    /// delegation.
    pub fn periodic_reports(&mut self, now_ms: u64) -> Vec<Outgoing> {
        let mut out = Vec::new();
        for delegation in self.delegations.values() {
            if delegation.retired_at.is_some() {
                continue;
            }
            for (subject, served) in &delegation.subjects {
                let Some(state) = served.state.as_ref().filter(|_| served.acknowledged) else {
                    continue;
                };
                let snapshot = match state.to_snapshot() {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", subject, e);
                        continue;
                    }
                };
                let store_id = self.stores.insert(
                    StoreContext {
                        subject: *subject,
                        reply_to: None,
                    },
                    now_ms,
                );
                out.push(Outgoing::new(
                    self.coordinator,
                    Packet::StateStore {
                        request_id: store_id,
                        partition: delegation.authority.partition,
                        subject: *subject,
                        authority: delegation.authority.id,
                        snapshot,
                    },
                ));
            }
        }
        out
    }

    /// World snapshots from every delegation that is its partition's
    /// master, sent to the host of each registered subject.
    pub fn snapshots<F>(&mut self, tree: &PartitionTree, mut is_live: F) -> Vec<Outgoing>
    where
        F: FnMut(HostId) -> bool,
    {
        self.snapshot_tick = self.snapshot_tick.wrapping_add(1);
        let mut out = Vec::new();

        for delegation in self.delegations.values() {
            if delegation.retired_at.is_some() || delegation.subjects.is_empty() {
                continue;
            }
            let partition = delegation.authority.partition;
            let is_master = tree
                .registry(partition)
                .and_then(|r| r.master(&mut is_live))
                .map(|m| m.id == delegation.authority.id)
                .unwrap_or(false);
            if !is_master {
                continue;
            }

            let subjects: Vec<SubjectState> = delegation
                .subjects
                .values()
                .filter_map(|s| s.state.clone())
                .collect();
            let recipients: BTreeSet<SocketAddr> =
                delegation.subjects.values().map(|s| s.requester).collect();
            for addr in recipients {
                out.push(Outgoing::new(
                    addr,
                    Packet::WorldSnapshot {
                        partition,
                        tick: self.snapshot_tick,
                        subjects: subjects.clone(),
                    },
                ));
            }
        }
        out
    }

    /// Fails requests the coordinator never answered and drops retired
    /// delegations that outlived the linger period.
    pub fn expire(&mut self, now_ms: u64) -> Vec<Outgoing> {
        let mut out = Vec::new();

        for (_, retrieval) in self.retrievals.expire(now_ms) {
            warn!(
                "State retrieval for {} timed out; refusing registration with {}",
                retrieval.subject, retrieval.authority
            );
            if let Some(delegation) = self.delegations.get_mut(&retrieval.authority) {
                delegation.subjects.remove(&retrieval.subject);
            }
            out.push(Outgoing::new(
                retrieval.requester,
                Packet::RegisterReply {
                    request_id: retrieval.register_request_id,
                    subject: retrieval.subject,
                    authority: retrieval.authority,
                    accepted: false,
                    snapshot: None,
                },
            ));
        }

        for (_, context) in self.stores.expire(now_ms) {
            if let Some((addr, authority, unregister_id)) = context.reply_to {
                warn!("Commit of {} timed out", context.subject);
                out.push(Outgoing::new(
                    addr,
                    Packet::UnregisterReply {
                        request_id: unregister_id,
                        subject: context.subject,
                        authority,
                        committed: false,
                    },
                ));
            }
        }

        let linger_ms = self.linger_ms;
        self.delegations.retain(|id, d| match d.retired_at {
            Some(at) if now_ms.saturating_sub(at) > linger_ms => {
                if !d.subjects.is_empty() {
                    warn!("Dropping retired {} with {} subjects", id, d.subjects.len());
                }
                false
            }
            _ => true,
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{PartitionId, Rect};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    const COORDINATOR: u16 = 8080;
    const SUBJECT_HOST: u16 = 9100;

    fn tree_with(authorities: &[(u64, u32)]) -> PartitionTree {
        let mut tree = PartitionTree::new(Rect::new(0.0, 0.0, 800.0, 600.0));
        tree.commit_provisional(|| PartitionId(1)).unwrap();
        for (id, host) in authorities {
            tree.add_authority(Authority::new(
                AuthorityId(*id),
                PartitionId(1),
                HostId(*host),
                addr(9000 + *host as u16),
            ))
            .unwrap();
        }
        tree
    }

    fn duty_for(tree: &PartitionTree, host: u32) -> AuthorityDuty {
        let mut duty = AuthorityDuty::new(addr(COORDINATOR), 1000, 5000);
        duty.sync_map(tree, HostId(host), 0);
        duty
    }

    /// Registers subject 1 with authority 1 and returns the duty.
    fn registered(tree: &PartitionTree) -> AuthorityDuty {
        let mut duty = duty_for(tree, 1);
        let out = duty.on_register_request(7, SubjectId(1), AuthorityId(1), addr(SUBJECT_HOST), 0);
        let retrieve_id = match out[0].packet {
            Packet::StateRetrieve { request_id, .. } => request_id,
            ref other => panic!("unexpected {:?}", other),
        };
        duty.on_state_retrieve_reply(retrieve_id, None);
        duty.on_register_ack(SubjectId(1), AuthorityId(1));
        duty.on_subject_update(
            AuthorityId(1),
            SubjectState::new(SubjectId(1), 10.0, 20.0),
            addr(SUBJECT_HOST),
        );
        duty
    }

    #[test]
    fn test_register_fetches_state_then_replies() {
        let tree = tree_with(&[(1, 1), (2, 2)]);
        let mut duty = duty_for(&tree, 1);
        assert_eq!(duty.delegations().len(), 1);

        let out = duty.on_register_request(7, SubjectId(1), AuthorityId(1), addr(SUBJECT_HOST), 0);
        assert_eq!(out[0].addr, addr(COORDINATOR));
        let retrieve_id = match out[0].packet {
            Packet::StateRetrieve { request_id, .. } => request_id,
            ref other => panic!("unexpected {:?}", other),
        };

        let committed = SubjectState::new(SubjectId(1), 42.0, 24.0);
        let out = duty.on_state_retrieve_reply(retrieve_id, Some(committed.to_snapshot().unwrap()));
        assert_eq!(out[0].addr, addr(SUBJECT_HOST));
        match &out[0].packet {
            Packet::RegisterReply {
                request_id,
                accepted,
                ..
            } => {
                assert_eq!(*request_id, 7);
                assert!(*accepted);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(duty.state_of(AuthorityId(1), SubjectId(1)), Some(&committed));
    }

    #[test]
    fn test_register_refused_for_foreign_authority() {
        let tree = tree_with(&[(1, 1), (2, 2)]);
        let mut duty = duty_for(&tree, 1);

        let out = duty.on_register_request(7, SubjectId(1), AuthorityId(2), addr(SUBJECT_HOST), 0);
        assert!(matches!(
            out[0].packet,
            Packet::RegisterReply {
                accepted: false,
                ..
            }
        ));
    }

    #[test]
    fn test_unregister_with_report_waits_for_commit() {
        let tree = tree_with(&[(1, 1), (2, 2)]);
        let mut duty = registered(&tree);

        let out = duty
            .on_unregister_request(11, SubjectId(1), AuthorityId(1), true, addr(SUBJECT_HOST), 5)
            .unwrap();
        assert_eq!(out[0].addr, addr(COORDINATOR));
        let store_id = match out[0].packet {
            Packet::StateStore { request_id, .. } => request_id,
            ref other => panic!("unexpected {:?}", other),
        };
        assert!(duty.served(AuthorityId(1)).is_empty());

        let out = duty.on_state_store_reply(store_id, true);
        assert_eq!(
            out[0].packet,
            Packet::UnregisterReply {
                request_id: 11,
                subject: SubjectId(1),
                authority: AuthorityId(1),
                committed: true,
            }
        );
    }

    #[test]
    fn test_unregister_unknown_subject_is_violation() {
        let tree = tree_with(&[(1, 1)]);
        let mut duty = duty_for(&tree, 1);

        let result =
            duty.on_unregister_request(1, SubjectId(5), AuthorityId(1), false, addr(SUBJECT_HOST), 0);
        assert!(matches!(result, Err(ZoneError::ProtocolViolation(_))));
    }

    #[test]
    fn test_retired_delegation_still_reports() {
        let tree = tree_with(&[(1, 1), (2, 2)]);
        let mut duty = registered(&tree);

        duty.sync_map(&tree_with(&[]), HostId(1), 10);
        assert!(duty.delegations().is_empty());
        assert!(duty.periodic_reports(10).is_empty());

        let out = duty
            .on_unregister_request(11, SubjectId(1), AuthorityId(1), true, addr(SUBJECT_HOST), 20)
            .unwrap();
        assert!(matches!(
            out[0].packet,
            Packet::StateStore {
                partition: PartitionId(1),
                ..
            }
        ));
    }

    #[test]
    fn test_only_master_broadcasts_snapshots() {
        let tree = tree_with(&[(1, 1), (2, 2)]);
        let mut duty = registered(&tree);

        let out = duty.snapshots(&tree, |_| true);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].addr, addr(SUBJECT_HOST));

        // With host 1 considered dead, authority 2 is master instead.
        assert!(duty.snapshots(&tree, |h| h != HostId(1)).is_empty());
    }

    #[test]
    fn test_periodic_reports_cover_acknowledged_subjects() {
        let tree = tree_with(&[(1, 1), (2, 2)]);
        let mut duty = registered(&tree);

        let out = duty.periodic_reports(100);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].packet, Packet::StateStore { .. }));
        let store_id = match out[0].packet {
            Packet::StateStore { request_id, .. } => request_id,
            _ => unreachable!(),
        };
        assert!(duty.on_state_store_reply(store_id, true).is_empty());
    }

    #[test]
    fn test_expired_retrieval_refuses_registration() {
        let tree = tree_with(&[(1, 1)]);
        let mut duty = duty_for(&tree, 1);
        duty.on_register_request(7, SubjectId(1), AuthorityId(1), addr(SUBJECT_HOST), 0);

        let out = duty.expire(2000);
        assert!(matches!(
            out[0].packet,
            Packet::RegisterReply {
                accepted: false,
                request_id: 7,
                ..
            }
        ));
        assert!(duty.served(AuthorityId(1)).is_empty());
    }
}
