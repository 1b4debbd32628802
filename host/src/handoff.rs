//! Per-subject authority handoff.
//!
//! Every subject this host simulates keeps one [`AuthorityHandoff`]. It holds
//! a registration per authority the subject is, or is becoming, driven by:
//!
//! ```text
//! registering -> registered -> unregistering -> unregistered
//! ```
//!
//! `unregistered` is terminal; the entry is purged and a later transition
//! may register with the same authority again. A subject with no entries is
//! idle.
//!
//! Transitions are triggered by a new partition map version or by the
//! subject crossing a partition boundary. Every stale authority is fully
//! unregistered before any new registration request goes out.

use log::{debug, info, warn};
use shared::{
    Authority, AuthorityId, HostId, PartitionId, PartitionTree, SubjectId, ZoneError, ZoneResult,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Registering,
    Registered,
    Unregistering,
    Unregistered,
}

impl RegistrationState {
    pub fn is_terminal(self) -> bool {
        self == RegistrationState::Unregistered
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub authority: Authority,
    pub state: RegistrationState,
    pub since_ms: u64,
    /// Set while the authority's host is unreachable.
    pub unreachable_since: Option<u64>,
}

/// Work the network layer must carry out for a handoff.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffCommand {
    SendRegister {
        authority: Authority,
    },
    /// `await_reply` is false when the registration was already closed
    /// locally and the request is sent as a courtesy.
    SendUnregister {
        authority: Authority,
        report: bool,
        await_reply: bool,
    },
    AckRegistered {
        authority: Authority,
    },
    ForcedDisconnect {
        authority: Authority,
    },
}

/// Result of one tick.
#[derive(Debug, Default)]
pub struct HandoffTick {
    pub commands: Vec<HandoffCommand>,
    /// Set when the subject entered a different leaf: (previous, current).
    pub zone_change: Option<(Option<PartitionId>, PartitionId)>,
}

#[derive(Debug)]
pub struct AuthorityHandoff {
    subject: SubjectId,
    partition: Option<PartitionId>,
    map_version: u64,
    registrations: BTreeMap<AuthorityId, Registration>,
    transition_pending: bool,
    draining: bool,
    grace_ms: u64,
}

impl AuthorityHandoff {
    pub fn new(subject: SubjectId, grace_ms: u64) -> Self {
        Self {
            subject,
            partition: None,
            map_version: 0,
            registrations: BTreeMap::new(),
            transition_pending: false,
            draining: false,
            grace_ms,
        }
    }

    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    pub fn partition(&self) -> Option<PartitionId> {
        self.partition
    }

    pub fn set_grace(&mut self, grace_ms: u64) {
        self.grace_ms = grace_ms;
    }

    pub fn is_idle(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn state_of(&self, authority: AuthorityId) -> Option<RegistrationState> {
        self.registrations.get(&authority).map(|r| r.state)
    }

    pub fn registration(&self, authority: AuthorityId) -> Option<&Registration> {
        self.registrations.get(&authority)
    }

    /// Authorities the subject is currently registered with.
    pub fn registered(&self) -> Vec<Authority> {
        self.in_state(RegistrationState::Registered)
    }

    pub fn in_state(&self, state: RegistrationState) -> Vec<Authority> {
        self.registrations
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.authority.clone())
            .collect()
    }

    /// No request of this subject is in flight.
    pub fn is_settled(&self) -> bool {
        self.registrations.values().all(|r| {
            matches!(
                r.state,
                RegistrationState::Registered | RegistrationState::Unregistered
            )
        })
    }

    /// Re-evaluates triggers for the subject at `position` and advances the
    /// handoff as far as it can go without waiting on a reply.
    pub fn tick(
        &mut self,
        tree: &PartitionTree,
        map_version: u64,
        position: (f32, f32),
        quota: usize,
        now_ms: u64,
    ) -> HandoffTick {
        let mut out = HandoffTick::default();

        let leaf = tree.resolve_point(position.0, position.1);
        if self.partition != Some(leaf) {
            debug!("{} entered {} from {:?}", self.subject, leaf, self.partition);
            out.zone_change = Some((self.partition, leaf));
            self.partition = Some(leaf);
            self.transition_pending = true;
        }
        if self.map_version != map_version {
            self.map_version = map_version;
            self.transition_pending = true;
        }

        out.commands.extend(self.enforce_grace(now_ms));

        if self.transition_pending && !self.draining {
            let wanted = tree.authorities(leaf);
            out.commands.extend(self.transition(&wanted, quota, now_ms));
        }
        out
    }

    fn transition(&mut self, wanted: &[Authority], quota: usize, now_ms: u64) -> Vec<HandoffCommand> {
        let mut commands = Vec::new();
        let is_wanted = |id: AuthorityId| wanted.iter().any(|a| a.id == id);

        let registered_count = self
            .registrations
            .values()
            .filter(|r| r.state == RegistrationState::Registered)
            .count();
        let stale: Vec<AuthorityId> = self
            .registrations
            .values()
            .filter(|r| {
                matches!(
                    r.state,
                    RegistrationState::Registering | RegistrationState::Registered
                ) && !is_wanted(r.authority.id)
            })
            .map(|r| r.authority.id)
            .collect();

        // Reporting needs at least two registered authorities for a quorum.
        let report = registered_count >= 2;
        for id in stale {
            if let Some(registration) = self.registrations.get_mut(&id) {
                let was_registered = registration.state == RegistrationState::Registered;
                let report = report && was_registered;
                let await_reply = report || !was_registered;
                registration.state = if await_reply {
                    RegistrationState::Unregistering
                } else {
                    RegistrationState::Unregistered
                };
                registration.since_ms = now_ms;
                info!(
                    "{} unregistering from {} (report: {})",
                    self.subject, id, report
                );
                commands.push(HandoffCommand::SendUnregister {
                    authority: registration.authority.clone(),
                    report,
                    await_reply,
                });
            }
        }

        if self
            .registrations
            .values()
            .any(|r| r.state == RegistrationState::Unregistering)
        {
            return commands;
        }

        self.registrations.retain(|_, r| !r.state.is_terminal());

        if wanted.len() >= quota {
            for authority in wanted {
                if self.registrations.contains_key(&authority.id) {
                    continue;
                }
                info!("{} registering with {}", self.subject, authority.id);
                self.registrations.insert(
                    authority.id,
                    Registration {
                        authority: authority.clone(),
                        state: RegistrationState::Registering,
                        since_ms: now_ms,
                        unreachable_since: None,
                    },
                );
                commands.push(HandoffCommand::SendRegister {
                    authority: authority.clone(),
                });
            }
        } else {
            debug!(
                "{} waiting for quota in {:?}: {} of {}",
                self.subject,
                self.partition,
                wanted.len(),
                quota
            );
        }

        self.transition_pending = false;
        commands
    }

    pub fn on_register_reply(
        &mut self,
        authority: AuthorityId,
        accepted: bool,
        now_ms: u64,
    ) -> ZoneResult<Option<HandoffCommand>> {
        let subject = self.subject;
        let registration = self.expect_state(authority, RegistrationState::Registering)?;
        registration.since_ms = now_ms;
        if accepted {
            registration.state = RegistrationState::Registered;
            info!("{} registered with {}", subject, authority);
            Ok(Some(HandoffCommand::AckRegistered {
                authority: registration.authority.clone(),
            }))
        } else {
            registration.state = RegistrationState::Unregistered;
            warn!("{} was refused by {}", subject, authority);
            Ok(None)
        }
    }

    /// A registration request went unanswered. The registration is closed
    /// and retried only on the next trigger.
    pub fn on_register_timeout(&mut self, authority: AuthorityId) {
        if let Some(registration) = self.registrations.get_mut(&authority) {
            if registration.state == RegistrationState::Registering {
                warn!("{} registration with {} timed out", self.subject, authority);
                registration.state = RegistrationState::Unregistered;
            }
        }
    }

    pub fn on_unregister_reply(
        &mut self,
        authority: AuthorityId,
        committed: bool,
    ) -> ZoneResult<()> {
        let subject = self.subject;
        let registration = self.expect_state(authority, RegistrationState::Unregistering)?;
        registration.state = RegistrationState::Unregistered;
        info!(
            "{} unregistered from {} (committed: {})",
            subject, authority, committed
        );
        self.transition_pending = true;
        Ok(())
    }

    pub fn on_unregister_timeout(&mut self, authority: AuthorityId) {
        if let Some(registration) = self.registrations.get_mut(&authority) {
            if registration.state == RegistrationState::Unregistering {
                warn!("{} unregistration from {} timed out", self.subject, authority);
                registration.state = RegistrationState::Unregistered;
                self.transition_pending = true;
            }
        }
    }

    /// Records that `host` stopped answering at `since_ms`.
    pub fn on_host_unreachable(&mut self, host: HostId, since_ms: u64) {
        for registration in self.registrations.values_mut() {
            if registration.authority.host == host && registration.unreachable_since.is_none() {
                registration.unreachable_since = Some(since_ms);
            }
        }
    }

    pub fn on_host_restored(&mut self, host: HostId) {
        for registration in self.registrations.values_mut() {
            if registration.authority.host == host {
                registration.unreachable_since = None;
            }
        }
    }

    /// Closes every registration whose host has been unreachable for longer
    /// than the grace period, whatever its phase.
    pub fn enforce_grace(&mut self, now_ms: u64) -> Vec<HandoffCommand> {
        let mut commands = Vec::new();
        for registration in self.registrations.values_mut() {
            let Some(since) = registration.unreachable_since else {
                continue;
            };
            if registration.state.is_terminal() || now_ms.saturating_sub(since) <= self.grace_ms {
                continue;
            }
            warn!(
                "Forced disconnect of {} from {} on {} after {}ms",
                self.subject,
                registration.authority.id,
                registration.authority.host,
                now_ms.saturating_sub(since)
            );
            registration.state = RegistrationState::Unregistered;
            commands.push(HandoffCommand::ForcedDisconnect {
                authority: registration.authority.clone(),
            });
        }
        if !commands.is_empty() {
            self.transition_pending = true;
        }
        commands
    }

    /// Starts unregistering from every authority ahead of shutdown. No new
    /// registrations are made afterwards.
    pub fn begin_drain(&mut self, now_ms: u64) -> Vec<HandoffCommand> {
        self.draining = true;
        let mut commands = Vec::new();
        let registered_count = self.registered().len();

        for registration in self.registrations.values_mut() {
            let report = match registration.state {
                RegistrationState::Registered => registered_count >= 2,
                RegistrationState::Registering => false,
                _ => continue,
            };
            registration.state = RegistrationState::Unregistering;
            registration.since_ms = now_ms;
            commands.push(HandoffCommand::SendUnregister {
                authority: registration.authority.clone(),
                report,
                await_reply: true,
            });
        }
        commands
    }

    fn expect_state(
        &mut self,
        authority: AuthorityId,
        expected: RegistrationState,
    ) -> ZoneResult<&mut Registration> {
        let subject = self.subject;
        match self.registrations.get_mut(&authority) {
            Some(registration) if registration.state == expected => Ok(registration),
            Some(registration) => Err(ZoneError::ProtocolViolation(format!(
                "{} got a reply from {} while {:?}, expected {:?}",
                subject, authority, registration.state, expected
            ))),
            None => Err(ZoneError::ProtocolViolation(format!(
                "{} got a reply from {} it never registered with",
                subject, authority
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Rect;
    use std::net::SocketAddr;

    const QUOTA: usize = 2;

    fn addr(host: u32) -> SocketAddr {
        format!("127.0.0.1:{}", 9000 + host).parse().unwrap()
    }

    /// Root split once; the low half holds authorities 1 and 2 and the
    /// high half authorities 3 and 4.
    fn split_tree() -> (PartitionTree, PartitionId, PartitionId) {
        let mut tree = PartitionTree::new(Rect::new(0.0, 0.0, 800.0, 600.0));
        let mut next = 0;
        tree.commit_provisional(|| {
            next += 1;
            PartitionId(next)
        })
        .unwrap();
        let root = tree.root();
        let [low, high] = tree.split(root).unwrap().children;
        let committed = tree
            .commit_provisional(|| {
                next += 1;
                PartitionId(next)
            })
            .unwrap();
        let durable = |id: PartitionId| {
            committed
                .iter()
                .find(|(p, _)| *p == id)
                .map(|(_, d)| *d)
                .unwrap()
        };
        let (low, high) = (durable(low), durable(high));

        for (id, partition) in [(1, low), (2, low), (3, high), (4, high)] {
            tree.add_authority(Authority::new(
                AuthorityId(id),
                partition,
                HostId(id as u32),
                addr(id as u32),
            ))
            .unwrap();
        }
        (tree, low, high)
    }

    fn registered_in(handoff: &mut AuthorityHandoff, tree: &PartitionTree, pos: (f32, f32)) {
        let tick = handoff.tick(tree, 1, pos, QUOTA, 0);
        for command in tick.commands {
            if let HandoffCommand::SendRegister { authority } = command {
                handoff.on_register_reply(authority.id, true, 0).unwrap();
            }
        }
        assert_eq!(handoff.registered().len(), 2);
    }

    #[test]
    fn test_registers_with_every_authority_of_full_partition() {
        let (tree, low, _) = split_tree();
        let mut handoff = AuthorityHandoff::new(SubjectId(1), 1000);

        let tick = handoff.tick(&tree, 1, (100.0, 100.0), QUOTA, 0);
        assert_eq!(tick.zone_change, Some((None, low)));
        assert_eq!(tick.commands.len(), 2);
        assert_eq!(
            handoff.state_of(AuthorityId(1)),
            Some(RegistrationState::Registering)
        );

        let ack = handoff.on_register_reply(AuthorityId(1), true, 5).unwrap();
        assert!(matches!(ack, Some(HandoffCommand::AckRegistered { .. })));
        assert_eq!(
            handoff.state_of(AuthorityId(1)),
            Some(RegistrationState::Registered)
        );
    }

    #[test]
    fn test_waits_for_quota_before_registering() {
        let (mut tree, _, _) = split_tree();
        tree.remove_authority(AuthorityId(2));
        let mut handoff = AuthorityHandoff::new(SubjectId(1), 1000);

        let tick = handoff.tick(&tree, 1, (100.0, 100.0), QUOTA, 0);
        assert!(tick.commands.is_empty());
        assert!(handoff.is_idle());
    }

    #[test]
    fn test_crossing_unregisters_before_registering() {
        let (tree, _, high) = split_tree();
        let mut handoff = AuthorityHandoff::new(SubjectId(1), 1000);
        registered_in(&mut handoff, &tree, (100.0, 100.0));

        let tick = handoff.tick(&tree, 1, (700.0, 100.0), QUOTA, 10);
        assert_eq!(tick.zone_change.map(|(_, to)| to), Some(high));
        assert_eq!(tick.commands.len(), 2);
        for command in &tick.commands {
            assert!(matches!(
                command,
                HandoffCommand::SendUnregister {
                    report: true,
                    await_reply: true,
                    ..
                }
            ));
        }

        // Still waiting on authority 2.
        handoff.on_unregister_reply(AuthorityId(1), true).unwrap();
        let tick = handoff.tick(&tree, 1, (700.0, 100.0), QUOTA, 20);
        assert!(tick.commands.is_empty());

        handoff.on_unregister_reply(AuthorityId(2), true).unwrap();
        let tick = handoff.tick(&tree, 1, (700.0, 100.0), QUOTA, 30);
        let targets: Vec<AuthorityId> = tick
            .commands
            .iter()
            .map(|c| match c {
                HandoffCommand::SendRegister { authority } => authority.id,
                other => panic!("unexpected command {:?}", other),
            })
            .collect();
        assert_eq!(targets, vec![AuthorityId(3), AuthorityId(4)]);
        assert_eq!(handoff.state_of(AuthorityId(1)), None);
    }

    #[test]
    fn test_single_registration_skips_report() {
        let (tree, _, _) = split_tree();
        let mut handoff = AuthorityHandoff::new(SubjectId(1), 1000);
        let tick = handoff.tick(&tree, 1, (100.0, 100.0), QUOTA, 0);
        assert_eq!(tick.commands.len(), 2);
        handoff.on_register_reply(AuthorityId(1), true, 0).unwrap();
        handoff.on_register_timeout(AuthorityId(2));

        let tick = handoff.tick(&tree, 1, (700.0, 100.0), QUOTA, 10);
        assert_eq!(
            tick.commands[0],
            HandoffCommand::SendUnregister {
                authority: tree.find_authority(AuthorityId(1)).unwrap().clone(),
                report: false,
                await_reply: false,
            }
        );
        // Nothing to wait for, so the new partition is registered at once.
        assert_eq!(tick.commands.len(), 3);
    }

    #[test]
    fn test_map_change_retriggers_transition() {
        let (mut tree, _, _) = split_tree();
        let mut handoff = AuthorityHandoff::new(SubjectId(1), 1000);
        registered_in(&mut handoff, &tree, (100.0, 100.0));

        tree.remove_authority(AuthorityId(2));
        let tick = handoff.tick(&tree, 2, (100.0, 100.0), QUOTA, 10);
        assert!(tick.zone_change.is_none());
        assert_eq!(tick.commands.len(), 1);
        assert_eq!(
            handoff.state_of(AuthorityId(2)),
            Some(RegistrationState::Unregistering)
        );
        assert_eq!(
            handoff.state_of(AuthorityId(1)),
            Some(RegistrationState::Registered)
        );
    }

    #[test]
    fn test_unexpected_reply_is_protocol_violation() {
        let (tree, _, _) = split_tree();
        let mut handoff = AuthorityHandoff::new(SubjectId(1), 1000);
        registered_in(&mut handoff, &tree, (100.0, 100.0));

        assert!(matches!(
            handoff.on_unregister_reply(AuthorityId(1), true),
            Err(ZoneError::ProtocolViolation(_))
        ));
        assert!(matches!(
            handoff.on_register_reply(AuthorityId(9), true, 0),
            Err(ZoneError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_unreachable_host_forced_after_grace() {
        let (tree, _, _) = split_tree();
        let mut handoff = AuthorityHandoff::new(SubjectId(1), 1000);
        registered_in(&mut handoff, &tree, (100.0, 100.0));

        handoff.on_host_unreachable(HostId(1), 100);
        assert!(handoff.enforce_grace(1000).is_empty());

        handoff.on_host_restored(HostId(1));
        handoff.on_host_unreachable(HostId(1), 500);
        let commands = handoff.enforce_grace(1600);
        assert_eq!(commands.len(), 1);
        assert_eq!(
            handoff.state_of(AuthorityId(1)),
            Some(RegistrationState::Unregistered)
        );
    }

    #[test]
    fn test_drain_unregisters_everything() {
        let (tree, _, _) = split_tree();
        let mut handoff = AuthorityHandoff::new(SubjectId(1), 1000);
        registered_in(&mut handoff, &tree, (100.0, 100.0));

        let commands = handoff.begin_drain(50);
        assert_eq!(commands.len(), 2);
        assert!(!handoff.is_settled());

        handoff.on_unregister_reply(AuthorityId(1), true).unwrap();
        handoff.on_unregister_reply(AuthorityId(2), true).unwrap();
        assert!(handoff.is_settled());

        // Draining subjects never re-register.
        let tick = handoff.tick(&tree, 1, (100.0, 100.0), QUOTA, 60);
        assert!(tick.commands.is_empty());
    }
}
