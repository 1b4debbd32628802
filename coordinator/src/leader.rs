//! Primary election over the durable coordinator roster.
//!
//! Every instance upserts its own roster row on each check and deletes rows
//! that stopped refreshing. The live instance with the lowest id is primary.

use crate::store::{CoordinatorId, DurableStore, StoreTable};
use log::{debug, info, warn};
use shared::{PartitionMap, ZoneError, ZoneResult};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    BecamePrimary,
    StillPrimary,
    BecameSecondary,
    StillSecondary,
}

impl RoleChange {
    pub fn is_primary(self) -> bool {
        matches!(self, RoleChange::BecamePrimary | RoleChange::StillPrimary)
    }
}

#[derive(Debug)]
pub struct LeaderElector {
    id: CoordinatorId,
    stale_after_ms: u64,
    role: Option<Role>,
}

impl LeaderElector {
    pub fn new(id: CoordinatorId, stale_after_ms: u64) -> Self {
        Self {
            id,
            stale_after_ms,
            role: None,
        }
    }

    pub fn id(&self) -> CoordinatorId {
        self.id
    }

    pub fn is_primary(&self) -> bool {
        self.role == Some(Role::Primary)
    }

    /// Refreshes this instance's roster row and re-derives its role.
    pub fn check<S: DurableStore>(&mut self, store: &S, now_ms: u64) -> RoleChange {
        let live = store.exclusive(StoreTable::Roster, || {
            store.upsert_coordinator(self.id, now_ms);
            let removed = store.delete_stale_coordinators(now_ms.saturating_sub(self.stale_after_ms));
            if removed > 0 {
                info!("Removed {} stale coordinators from the roster", removed);
            }
            store.live_coordinators()
        });

        let role = if live.first() == Some(&self.id) {
            Role::Primary
        } else {
            Role::Secondary
        };
        let change = match (self.role, role) {
            (Some(Role::Primary), Role::Primary) => RoleChange::StillPrimary,
            (_, Role::Primary) => RoleChange::BecamePrimary,
            (Some(Role::Secondary), Role::Secondary) => RoleChange::StillSecondary,
            (_, Role::Secondary) => RoleChange::BecameSecondary,
        };
        self.role = Some(role);

        match change {
            RoleChange::BecamePrimary => info!("{} is now primary", self.id),
            RoleChange::BecameSecondary => {
                info!("{} is secondary to {:?}", self.id, live.first())
            }
            _ => debug!("{} role unchanged ({} live)", self.id, live.len()),
        }
        change
    }

    /// Removes this instance from the roster so a successor takes over on
    /// its next check.
    pub fn resign<S: DurableStore>(&mut self, store: &S) {
        store.exclusive(StoreTable::Roster, || store.remove_coordinator(self.id));
        self.role = None;
        info!("{} resigned", self.id);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    Loaded {
        map: PartitionMap,
        settings: Vec<(String, String)>,
    },
    /// Nothing was stored before the deadline and this instance became
    /// primary meanwhile; it must seed the store itself.
    BecamePrimary,
}

/// Polls the store for the partition map until it appears. On timeout the
/// role is re-checked: a fresh primary abandons the pull, anyone else fails.
pub async fn pull_state<S: DurableStore>(
    store: &S,
    elector: &mut LeaderElector,
    timeout: Duration,
    poll: Duration,
) -> ZoneResult<PullOutcome> {
    let started = Instant::now();
    loop {
        if let Some(map) = store.load_partition_map()? {
            let settings = store.load_config();
            debug!("Pulled partition map version {}", map.version);
            return Ok(PullOutcome::Loaded { map, settings });
        }

        if started.elapsed() >= timeout {
            if elector.check(store, shared::utils::get_timestamp()).is_primary() {
                warn!("No partition map stored; taking over bootstrap as primary");
                return Ok(PullOutcome::BecamePrimary);
            }
            return Err(ZoneError::Timeout(timeout.as_millis() as u64));
        }

        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use shared::{PartitionTree, Rect};
    use std::sync::Arc;

    #[test]
    fn test_lowest_live_id_is_primary() {
        let store = MemoryStore::new();
        let mut a = LeaderElector::new(CoordinatorId(2), 1000);
        let mut b = LeaderElector::new(CoordinatorId(5), 1000);

        assert_eq!(a.check(&store, 0), RoleChange::BecamePrimary);
        assert_eq!(b.check(&store, 0), RoleChange::BecameSecondary);
        assert_eq!(a.check(&store, 100), RoleChange::StillPrimary);
        assert_eq!(b.check(&store, 100), RoleChange::StillSecondary);
    }

    #[test]
    fn test_stale_primary_is_replaced() {
        let store = MemoryStore::new();
        let mut a = LeaderElector::new(CoordinatorId(1), 1000);
        let mut b = LeaderElector::new(CoordinatorId(2), 1000);
        a.check(&store, 0);
        b.check(&store, 0);

        // `a` stops refreshing.
        assert_eq!(b.check(&store, 2000), RoleChange::BecamePrimary);
        assert_eq!(store.live_coordinators(), vec![CoordinatorId(2)]);
    }

    #[test]
    fn test_resign_hands_over() {
        let store = MemoryStore::new();
        let mut a = LeaderElector::new(CoordinatorId(1), 1000);
        let mut b = LeaderElector::new(CoordinatorId(2), 1000);
        a.check(&store, 0);
        b.check(&store, 0);

        a.resign(&store);
        assert!(!a.is_primary());
        assert_eq!(b.check(&store, 10), RoleChange::BecamePrimary);
    }

    #[tokio::test]
    async fn test_pull_state_loads_stored_map() {
        let store = MemoryStore::new();
        let tree = PartitionTree::new(Rect::new(0.0, 0.0, 100.0, 100.0));
        store.save_partition_map(&tree.to_map(3)).unwrap();
        store.save_config(&[("authority_quota".to_string(), "3".to_string())]);

        let mut elector = LeaderElector::new(CoordinatorId(9), 1000);
        let outcome = pull_state(
            &store,
            &mut elector,
            Duration::from_millis(50),
            Duration::from_millis(5),
        )
        .await
        .unwrap();

        match outcome {
            PullOutcome::Loaded { map, settings } => {
                assert_eq!(map.version, 3);
                assert_eq!(settings.len(), 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pull_state_abandons_when_primary() {
        let store = MemoryStore::new();
        let mut elector = LeaderElector::new(CoordinatorId(9), 60_000);

        let outcome = pull_state(
            &store,
            &mut elector,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome, PullOutcome::BecamePrimary);
    }

    #[tokio::test]
    async fn test_pull_state_times_out_as_secondary() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_coordinator(CoordinatorId(1), shared::utils::get_timestamp());
        let mut elector = LeaderElector::new(CoordinatorId(9), 60_000);

        let result = pull_state(
            store.as_ref(),
            &mut elector,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .await;
        assert!(matches!(result, Err(ZoneError::Timeout(20))));
    }
}
