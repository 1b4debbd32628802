//! Primary-only control loop that reshapes the partition tree.
//!
//! One pass runs, in this order: drop delegations held by hosts that are no
//! longer live, split overpopulated leaves, merge underpopulated sibling
//! pairs, assign authorities to leaves short of their quota, and publish the
//! resulting map. Splits and merges are skipped entirely while any subject is
//! still reported in a partition that is no longer a leaf.

use crate::store::{DurableStore, StoreTable};
use log::{debug, info};
use shared::{
    Authority, HostId, Occupancy, PartitionId, PartitionMap, PartitionTree, PopulationLimits,
    SubjectId, ZoneConfig, ZoneResult,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;

/// A host as seen by authority assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct HostCandidate {
    pub id: HostId,
    pub addr: SocketAddr,
    pub logged_in: bool,
    pub available: bool,
    pub last_active_ms: u64,
}

impl HostCandidate {
    pub fn is_eligible(&self) -> bool {
        self.logged_in && self.available
    }
}

/// Which partition every known subject currently occupies.
#[derive(Debug, Clone, Default)]
pub struct OccupancySnapshot {
    subjects: HashMap<SubjectId, PartitionId>,
}

impl OccupancySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subject: SubjectId, partition: PartitionId) {
        self.subjects.insert(subject, partition);
    }

    pub fn partition_of(&self, subject: SubjectId) -> Option<PartitionId> {
        self.subjects.get(&subject).copied()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Occupant count per leaf.
    pub fn counts(&self, tree: &PartitionTree) -> Occupancy {
        let mut counts = Occupancy::new();
        for partition in self.subjects.values() {
            if tree.is_leaf(*partition) {
                *counts.entry(*partition).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Subjects still reported in a partition that is not a current leaf:
    /// their partition was split or merged away and they have not been
    /// reassigned yet.
    pub fn in_transit(&self, tree: &PartitionTree) -> Vec<SubjectId> {
        let mut subjects: Vec<SubjectId> = self
            .subjects
            .iter()
            .filter(|(_, partition)| !tree.is_leaf(**partition))
            .map(|(subject, _)| *subject)
            .collect();
        subjects.sort();
        subjects
    }
}

impl FromIterator<(SubjectId, PartitionId)> for OccupancySnapshot {
    fn from_iter<I: IntoIterator<Item = (SubjectId, PartitionId)>>(iter: I) -> Self {
        Self {
            subjects: iter.into_iter().collect(),
        }
    }
}

/// What a balancer pass changed.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub dropped: Vec<Authority>,
    pub splits: Vec<(PartitionId, [PartitionId; 2])>,
    pub merges: Vec<PartitionId>,
    /// Delegations removed because their partition was split or merged.
    pub stripped: Vec<Authority>,
    pub assigned: Vec<Authority>,
    pub blocked_by_transit: bool,
    pub restarts: u32,
    /// Every map persisted during the pass, in order. Each must be broadcast.
    pub publications: Vec<PartitionMap>,
}

impl PassReport {
    pub fn changed(&self) -> bool {
        !self.publications.is_empty()
    }
}

pub struct PartitionBalancer {
    limits: PopulationLimits,
    quota: usize,
}

impl PartitionBalancer {
    pub fn new(config: &ZoneConfig) -> Self {
        Self {
            limits: config.population_limits(),
            quota: config.authority_quota,
        }
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Runs one balancing pass under the partition table lock. `version` is
    /// bumped for every map persisted.
    pub fn run_pass<S: DurableStore>(
        &self,
        tree: &mut PartitionTree,
        occupancy: &OccupancySnapshot,
        hosts: &[HostCandidate],
        store: &S,
        version: &mut u64,
    ) -> ZoneResult<PassReport> {
        store.exclusive(StoreTable::Partitions, || {
            self.run_pass_locked(tree, occupancy, hosts, store, version)
        })
    }

    fn run_pass_locked<S: DurableStore>(
        &self,
        tree: &mut PartitionTree,
        occupancy: &OccupancySnapshot,
        hosts: &[HostCandidate],
        store: &S,
        version: &mut u64,
    ) -> ZoneResult<PassReport> {
        let mut report = PassReport::default();
        let live: HashSet<HostId> = hosts.iter().map(|h| h.id).collect();

        // Dropped delegations change eligibility for the whole tree, so the
        // reduced map goes out before anything else is evaluated.
        loop {
            let dropped = tree.drop_authorities(|host| live.contains(&host));
            if dropped.is_empty() {
                break;
            }
            for authority in &dropped {
                info!(
                    "Dropped {} of {} held by departed {}",
                    authority.id, authority.partition, authority.host
                );
            }
            report.dropped.extend(dropped);
            report.restarts += 1;
            Self::publish(tree, store, version, &mut report)?;
        }

        let mut changed = false;
        let counts = occupancy.counts(tree);
        let leaves = tree.leaves();
        let overpopulated: Vec<PartitionId> = leaves
            .iter()
            .copied()
            .filter(|leaf| tree.evaluate_split(*leaf, &counts, self.limits))
            .collect();
        let mergeable: BTreeSet<PartitionId> = leaves
            .iter()
            .filter_map(|leaf| tree.evaluate_merge(*leaf, &counts, self.limits))
            .collect();

        let in_transit = occupancy.in_transit(tree);
        if !in_transit.is_empty() {
            if !overpopulated.is_empty() || !mergeable.is_empty() {
                debug!(
                    "Deferring {} splits and {} merges: {} subjects in transit",
                    overpopulated.len(),
                    mergeable.len(),
                    in_transit.len()
                );
            }
            report.blocked_by_transit = true;
        } else {
            for leaf in overpopulated {
                let outcome = tree.split(leaf)?;
                info!(
                    "Split {} ({} occupants) into {} and {}",
                    leaf,
                    counts.get(&leaf).copied().unwrap_or(0),
                    outcome.children[0],
                    outcome.children[1]
                );
                report.stripped.extend(outcome.stripped);
                report.splits.push((leaf, outcome.children));
                changed = true;
            }

            for parent in mergeable {
                if !self.still_mergeable(tree, parent, &counts) {
                    continue;
                }
                let stripped = tree.merge(parent)?;
                info!("Merged children of {} back into one leaf", parent);
                report.stripped.extend(stripped);
                report.merges.push(parent);
                changed = true;
            }

            for (provisional, durable) in
                tree.commit_provisional(|| store.allocate_partition_id())?
            {
                debug!("Committed {} as {}", provisional, durable);
                for split in report.splits.iter_mut() {
                    for child in split.1.iter_mut() {
                        if *child == provisional {
                            *child = durable;
                        }
                    }
                }
            }
        }

        let assigned = self.allocate_authorities(tree, hosts, store)?;
        if !assigned.is_empty() {
            changed = true;
        }
        report.assigned = assigned;

        if changed {
            Self::publish(tree, store, version, &mut report)?;
        }
        Ok(report)
    }

    /// True when a commit is pending for `leaf` or any partition it was
    /// split from.
    fn commit_pending_above<S: DurableStore>(tree: &PartitionTree, leaf: PartitionId, store: &S) -> bool {
        let mut current = Some(leaf);
        while let Some(id) = current {
            if store.has_pending_commit(id) {
                return true;
            }
            current = tree.get(id).and_then(|p| p.parent);
        }
        false
    }

    /// Gives every leaf short of its quota at most one new delegation.
    /// Leaves with a pending commit are skipped so a fresh authority never
    /// serves a subject whose latest state is still being committed.
    pub fn allocate_authorities<S: DurableStore>(
        &self,
        tree: &mut PartitionTree,
        hosts: &[HostCandidate],
        store: &S,
    ) -> ZoneResult<Vec<Authority>> {
        let mut assigned = Vec::new();

        for leaf in tree.leaves() {
            let held = tree.registry(leaf).map(|r| r.len()).unwrap_or(0);
            if held >= self.quota {
                continue;
            }
            if Self::commit_pending_above(tree, leaf, store) {
                debug!("Skipping assignment for {}: commit pending", leaf);
                continue;
            }

            let counts = tree.delegation_counts();
            let chosen = pick_least_burdened(hosts, &counts, |host| {
                tree.registry(leaf)
                    .map(|r| r.contains_host(host))
                    .unwrap_or(false)
            });
            let Some(host) = chosen else {
                continue;
            };

            let authority = Authority::new(store.allocate_authority_id(), leaf, host.id, host.addr);
            tree.add_authority(authority.clone())?;
            info!(
                "Assigned {} to {} ({} of {})",
                host.id,
                leaf,
                held + 1,
                self.quota
            );
            assigned.push(authority);
        }

        Ok(assigned)
    }

    fn still_mergeable(&self, tree: &PartitionTree, parent: PartitionId, counts: &Occupancy) -> bool {
        let Some([low, high]) = tree.get(parent).and_then(|p| p.children) else {
            return false;
        };
        tree.evaluate_merge(low, counts, self.limits) == Some(parent)
            || tree.evaluate_merge(high, counts, self.limits) == Some(parent)
    }

    fn publish<S: DurableStore>(
        tree: &PartitionTree,
        store: &S,
        version: &mut u64,
        report: &mut PassReport,
    ) -> ZoneResult<()> {
        *version += 1;
        let map = tree.to_map(*version);
        store.save_partition_map(&map)?;
        report.publications.push(map);
        Ok(())
    }
}

/// Picks the eligible host holding the fewest delegations, preferring the
/// most recently active host on ties, then the lowest host id.
pub fn pick_least_burdened<'a, F>(
    hosts: &'a [HostCandidate],
    counts: &HashMap<HostId, usize>,
    already_assigned: F,
) -> Option<&'a HostCandidate>
where
    F: Fn(HostId) -> bool,
{
    hosts
        .iter()
        .filter(|host| host.is_eligible() && !already_assigned(host.id))
        .min_by(|a, b| {
            let load_a = counts.get(&a.id).copied().unwrap_or(0);
            let load_b = counts.get(&b.id).copied().unwrap_or(0);
            load_a
                .cmp(&load_b)
                .then_with(|| b.last_active_ms.cmp(&a.last_active_ms))
                .then_with(|| a.id.cmp(&b.id))
        })
}
