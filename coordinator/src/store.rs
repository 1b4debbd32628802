//! Durable storage used by coordinator instances.
//!
//! The production store is an external relational database; [`DurableStore`]
//! is the surface this crate needs from it and [`MemoryStore`] is an
//! in-process implementation that several coordinator instances can share.
//! Rows are kept serialized so every read hands back a fresh copy.

use serde::{Deserialize, Serialize};
use shared::{AuthorityId, HostId, PartitionId, PartitionMap, SubjectId, ZoneResult};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoordinatorId(pub u64);

impl fmt::Display for CoordinatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coordinator-{}", self.0)
    }
}

/// A buffered state report from one authority, awaiting quorum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommit {
    pub id: u64,
    pub request_id: u64,
    pub partition: PartitionId,
    pub subject: SubjectId,
    pub authority: AuthorityId,
    pub origin: HostId,
    pub snapshot: Vec<u8>,
    pub received_ms: u64,
}

/// A row of the live host roster, shared by every coordinator instance.
/// Host ids are allocated by the store so they are unique across instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: HostId,
    pub addr: SocketAddr,
    pub available: bool,
    pub last_seen_ms: u64,
    /// Partition each of the host's subjects occupies
    pub occupants: Vec<(SubjectId, PartitionId)>,
}

/// Tables that support exclusive read-modify-write sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreTable {
    Roster,
    Partitions,
    Commits,
}

pub trait DurableStore: Send + Sync {
    /// Upserts this coordinator's roster row with a fresh last-seen time.
    fn upsert_coordinator(&self, id: CoordinatorId, now_ms: u64);

    /// Deletes roster rows not seen since `cutoff_ms`.
    fn delete_stale_coordinators(&self, cutoff_ms: u64) -> usize;

    fn remove_coordinator(&self, id: CoordinatorId);

    /// Live coordinator ids in ascending order.
    fn live_coordinators(&self) -> Vec<CoordinatorId>;

    fn allocate_host_id(&self) -> HostId;

    /// Inserts or replaces the row keyed by the record's host id.
    fn upsert_host(&self, record: HostRecord);

    fn remove_host(&self, id: HostId);

    fn host(&self, id: HostId) -> Option<HostRecord>;

    /// Every host row in ascending id order.
    fn live_hosts(&self) -> Vec<HostRecord>;

    /// Deletes host rows not seen since `cutoff_ms` and returns their ids.
    fn delete_stale_hosts(&self, cutoff_ms: u64) -> Vec<HostId>;

    fn load_config(&self) -> Vec<(String, String)>;

    fn save_config(&self, rows: &[(String, String)]);

    fn load_partition_map(&self) -> ZoneResult<Option<PartitionMap>>;

    fn save_partition_map(&self, map: &PartitionMap) -> ZoneResult<()>;

    /// Writes the map only if none exists yet. Returns whether it was written.
    fn seed_partition_map(&self, map: &PartitionMap) -> ZoneResult<bool>;

    fn allocate_partition_id(&self) -> PartitionId;

    fn allocate_authority_id(&self) -> AuthorityId;

    /// Appends a report to the commit queue, assigning its row id.
    fn enqueue_commit(&self, commit: PendingCommit) -> u64;

    fn pending_commits(&self) -> Vec<PendingCommit>;

    fn has_pending_commit(&self, partition: PartitionId) -> bool;

    fn delete_commits(&self, ids: &[u64]) -> usize;

    fn write_subject_state(&self, subject: SubjectId, snapshot: &[u8]);

    fn read_subject_state(&self, subject: SubjectId) -> Option<Vec<u8>>;

    /// Runs `f` while holding the exclusive lock on `table`.
    fn exclusive<R, F>(&self, table: StoreTable, f: F) -> R
    where
        F: FnOnce() -> R,
        Self: Sized;
}

#[derive(Debug, Default)]
struct Tables {
    coordinators: BTreeMap<CoordinatorId, u64>,
    hosts: BTreeMap<HostId, HostRecord>,
    config: BTreeMap<String, String>,
    partition_map: Option<Vec<u8>>,
    commits: BTreeMap<u64, PendingCommit>,
    subjects: HashMap<SubjectId, Vec<u8>>,
    next_partition_id: i64,
    next_host_id: u32,
    next_authority_id: u64,
    next_commit_id: u64,
}

#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    locks: HashMap<StoreTable, Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let locks = [StoreTable::Roster, StoreTable::Partitions, StoreTable::Commits]
            .into_iter()
            .map(|table| (table, Mutex::new(())))
            .collect();

        Self {
            tables: Mutex::new(Tables {
                next_partition_id: 1,
                next_host_id: 1,
                next_authority_id: 1,
                next_commit_id: 1,
                ..Tables::default()
            }),
            locks,
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for MemoryStore {
    fn upsert_coordinator(&self, id: CoordinatorId, now_ms: u64) {
        self.tables().coordinators.insert(id, now_ms);
    }

    fn delete_stale_coordinators(&self, cutoff_ms: u64) -> usize {
        let mut tables = self.tables();
        let before = tables.coordinators.len();
        tables.coordinators.retain(|_, last_seen| *last_seen >= cutoff_ms);
        before - tables.coordinators.len()
    }

    fn remove_coordinator(&self, id: CoordinatorId) {
        self.tables().coordinators.remove(&id);
    }

    fn live_coordinators(&self) -> Vec<CoordinatorId> {
        self.tables().coordinators.keys().copied().collect()
    }

    fn allocate_host_id(&self) -> HostId {
        let mut tables = self.tables();
        let id = tables.next_host_id;
        tables.next_host_id += 1;
        HostId(id)
    }

    fn upsert_host(&self, record: HostRecord) {
        self.tables().hosts.insert(record.id, record);
    }

    fn remove_host(&self, id: HostId) {
        self.tables().hosts.remove(&id);
    }

    fn host(&self, id: HostId) -> Option<HostRecord> {
        self.tables().hosts.get(&id).cloned()
    }

    fn live_hosts(&self) -> Vec<HostRecord> {
        self.tables().hosts.values().cloned().collect()
    }

    fn delete_stale_hosts(&self, cutoff_ms: u64) -> Vec<HostId> {
        let mut tables = self.tables();
        let stale: Vec<HostId> = tables
            .hosts
            .values()
            .filter(|host| host.last_seen_ms < cutoff_ms)
            .map(|host| host.id)
            .collect();
        for id in &stale {
            tables.hosts.remove(id);
        }
        stale
    }

    fn load_config(&self) -> Vec<(String, String)> {
        self.tables()
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn save_config(&self, rows: &[(String, String)]) {
        let mut tables = self.tables();
        for (name, value) in rows {
            tables.config.insert(name.clone(), value.clone());
        }
    }

    fn load_partition_map(&self) -> ZoneResult<Option<PartitionMap>> {
        match &self.tables().partition_map {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    fn save_partition_map(&self, map: &PartitionMap) -> ZoneResult<()> {
        let bytes = bincode::serialize(map)?;
        self.tables().partition_map = Some(bytes);
        Ok(())
    }

    fn seed_partition_map(&self, map: &PartitionMap) -> ZoneResult<bool> {
        let bytes = bincode::serialize(map)?;
        let mut tables = self.tables();
        if tables.partition_map.is_some() {
            return Ok(false);
        }
        tables.partition_map = Some(bytes);
        Ok(true)
    }

    fn allocate_partition_id(&self) -> PartitionId {
        let mut tables = self.tables();
        let id = tables.next_partition_id;
        tables.next_partition_id += 1;
        PartitionId(id)
    }

    fn allocate_authority_id(&self) -> AuthorityId {
        let mut tables = self.tables();
        let id = tables.next_authority_id;
        tables.next_authority_id += 1;
        AuthorityId(id)
    }

    fn enqueue_commit(&self, mut commit: PendingCommit) -> u64 {
        let mut tables = self.tables();
        let id = tables.next_commit_id;
        tables.next_commit_id += 1;
        commit.id = id;
        tables.commits.insert(id, commit);
        id
    }

    fn pending_commits(&self) -> Vec<PendingCommit> {
        self.tables().commits.values().cloned().collect()
    }

    fn has_pending_commit(&self, partition: PartitionId) -> bool {
        self.tables()
            .commits
            .values()
            .any(|c| c.partition == partition)
    }

    fn delete_commits(&self, ids: &[u64]) -> usize {
        let mut tables = self.tables();
        ids.iter()
            .filter(|id| tables.commits.remove(*id).is_some())
            .count()
    }

    fn write_subject_state(&self, subject: SubjectId, snapshot: &[u8]) {
        self.tables().subjects.insert(subject, snapshot.to_vec());
    }

    fn read_subject_state(&self, subject: SubjectId) -> Option<Vec<u8>> {
        self.tables().subjects.get(&subject).cloned()
    }

    fn exclusive<R, F>(&self, table: StoreTable, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = self
            .locks
            .get(&table)
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));
        f()
    }
}
