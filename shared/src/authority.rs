//! Authority delegations: which hosts simulate which partition.
//!
//! Every leaf partition owns an [`AuthorityRegistry`] listing the hosts
//! delegated to it. A host holds at most one delegation per partition.
//! The master authority of a partition is never stored; it is derived as
//! the lowest authority id among the delegations whose host is still live.

use crate::error::{ZoneError, ZoneResult};
use crate::partition::PartitionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Identity the coordinator hands out to a logged-in peer host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub u32);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

/// Durable identity of a delegation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuthorityId(pub u64);

impl fmt::Display for AuthorityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authority-{}", self.0)
    }
}

/// A (host, partition) delegation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    pub id: AuthorityId,
    pub partition: PartitionId,
    pub host: HostId,
    pub addr: SocketAddr,
}

impl Authority {
    pub fn new(id: AuthorityId, partition: PartitionId, host: HostId, addr: SocketAddr) -> Self {
        Self {
            id,
            partition,
            host,
            addr,
        }
    }
}

/// Delegations held by a single partition, kept sorted by authority id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorityRegistry {
    entries: Vec<Authority>,
}

impl AuthorityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a delegation, rejecting a second delegation for the same host.
    pub fn add(&mut self, authority: Authority) -> ZoneResult<()> {
        if self.contains_host(authority.host) {
            return Err(ZoneError::DuplicateDelegation {
                host: authority.host,
                partition: authority.partition,
            });
        }

        let pos = self
            .entries
            .binary_search_by_key(&authority.id, |a| a.id)
            .unwrap_or_else(|pos| pos);
        self.entries.insert(pos, authority);
        Ok(())
    }

    pub fn remove(&mut self, id: AuthorityId) -> Option<Authority> {
        let pos = self.entries.iter().position(|a| a.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Removes every delegation whose host fails the liveness check and
    /// returns the dropped records.
    pub fn retain_live<F>(&mut self, mut is_live: F) -> Vec<Authority>
    where
        F: FnMut(HostId) -> bool,
    {
        let (kept, dropped): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|a| is_live(a.host));
        self.entries = kept;
        dropped
    }

    /// Empties the registry, returning the stripped delegations.
    pub fn clear(&mut self) -> Vec<Authority> {
        std::mem::take(&mut self.entries)
    }

    pub fn contains_host(&self, host: HostId) -> bool {
        self.entries.iter().any(|a| a.host == host)
    }

    pub fn get(&self, id: AuthorityId) -> Option<&Authority> {
        self.entries.iter().find(|a| a.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Authority> {
        self.entries.iter()
    }

    /// Defensive copy of the delegations, ordered by authority id.
    pub fn entries(&self) -> Vec<Authority> {
        self.entries.clone()
    }

    /// Lowest-id authority whose host is live. This is the authority that
    /// broadcasts world snapshots for the partition.
    pub fn master<F>(&self, mut is_live: F) -> Option<&Authority>
    where
        F: FnMut(HostId) -> bool,
    {
        self.entries.iter().find(|a| is_live(a.host))
    }

    /// Re-labels every record after the owning partition's identity changed.
    pub(crate) fn rekey_partition(&mut self, partition: PartitionId) {
        for authority in &mut self.entries {
            authority.partition = partition;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn authority(id: u64, host: u32) -> Authority {
        Authority::new(AuthorityId(id), PartitionId(1), HostId(host), addr(9000 + host as u16))
    }

    #[test]
    fn test_add_keeps_id_order() {
        let mut registry = AuthorityRegistry::new();
        registry.add(authority(7, 1)).unwrap();
        registry.add(authority(3, 2)).unwrap();
        registry.add(authority(5, 3)).unwrap();

        let ids: Vec<u64> = registry.iter().map(|a| a.id.0).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let mut registry = AuthorityRegistry::new();
        registry.add(authority(1, 4)).unwrap();

        let result = registry.add(authority(2, 4));
        assert!(matches!(
            result,
            Err(ZoneError::DuplicateDelegation { host: HostId(4), .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_retain_live_returns_dropped() {
        let mut registry = AuthorityRegistry::new();
        registry.add(authority(1, 1)).unwrap();
        registry.add(authority(2, 2)).unwrap();

        let dropped = registry.retain_live(|host| host != HostId(2));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].host, HostId(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_master_skips_dead_hosts() {
        let mut registry = AuthorityRegistry::new();
        registry.add(authority(4, 1)).unwrap();
        registry.add(authority(9, 2)).unwrap();

        assert_eq!(registry.master(|_| true).map(|a| a.id), Some(AuthorityId(4)));
        assert_eq!(
            registry.master(|host| host != HostId(1)).map(|a| a.id),
            Some(AuthorityId(9))
        );
        assert!(registry.master(|_| false).is_none());
    }

    #[test]
    fn test_entries_is_a_copy() {
        let mut registry = AuthorityRegistry::new();
        registry.add(authority(1, 1)).unwrap();

        let mut copy = registry.entries();
        copy.clear();
        assert_eq!(registry.len(), 1);
    }
}
