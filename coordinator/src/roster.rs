//! Session table for the hosts logged in to one coordinator instance
//!
//! This module tracks the hosts whose datagrams arrive at this instance:
//! - Login lifecycle (login, logout, timeout)
//! - Availability flags used by authority assignment
//! - The occupancy each host reports for its subjects
//!
//! Host ids are not chosen here. They come from the durable store, which
//! also holds the roster every instance shares; each instance mirrors its
//! own sessions into it with [`HostEntry::record`].

use crate::store::HostRecord;
use log::info;
use shared::{HostId, PartitionId, SubjectId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A host logged in to this instance
///
/// Each entry keeps:
/// - The identity and address the host logged in with
/// - Activity times for timeout detection and assignment tie-breaks
/// - The partitions its subjects last reported
#[derive(Debug)]
pub struct HostEntry {
    /// Identity allocated by the durable store at login
    pub id: HostId,
    /// Address replies and map broadcasts are sent to
    pub addr: SocketAddr,
    /// Last time any datagram arrived from this host
    pub last_seen: Instant,
    /// Wall-clock time of the last datagram, used to break assignment ties
    pub last_active_ms: u64,
    /// Cleared while the host is draining so it receives no new delegations
    pub available: bool,
    /// Partition each of the host's subjects currently occupies
    pub occupants: HashMap<SubjectId, PartitionId>,
}

impl HostEntry {
    pub fn new(id: HostId, addr: SocketAddr, now_ms: u64) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            last_active_ms: now_ms,
            available: true,
            occupants: HashMap::new(),
        }
    }

    /// Marks the host as active at `now_ms`.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_seen = Instant::now();
        self.last_active_ms = now_ms;
    }

    /// Checks if the host has exceeded the session timeout
    ///
    /// Returns true if nothing arrived from this host within `timeout`,
    /// indicating it crashed or moved to another coordinator.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// The durable roster row describing this session.
    pub fn record(&self) -> HostRecord {
        let mut occupants: Vec<(SubjectId, PartitionId)> =
            self.occupants.iter().map(|(s, p)| (*s, *p)).collect();
        occupants.sort();
        HostRecord {
            id: self.id,
            addr: self.addr,
            available: self.available,
            last_seen_ms: self.last_active_ms,
            occupants,
        }
    }
}

/// Manages every host session held by this instance
///
/// Enforces the instance's capacity and maps source addresses back to host
/// ids, so packet dispatch can tell a known host from a stranger.
pub struct HostRoster {
    hosts: HashMap<HostId, HostEntry>,
    max_hosts: usize,
}

impl HostRoster {
    pub fn new(max_hosts: usize) -> Self {
        Self {
            hosts: HashMap::new(),
            max_hosts,
        }
    }

    pub fn is_full(&self) -> bool {
        self.hosts.len() >= self.max_hosts
    }

    /// Starts a session for `host_id` at `addr`
    ///
    /// Returns false when the roster is full. An existing session with the
    /// same id is replaced.
    pub fn add_host(&mut self, host_id: HostId, addr: SocketAddr, now_ms: u64) -> bool {
        if self.is_full() && !self.hosts.contains_key(&host_id) {
            return false;
        }

        info!("{} logged in from {}", host_id, addr);
        self.hosts.insert(host_id, HostEntry::new(host_id, addr, now_ms));
        true
    }

    /// Ends a session, for both explicit disconnects and timeout cleanup.
    pub fn remove_host(&mut self, host_id: &HostId) -> bool {
        if let Some(host) = self.hosts.remove(host_id) {
            info!("{} logged out", host.id);
            true
        } else {
            false
        }
    }

    /// Finds the host whose datagrams come from `addr`
    pub fn find_host_by_addr(&self, addr: SocketAddr) -> Option<HostId> {
        self.hosts
            .iter()
            .find(|(_, host)| host.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, host_id: HostId) -> Option<&HostEntry> {
        self.hosts.get(&host_id)
    }

    pub fn touch(&mut self, host_id: HostId, now_ms: u64) -> bool {
        if let Some(host) = self.hosts.get_mut(&host_id) {
            host.touch(now_ms);
            true
        } else {
            false
        }
    }

    pub fn set_available(&mut self, host_id: HostId, available: bool) {
        if let Some(host) = self.hosts.get_mut(&host_id) {
            host.available = available;
        }
    }

    /// Replaces the host's occupancy with a full report.
    pub fn record_occupancy(&mut self, host_id: HostId, occupants: &[(SubjectId, PartitionId)]) {
        if let Some(host) = self.hosts.get_mut(&host_id) {
            host.occupants = occupants.iter().copied().collect();
        }
    }

    pub fn record_zone_change(&mut self, host_id: HostId, subject: SubjectId, to: PartitionId) {
        if let Some(host) = self.hosts.get_mut(&host_id) {
            host.occupants.insert(subject, to);
        }
    }

    /// Checks for and removes hosts that have timed out
    ///
    /// Returns the ids of every host silent for longer than `timeout` so the
    /// caller can clear their durable rows as well.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<HostId> {
        let timed_out: Vec<HostId> = self
            .hosts
            .iter()
            .filter(|(_, host)| host.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for host_id in &timed_out {
            self.remove_host(host_id);
        }

        timed_out
    }

    /// Addresses of every session, for map broadcasts
    pub fn get_host_addrs(&self) -> Vec<(HostId, SocketAddr)> {
        let mut addrs: Vec<(HostId, SocketAddr)> = self
            .hosts
            .iter()
            .map(|(id, host)| (*id, host.addr))
            .collect();
        addrs.sort_by_key(|(id, _)| *id);
        addrs
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_host_creation() {
        let host = HostEntry::new(HostId(1), test_addr(), 42);

        assert_eq!(host.id, HostId(1));
        assert_eq!(host.addr, test_addr());
        assert_eq!(host.last_active_ms, 42);
        assert!(host.available);
        assert!(host.occupants.is_empty());
    }

    #[test]
    fn test_host_timeout() {
        let mut host = HostEntry::new(HostId(1), test_addr(), 0);

        assert!(!host.is_timed_out(Duration::from_secs(1)));

        host.last_seen = Instant::now() - Duration::from_secs(2);

        assert!(host.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_host_uses_given_ids() {
        let mut roster = HostRoster::new(3);

        assert!(roster.add_host(HostId(7), test_addr(), 0));
        assert!(roster.add_host(HostId(9), test_addr2(), 0));
        assert_eq!(roster.find_host_by_addr(test_addr2()), Some(HostId(9)));
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_add_host_max_capacity() {
        let mut roster = HostRoster::new(1);

        assert!(roster.add_host(HostId(1), test_addr(), 0));
        assert!(roster.is_full());
        assert!(!roster.add_host(HostId(2), test_addr2(), 0));
        // A resumed session does not need a free slot.
        assert!(roster.add_host(HostId(1), test_addr(), 5));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_remove_host() {
        let mut roster = HostRoster::new(2);
        roster.add_host(HostId(1), test_addr(), 0);

        assert!(roster.remove_host(&HostId(1)));
        assert!(!roster.remove_host(&HostId(1)));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_find_host_by_addr() {
        let mut roster = HostRoster::new(2);
        roster.add_host(HostId(4), test_addr(), 0);

        assert_eq!(roster.find_host_by_addr(test_addr()), Some(HostId(4)));
        assert_eq!(roster.find_host_by_addr(test_addr2()), None);
    }

    #[test]
    fn test_check_timeouts_removes_silent_hosts() {
        let mut roster = HostRoster::new(2);
        roster.add_host(HostId(1), test_addr(), 0);
        roster.add_host(HostId(2), test_addr2(), 0);
        roster.hosts.get_mut(&HostId(1)).unwrap().last_seen =
            Instant::now() - Duration::from_secs(10);

        let removed = roster.check_timeouts(Duration::from_secs(5));
        assert_eq!(removed, vec![HostId(1)]);
        assert!(roster.get(HostId(1)).is_none());
        assert!(roster.get(HostId(2)).is_some());
    }

    #[test]
    fn test_record_reflects_session() {
        let mut roster = HostRoster::new(2);
        roster.add_host(HostId(3), test_addr(), 10);
        roster.record_occupancy(
            HostId(3),
            &[(SubjectId(2), PartitionId(3)), (SubjectId(1), PartitionId(3))],
        );
        roster.record_zone_change(HostId(3), SubjectId(2), PartitionId(4));
        roster.touch(HostId(3), 25);
        roster.set_available(HostId(3), false);

        let record = roster.get(HostId(3)).unwrap().record();
        assert_eq!(record.id, HostId(3));
        assert_eq!(record.addr, test_addr());
        assert_eq!(record.last_seen_ms, 25);
        assert!(!record.available);
        assert_eq!(
            record.occupants,
            vec![(SubjectId(1), PartitionId(3)), (SubjectId(2), PartitionId(4))]
        );
    }
}
