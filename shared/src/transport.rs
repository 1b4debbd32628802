//! Transport helpers shared by both sides: datagram codec, reconnect
//! backoff, request/reply correlation and the shutdown drain signal.

use crate::error::ZoneResult;
use crate::packets::Packet;
use bincode::{deserialize, serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;

/// Largest datagram either side will read.
pub const MAX_DATAGRAM: usize = 65_507;

pub fn encode(packet: &Packet) -> ZoneResult<Vec<u8>> {
    Ok(serialize(packet)?)
}

pub fn decode(bytes: &[u8]) -> ZoneResult<Packet> {
    Ok(deserialize(bytes)?)
}

/// Exponential reconnect backoff with a bound on the total time spent
/// waiting.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max_total: Duration,
    waited: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max_total: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max_total,
            waited: Duration::ZERO,
        }
    }

    /// Next delay to wait, or `None` once the total budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.waited >= self.max_total {
            return None;
        }
        let delay = self.current.min(self.max_total - self.waited);
        self.waited += delay;
        self.current = self.current.saturating_mul(2);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.waited = Duration::ZERO;
    }
}

/// Outstanding requests keyed by request id, each with a deadline in
/// milliseconds.
#[derive(Debug)]
pub struct PendingRequests<T> {
    next_id: u64,
    timeout_ms: u64,
    entries: HashMap<u64, (T, u64)>,
}

impl<T> PendingRequests<T> {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            next_id: 1,
            timeout_ms,
            entries: HashMap::new(),
        }
    }

    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    /// Registers a new request and returns the id to put on the wire.
    pub fn insert(&mut self, context: T, now_ms: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries
            .insert(id, (context, now_ms.saturating_add(self.timeout_ms)));
        id
    }

    /// Claims the context for a reply. Replies for unknown or expired ids
    /// yield `None`.
    pub fn complete(&mut self, request_id: u64) -> Option<T> {
        self.entries.remove(&request_id).map(|(context, _)| context)
    }

    /// Drops every request matching `cancelled` without reporting it as
    /// expired. A reply arriving later is treated as late.
    pub fn cancel<F>(&mut self, mut cancelled: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, (context, _)| !cancelled(context));
        before - self.entries.len()
    }

    /// Removes and returns every request whose deadline passed.
    pub fn expire(&mut self, now_ms: u64) -> Vec<(u64, T)> {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now_ms)
            .map(|(id, _)| *id)
            .collect();

        let mut out: Vec<(u64, T)> = expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|(context, _)| (id, context)))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cancellation signal threaded through a poll loop. Once triggered the
/// loop switches into its drain phase.
#[derive(Debug, Clone)]
pub struct DrainToken {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct DrainTrigger {
    tx: watch::Sender<bool>,
}

pub fn drain_channel() -> (DrainTrigger, DrainToken) {
    let (tx, rx) = watch::channel(false);
    (DrainTrigger { tx }, DrainToken { rx })
}

impl DrainTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl DrainToken {
    pub fn is_draining(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires or is dropped.
    pub async fn drained(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
