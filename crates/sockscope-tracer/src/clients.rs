//! Per-client cursors.
//!
//! A client's watermark is the table version of its previous poll: entries
//! stamped later have changed since. Baselines hold the totals each entry
//! had when last delivered, so `last` counters are per client.

use std::collections::{HashMap, VecDeque};

use sockscope_common::types::{ClientId, StatCounters};

use crate::stats::ConnectionStats;
use crate::table::ConnKey;

#[derive(Debug, Default)]
pub(crate) struct ClientState {
    pub watermark: u64,
    pub baselines: HashMap<ConnKey, StatCounters>,
    /// Closed connections evicted before this client saw them.
    pub short_lived: VecDeque<ConnectionStats>,
    pub last_seen_ns: u64,
}

impl ClientState {
    /// Counters delivered so far for `key`, then records `monotonic` as
    /// the new baseline.
    pub fn advance(&mut self, key: ConnKey, monotonic: StatCounters) -> StatCounters {
        let previous = self
            .baselines
            .insert(key, monotonic)
            .unwrap_or_default();
        monotonic.saturating_sub(previous)
    }

    /// Delta since the last delivery, without recording anything.
    pub fn pending(&self, key: &ConnKey, monotonic: StatCounters) -> StatCounters {
        monotonic.saturating_sub(self.baselines.get(key).copied().unwrap_or_default())
    }
}

#[derive(Debug)]
pub(crate) struct ClientRegistry {
    clients: HashMap<ClientId, ClientState>,
    buffer_size: usize,
}

impl ClientRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            clients: HashMap::new(),
            buffer_size,
        }
    }

    /// Registers `id`, or resets it when already active. Returns whether
    /// the client is new.
    pub fn register(&mut self, id: &ClientId, now: u64) -> bool {
        let state = ClientState {
            last_seen_ns: now,
            ..ClientState::default()
        };
        self.clients.insert(id.clone(), state).is_none()
    }

    pub fn unregister(&mut self, id: &ClientId) -> bool {
        self.clients.remove(id).is_some()
    }

    pub fn get_mut(&mut self, id: &ClientId) -> Option<&mut ClientState> {
        self.clients.get_mut(id)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ClientId> {
        self.clients.keys()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Clients idle for at least `expiry_ns`.
    pub fn expired(&self, now: u64, expiry_ns: u64) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(_, s)| now.saturating_sub(s.last_seen_ns) >= expiry_ns)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drops every client's baseline for an evicted entry.
    pub fn forget(&mut self, key: &ConnKey) {
        for state in self.clients.values_mut() {
            let _ = state.baselines.remove(key);
        }
    }

    /// Queues `stats` for `id`. Returns `false` when the oldest buffered
    /// connection had to be dropped to make room.
    pub fn push_short_lived(&mut self, id: &ClientId, stats: ConnectionStats) -> bool {
        let Some(state) = self.clients.get_mut(id) else {
            return true;
        };
        let _ = state.baselines.remove(&ConnKey {
            tuple: stats.tuple,
            generation: stats.generation,
        });
        state.short_lived.push_back(stats);
        if state.short_lived.len() > self.buffer_size {
            let _ = state.short_lived.pop_front();
            return false;
        }
        true
    }
}
