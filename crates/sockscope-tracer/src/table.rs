//! Connection table.
//!
//! Entries are keyed by tuple and generation. `current` points each tuple at
//! its newest generation; older generations linger, closed, until every
//! client has observed them. Every mutation stamps the entry with a fresh
//! table version, which is what client watermarks are compared against.
//!
//! Three ordered indexes keep eviction off the full table: open entries by
//! last update, and closed entries by close time, split on whether every
//! active client has observed them. Generations are unique across the
//! table, so `(timestamp, generation)` orders entries without ties.

use std::collections::{BTreeMap, HashMap, HashSet};

use sockscope_common::types::{ClientId, ConnType, ConnectionTuple, Direction, StatCounters};
use sockscope_ebpf::{ConnEvent, ConnEventKind, CounterMode};

use crate::clients::ClientRegistry;
use crate::failure::TcpFailures;
use crate::gateway::Via;
use crate::nat::IpTranslation;
use crate::protocols::{self, ProtocolStack};

/// Identity of one table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub tuple: ConnectionTuple,
    pub generation: u64,
}

/// Statistics of one generation of a tuple.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub tuple: ConnectionTuple,
    pub generation: u64,
    pub source_generation: Option<u64>,
    pub pid: u32,
    pub direction: Option<Direction>,
    pub monotonic: StatCounters,
    /// Last absolute reading, the base of the next delta.
    pub last_raw: StatCounters,
    pub last_seq: Option<u64>,
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub is_closed: bool,
    pub is_assured: bool,
    pub protocol_stack: ProtocolStack,
    pub ip_translation: Option<IpTranslation>,
    /// NAT lookups gave up for good.
    pub nat_settled: bool,
    pub via: Option<Via>,
    pub via_resolved: bool,
    pub tcp_failures: TcpFailures,
    pub created_ns: u64,
    pub last_update_ns: u64,
    pub closed_ns: Option<u64>,
    pub version: u64,
    /// Clients that were handed this entry in closed state.
    pub closed_observers: HashSet<ClientId>,
}

impl Entry {
    fn new(tuple: ConnectionTuple, generation: u64, source_generation: Option<u64>, now: u64) -> Self {
        Self {
            tuple,
            generation,
            source_generation,
            pid: 0,
            direction: None,
            monotonic: StatCounters::default(),
            last_raw: StatCounters::default(),
            last_seq: None,
            rtt_us: 0,
            rtt_var_us: 0,
            is_closed: false,
            is_assured: false,
            protocol_stack: ProtocolStack::default(),
            ip_translation: None,
            nat_settled: false,
            via: None,
            via_resolved: false,
            tcp_failures: TcpFailures::default(),
            created_ns: now,
            last_update_ns: now,
            closed_ns: None,
            version: 0,
            closed_observers: HashSet::new(),
        }
    }

    pub const fn key(&self) -> ConnKey {
        ConnKey {
            tuple: self.tuple,
            generation: self.generation,
        }
    }

    /// Time since creation, frozen at close.
    pub fn duration_ns(&self, now: u64) -> u64 {
        self.closed_ns.unwrap_or(now).saturating_sub(self.created_ns)
    }

    /// Whether every client in `clients` has seen the entry closed.
    pub fn observed_by<'a>(&self, mut clients: impl Iterator<Item = &'a ClientId>) -> bool {
        self.is_closed && clients.all(|c| self.closed_observers.contains(c))
    }

    fn apply_counters(&mut self, mode: CounterMode, counters: StatCounters) {
        match mode {
            CounterMode::Delta => self.monotonic = self.monotonic.saturating_add(counters),
            CounterMode::Absolute => {
                if counters.is_zero() {
                    return;
                }
                if let Some(delta) = counters.checked_delta(self.last_raw) {
                    self.monotonic = self.monotonic.saturating_add(delta);
                    self.last_raw = counters;
                }
            }
        }
        if self.tuple.conn_type == ConnType::Udp
            && (self.monotonic.sent_packets > 0 || self.monotonic.sent_bytes > 0)
            && (self.monotonic.recv_packets > 0 || self.monotonic.recv_bytes > 0)
        {
            self.is_assured = true;
        }
    }
}

/// What an event will do to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    /// Update the live entry.
    Apply(ConnKey),
    /// Open a new generation, closing `supersede` first if set.
    Start { supersede: Option<ConnKey> },
    /// Already applied.
    Duplicate,
    /// Targets a closed generation.
    Stale,
}

/// Side effects of applying an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Applied {
    pub unknown_failure: Option<i32>,
}

/// Position of an entry in its eviction index.
type OrderKey = (u64, u64);

const fn order_of(entry: &Entry) -> OrderKey {
    let at = match entry.closed_ns {
        Some(at) => at,
        None => entry.last_update_ns,
    };
    (at, entry.generation)
}

#[derive(Debug, Default)]
pub(crate) struct ConnTable {
    entries: HashMap<ConnKey, Entry>,
    current: HashMap<ConnectionTuple, u64>,
    next_generation: u64,
    version: u64,
    open: BTreeMap<OrderKey, ConnKey>,
    delivered: BTreeMap<OrderKey, ConnKey>,
    undelivered: BTreeMap<OrderKey, ConnKey>,
    /// Whether any client is registered. Without one, a closed entry is
    /// delivered the moment it closes.
    has_audience: bool,
}

impl ConnTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &ConnKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ConnKey) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    /// Oldest closed entry every active client has observed.
    pub fn oldest_delivered(&self) -> Option<ConnKey> {
        self.delivered.values().next().copied()
    }

    /// Oldest closed entry some active client has not observed.
    pub fn oldest_undelivered(&self) -> Option<ConnKey> {
        self.undelivered.values().next().copied()
    }

    /// Least recently updated open entry.
    pub fn oldest_open(&self) -> Option<ConnKey> {
        self.open.values().next().copied()
    }

    /// Delivered entries closed at or before `cutoff_ns`.
    pub fn delivered_before(&self, cutoff_ns: u64) -> Vec<ConnKey> {
        self.delivered
            .iter()
            .take_while(|((at, _), _)| *at <= cutoff_ns)
            .map(|(_, key)| *key)
            .collect()
    }

    /// Newest generation of `tuple`.
    pub fn live(&self, tuple: &ConnectionTuple) -> Option<&Entry> {
        let generation = self.current.get(tuple)?;
        self.entries.get(&ConnKey {
            tuple: *tuple,
            generation: *generation,
        })
    }

    /// Decides how `event` relates to what is already tracked.
    pub fn plan(&self, event: &ConnEvent) -> Plan {
        let Some(entry) = self.live(&event.tuple) else {
            return Plan::Start { supersede: None };
        };
        let key = entry.key();
        let open = (!entry.is_closed).then_some(key);

        if let (Some(incoming), Some(tracked)) = (event.generation, entry.source_generation) {
            if incoming != tracked {
                return Plan::Start { supersede: open };
            }
        }
        if let (Some(seq), Some(last)) = (event.seq, entry.last_seq) {
            if seq <= last {
                return Plan::Duplicate;
            }
        }
        if entry.is_closed {
            return if event.kind == ConnEventKind::New {
                Plan::Start { supersede: None }
            } else {
                Plan::Stale
            };
        }
        if event.mode == CounterMode::Absolute
            && !event.counters.is_zero()
            && event.counters.checked_delta(entry.last_raw).is_none()
        {
            // Totals went backwards: the tuple was reused.
            return Plan::Start { supersede: open };
        }
        Plan::Apply(key)
    }

    /// Opens a new generation for the event's tuple.
    pub fn start_generation(
        &mut self,
        event: &ConnEvent,
        supersede: Option<ConnKey>,
        now: u64,
    ) -> ConnKey {
        if let Some(old) = supersede {
            if let Some(entry) = self.entries.get(&old) {
                let at = entry.last_update_ns;
                let _ = self.mark_closed(&old, at);
            }
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let mut entry = Entry::new(event.tuple, generation, event.generation, now);
        self.version += 1;
        entry.version = self.version;
        let key = entry.key();
        let _ = self.open.insert(order_of(&entry), key);
        let _ = self.entries.insert(key, entry);
        let _ = self.current.insert(event.tuple, generation);
        key
    }

    /// Applies an event to an open entry.
    pub fn apply(&mut self, key: &ConnKey, event: &ConnEvent, now: u64, classify: bool) -> Applied {
        let mut applied = Applied::default();
        self.version += 1;
        let version = self.version;
        self.unindex(key);
        let Some(entry) = self.entries.get_mut(key) else {
            return applied;
        };

        entry.apply_counters(event.mode, event.counters);
        if event.pid != 0 {
            entry.pid = event.pid;
        }
        if event.direction.is_some() {
            entry.direction = event.direction;
        }
        if event.seq.is_some() {
            entry.last_seq = event.seq;
        }
        if let Some(rtt) = event.rtt_us {
            entry.rtt_us = rtt;
        }
        if let Some(var) = event.rtt_var_us {
            entry.rtt_var_us = var;
        }
        if classify && !event.payload.is_empty() && !entry.protocol_stack.is_complete() {
            if let Some(protocol) = protocols::classify(&entry.tuple, &event.payload) {
                let _ = entry.protocol_stack.merge(protocol);
            }
        }
        if let Some(code) = event.failure_code {
            if !entry.tcp_failures.record(code) {
                applied.unknown_failure = Some(code);
            }
        }
        entry.last_update_ns = now;
        entry.version = version;

        if event.kind == ConnEventKind::Close {
            entry.is_closed = true;
            entry.closed_ns = Some(now);
        }
        self.index(key);
        applied
    }

    /// Closes an open entry as of `at_ns`.
    pub fn mark_closed(&mut self, key: &ConnKey, at_ns: u64) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.is_closed {
            return false;
        }
        let _ = self.open.remove(&order_of(entry));
        self.version += 1;
        entry.is_closed = true;
        entry.closed_ns = Some(at_ns.max(entry.created_ns));
        entry.version = self.version;
        self.index(key);
        true
    }

    pub fn remove(&mut self, key: &ConnKey) -> Option<Entry> {
        self.unindex(key);
        let entry = self.entries.remove(key)?;
        if self.current.get(&key.tuple) == Some(&key.generation) {
            let _ = self.current.remove(&key.tuple);
        }
        Some(entry)
    }

    /// Keys of entries mutated after `watermark`.
    pub fn changed_since(&self, watermark: u64) -> Vec<ConnKey> {
        self.entries
            .values()
            .filter(|e| e.version > watermark)
            .map(Entry::key)
            .collect()
    }

    /// Open entries idle for at least their protocol's timeout.
    pub fn idle(&self, now: u64, tcp_timeout_ns: u64, udp_timeout_ns: u64) -> Vec<ConnKey> {
        let shortest = tcp_timeout_ns.min(udp_timeout_ns);
        self.open
            .iter()
            .take_while(|((at, _), _)| now.saturating_sub(*at) >= shortest)
            .filter(|((at, _), key)| {
                let timeout = match key.tuple.conn_type {
                    ConnType::Tcp => tcp_timeout_ns,
                    ConnType::Udp => udp_timeout_ns,
                };
                now.saturating_sub(*at) >= timeout
            })
            .map(|(_, key)| *key)
            .collect()
    }

    /// Records that `client` was handed the entry in closed state.
    pub fn note_observer(&mut self, key: &ConnKey, client: &ClientId, clients: &ClientRegistry) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if !entry.is_closed {
            return;
        }
        let _ = entry.closed_observers.insert(client.clone());
        if entry.observed_by(clients.ids()) {
            let order = order_of(entry);
            if let Some(key) = self.undelivered.remove(&order) {
                let _ = self.delivered.insert(order, key);
            }
        }
    }

    /// Re-sorts closed entries after the set of active clients changed.
    pub fn audience_changed(&mut self, clients: &ClientRegistry) {
        self.has_audience = !clients.is_empty();
        let closed: Vec<(OrderKey, ConnKey)> = self
            .delivered
            .iter()
            .chain(self.undelivered.iter())
            .map(|(order, key)| (*order, *key))
            .collect();
        self.delivered.clear();
        self.undelivered.clear();
        for (order, key) in closed {
            let seen = self
                .entries
                .get(&key)
                .is_some_and(|e| e.observed_by(clients.ids()));
            let slot = if seen {
                &mut self.delivered
            } else {
                &mut self.undelivered
            };
            let _ = slot.insert(order, key);
        }
    }

    /// Drops `key` from whichever eviction index holds it.
    fn unindex(&mut self, key: &ConnKey) {
        let Some(order) = self.entries.get(key).map(order_of) else {
            return;
        };
        let _ = self.open.remove(&order);
        let _ = self.delivered.remove(&order);
        let _ = self.undelivered.remove(&order);
    }

    /// Files `key` under its current state. A closed entry lands in the
    /// delivered index only when nobody is around to observe it.
    fn index(&mut self, key: &ConnKey) {
        let Some((order, closed)) = self.entries.get(key).map(|e| (order_of(e), e.is_closed)) else {
            return;
        };
        let slot = match (closed, self.has_audience) {
            (false, _) => &mut self.open,
            (true, true) => &mut self.undelivered,
            (true, false) => &mut self.delivered,
        };
        let _ = slot.insert(order, *key);
    }
}
