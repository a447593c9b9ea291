//! The connection tracker.
//!
//! One mutex guards the table and the client cursors together, so a poll
//! never sees a half-applied event. NAT and gateway lookups may block, so a
//! poll collects its work under the lock, runs the lookups without it, then
//! takes the lock again to write results back and render. All NAT lookups
//! of one poll share a single retry budget.
//!
//! Lock order: client lock map, then a client's lock, then the state.
//! Reclaim never waits on a client lock, it skips busy clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sockscope_common::config::TracerConfig;
use sockscope_common::types::{ClientId, Direction, StatCounters};
use sockscope_ebpf::ConnEvent;

use crate::clients::ClientRegistry;
use crate::clock::{Clock, nanos};
use crate::gateway::{GatewayLookup, Via};
use crate::local::LocalAddrs;
use crate::nat::{NatResolver, Resolution};
use crate::stats::{ConnectionStats, Connections};
use crate::table::{ConnKey, ConnTable, Entry, Plan};
use crate::telemetry::{Telemetry, TelemetrySnapshot};

#[derive(Debug)]
struct TrackerState {
    table: ConnTable,
    clients: ClientRegistry,
}

/// Why an entry was removed to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Victim {
    Delivered(ConnKey),
    Undelivered(ConnKey),
    Open(ConnKey),
}

/// Live table of connection statistics with per-client delta views.
///
/// Build one with [`TracerBuilder`](crate::TracerBuilder).
#[derive(Debug)]
pub struct Tracer {
    config: TracerConfig,
    clock: Arc<dyn Clock>,
    telemetry: Arc<Telemetry>,
    state: Mutex<TrackerState>,
    client_locks: Mutex<HashMap<ClientId, Arc<Mutex<()>>>>,
    nat: Option<NatResolver>,
    gateway: Option<GatewayLookup>,
    local: LocalAddrs,
}

impl Tracer {
    pub(crate) fn from_parts(
        config: TracerConfig,
        clock: Arc<dyn Clock>,
        telemetry: Arc<Telemetry>,
        nat: Option<NatResolver>,
        gateway: Option<GatewayLookup>,
        local: LocalAddrs,
    ) -> Self {
        let clients = ClientRegistry::new(config.short_lived_buffer_size);
        Self {
            config,
            clock,
            telemetry,
            state: Mutex::new(TrackerState {
                table: ConnTable::default(),
                clients,
            }),
            client_locks: Mutex::new(HashMap::new()),
            nat,
            gateway,
            local,
        }
    }

    /// Applies one raw event.
    ///
    /// Never fails and never blocks on capacity: a full table makes room by
    /// evicting, counting any data lost.
    pub fn ingest(&self, event: &ConnEvent) {
        let now = self.clock.now_ns();
        let mut state = self.state.lock();
        let key = match state.table.plan(event) {
            Plan::Apply(key) => key,
            Plan::Start { supersede } => {
                while state.table.len() >= self.config.max_tracked_connections {
                    if !self.make_room(&mut state, now) {
                        break;
                    }
                }
                Telemetry::incr(&self.telemetry.generations_started);
                state.table.start_generation(event, supersede, now)
            }
            Plan::Duplicate => {
                Telemetry::incr(&self.telemetry.duplicate_events);
                tracing::trace!(tuple = %event.tuple, seq = ?event.seq, "duplicate event dropped");
                return;
            }
            Plan::Stale => {
                Telemetry::incr(&self.telemetry.stale_events);
                tracing::trace!(tuple = %event.tuple, kind = ?event.kind, "event for closed connection dropped");
                return;
            }
        };
        let applied = state.table.apply(
            &key,
            event,
            now,
            self.config.enable_protocol_classification,
        );
        Telemetry::incr(&self.telemetry.events_ingested);
        if let Some(code) = applied.unknown_failure {
            Telemetry::incr(&self.telemetry.unknown_failure_codes);
            tracing::debug!(tuple = %event.tuple, code, "unknown failure code dropped");
        }
    }

    /// Registers a client, or resets an active one to a fresh cursor.
    ///
    /// A reset client loses its undelivered deltas and receives full
    /// totals on its next poll.
    pub fn register_client(&self, id: &ClientId) {
        let lock = self.client_lock(id);
        let _guard = lock.lock();
        let now = self.clock.now_ns();
        let mut state = self.state.lock();
        if state.clients.register(id, now) {
            let TrackerState { table, clients } = &mut *state;
            table.audience_changed(clients);
            Telemetry::incr(&self.telemetry.clients_registered);
            tracing::info!(client = %id, "client registered");
        } else {
            tracing::debug!(client = %id, "client re-registered, cursor reset");
        }
    }

    /// Removes a client. Waits for an in-flight poll of the same client.
    pub fn unregister_client(&self, id: &ClientId) -> bool {
        let lock = self.client_lock(id);
        let removed = {
            let _guard = lock.lock();
            let mut state = self.state.lock();
            let TrackerState { table, clients } = &mut *state;
            let removed = clients.unregister(id);
            if removed {
                table.audience_changed(clients);
            }
            removed
        };
        let mut locks = self.client_locks.lock();
        // Ours and the map's.
        if Arc::strong_count(&lock) == 2 {
            let _ = locks.remove(id);
        }
        if removed {
            tracing::info!(client = %id, "client unregistered");
        }
        removed
    }

    /// Returns the connections that changed since the client's previous
    /// call, plus closed connections evicted before it could see them.
    ///
    /// Unknown clients are registered on the fly and receive everything.
    pub fn get_connections(&self, id: &ClientId) -> Connections {
        let lock = self.client_lock(id);
        let _guard = lock.lock();

        let (version, keys, nat_work, gateway_work) = {
            let now = self.clock.now_ns();
            let mut state = self.state.lock();
            let watermark = self.ensure_client(&mut state, id, now);
            let keys = state.table.changed_since(watermark);
            let mut nat_work = Vec::new();
            let mut gateway_work = Vec::new();
            for key in &keys {
                let Some(entry) = state.table.get(key) else {
                    continue;
                };
                if self.nat.is_some() && entry.ip_translation.is_none() && !entry.nat_settled {
                    let age = Duration::from_nanos(now.saturating_sub(entry.created_ns));
                    nat_work.push((*key, age));
                }
                if self.gateway.is_some()
                    && !entry.via_resolved
                    && !self.is_intra_host(&state.table, entry)
                {
                    gateway_work.push(*key);
                }
            }
            (state.table.version(), keys, nat_work, gateway_work)
        };

        let translations: Vec<(ConnKey, Resolution)> = match &self.nat {
            Some(nat) if !nat_work.is_empty() => {
                let lookups: Vec<_> = nat_work.iter().map(|(key, age)| (key.tuple, *age)).collect();
                nat_work
                    .into_iter()
                    .map(|(key, _)| key)
                    .zip(nat.resolve_all(&lookups))
                    .collect()
            }
            _ => Vec::new(),
        };
        let vias: Vec<(ConnKey, Option<Via>)> = match &self.gateway {
            Some(gateway) => gateway_work
                .into_iter()
                .map(|key| (key, gateway.lookup(&key.tuple)))
                .collect(),
            None => Vec::new(),
        };

        let now = self.clock.now_ns();
        let mut state = self.state.lock();
        let _ = self.ensure_client(&mut state, id, now);
        let TrackerState { table, clients } = &mut *state;

        for (key, resolution) in translations {
            let Some(entry) = table.get_mut(&key) else {
                continue;
            };
            match resolution {
                Resolution::Found(t) => {
                    if entry.ip_translation.is_none() {
                        entry.ip_translation = Some(t);
                    }
                }
                Resolution::Absent => entry.nat_settled = true,
                Resolution::Pending => {}
            }
        }
        for (key, via) in vias {
            if let Some(entry) = table.get_mut(&key) {
                entry.via = via;
                entry.via_resolved = true;
            }
        }

        let mut connections = Vec::with_capacity(keys.len());
        let mut observed = Vec::new();
        if let Some(client) = clients.get_mut(id) {
            for key in keys {
                let Some(entry) = table.get(&key) else {
                    continue;
                };
                let last = client.advance(key, entry.monotonic);
                connections.push(self.render(table, entry, last, now));
                if entry.is_closed {
                    let _ = client.baselines.remove(&key);
                    observed.push(key);
                }
            }
            connections.extend(client.short_lived.drain(..));
            client.watermark = version;
            client.last_seen_ns = now;
        }
        for key in &observed {
            table.note_observer(key, id, clients);
        }

        let _ = self.evict_locked(&mut state, now);
        drop(state);

        Connections {
            connections,
            telemetry: self.telemetry.snapshot(),
        }
    }

    /// Reclaims clients that have not polled within the client expiry.
    ///
    /// A client with a poll in flight is skipped. Returns the number of
    /// reclaimed clients.
    pub fn reclaim_expired_clients(&self) -> usize {
        let now = self.clock.now_ns();
        let expiry_ns = nanos(self.config.client_expiry());
        let mut locks = self.client_locks.lock();
        let mut state = self.state.lock();
        let mut reclaimed = 0;
        for id in state.clients.expired(now, expiry_ns) {
            let busy = locks
                .get(&id)
                .is_some_and(|l| Arc::strong_count(l) > 1 || l.is_locked());
            if busy {
                tracing::debug!(client = %id, "expired client busy, reclaim skipped");
                continue;
            }
            let _ = state.clients.unregister(&id);
            let _ = locks.remove(&id);
            reclaimed += 1;
            Telemetry::incr(&self.telemetry.clients_reclaimed);
            tracing::info!(client = %id, "reclaimed idle client");
        }
        if reclaimed > 0 {
            let TrackerState { table, clients } = &mut *state;
            table.audience_changed(clients);
            let _ = self.evict_locked(&mut state, now);
        }
        reclaimed
    }

    /// Expires idle connections and drops closed ones every client has
    /// seen. Returns the number of removed entries.
    pub fn evict(&self) -> usize {
        let now = self.clock.now_ns();
        let mut state = self.state.lock();
        self.evict_locked(&mut state, now)
    }

    /// Current telemetry counters.
    #[must_use]
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Number of table entries, closed ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of active clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Name of the conntrack backend, `None` when NAT resolution is off.
    #[must_use]
    pub fn conntracker_kind(&self) -> Option<&'static str> {
        self.nat.as_ref().map(NatResolver::kind)
    }

    /// Whether gateway enrichment is active.
    #[must_use]
    pub const fn gateway_enabled(&self) -> bool {
        self.gateway.is_some()
    }

    /// Configuration the tracer was built with.
    #[must_use]
    pub const fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// Releases the conntrack backend.
    pub fn close(&self) {
        if let Some(nat) = &self.nat {
            nat.close();
        }
    }

    fn client_lock(&self, id: &ClientId) -> Arc<Mutex<()>> {
        let mut locks = self.client_locks.lock();
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    /// Registers `id` if needed and returns its watermark.
    fn ensure_client(&self, state: &mut TrackerState, id: &ClientId, now: u64) -> u64 {
        if !state.clients.contains(id) {
            let _ = state.clients.register(id, now);
            let TrackerState { table, clients } = &mut *state;
            table.audience_changed(clients);
            Telemetry::incr(&self.telemetry.clients_registered);
            tracing::info!(client = %id, "client registered on first poll");
        }
        state.clients.get_mut(id).map_or(0, |c| c.watermark)
    }

    fn is_intra_host(&self, table: &ConnTable, entry: &Entry) -> bool {
        self.local.is_local(entry.tuple.dest)
            || entry
                .ip_translation
                .is_some_and(|t| self.local.is_local(t.repl_src_ip))
            || table.live(&entry.tuple.reversed()).is_some()
    }

    fn direction(table: &ConnTable, entry: &Entry) -> Direction {
        entry
            .direction
            .filter(|d| *d != Direction::Unknown)
            .or_else(|| {
                table
                    .live(&entry.tuple.reversed())
                    .and_then(|peer| peer.direction)
                    .filter(|d| *d != Direction::Unknown)
                    .map(Direction::opposite)
            })
            .unwrap_or_else(|| Direction::from_ports(entry.tuple.sport, entry.tuple.dport))
    }

    fn render(&self, table: &ConnTable, entry: &Entry, last: StatCounters, now: u64) -> ConnectionStats {
        ConnectionStats {
            tuple: entry.tuple,
            generation: entry.generation,
            pid: entry.pid,
            direction: Self::direction(table, entry),
            monotonic: entry.monotonic,
            last,
            is_closed: entry.is_closed,
            is_assured: entry.is_assured,
            intra_host: self.is_intra_host(table, entry),
            protocol_stack: entry.protocol_stack,
            ip_translation: entry.ip_translation,
            via: entry.via.clone(),
            tcp_failures: entry.tcp_failures.clone(),
            rtt_us: entry.rtt_us,
            rtt_var_us: entry.rtt_var_us,
            duration_ns: entry.duration_ns(now),
            created_ns: entry.created_ns,
            last_update_ns: entry.last_update_ns,
        }
    }

    /// Picks the entry to sacrifice for a new one: closed entries every
    /// client has seen, then closed entries someone has not seen, then the
    /// least recently updated open entry. Oldest first within each group.
    fn pick_victim(table: &ConnTable) -> Option<Victim> {
        table
            .oldest_delivered()
            .map(Victim::Delivered)
            .or_else(|| table.oldest_undelivered().map(Victim::Undelivered))
            .or_else(|| table.oldest_open().map(Victim::Open))
    }

    /// Evicts one entry. Returns `false` when the table is empty.
    fn make_room(&self, state: &mut TrackerState, now: u64) -> bool {
        let Some(victim) = Self::pick_victim(&state.table) else {
            return false;
        };
        let TrackerState { table, clients } = state;
        match victim {
            Victim::Delivered(key) => {
                Telemetry::incr(&self.telemetry.closed_evicted);
                tracing::debug!(tuple = %key.tuple, "evicted delivered connection to make room");
            }
            Victim::Undelivered(key) => {
                Telemetry::incr(&self.telemetry.undelivered_evicted);
                if let Some(entry) = table.get(&key) {
                    let missing: Vec<ClientId> = clients
                        .ids()
                        .filter(|c| !entry.closed_observers.contains(*c))
                        .cloned()
                        .collect();
                    for id in missing {
                        let last = clients
                            .get_mut(&id)
                            .map(|c| c.pending(&key, entry.monotonic))
                            .unwrap_or_default();
                        let stats = self.render(table, entry, last, now);
                        if !clients.push_short_lived(&id, stats) {
                            Telemetry::incr(&self.telemetry.short_lived_overflows);
                            tracing::warn!(client = %id, "short-lived buffer full, oldest connection dropped");
                        }
                    }
                }
                tracing::debug!(tuple = %key.tuple, "buffered undelivered connection before eviction");
            }
            Victim::Open(key) => {
                Telemetry::incr(&self.telemetry.dropped_connections);
                tracing::warn!(
                    tuple = %key.tuple,
                    capacity = self.config.max_tracked_connections,
                    "connection table full, dropped open connection"
                );
            }
        }
        let key = match victim {
            Victim::Delivered(k) | Victim::Undelivered(k) | Victim::Open(k) => k,
        };
        let _ = table.remove(&key);
        clients.forget(&key);
        true
    }

    fn evict_locked(&self, state: &mut TrackerState, now: u64) -> usize {
        let idle = state.table.idle(
            now,
            nanos(self.config.tcp_conn_timeout()),
            nanos(self.config.udp_conn_timeout()),
        );
        for key in idle {
            let at = state.table.get(&key).map_or(now, |e| e.last_update_ns);
            if state.table.mark_closed(&key, at) {
                Telemetry::incr(&self.telemetry.idle_expired);
                tracing::debug!(tuple = %key.tuple, "idle connection expired");
            }
        }

        let grace = nanos(self.config.closed_grace());
        let done = now
            .checked_sub(grace)
            .map_or_else(Vec::new, |cutoff| state.table.delivered_before(cutoff));
        for key in &done {
            let _ = state.table.remove(key);
            state.clients.forget(key);
            Telemetry::incr(&self.telemetry.closed_evicted);
        }
        if !done.is_empty() {
            tracing::debug!(evicted = done.len(), remaining = state.table.len(), "evicted closed connections");
        }
        done.len()
    }
}
