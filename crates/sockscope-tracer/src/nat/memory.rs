//! In-memory conntrack backend.
//!
//! Used for replays and tests, and as the last-resort backend when the
//! caller seeds translations itself. Clones share the same table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use sockscope_common::types::ConnectionTuple;

use super::{Conntracker, IpTranslation};

/// Backend name.
pub const KIND: &str = "static";

/// Conntracker backed by a shared map.
#[derive(Debug, Clone, Default)]
pub struct StaticConntracker {
    table: Arc<RwLock<HashMap<ConnectionTuple, IpTranslation>>>,
    closed: Arc<AtomicBool>,
}

impl StaticConntracker {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a flow by its original and reply tuples.
    ///
    /// Both directions are indexed, so the flow resolves from either side.
    pub fn insert(&self, orig: ConnectionTuple, reply: ConnectionTuple) {
        let mut table = self.table.write();
        let _ = table.insert(orig.without_netns(), IpTranslation::from_reply(&reply));
        let _ = table.insert(reply.without_netns(), IpTranslation::from_reply(&orig));
    }

    /// Forgets a flow, as the kernel does when its conntrack entry expires.
    pub fn remove(&self, orig: &ConnectionTuple) {
        let mut table = self.table.write();
        if let Some(t) = table.remove(&orig.without_netns()) {
            let reply = ConnectionTuple {
                source: t.repl_src_ip,
                dest: t.repl_dst_ip,
                sport: t.repl_src_port,
                dport: t.repl_dst_port,
                conn_type: orig.conn_type,
                netns: None,
            };
            let _ = table.remove(&reply);
        }
    }

    /// Number of indexed tuples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Whether no flow is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

impl Conntracker for StaticConntracker {
    fn lookup(&self, tuple: &ConnectionTuple) -> Option<IpTranslation> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.table.read().get(&tuple.without_netns()).copied()
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use sockscope_common::types::ConnType;

    use super::*;

    fn flow() -> (ConnectionTuple, ConnectionTuple) {
        let orig = ConnectionTuple::new(
            ConnType::Tcp,
            "10.0.0.1".parse().expect("ip"),
            40000,
            "10.96.0.10".parse().expect("ip"),
            80,
        );
        let reply = ConnectionTuple::new(
            ConnType::Tcp,
            "172.17.0.5".parse().expect("ip"),
            8080,
            "10.0.0.1".parse().expect("ip"),
            40000,
        );
        (orig, reply)
    }

    #[test]
    fn resolves_both_directions() {
        let ct = StaticConntracker::new();
        let (orig, reply) = flow();
        ct.insert(orig, reply);

        let out = ct.lookup(&orig).expect("orig side");
        assert_eq!(out.repl_src_ip, reply.source);
        assert_eq!(out.repl_src_port, 8080);

        let back = ct.lookup(&reply).expect("reply side");
        assert_eq!(back.repl_src_ip, orig.source);
        assert_eq!(back.repl_dst_port, 80);
    }

    #[test]
    fn namespace_is_ignored_for_lookup() {
        let ct = StaticConntracker::new();
        let (orig, reply) = flow();
        ct.insert(orig, reply);
        assert!(ct.lookup(&orig.with_netns(42)).is_some());
    }

    #[test]
    fn remove_and_close_stop_lookups() {
        let ct = StaticConntracker::new();
        let handle = ct.clone();
        let (orig, reply) = flow();
        ct.insert(orig, reply);
        assert_eq!(handle.len(), 2);

        handle.remove(&orig);
        assert!(ct.is_empty());

        ct.insert(orig, reply);
        ct.close();
        assert!(handle.lookup(&orig).is_none());
    }
}
