//! Conntracker decorator that hides fresh flows.
//!
//! Reproduces the kernel race where a very short-lived connection is not
//! yet visible in conntrack on the first query: the first `misses` lookups
//! of every tuple miss, later ones reach the wrapped backend.
//!
//! Both the tuples inside their miss window and those past it are capped
//! at a fixed count; once a set is full it starts over, and the forgotten
//! tuples get a fresh window.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use sockscope_common::types::ConnectionTuple;

use super::{Conntracker, IpTranslation};

/// Tuples remembered per set before it starts over.
const MAX_TRACKED: usize = 65_536;

/// Decorator failing the first lookups of each tuple.
#[derive(Debug)]
pub struct DelayedConntracker {
    inner: Box<dyn Conntracker>,
    misses: u32,
    capacity: usize,
    state: Mutex<Windows>,
}

/// Tuples inside their miss window, and those that already left it.
#[derive(Debug, Default)]
struct Windows {
    remaining: HashMap<ConnectionTuple, u32>,
    passed: HashSet<ConnectionTuple>,
}

impl DelayedConntracker {
    /// Wraps `inner`, failing the first `misses` lookups per tuple.
    #[must_use]
    pub fn new(inner: Box<dyn Conntracker>, misses: u32) -> Self {
        Self {
            inner,
            misses,
            capacity: MAX_TRACKED,
            state: Mutex::new(Windows::default()),
        }
    }

    /// Whether this lookup of `tuple` should miss.
    fn hide(&self, tuple: &ConnectionTuple) -> bool {
        if self.misses == 0 {
            return false;
        }
        let mut w = self.state.lock();
        if w.passed.contains(tuple) {
            return false;
        }
        if let Some(left) = w.remaining.get_mut(tuple) {
            if *left > 0 {
                *left -= 1;
                return true;
            }
            let _ = w.remaining.remove(tuple);
            if w.passed.len() >= self.capacity {
                w.passed.clear();
            }
            let _ = w.passed.insert(*tuple);
            return false;
        }
        if w.remaining.len() >= self.capacity {
            w.remaining.clear();
        }
        let _ = w.remaining.insert(*tuple, self.misses - 1);
        true
    }

    #[cfg(test)]
    fn tracked(&self) -> (usize, usize) {
        let w = self.state.lock();
        (w.remaining.len(), w.passed.len())
    }
}

impl Conntracker for DelayedConntracker {
    fn lookup(&self, tuple: &ConnectionTuple) -> Option<IpTranslation> {
        if self.hide(tuple) {
            return None;
        }
        self.inner.lookup(tuple)
    }

    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn refresh(&self) {
        self.inner.refresh();
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use sockscope_common::types::ConnType;

    use super::*;
    use crate::nat::StaticConntracker;

    fn dns(sport: u16) -> ConnectionTuple {
        ConnectionTuple::new(
            ConnType::Udp,
            "10.0.0.1".parse().expect("ip"),
            sport,
            "2.2.2.2".parse().expect("ip"),
            53,
        )
    }

    #[test]
    fn first_lookup_misses_then_hits() {
        let backend = StaticConntracker::new();
        let orig = dns(5000);
        let mut reply = orig.reversed();
        reply.dest = "1.1.1.1".parse().expect("ip");
        backend.insert(orig, reply);

        let delayed = DelayedConntracker::new(Box::new(backend), 1);
        assert!(delayed.lookup(&orig).is_none());
        assert!(delayed.lookup(&orig).is_some());
        assert_eq!(delayed.kind(), crate::nat::memory::KIND);
    }

    #[test]
    fn tuples_leave_the_window_once_their_misses_are_used() {
        let delayed = DelayedConntracker::new(Box::new(StaticConntracker::new()), 2);
        let t = dns(5001);
        assert!(delayed.hide(&t));
        assert!(delayed.hide(&t));
        assert_eq!(delayed.tracked(), (1, 0));
        assert!(!delayed.hide(&t));
        assert_eq!(delayed.tracked(), (0, 1));
        assert!(!delayed.hide(&t));
    }

    #[test]
    fn bookkeeping_stays_within_capacity() {
        let mut delayed = DelayedConntracker::new(Box::new(StaticConntracker::new()), 1);
        delayed.capacity = 8;
        for sport in 0..100 {
            let t = dns(6000 + sport);
            assert!(delayed.hide(&t));
            assert!(!delayed.hide(&t));
        }
        let (remaining, passed) = delayed.tracked();
        assert!(remaining <= 8);
        assert!(passed <= 8);
    }

    #[test]
    fn zero_misses_records_nothing() {
        let delayed = DelayedConntracker::new(Box::new(StaticConntracker::new()), 0);
        for sport in 0..10 {
            assert!(delayed.lookup(&dns(7000 + sport)).is_none());
        }
        assert_eq!(delayed.tracked(), (0, 0));
    }
}
