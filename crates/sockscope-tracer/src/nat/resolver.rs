//! Bounded retry-on-miss over a [`Conntracker`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use sockscope_common::config::NatRetryConfig;
use sockscope_common::types::ConnectionTuple;

use super::{Conntracker, IpTranslation};
use crate::telemetry::Telemetry;

/// Result of one resolve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The facility knows a translation.
    Found(IpTranslation),
    /// Missed, but the connection is young enough to be looked up again.
    Pending,
    /// Missed on a connection old enough for the miss to be final.
    Absent,
}

/// Resolves tuples with bounded retries.
#[derive(Debug)]
pub struct NatResolver {
    conntracker: Box<dyn Conntracker>,
    retry: NatRetryConfig,
    telemetry: Arc<Telemetry>,
}

impl NatResolver {
    /// Wraps a backend with the given retry policy.
    #[must_use]
    pub fn new(
        conntracker: Box<dyn Conntracker>,
        retry: NatRetryConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            conntracker,
            retry,
            telemetry,
        }
    }

    /// Name of the backend in use.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.conntracker.kind()
    }

    /// Looks up `tuple`, retrying misses on connections younger than the
    /// young threshold. See [`resolve_all`](Self::resolve_all).
    pub fn resolve(&self, tuple: &ConnectionTuple, age: Duration) -> Resolution {
        self.resolve_all(&[(*tuple, age)])
            .pop()
            .unwrap_or(Resolution::Pending)
    }

    /// Resolves a batch of `(tuple, age)` pairs, in order.
    ///
    /// Every tuple is looked up once. Young misses are then retried in
    /// rounds: one backoff sleep and one backend refresh per round, shared
    /// by the whole batch. Rounds stop after `max_retries` or once the
    /// budget is spent, so the call blocks for at most about one budget no
    /// matter how many tuples it carries. Young tuples still missing at the
    /// end are [`Resolution::Pending`] and get looked up again by a later
    /// call.
    pub fn resolve_all(&self, work: &[(ConnectionTuple, Duration)]) -> Vec<Resolution> {
        let started = Instant::now();
        let young = self.retry.young_threshold();
        let backoff = self.retry.backoff();
        let mut found: Vec<Option<IpTranslation>> = work.iter().map(|(t, _)| self.lookup(t)).collect();

        let mut pending: Vec<usize> = (0..work.len())
            .filter(|&i| found[i].is_none() && work[i].1 < young)
            .collect();
        let mut round = 0;
        while !pending.is_empty() && round < self.retry.max_retries {
            if started.elapsed() + backoff > self.retry.budget() {
                tracing::trace!(pending = pending.len(), round, "nat retry budget exhausted");
                break;
            }
            std::thread::sleep(backoff);
            round += 1;
            self.conntracker.refresh();
            pending.retain(|&i| {
                Telemetry::incr(&self.telemetry.nat_retries);
                found[i] = self.lookup(&work[i].0);
                found[i].is_none()
            });
        }

        work.iter()
            .zip(found)
            .map(|((_, age), hit)| match hit {
                Some(translation) => Resolution::Found(translation),
                None => {
                    Telemetry::incr(&self.telemetry.nat_misses);
                    if *age < young {
                        Resolution::Pending
                    } else {
                        Resolution::Absent
                    }
                }
            })
            .collect()
    }

    fn lookup(&self, tuple: &ConnectionTuple) -> Option<IpTranslation> {
        Telemetry::incr(&self.telemetry.nat_lookups);
        let hit = self.conntracker.lookup(tuple);
        if hit.is_some() {
            Telemetry::incr(&self.telemetry.nat_hits);
        }
        hit
    }

    /// Closes the backend.
    pub fn close(&self) {
        self.conntracker.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sockscope_common::types::ConnType;

    use super::*;
    use crate::nat::{DelayedConntracker, StaticConntracker};

    fn flow() -> (ConnectionTuple, ConnectionTuple) {
        let orig = ConnectionTuple::new(
            ConnType::Tcp,
            "10.0.0.1".parse().expect("ip"),
            40000,
            "10.96.0.10".parse().expect("ip"),
            80,
        );
        let mut reply = orig.reversed();
        reply.source = "172.17.0.5".parse().expect("ip");
        (orig, reply)
    }

    fn retry(max_retries: u32) -> NatRetryConfig {
        NatRetryConfig {
            max_retries,
            backoff_ms: 1,
            budget_ms: 100,
            young_threshold_ms: 10_000,
        }
    }

    #[test]
    fn young_miss_is_retried_until_hit() {
        let backend = StaticConntracker::new();
        let (orig, reply) = flow();
        backend.insert(orig, reply);
        let telemetry = Arc::new(Telemetry::default());
        let resolver = NatResolver::new(
            Box::new(DelayedConntracker::new(Box::new(backend), 1)),
            retry(2),
            Arc::clone(&telemetry),
        );

        let out = resolver.resolve(&orig, Duration::ZERO);
        assert!(matches!(out, Resolution::Found(t) if t.repl_src_ip == reply.source));
        let snap = telemetry.snapshot();
        assert_eq!(snap.nat_lookups, 2);
        assert_eq!(snap.nat_retries, 1);
        assert_eq!(snap.nat_hits, 1);
    }

    #[test]
    fn young_miss_stays_pending() {
        let (orig, _) = flow();
        let resolver = NatResolver::new(
            Box::new(StaticConntracker::new()),
            retry(1),
            Arc::new(Telemetry::default()),
        );
        assert_eq!(resolver.resolve(&orig, Duration::ZERO), Resolution::Pending);
    }

    #[test]
    fn old_miss_is_final_without_retry() {
        let (orig, _) = flow();
        let telemetry = Arc::new(Telemetry::default());
        let resolver = NatResolver::new(
            Box::new(StaticConntracker::new()),
            retry(3),
            Arc::clone(&telemetry),
        );
        assert_eq!(
            resolver.resolve(&orig, Duration::from_secs(60)),
            Resolution::Absent
        );
        assert_eq!(telemetry.snapshot().nat_retries, 0);
    }

    #[test]
    fn budget_caps_retries() {
        let (orig, _) = flow();
        let telemetry = Arc::new(Telemetry::default());
        let resolver = NatResolver::new(
            Box::new(StaticConntracker::new()),
            NatRetryConfig {
                max_retries: 100,
                backoff_ms: 20,
                budget_ms: 30,
                young_threshold_ms: 10_000,
            },
            Arc::clone(&telemetry),
        );
        let started = Instant::now();
        assert_eq!(resolver.resolve(&orig, Duration::ZERO), Resolution::Pending);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(telemetry.snapshot().nat_retries <= 1);
    }

    struct CountingRefresh {
        refreshes: Arc<AtomicUsize>,
    }

    impl Conntracker for CountingRefresh {
        fn lookup(&self, _: &ConnectionTuple) -> Option<IpTranslation> {
            None
        }

        fn kind(&self) -> &'static str {
            "counting"
        }

        fn refresh(&self) {
            let _ = self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn many(count: u16) -> Vec<(ConnectionTuple, Duration)> {
        let (orig, _) = flow();
        (0..count)
            .map(|i| {
                let mut t = orig;
                t.sport = 20_000 + i;
                (t, Duration::ZERO)
            })
            .collect()
    }

    #[test]
    fn large_batch_of_young_misses_shares_one_budget() {
        let telemetry = Arc::new(Telemetry::default());
        let resolver = NatResolver::new(
            Box::new(StaticConntracker::new()),
            NatRetryConfig::default(),
            Arc::clone(&telemetry),
        );
        let work = many(300);

        let started = Instant::now();
        let out = resolver.resolve_all(&work);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(out.len(), 300);
        assert!(out.iter().all(|r| *r == Resolution::Pending));
        let snap = telemetry.snapshot();
        assert!(snap.nat_retries <= 600);
        assert_eq!(snap.nat_misses, 300);
    }

    #[test]
    fn backend_is_refreshed_once_per_round() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let resolver = NatResolver::new(
            Box::new(CountingRefresh {
                refreshes: Arc::clone(&refreshes),
            }),
            retry(2),
            Arc::new(Telemetry::default()),
        );
        let _ = resolver.resolve_all(&many(50));
        assert_eq!(refreshes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batch_keeps_order_and_separates_old_from_young() {
        let backend = StaticConntracker::new();
        let (orig, reply) = flow();
        backend.insert(orig, reply);
        let mut other = orig;
        other.sport = 40001;
        let resolver = NatResolver::new(Box::new(backend), retry(0), Arc::new(Telemetry::default()));

        let out = resolver.resolve_all(&[
            (other, Duration::from_secs(60)),
            (orig, Duration::ZERO),
            (other, Duration::ZERO),
        ]);
        assert_eq!(out[0], Resolution::Absent);
        assert!(matches!(out[1], Resolution::Found(_)));
        assert_eq!(out[2], Resolution::Pending);
    }
}
