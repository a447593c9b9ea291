//! Internal telemetry counters.
//!
//! Data-loss paths never return errors; they bump one of these counters so
//! operators can see when the bounded-memory trade-off is exercised.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! telemetry_counters {
    ($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
        /// Live counters, updated lock-free from every path of the tracer.
        #[derive(Debug, Default)]
        pub struct Telemetry {
            $($(#[$doc])* pub(crate) $name: AtomicU64,)+
        }

        /// Point-in-time copy of [`Telemetry`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct TelemetrySnapshot {
            $($(#[$doc])* pub $name: u64,)+
        }

        impl Telemetry {
            /// Reads every counter.
            #[must_use]
            pub fn snapshot(&self) -> TelemetrySnapshot {
                TelemetrySnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

telemetry_counters! {
    /// Events applied to the table.
    events_ingested,
    /// Events dropped because their sequence number was already applied.
    duplicate_events,
    /// Events dropped because they targeted a closed generation.
    stale_events,
    /// Table entries created.
    generations_started,
    /// Closed entries removed after every client observed them.
    closed_evicted,
    /// Closed entries removed before every client observed them.
    undelivered_evicted,
    /// Open entries removed to make room.
    dropped_connections,
    /// Short-lived entries lost because a client buffer was full.
    short_lived_overflows,
    /// Failure events carrying an unrecognised code.
    unknown_failure_codes,
    /// Open entries closed after staying idle past their timeout.
    idle_expired,
    /// Conntrack lookups issued.
    nat_lookups,
    /// Conntrack lookups that returned a translation.
    nat_hits,
    /// Conntrack lookups repeated after a miss.
    nat_retries,
    /// Resolve calls that ended without a translation.
    nat_misses,
    /// Gateway lookups that failed.
    gateway_errors,
    /// Client registrations.
    clients_registered,
    /// Orphaned clients reclaimed.
    clients_reclaimed,
}

impl Telemetry {
    pub(crate) fn incr(counter: &AtomicU64) {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }
}
