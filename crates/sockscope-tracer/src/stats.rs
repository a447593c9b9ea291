//! Connection records handed to clients.

use serde::{Deserialize, Serialize};
use sockscope_common::types::{ConnectionTuple, Direction, StatCounters};

use crate::failure::TcpFailures;
use crate::gateway::Via;
use crate::nat::IpTranslation;
use crate::protocols::ProtocolStack;
use crate::telemetry::TelemetrySnapshot;

/// One connection as seen by one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Connection identity.
    pub tuple: ConnectionTuple,
    /// Distinguishes successive connections sharing the tuple.
    pub generation: u64,
    /// Owning process, zero when unknown.
    pub pid: u32,
    /// Who opened the connection.
    pub direction: Direction,
    /// Totals since the connection was created.
    pub monotonic: StatCounters,
    /// Change since this client last received the connection.
    pub last: StatCounters,
    /// Whether the connection is closed; counters are final.
    pub is_closed: bool,
    /// UDP only: traffic was seen in both directions.
    pub is_assured: bool,
    /// Both endpoints live on this host.
    pub intra_host: bool,
    /// Detected protocols.
    pub protocol_stack: ProtocolStack,
    /// NAT rewrite, when one was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_translation: Option<IpTranslation>,
    /// Subnet the traffic was routed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<Via>,
    /// Terminal TCP failures.
    #[serde(default, skip_serializing_if = "TcpFailures::is_empty")]
    pub tcp_failures: TcpFailures,
    /// Smoothed round-trip time in microseconds (TCP).
    pub rtt_us: u32,
    /// Round-trip time variance in microseconds (TCP).
    pub rtt_var_us: u32,
    /// Lifetime so far, frozen at close.
    pub duration_ns: u64,
    /// Creation time on the tracer clock.
    pub created_ns: u64,
    /// Last activity on the tracer clock.
    pub last_update_ns: u64,
}

/// Result of one `get_connections` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connections {
    /// Connections changed since the client's previous call.
    pub connections: Vec<ConnectionStats>,
    /// Tracer counters at the time of the call.
    pub telemetry: TelemetrySnapshot,
}

impl Connections {
    /// Entries of one tuple, oldest generation first.
    #[must_use]
    pub fn find(&self, tuple: &ConnectionTuple) -> Vec<&ConnectionStats> {
        let mut found: Vec<_> = self
            .connections
            .iter()
            .filter(|c| c.tuple == *tuple)
            .collect();
        found.sort_by_key(|c| c.generation);
        found
    }
}
