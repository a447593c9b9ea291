//! Raw connection events emitted by the probe layer.
//!
//! The source delivers events at least once: duplicates are possible, and
//! events of different tuples may be reordered. Events of one tuple arrive
//! in order for a given connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sockscope_common::error::Result;
use sockscope_common::types::{ConnectionTuple, Direction, StatCounters};

/// What happened to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnEventKind {
    /// The connection was created or first observed.
    New,
    /// Counters or metadata changed.
    Update,
    /// The connection was closed.
    Close,
    /// The connection failed with an `errno`.
    Failure,
}

/// How the counters in an event are to be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterMode {
    /// Running totals for the connection.
    #[default]
    Absolute,
    /// Increments since the previous event of the connection.
    Delta,
}

/// One raw connection event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnEvent {
    /// Event type.
    pub kind: ConnEventKind,
    /// Identity of the connection side the event describes.
    pub tuple: ConnectionTuple,
    /// How [`Self::counters`] is to be read.
    #[serde(default)]
    pub mode: CounterMode,
    /// Counter reading carried by the event.
    #[serde(default)]
    pub counters: StatCounters,
    /// Owning process, zero when unknown.
    #[serde(default)]
    pub pid: u32,
    /// Direction, when the probe knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Socket cookie or other per-connection discriminator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    /// Per-connection sequence number used to drop duplicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Smoothed round-trip time in microseconds (TCP).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt_us: Option<u32>,
    /// Round-trip time variance in microseconds (TCP).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt_var_us: Option<u32>,
    /// `errno` of a failure event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<i32>,
    /// First payload bytes seen on the connection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

impl ConnEvent {
    /// Creates an event with zeroed counters and no metadata.
    #[must_use]
    pub const fn new(kind: ConnEventKind, tuple: ConnectionTuple) -> Self {
        Self {
            kind,
            tuple,
            mode: CounterMode::Absolute,
            counters: StatCounters {
                sent_bytes: 0,
                recv_bytes: 0,
                sent_packets: 0,
                recv_packets: 0,
                retransmits: 0,
            },
            pid: 0,
            direction: None,
            generation: None,
            seq: None,
            rtt_us: None,
            rtt_var_us: None,
            failure_code: None,
            payload: Vec::new(),
        }
    }

    /// Sets absolute counters.
    #[must_use]
    pub fn with_totals(mut self, counters: StatCounters) -> Self {
        self.mode = CounterMode::Absolute;
        self.counters = counters;
        self
    }

    /// Sets delta counters.
    #[must_use]
    pub fn with_delta(mut self, counters: StatCounters) -> Self {
        self.mode = CounterMode::Delta;
        self.counters = counters;
        self
    }

    /// Sets the owning process.
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Sets the direction.
    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Sets the source-provided generation.
    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Sets the sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Sets round-trip time and its variance.
    #[must_use]
    pub fn with_rtt(mut self, rtt_us: u32, rtt_var_us: u32) -> Self {
        self.rtt_us = Some(rtt_us);
        self.rtt_var_us = Some(rtt_var_us);
        self
    }

    /// Sets the failure `errno`.
    #[must_use]
    pub fn with_failure(mut self, code: i32) -> Self {
        self.failure_code = Some(code);
        self
    }

    /// Sets early payload bytes.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Outcome of one poll of an [`EventSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePoll {
    /// An event is available.
    Event(Box<ConnEvent>),
    /// Nothing arrived within the timeout.
    Idle,
    /// The source ended and will never produce another event.
    Exhausted,
}

/// A lazy, non-restartable stream of connection events.
pub trait EventSource: Send {
    /// Waits up to `timeout` for the next event.
    ///
    /// # Errors
    ///
    /// Returns [`SockscopeError::Parse`](sockscope_common::error::SockscopeError::Parse)
    /// for a single malformed record (the stream stays usable) and
    /// [`SockscopeError::EventSource`](sockscope_common::error::SockscopeError::EventSource)
    /// when the underlying stream broke.
    fn poll_event(&mut self, timeout: Duration) -> Result<SourcePoll>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockscope_common::types::ConnType;

    #[test]
    fn minimal_json_event_uses_defaults() {
        let line = r#"{"kind":"new","tuple":{"source":"10.0.0.1","dest":"10.0.0.2","sport":40000,"dport":80,"type":"tcp"}}"#;
        let event: ConnEvent = serde_json::from_str(line).expect("parse");
        assert_eq!(event.kind, ConnEventKind::New);
        assert_eq!(event.mode, CounterMode::Absolute);
        assert!(event.counters.is_zero());
        assert_eq!(event.tuple.conn_type, ConnType::Tcp);
        assert!(event.payload.is_empty());
    }

    #[test]
    fn builder_sets_delta_mode() {
        let tuple = ConnectionTuple::new(
            ConnType::Udp,
            "10.0.0.1".parse().expect("ip"),
            5353,
            "10.0.0.2".parse().expect("ip"),
            53,
        );
        let event = ConnEvent::new(ConnEventKind::Update, tuple).with_delta(StatCounters {
            sent_bytes: 12,
            ..StatCounters::default()
        });
        assert_eq!(event.mode, CounterMode::Delta);
        assert_eq!(event.counters.sent_bytes, 12);
    }
}
