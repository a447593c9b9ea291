//! Domain primitive types used across the Sockscope workspace.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::constants::EPHEMERAL_PORT_RANGE;

/// Transport protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    /// TCP stream.
    Tcp,
    /// UDP datagrams.
    Udp,
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Address family of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "v4"),
            Self::V6 => write!(f, "v6"),
        }
    }
}

/// Which side initiated a connection, from the point of view of this host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Not determined.
    #[default]
    Unknown,
    /// Accepted by a local listener.
    Incoming,
    /// Initiated by a local socket.
    Outgoing,
}

impl Direction {
    /// Returns the direction the peer side of the same flow has.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Unknown => Self::Unknown,
            Self::Incoming => Self::Outgoing,
            Self::Outgoing => Self::Incoming,
        }
    }

    /// Guesses the direction of a tuple from the ephemeral port range.
    ///
    /// A local ephemeral port talking to a non-ephemeral remote port is
    /// outgoing, and the reverse is incoming. Anything else is unknown.
    #[must_use]
    pub fn from_ports(sport: u16, dport: u16) -> Self {
        match (
            EPHEMERAL_PORT_RANGE.contains(&sport),
            EPHEMERAL_PORT_RANGE.contains(&dport),
        ) {
            (true, false) => Self::Outgoing,
            (false, true) => Self::Incoming,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Incoming => write!(f, "incoming"),
            Self::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// Identity of one side of a flow.
///
/// The reversed tuple (source and destination swapped) identifies the peer
/// side of the same flow and is tracked as a separate entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionTuple {
    /// Local address.
    pub source: IpAddr,
    /// Remote address.
    pub dest: IpAddr,
    /// Local port.
    pub sport: u16,
    /// Remote port.
    pub dport: u16,
    /// Transport protocol.
    #[serde(rename = "type")]
    pub conn_type: ConnType,
    /// Network namespace inode, when the source knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns: Option<u32>,
}

impl ConnectionTuple {
    /// Creates a tuple without a namespace discriminator.
    #[must_use]
    pub const fn new(
        conn_type: ConnType,
        source: IpAddr,
        sport: u16,
        dest: IpAddr,
        dport: u16,
    ) -> Self {
        Self {
            source,
            dest,
            sport,
            dport,
            conn_type,
            netns: None,
        }
    }

    /// Returns the same tuple scoped to a network namespace.
    #[must_use]
    pub const fn with_netns(mut self, netns: u32) -> Self {
        self.netns = Some(netns);
        self
    }

    /// Address family, derived from the source address.
    #[must_use]
    pub const fn family(&self) -> Family {
        match self.source {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Returns the tuple of the peer side of this flow.
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self {
            source: self.dest,
            dest: self.source,
            sport: self.dport,
            dport: self.sport,
            conn_type: self.conn_type,
            netns: self.netns,
        }
    }

    /// Returns the tuple with the namespace discriminator removed.
    #[must_use]
    pub const fn without_netns(&self) -> Self {
        let mut t = *self;
        t.netns = None;
        t
    }
}

impl fmt::Display for ConnectionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}{}] {} -> {}",
            self.conn_type,
            self.family(),
            std::net::SocketAddr::new(self.source, self.sport),
            std::net::SocketAddr::new(self.dest, self.dport),
        )?;
        if let Some(ns) = self.netns {
            write!(f, " ns:{ns}")?;
        }
        Ok(())
    }
}

/// Opaque identifier of a snapshot consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Creates a client ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte, packet and retransmit counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatCounters {
    /// Bytes sent by the local side.
    pub sent_bytes: u64,
    /// Bytes received by the local side.
    pub recv_bytes: u64,
    /// Packets sent by the local side.
    pub sent_packets: u64,
    /// Packets received by the local side.
    pub recv_packets: u64,
    /// TCP retransmits.
    pub retransmits: u64,
}

impl StatCounters {
    /// Counter-wise sum, saturating at `u64::MAX`.
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self {
            sent_bytes: self.sent_bytes.saturating_add(other.sent_bytes),
            recv_bytes: self.recv_bytes.saturating_add(other.recv_bytes),
            sent_packets: self.sent_packets.saturating_add(other.sent_packets),
            recv_packets: self.recv_packets.saturating_add(other.recv_packets),
            retransmits: self.retransmits.saturating_add(other.retransmits),
        }
    }

    /// Counter-wise difference, clamped at zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self {
            sent_bytes: self.sent_bytes.saturating_sub(other.sent_bytes),
            recv_bytes: self.recv_bytes.saturating_sub(other.recv_bytes),
            sent_packets: self.sent_packets.saturating_sub(other.sent_packets),
            recv_packets: self.recv_packets.saturating_sub(other.recv_packets),
            retransmits: self.retransmits.saturating_sub(other.retransmits),
        }
    }

    /// Difference between two monotonic readings of the same counters.
    ///
    /// Returns `None` if any counter went backwards, which means the
    /// readings belong to different connections.
    #[must_use]
    pub fn checked_delta(self, previous: Self) -> Option<Self> {
        Some(Self {
            sent_bytes: self.sent_bytes.checked_sub(previous.sent_bytes)?,
            recv_bytes: self.recv_bytes.checked_sub(previous.recv_bytes)?,
            sent_packets: self.sent_packets.checked_sub(previous.sent_packets)?,
            recv_packets: self.recv_packets.checked_sub(previous.recv_packets)?,
            retransmits: self.retransmits.checked_sub(previous.retransmits)?,
        })
    }

    /// Returns whether every counter is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.sent_bytes == 0
            && self.recv_bytes == 0
            && self.sent_packets == 0
            && self.recv_packets == 0
            && self.retransmits == 0
    }
}
