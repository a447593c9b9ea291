//! Conntrack BPF program and map layout.
//!
//! The in-kernel program hooks NAT setup and stores, for every translated
//! flow, the reply-direction tuple keyed by the original tuple. Both sides
//! of the map use [`ConntrackKey`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use sockscope_common::types::{ConnType, ConnectionTuple};

/// Name of the conntrack program in the compiled object.
pub const CONNTRACK_PROGRAM_NAME: &str = "sockscope_conntrack";

/// Name of the hash map holding translations.
pub const CONNTRACK_MAP_NAME: &str = "conntrack";

const META_TCP: u32 = 1 << 0;
const META_V6: u32 = 1 << 1;

/// Tuple layout shared with the kernel program.
///
/// IPv4 addresses live in the low word with the high word zeroed. Address
/// words hold the raw network-order bytes as the kernel stores them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConntrackKey {
    /// High 64 bits of the source address.
    pub saddr_h: u64,
    /// Low 64 bits of the source address.
    pub saddr_l: u64,
    /// High 64 bits of the destination address.
    pub daddr_h: u64,
    /// Low 64 bits of the destination address.
    pub daddr_l: u64,
    /// Source port, host order.
    pub sport: u16,
    /// Destination port, host order.
    pub dport: u16,
    /// Network namespace inode, zero when unknown.
    pub netns: u32,
    /// Transport and family bits.
    pub metadata: u32,
    _pad: u32,
}

impl ConntrackKey {
    /// Encodes a tuple in the kernel layout.
    #[must_use]
    pub fn from_tuple(tuple: &ConnectionTuple) -> Self {
        let (saddr_h, saddr_l) = encode_addr(tuple.source);
        let (daddr_h, daddr_l) = encode_addr(tuple.dest);
        let mut metadata = 0;
        if tuple.conn_type == ConnType::Tcp {
            metadata |= META_TCP;
        }
        if tuple.source.is_ipv6() {
            metadata |= META_V6;
        }
        Self {
            saddr_h,
            saddr_l,
            daddr_h,
            daddr_l,
            sport: tuple.sport,
            dport: tuple.dport,
            netns: tuple.netns.unwrap_or(0),
            metadata,
            _pad: 0,
        }
    }

    /// Decodes the kernel layout back into a tuple.
    #[must_use]
    pub fn to_tuple(&self) -> ConnectionTuple {
        let v6 = self.metadata & META_V6 != 0;
        let conn_type = if self.metadata & META_TCP == 0 {
            ConnType::Udp
        } else {
            ConnType::Tcp
        };
        let mut tuple = ConnectionTuple::new(
            conn_type,
            decode_addr(self.saddr_h, self.saddr_l, v6),
            self.sport,
            decode_addr(self.daddr_h, self.daddr_l, v6),
            self.dport,
        );
        if self.netns != 0 {
            tuple = tuple.with_netns(self.netns);
        }
        tuple
    }
}

fn encode_addr(addr: IpAddr) -> (u64, u64) {
    match addr {
        IpAddr::V4(v4) => (0, u64::from(u32::from_ne_bytes(v4.octets()))),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            let mut high = [0u8; 8];
            let mut low = [0u8; 8];
            high.copy_from_slice(&o[..8]);
            low.copy_from_slice(&o[8..]);
            (u64::from_ne_bytes(high), u64::from_ne_bytes(low))
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn decode_addr(high: u64, low: u64, v6: bool) -> IpAddr {
    if v6 {
        let mut o = [0u8; 16];
        o[..8].copy_from_slice(&high.to_ne_bytes());
        o[8..].copy_from_slice(&low.to_ne_bytes());
        IpAddr::V6(Ipv6Addr::from(o))
    } else {
        IpAddr::V4(Ipv4Addr::from((low as u32).to_ne_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_tcp_key_keeps_high_words_zero() {
        let tuple = ConnectionTuple::new(
            ConnType::Tcp,
            "10.0.0.1".parse().expect("ip"),
            5000,
            "2.2.2.2".parse().expect("ip"),
            80,
        );
        let key = ConntrackKey::from_tuple(&tuple);
        assert_eq!(key.saddr_h, 0);
        assert_eq!(key.daddr_h, 0);
        assert_eq!(key.metadata, META_TCP);
        assert_eq!(key.netns, 0);
        assert_eq!(key.to_tuple(), tuple);
    }

    #[test]
    fn ipv6_udp_key_decodes_with_namespace() {
        let tuple = ConnectionTuple::new(
            ConnType::Udp,
            "fd00::1".parse().expect("ip"),
            53000,
            "2001:4860:4860::8888".parse().expect("ip"),
            53,
        )
        .with_netns(4_026_531_840);
        let key = ConntrackKey::from_tuple(&tuple);
        assert_eq!(key.metadata, META_V6);
        assert_eq!(key.to_tuple(), tuple);
    }

    #[test]
    fn key_layout_has_no_implicit_padding() {
        assert_eq!(std::mem::size_of::<ConntrackKey>(), 48);
    }
}
