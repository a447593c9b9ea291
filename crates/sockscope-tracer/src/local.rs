//! Addresses owned by this host, for intra-host detection.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};

use sockscope_common::error::{Result, SockscopeError};

/// Set of local interface addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAddrs {
    addrs: HashSet<IpAddr>,
}

impl LocalAddrs {
    /// Lists the addresses of every host interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface list cannot be read.
    pub fn discover() -> Result<Self> {
        let ifaddrs = nix::ifaddrs::getifaddrs().map_err(|e| SockscopeError::Lookup {
            message: format!("cannot list interface addresses: {e}"),
        })?;
        let mut addrs = HashSet::new();
        for ifaddr in ifaddrs {
            let Some(address) = ifaddr.address else {
                continue;
            };
            if let Some(v4) = address.as_sockaddr_in() {
                let _ = addrs.insert(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
            } else if let Some(v6) = address.as_sockaddr_in6() {
                let _ = addrs.insert(IpAddr::V6(*SocketAddrV6::from(*v6).ip()));
            }
        }
        tracing::debug!(count = addrs.len(), "discovered local addresses");
        Ok(Self { addrs })
    }

    /// Whether `addr` belongs to this host.
    #[must_use]
    pub fn is_local(&self, addr: IpAddr) -> bool {
        addr.is_loopback() || self.addrs.contains(&addr)
    }

    /// Number of known interface addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Whether no interface address is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

impl FromIterator<IpAddr> for LocalAddrs {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        Self {
            addrs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_always_local() {
        let local = LocalAddrs::default();
        assert!(local.is_local("127.0.0.1".parse().expect("ip")));
        assert!(local.is_local("::1".parse().expect("ip")));
        assert!(!local.is_local("10.0.0.1".parse().expect("ip")));
    }

    #[test]
    fn listed_addresses_are_local() {
        let local: LocalAddrs = ["10.0.0.5".parse().expect("ip")].into_iter().collect();
        assert!(local.is_local("10.0.0.5".parse().expect("ip")));
        assert_eq!(local.len(), 1);
    }

    #[test]
    fn discovery_finds_loopback() {
        let local = LocalAddrs::discover().expect("getifaddrs");
        assert!(
            local.is_local("127.0.0.1".parse().expect("ip")),
            "loopback must be local"
        );
    }
}
