//! NAT translation.
//!
//! A [`Conntracker`] answers "what does the reply direction of this tuple
//! look like" from a connection-tracking facility. Backends are picked once
//! at startup by [`create_conntracker`], which walks a fallback chain and
//! only fails when every backend failed. [`NatResolver`] adds the bounded
//! retry-on-miss that young connections need.

pub mod delayed;
pub mod ebpf;
pub mod memory;
pub mod procfs;
pub mod resolver;

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sockscope_common::config::TracerConfig;
use sockscope_common::error::{Result, SockscopeError};
use sockscope_common::types::ConnectionTuple;

pub use delayed::DelayedConntracker;
pub use ebpf::EbpfConntracker;
pub use memory::StaticConntracker;
pub use procfs::ProcConntracker;
pub use resolver::{NatResolver, Resolution};

/// Address rewrite seen in the reply direction of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpTranslation {
    /// Source address of reply packets.
    pub repl_src_ip: IpAddr,
    /// Destination address of reply packets.
    pub repl_dst_ip: IpAddr,
    /// Source port of reply packets.
    pub repl_src_port: u16,
    /// Destination port of reply packets.
    pub repl_dst_port: u16,
}

impl IpTranslation {
    /// Builds the translation carried by a reply-direction tuple.
    #[must_use]
    pub const fn from_reply(reply: &ConnectionTuple) -> Self {
        Self {
            repl_src_ip: reply.source,
            repl_dst_ip: reply.dest,
            repl_src_port: reply.sport,
            repl_dst_port: reply.dport,
        }
    }

    /// Whether `reply` is just `orig` reversed, i.e. nothing was rewritten.
    #[must_use]
    pub fn is_identity(orig: &ConnectionTuple, reply: &ConnectionTuple) -> bool {
        reply.source == orig.dest
            && reply.dest == orig.source
            && reply.sport == orig.dport
            && reply.dport == orig.sport
    }
}

/// A connection-tracking facility.
///
/// Lookups are synchronous and may block on kernel reads; callers must not
/// hold table locks across them. Backends only fail at construction.
pub trait Conntracker: Send + Sync {
    /// Returns the translation of `tuple`, if the facility knows one.
    fn lookup(&self, tuple: &ConnectionTuple) -> Option<IpTranslation>;

    /// Short backend name, for logs and the CLI.
    fn kind(&self) -> &'static str;

    /// Brings cached state up to date before a retry round, ignoring any
    /// rate limit the backend applies to its own refreshes.
    fn refresh(&self) {}

    /// Releases kernel resources. Lookups after `close` miss.
    fn close(&self) {}
}

impl std::fmt::Debug for dyn Conntracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conntracker")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Constructor of one backend in the fallback chain.
pub type ConntrackerFactory =
    Box<dyn FnOnce(&TracerConfig) -> Result<Box<dyn Conntracker>> + Send>;

/// The default chain: pinned map first when enabled, then procfs.
#[must_use]
pub fn default_factories(config: &TracerConfig) -> Vec<(&'static str, ConntrackerFactory)> {
    let mut chain: Vec<(&'static str, ConntrackerFactory)> = Vec::new();
    if config.enable_ebpf_conntracker {
        chain.push((
            ebpf::KIND,
            Box::new(|cfg: &TracerConfig| {
                let backend = EbpfConntracker::open(&cfg.conntrack_map_pin_path)?;
                Ok(Box::new(backend) as Box<dyn Conntracker>)
            }),
        ));
    }
    chain.push((
        procfs::KIND,
        Box::new(|cfg: &TracerConfig| {
            let backend = ProcConntracker::open(
                &cfg.conntrack_procfs_path,
                cfg.conntrack_rescan_interval(),
            )?;
            Ok(Box::new(backend) as Box<dyn Conntracker>)
        }),
    ));
    chain
}

/// Builds the first backend of `chain` that initializes.
///
/// # Errors
///
/// Returns [`SockscopeError::ConntrackUnavailable`] listing every failure
/// when no backend could be built.
pub fn create_conntracker(
    config: &TracerConfig,
    chain: Vec<(&'static str, ConntrackerFactory)>,
) -> Result<Box<dyn Conntracker>> {
    let mut reasons = Vec::new();
    for (name, factory) in chain {
        match factory(config) {
            Ok(backend) => {
                if reasons.is_empty() {
                    tracing::info!(backend = backend.kind(), "conntrack backend initialized");
                } else {
                    tracing::info!(
                        backend = backend.kind(),
                        failed = reasons.len(),
                        "conntrack backend initialized after fallback"
                    );
                }
                return Ok(backend);
            }
            Err(e) => {
                tracing::warn!(backend = name, error = %e, "conntrack backend unavailable");
                reasons.push(format!("{name}: {e}"));
            }
        }
    }
    Err(SockscopeError::ConntrackUnavailable { reasons })
}

#[cfg(test)]
mod tests {
    use sockscope_common::types::ConnType;

    use super::*;

    fn failing(message: &'static str) -> ConntrackerFactory {
        Box::new(move |_: &TracerConfig| -> Result<Box<dyn Conntracker>> {
            Err(SockscopeError::Config {
                message: message.into(),
            })
        })
    }

    fn working() -> ConntrackerFactory {
        Box::new(|_: &TracerConfig| Ok(Box::new(StaticConntracker::new()) as Box<dyn Conntracker>))
    }

    #[test]
    fn falls_back_to_next_backend() {
        let chain = vec![("ebpf", failing("no map")), ("static", working())];
        let backend = create_conntracker(&TracerConfig::default(), chain).expect("fallback");
        assert_eq!(backend.kind(), memory::KIND);
    }

    #[test]
    fn all_backends_failing_is_fatal() {
        let chain = vec![("ebpf", failing("no map")), ("procfs", failing("no file"))];
        let err = create_conntracker(&TracerConfig::default(), chain).unwrap_err();
        match err {
            SockscopeError::ConntrackUnavailable { reasons } => {
                assert_eq!(reasons.len(), 2);
                assert!(reasons[0].starts_with("ebpf: "));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn default_chain_respects_ebpf_toggle() {
        let config = TracerConfig {
            enable_ebpf_conntracker: false,
            ..TracerConfig::default()
        };
        let names: Vec<_> = default_factories(&config).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![procfs::KIND]);
    }

    #[test]
    fn identity_reply_is_not_a_translation() {
        let orig = ConnectionTuple::new(
            ConnType::Tcp,
            "10.0.0.1".parse().expect("ip"),
            40000,
            "10.0.0.2".parse().expect("ip"),
            80,
        );
        assert!(IpTranslation::is_identity(&orig, &orig.reversed()));
        let mut dnat = orig.reversed();
        dnat.source = "172.17.0.2".parse().expect("ip");
        assert!(!IpTranslation::is_identity(&orig, &dnat));
    }
}
