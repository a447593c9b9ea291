//! Conntrack backend reading the pinned BPF map.

use std::path::Path;

use sockscope_common::error::Result;
use sockscope_common::types::ConnectionTuple;
use sockscope_ebpf::conntrack_map::PinnedConntrackMap;

use super::{Conntracker, IpTranslation};

/// Backend name.
pub const KIND: &str = "ebpf";

/// Accelerated backend: the kernel program maintains the translations.
#[derive(Debug)]
pub struct EbpfConntracker {
    map: PinnedConntrackMap,
}

impl EbpfConntracker {
    /// Opens the map pinned at `pin`.
    ///
    /// # Errors
    ///
    /// Returns an error when the map is missing or BPF support was not
    /// compiled in.
    pub fn open(pin: &Path) -> Result<Self> {
        Ok(Self {
            map: PinnedConntrackMap::open(pin)?,
        })
    }
}

impl Conntracker for EbpfConntracker {
    fn lookup(&self, tuple: &ConnectionTuple) -> Option<IpTranslation> {
        let reply = self
            .map
            .lookup(tuple)
            .or_else(|| tuple.netns.and_then(|_| self.map.lookup(&tuple.without_netns())))?;
        (!IpTranslation::is_identity(tuple, &reply)).then_some(IpTranslation::from_reply(&reply))
    }

    fn kind(&self) -> &'static str {
        KIND
    }
}

#[cfg(all(test, not(feature = "ebpf")))]
mod tests {
    use super::*;

    #[test]
    fn open_fails_without_bpf_support() {
        let err = EbpfConntracker::open(Path::new("/sys/fs/bpf/missing")).unwrap_err();
        assert!(err.to_string().contains("ebpf"), "got: {err}");
    }
}
