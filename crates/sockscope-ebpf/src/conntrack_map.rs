//! Reader for the pinned conntrack map.
//!
//! The accelerated NAT backend reads translations straight out of the map
//! the in-kernel conntrack program maintains. Without the `ebpf` feature
//! (or off Linux) opening the map always fails, which makes the tracer fall
//! back to the procfs backend.

use std::path::Path;

use sockscope_common::error::Result;
use sockscope_common::types::ConnectionTuple;

#[cfg(all(target_os = "linux", feature = "ebpf"))]
pub use imp::PinnedConntrackMap;

#[cfg(not(all(target_os = "linux", feature = "ebpf")))]
pub use stub::PinnedConntrackMap;

#[cfg(all(target_os = "linux", feature = "ebpf"))]
mod imp {
    #![allow(unsafe_code)]

    use aya::maps::{HashMap, Map, MapData, MapError};
    use sockscope_common::error::SockscopeError;

    use super::{ConnectionTuple, Path, Result};
    use crate::programs::conntrack::{CONNTRACK_MAP_NAME, ConntrackKey};

    // SAFETY: `ConntrackKey` is `repr(C)`, `Copy`, and has explicit padding,
    // so every bit pattern is valid and no byte is uninitialized.
    unsafe impl aya::Pod for ConntrackKey {}

    /// Handle to the pinned conntrack hash map.
    pub struct PinnedConntrackMap {
        map: HashMap<MapData, ConntrackKey, ConntrackKey>,
    }

    impl std::fmt::Debug for PinnedConntrackMap {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PinnedConntrackMap").finish_non_exhaustive()
        }
    }

    impl PinnedConntrackMap {
        /// Opens the map pinned at `pin`.
        ///
        /// # Errors
        ///
        /// Returns an error if the pin does not exist or is not a hash map
        /// with the expected key and value sizes.
        pub fn open(pin: &Path) -> Result<Self> {
            let data = MapData::from_pin(pin).map_err(|e| SockscopeError::Config {
                message: format!(
                    "cannot open pinned map {CONNTRACK_MAP_NAME} at {}: {e}",
                    pin.display()
                ),
            })?;
            let map = HashMap::try_from(Map::HashMap(data)).map_err(|e| {
                SockscopeError::Config {
                    message: format!("map {CONNTRACK_MAP_NAME} has an unexpected layout: {e}"),
                }
            })?;
            tracing::info!(pin = %pin.display(), "opened pinned conntrack map");
            Ok(Self { map })
        }

        /// Returns the reply-direction tuple stored for `tuple`.
        pub fn lookup(&self, tuple: &ConnectionTuple) -> Option<ConnectionTuple> {
            let key = ConntrackKey::from_tuple(tuple);
            match self.map.get(&key, 0) {
                Ok(reply) => Some(reply.to_tuple()),
                Err(MapError::KeyNotFound) => None,
                Err(e) => {
                    tracing::debug!(%tuple, error = %e, "conntrack map lookup failed");
                    None
                }
            }
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "ebpf")))]
mod stub {
    use sockscope_common::error::SockscopeError;

    use super::{ConnectionTuple, Path, Result};

    /// Placeholder used when BPF support is not compiled in.
    #[derive(Debug)]
    pub struct PinnedConntrackMap {
        _private: (),
    }

    impl PinnedConntrackMap {
        /// Always fails: the crate was built without the `ebpf` feature.
        ///
        /// # Errors
        ///
        /// Always returns a configuration error.
        pub fn open(pin: &Path) -> Result<Self> {
            Err(SockscopeError::Config {
                message: format!(
                    "cannot open {}: built without the `ebpf` feature",
                    pin.display()
                ),
            })
        }

        /// Never finds a translation.
        #[allow(clippy::unused_self)]
        pub const fn lookup(&self, _tuple: &ConnectionTuple) -> Option<ConnectionTuple> {
            None
        }
    }
}

#[cfg(all(test, not(feature = "ebpf")))]
mod tests {
    use super::*;

    #[test]
    fn open_without_feature_fails() {
        let err = PinnedConntrackMap::open(Path::new("/sys/fs/bpf/none")).unwrap_err();
        assert!(err.to_string().contains("ebpf"), "got: {err}");
    }
}
