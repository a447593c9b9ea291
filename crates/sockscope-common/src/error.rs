//! Unified error types for the Sockscope workspace.
//!
//! Initialization failures and failed environment queries are modelled as
//! errors. Lookup misses during normal operation (NAT, routes, protocol)
//! are plain values.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum SockscopeError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A query against the host or cloud environment failed or had no
    /// answer.
    #[error("lookup failed: {message}")]
    Lookup {
        /// What was looked up and why it failed.
        message: String,
    },

    /// Text read from a kernel table or an event stream could not be parsed.
    #[error("failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Parser diagnostic.
        message: String,
    },

    /// The connection event source could not be opened or read.
    #[error("event source unavailable: {message}")]
    EventSource {
        /// Description of the failure.
        message: String,
    },

    /// Every conntrack backend failed to initialize.
    #[error("no conntrack backend could be initialized: {}", reasons.join("; "))]
    ConntrackUnavailable {
        /// One reason per backend that was attempted.
        reasons: Vec<String>,
    },

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// YAML configuration could not be deserialized.
    #[error("yaml error: {source}")]
    Yaml {
        /// Underlying YAML error.
        #[from]
        source: serde_yaml::Error,
    },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SockscopeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conntrack_unavailable_lists_every_reason() {
        let err = SockscopeError::ConntrackUnavailable {
            reasons: vec!["ebpf: map not pinned".into(), "procfs: missing".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("ebpf: map not pinned"), "got: {msg}");
        assert!(msg.contains("procfs: missing"), "got: {msg}");
    }

    #[test]
    fn json_errors_convert() {
        let bad = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: SockscopeError = bad.into();
        assert!(matches!(err, SockscopeError::Serialization { .. }));
    }
}
