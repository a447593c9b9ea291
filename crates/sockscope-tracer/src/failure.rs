//! Terminal TCP failure recording.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sockscope_common::constants::{ERRNO_REFUSED, ERRNO_RESET, ERRNO_TIMEOUT};

/// Failure reasons the recorder keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureCode {
    /// `ETIMEDOUT`.
    Timeout,
    /// `ECONNRESET`.
    Reset,
    /// `ECONNREFUSED`.
    Refused,
}

impl FailureCode {
    /// Maps an `errno` to a known reason.
    #[must_use]
    pub const fn from_errno(code: i32) -> Option<Self> {
        match code {
            ERRNO_TIMEOUT => Some(Self::Timeout),
            ERRNO_RESET => Some(Self::Reset),
            ERRNO_REFUSED => Some(Self::Refused),
            _ => None,
        }
    }

    /// The `errno` this reason stands for.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::Timeout => ERRNO_TIMEOUT,
            Self::Reset => ERRNO_RESET,
            Self::Refused => ERRNO_REFUSED,
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Reset => write!(f, "reset"),
            Self::Refused => write!(f, "refused"),
        }
    }
}

/// Per-connection failure counters.
///
/// The key set is bounded by [`FailureCode`], so the map holds at most three
/// entries whatever the probe reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TcpFailures {
    counts: BTreeMap<FailureCode, u32>,
}

impl TcpFailures {
    /// Records one failure with the given `errno`.
    ///
    /// Returns `false`, recording nothing, when the code is not one of the
    /// known reasons.
    pub fn record(&mut self, errno: i32) -> bool {
        let Some(code) = FailureCode::from_errno(errno) else {
            return false;
        };
        let count = self.counts.entry(code).or_insert(0);
        *count = count.saturating_add(1);
        true
    }

    /// Count for one reason.
    #[must_use]
    pub fn count(&self, code: FailureCode) -> u32 {
        self.counts.get(&code).copied().unwrap_or(0)
    }

    /// Whether no failure was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterates over `(errno, count)` pairs.
    pub fn by_errno(&self) -> impl Iterator<Item = (i32, u32)> + '_ {
        self.counts.iter().map(|(code, n)| (code.errno(), *n))
    }
}
