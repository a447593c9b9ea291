//! System-wide constants and default paths.

use std::ops::Range;

/// Application name used in CLI output and log fields.
pub const APP_NAME: &str = "sockscope";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "sockscope";

/// Linux default `net.ipv4.ip_local_port_range` (32768-60999).
pub const EPHEMERAL_PORT_RANGE: Range<u16> = 32768..61000;

/// Kernel conntrack table exposed through procfs.
pub const DEFAULT_CONNTRACK_PROCFS_PATH: &str = "/proc/net/nf_conntrack";

/// Pin path of the conntrack map maintained by the accelerated backend.
pub const DEFAULT_CONNTRACK_MAP_PIN: &str = "/sys/fs/bpf/sockscope/conntrack";

/// Procfs mount point.
pub const DEFAULT_PROCFS_ROOT: &str = "/proc";

/// Sysfs mount point.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// `errno` reported by the kernel for a connect or keepalive timeout.
pub const ERRNO_TIMEOUT: i32 = libc::ETIMEDOUT;

/// `errno` reported by the kernel when the peer resets the connection.
pub const ERRNO_RESET: i32 = libc::ECONNRESET;

/// `errno` reported by the kernel when the peer refuses the connection.
pub const ERRNO_REFUSED: i32 = libc::ECONNREFUSED;
