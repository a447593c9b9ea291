//! Formatted output helpers for CLI commands.
//!
//! Connections print either as an aligned table or as JSON, one document
//! per poll so `watch` output can be piped into line-oriented tools.

use std::fmt::Write as _;

use clap::ValueEnum;
use sockscope_tracer::{ConnectionStats, Connections};

/// How polled connections are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Aligned columns.
    #[default]
    Table,
    /// One JSON document per poll.
    Json,
}

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn protocols(stats: &ConnectionStats) -> String {
    let stack = stats.protocol_stack;
    let names: Vec<String> = [stack.api, stack.application, stack.encryption]
        .into_iter()
        .flatten()
        .map(|p| p.to_string())
        .collect();
    if names.is_empty() {
        "-".into()
    } else {
        names.join("/")
    }
}

fn flags(stats: &ConnectionStats) -> String {
    let mut flags = String::new();
    if stats.is_closed {
        flags.push('C');
    }
    if stats.intra_host {
        flags.push('L');
    }
    if stats.ip_translation.is_some() {
        flags.push('N');
    }
    if !stats.tcp_failures.is_empty() {
        flags.push('F');
    }
    if flags.is_empty() {
        flags.push('-');
    }
    flags
}

/// Renders connections as an aligned table, sorted by tuple.
#[must_use]
pub fn render_table(connections: &[ConnectionStats]) -> String {
    let mut rows: Vec<&ConnectionStats> = connections.iter().collect();
    rows.sort_by_key(|c| (c.tuple.source, c.tuple.sport, c.tuple.dest, c.tuple.dport, c.generation));

    let mut out = format!(
        "{:<5} {:<46} {:<46} {:<9} {:>10} {:>10} {:>10} {:<14} {:<5}\n",
        "PROTO", "SOURCE", "DEST", "DIR", "SENT", "RECV", "LAST SENT", "PROTOCOLS", "FLAGS"
    );
    for c in rows {
        let _ = writeln!(
            out,
            "{:<5} {:<46} {:<46} {:<9} {:>10} {:>10} {:>10} {:<14} {:<5}",
            c.tuple.conn_type.to_string(),
            format!("{}:{}", c.tuple.source, c.tuple.sport),
            format!("{}:{}", c.tuple.dest, c.tuple.dport),
            c.direction.to_string(),
            format_bytes(c.monotonic.sent_bytes),
            format_bytes(c.monotonic.recv_bytes),
            format_bytes(c.last.sent_bytes),
            protocols(c),
            flags(c),
        );
    }
    out
}

/// Prints one poll result to stdout.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
#[allow(clippy::print_stdout)]
pub fn print_connections(polled: &Connections, format: Format) -> anyhow::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(polled)?),
        Format::Table => {
            if polled.connections.is_empty() {
                println!("No connection changes.");
            } else {
                print!("{}", render_table(&polled.connections));
            }
        }
    }
    Ok(())
}

/// Prints the telemetry counters of a poll result as pretty JSON.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
#[allow(clippy::print_stdout)]
pub fn print_telemetry(polled: &Connections) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&polled.telemetry)?);
    Ok(())
}
