//! `sockscope replay`: feed a captured event file through the tracer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use sockscope_common::config::TracerConfig;
use sockscope_common::types::ClientId;
use sockscope_ebpf::sources::JsonLinesSource;
use sockscope_tracer::{Connections, service};
use tokio::sync::watch;

use crate::output::{self, Format};

/// Arguments for the `replay` command.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Newline-delimited JSON connection events.
    #[arg(long)]
    pub events: PathBuf,

    /// Client identity the result is polled as.
    #[arg(long, default_value = "replay")]
    pub client: String,

    /// Output format.
    #[arg(long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Print tracer telemetry after the table.
    #[arg(long)]
    pub telemetry: bool,
}

/// Executes the `replay` command.
///
/// # Errors
///
/// Returns an error if the capture cannot be read or the tracer cannot be
/// built.
pub async fn execute(args: ReplayArgs, config: TracerConfig) -> anyhow::Result<()> {
    let polled = replay(&args.events, &ClientId::new(args.client), config).await?;
    output::print_connections(&polled, args.format)?;
    if args.telemetry && args.format == Format::Table {
        output::print_telemetry(&polled)?;
    }
    Ok(())
}

/// Ingests the whole capture, then polls once as `client`.
async fn replay(events: &Path, client: &ClientId, config: TracerConfig) -> anyhow::Result<Connections> {
    let source = JsonLinesSource::open(events)
        .with_context(|| format!("cannot replay {}", events.display()))?;
    let tracer = super::build_tracer(config)?;
    tracer.register_client(client);

    let (_shutdown, shutdown_rx) = watch::channel(false);
    let report = service::run(Arc::clone(&tracer), Box::new(source), shutdown_rx).await?;
    tracing::info!(
        events = report.events,
        parse_errors = report.parse_errors,
        "replay finished"
    );

    let polled = super::poll(&tracer, client).await?;
    tracer.close();
    Ok(polled)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const CAPTURE: &str = r#"# curl against a TLS endpoint, then a reset
{"kind":"new","tuple":{"source":"192.0.2.10","dest":"198.51.100.7","sport":40000,"dport":443,"type":"tcp"},"counters":{"sent_bytes":517,"sent_packets":1}}
{"kind":"update","tuple":{"source":"192.0.2.10","dest":"198.51.100.7","sport":40000,"dport":443,"type":"tcp"},"counters":{"sent_bytes":900,"recv_bytes":4000,"sent_packets":3,"recv_packets":4}}
not an event
{"kind":"failure","tuple":{"source":"192.0.2.10","dest":"198.51.100.8","sport":40001,"dport":80,"type":"tcp"},"failure_code":104}
{"kind":"close","tuple":{"source":"192.0.2.10","dest":"198.51.100.8","sport":40001,"dport":80,"type":"tcp"}}
"#;

    fn config() -> TracerConfig {
        TracerConfig {
            enable_conntrack: false,
            ..TracerConfig::default()
        }
    }

    #[tokio::test]
    async fn replay_skips_bad_lines_and_reports_every_connection() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{CAPTURE}").expect("write");

        let polled = replay(file.path(), &ClientId::new("test"), config())
            .await
            .expect("replay");

        assert_eq!(polled.connections.len(), 2);
        let tls = polled
            .connections
            .iter()
            .find(|c| c.tuple.dport == 443)
            .expect("tls connection");
        assert_eq!(tls.monotonic.sent_bytes, 900);
        assert_eq!(tls.monotonic.recv_bytes, 4000);
        let reset = polled
            .connections
            .iter()
            .find(|c| c.tuple.dport == 80)
            .expect("reset connection");
        assert!(reset.is_closed);
        assert!(!reset.tcp_failures.is_empty());
        assert_eq!(polled.telemetry.events_ingested, 4);
    }

    #[tokio::test]
    async fn missing_capture_fails() {
        let err = replay(Path::new("/nonexistent/events.jsonl"), &ClientId::new("test"), config())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("cannot replay"));
    }
}
