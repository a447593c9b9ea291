//! `sockscope watch`: track events from stdin and print periodic deltas.

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use sockscope_common::config::TracerConfig;
use sockscope_common::types::ClientId;
use sockscope_ebpf::sources::JsonLinesSource;
use sockscope_tracer::service;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::output::{self, Format};

/// Arguments for the `watch` command.
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Seconds between two polls.
    #[arg(short, long, default_value_t = 5)]
    pub interval: u64,

    /// Client identity to poll as. A random one is used when omitted.
    #[arg(long)]
    pub client: Option<String>,

    /// Output format.
    #[arg(long, value_enum, default_value_t = Format::Table)]
    pub format: Format,
}

/// Executes the `watch` command.
///
/// Runs until stdin ends or Ctrl-C, then prints a final poll.
///
/// # Errors
///
/// Returns an error if the tracer cannot be built or the event stream
/// breaks.
pub async fn execute(args: WatchArgs, config: TracerConfig) -> anyhow::Result<()> {
    let tracer = super::build_tracer(config)?;
    let client = ClientId::new(
        args.client
            .unwrap_or_else(|| format!("cli-{}", Uuid::new_v4())),
    );
    tracer.register_client(&client);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let source = JsonLinesSource::new(BufReader::new(std::io::stdin()));
    let mut ingest = tokio::spawn(service::run(Arc::clone(&tracer), Box::new(source), shutdown_rx));

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let report = loop {
        tokio::select! {
            joined = &mut ingest => {
                break joined.context("ingest task failed")??;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("cannot listen for Ctrl-C")?;
                tracing::info!("interrupted, stopping");
                let _ = shutdown.send(true);
                break (&mut ingest).await.context("ingest task failed")??;
            }
            _ = ticker.tick() => {
                output::print_connections(&super::poll(&tracer, &client).await?, args.format)?;
            }
        }
    };

    tracing::info!(
        events = report.events,
        parse_errors = report.parse_errors,
        exhausted = report.source_exhausted,
        "watch finished"
    );
    output::print_connections(&super::poll(&tracer, &client).await?, args.format)?;
    let _ = tracer.unregister_client(&client);
    tracer.close();
    Ok(())
}
