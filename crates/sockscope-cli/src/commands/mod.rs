//! CLI command definitions and dispatch.

pub mod conntrack;
pub mod replay;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sockscope_common::config::TracerConfig;
use sockscope_common::types::ClientId;
use sockscope_tracer::{Connections, Tracer, TracerBuilder};

/// Sockscope: connection tracking with per-client deltas.
#[derive(Parser, Debug)]
#[command(name = "sockscope", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// YAML tracer configuration. Missing keys keep their defaults.
    #[arg(long, global = true, env = "SOCKSCOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disable NAT resolution regardless of the configuration.
    #[arg(long, global = true)]
    pub no_nat: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Feed a captured event file through the tracer and print the result.
    Replay(replay::ReplayArgs),
    /// Track events read from stdin, printing deltas periodically.
    Watch(watch::WatchArgs),
    /// Query the conntrack backends directly.
    Conntrack(conntrack::ConntrackArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the command fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Replay(args) => replay::execute(args, config).await,
        Command::Watch(args) => watch::execute(args, config).await,
        Command::Conntrack(args) => conntrack::execute(&args, &config),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<TracerConfig> {
    let mut config = match &cli.config {
        Some(path) => TracerConfig::from_yaml_file(path)
            .with_context(|| format!("cannot load {}", path.display()))?,
        None => TracerConfig::default(),
    };
    if cli.no_nat {
        config.enable_conntrack = false;
    }
    Ok(config)
}

/// Builds a tracer with the host's default backends.
fn build_tracer(config: TracerConfig) -> anyhow::Result<Arc<Tracer>> {
    let tracer = TracerBuilder::new(config)
        .build()
        .context("cannot initialize the tracer (use --no-nat without conntrack access)")?;
    Ok(Arc::new(tracer))
}

/// Polls `client` on the blocking pool.
///
/// A poll may sleep through NAT retry backoffs, which must not stall the
/// runtime's worker threads.
async fn poll(tracer: &Arc<Tracer>, client: &ClientId) -> anyhow::Result<Connections> {
    let tracer = Arc::clone(tracer);
    let client = client.clone();
    tokio::task::spawn_blocking(move || tracer.get_connections(&client))
        .await
        .context("poll task failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["sockscope", "replay", "--events", "events.jsonl", "--no-nat", "--log-json"])
            .expect("parse");
        assert!(cli.no_nat);
        assert!(cli.log_json);
        assert!(matches!(cli.command, Command::Replay(_)));
    }

    #[test]
    fn no_nat_overrides_config() {
        let cli = Cli::try_parse_from(["sockscope", "--no-nat", "watch"]).expect("parse");
        let config = load_config(&cli).expect("config");
        assert!(!config.enable_conntrack);
    }

    #[tokio::test]
    async fn poll_runs_off_the_async_workers() {
        let tracer = build_tracer(TracerConfig {
            enable_conntrack: false,
            ..TracerConfig::default()
        })
        .expect("tracer");
        let polled = poll(&tracer, &ClientId::new("cli-test")).await.expect("poll");
        assert!(polled.connections.is_empty());
        assert_eq!(tracer.client_count(), 1);
    }

    #[test]
    fn missing_config_file_is_reported() {
        let cli = Cli::try_parse_from(["sockscope", "--config", "/nonexistent/sockscope.yaml", "watch"])
            .expect("parse");
        let err = load_config(&cli).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/sockscope.yaml"));
    }
}
