//! Long-running ingestion and maintenance.
//!
//! Events are drained on a dedicated thread because sources block in
//! `poll_event`. Client reclaim and eviction run on a `tokio` interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use sockscope_common::error::{Result, SockscopeError};
use sockscope_ebpf::{EventSource, SourcePoll};
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::tracer::Tracer;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(10);

/// Summary of a [`run`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceReport {
    /// Events handed to the tracer.
    pub events: u64,
    /// Malformed records skipped.
    pub parse_errors: u64,
    /// Whether the source ended on its own.
    pub source_exhausted: bool,
}

#[derive(Debug, Default)]
struct Progress {
    stop: AtomicBool,
    events: AtomicU64,
    parse_errors: AtomicU64,
}

/// Feeds `source` into `tracer` until the source is exhausted or
/// `shutdown` turns true, running maintenance every
/// `maintenance_interval_secs`.
///
/// # Errors
///
/// Returns an error if the ingest thread cannot be started or the source
/// breaks. Malformed records are logged and skipped.
pub async fn run(
    tracer: Arc<Tracer>,
    source: Box<dyn EventSource>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ServiceReport> {
    let progress = Arc::new(Progress::default());
    let (done_tx, mut done_rx) = oneshot::channel();
    {
        let tracer = Arc::clone(&tracer);
        let progress = Arc::clone(&progress);
        let _ = std::thread::Builder::new()
            .name("sockscope-ingest".into())
            .spawn(move || {
                let _ = done_tx.send(ingest_loop(&tracer, source, &progress));
            })
            .map_err(|e| SockscopeError::EventSource {
                message: format!("cannot start ingest thread: {e}"),
            })?;
    }

    let period = tracer
        .config()
        .maintenance_interval()
        .max(MIN_MAINTENANCE_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    tracing::info!(interval = ?period, "tracer service started");

    loop {
        tokio::select! {
            finished = &mut done_rx => {
                return finish(finished, &progress);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let reclaimed = tracer.reclaim_expired_clients();
                let evicted = tracer.evict();
                tracing::debug!(reclaimed, evicted, tracked = tracer.len(), "maintenance pass");
            }
        }
    }

    tracing::info!("shutdown requested, stopping ingestion");
    progress.stop.store(true, Ordering::Release);
    match tokio::time::timeout(SHUTDOWN_GRACE, done_rx).await {
        Ok(finished) => finish(finished, &progress),
        Err(_) => {
            tracing::warn!("ingest thread still blocked in its source, detaching it");
            Ok(report(&progress, false))
        }
    }
}

fn finish(
    finished: std::result::Result<Result<bool>, oneshot::error::RecvError>,
    progress: &Progress,
) -> Result<ServiceReport> {
    match finished {
        Ok(Ok(exhausted)) => Ok(report(progress, exhausted)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SockscopeError::EventSource {
            message: "ingest thread terminated unexpectedly".into(),
        }),
    }
}

fn report(progress: &Progress, source_exhausted: bool) -> ServiceReport {
    ServiceReport {
        events: progress.events.load(Ordering::Acquire),
        parse_errors: progress.parse_errors.load(Ordering::Acquire),
        source_exhausted,
    }
}

/// Drains the source. Returns whether it was exhausted.
fn ingest_loop(tracer: &Tracer, mut source: Box<dyn EventSource>, progress: &Progress) -> Result<bool> {
    while !progress.stop.load(Ordering::Acquire) {
        match source.poll_event(POLL_TIMEOUT) {
            Ok(SourcePoll::Event(event)) => {
                tracer.ingest(&event);
                let _ = progress.events.fetch_add(1, Ordering::AcqRel);
            }
            Ok(SourcePoll::Idle) => {}
            Ok(SourcePoll::Exhausted) => {
                tracing::info!(
                    events = progress.events.load(Ordering::Acquire),
                    "event source exhausted"
                );
                return Ok(true);
            }
            Err(e @ SockscopeError::Parse { .. }) => {
                let _ = progress.parse_errors.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(error = %e, "skipping malformed event");
            }
            Err(e) => {
                tracing::error!(error = %e, "event source failed");
                return Err(e);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use sockscope_common::config::TracerConfig;
    use sockscope_common::types::{ConnType, ConnectionTuple};
    use sockscope_ebpf::sources::{JsonLinesSource, channel_source};
    use sockscope_ebpf::{ConnEvent, ConnEventKind};

    use super::*;
    use crate::builder::TracerBuilder;
    use crate::local::LocalAddrs;

    fn tracer() -> Arc<Tracer> {
        let config = TracerConfig {
            enable_conntrack: false,
            ..TracerConfig::default()
        };
        Arc::new(
            TracerBuilder::new(config)
                .local_addrs(LocalAddrs::default())
                .build()
                .expect("build"),
        )
    }

    fn event() -> ConnEvent {
        ConnEvent::new(
            ConnEventKind::New,
            ConnectionTuple::new(
                ConnType::Tcp,
                "192.0.2.1".parse().expect("ip"),
                40000,
                "198.51.100.7".parse().expect("ip"),
                80,
            ),
        )
    }

    #[tokio::test]
    async fn exhausted_source_ends_the_service() {
        let line = serde_json::to_string(&event()).expect("serialize");
        let input = format!("{line}\nnot json\n");
        let source = Box::new(JsonLinesSource::new(Cursor::new(input)));
        let (_tx, rx) = watch::channel(false);

        let tracer = tracer();
        let report = run(Arc::clone(&tracer), source, rx).await.expect("run");
        assert_eq!(report.events, 1);
        assert_eq!(report.parse_errors, 1);
        assert!(report.source_exhausted);
        assert_eq!(tracer.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_ingestion() {
        let (events, source) = channel_source();
        let (tx, rx) = watch::channel(false);
        let tracer = tracer();
        let handle = tokio::spawn(run(Arc::clone(&tracer), Box::new(source), rx));

        events.send(event()).expect("send");
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).expect("signal");

        let report = handle.await.expect("join").expect("run");
        assert!(!report.source_exhausted);
        assert_eq!(report.events, 1);
        assert_eq!(tracer.len(), 1);
    }
}
