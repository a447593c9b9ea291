//! Event source implementations.
//!
//! [`ChannelSource`] is fed in-process by the probe reader thread.
//! [`JsonLinesSource`] replays one JSON-encoded [`ConnEvent`] per line, as
//! written by `sockscope replay` captures or piped on stdin.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use sockscope_common::error::{Result, SockscopeError};

use crate::events::{ConnEvent, EventSource, SourcePoll};

/// Event source backed by an in-process channel.
///
/// The source is exhausted once every sender has been dropped.
#[derive(Debug)]
pub struct ChannelSource {
    rx: Receiver<ConnEvent>,
}

/// Creates a connected sender and source pair.
#[must_use]
pub fn channel_source() -> (Sender<ConnEvent>, ChannelSource) {
    let (tx, rx) = mpsc::channel();
    (tx, ChannelSource { rx })
}

impl EventSource for ChannelSource {
    fn poll_event(&mut self, timeout: Duration) -> Result<SourcePoll> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(SourcePoll::Event(Box::new(event))),
            Err(RecvTimeoutError::Timeout) => Ok(SourcePoll::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(SourcePoll::Exhausted),
        }
    }
}

/// Event source reading newline-delimited JSON events.
///
/// Blank lines and lines starting with `#` are skipped. Reads block until
/// a full line is available, so the poll timeout is not honoured.
#[derive(Debug)]
pub struct JsonLinesSource<R> {
    reader: R,
    line: String,
    line_no: u64,
}

impl<R: BufRead + Send> JsonLinesSource<R> {
    /// Wraps a buffered reader.
    pub const fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
        }
    }
}

impl JsonLinesSource<BufReader<File>> {
    /// Opens an event capture file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| SockscopeError::EventSource {
            message: format!("cannot open {}: {e}", path.display()),
        })?;
        tracing::debug!(path = %path.display(), "opened event capture");
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead + Send> EventSource for JsonLinesSource<R> {
    fn poll_event(&mut self, _timeout: Duration) -> Result<SourcePoll> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .map_err(|e| SockscopeError::EventSource {
                    message: format!("read failed after line {}: {e}", self.line_no),
                })?;
            if read == 0 {
                return Ok(SourcePoll::Exhausted);
            }
            self.line_no += 1;

            let trimmed = self.line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return serde_json::from_str::<ConnEvent>(trimmed)
                .map(|event| SourcePoll::Event(Box::new(event)))
                .map_err(|e| SockscopeError::Parse {
                    what: "connection event",
                    message: format!("line {}: {e}", self.line_no),
                });
        }
    }
}
