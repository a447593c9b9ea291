//! # sockscope-ebpf
//!
//! The kernel-facing boundary of the Sockscope connection tracker.
//!
//! - **Events**: the raw connection event record produced by the probe
//!   layer, and the [`EventSource`](events::EventSource) trait the tracer
//!   drains.
//! - **Sources**: an in-process channel source and a JSON-lines source for
//!   replaying captured event streams.
//! - **Conntrack map**: the key layout shared with the in-kernel conntrack
//!   program and, with the `ebpf` feature, a reader for its pinned map.
//!
//! The probe programs themselves are loaded by the agent outside this crate.

pub mod conntrack_map;
pub mod events;
pub mod programs;
pub mod sources;

pub use events::{ConnEvent, ConnEventKind, CounterMode, EventSource, SourcePoll};
