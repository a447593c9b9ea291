//! # sockscope-tracer
//!
//! Connection tracking core of the `sockscope` agent: a bounded table of
//! connection statistics fed by raw probe events, per-client delta views,
//! and best-effort enrichment (NAT translation, protocol, gateway subnet,
//! TCP failure reasons).
//!
//! Start with [`TracerBuilder`], feed events with [`Tracer::ingest`] or
//! [`service::run`], and poll with [`Tracer::get_connections`].

mod builder;
mod clients;
pub mod clock;
pub mod failure;
pub mod gateway;
pub mod local;
pub mod nat;
pub mod protocols;
pub mod service;
pub mod stats;
mod table;
pub mod telemetry;
mod tracer;

pub use builder::TracerBuilder;
pub use stats::{ConnectionStats, Connections};
pub use tracer::Tracer;
