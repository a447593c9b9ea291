//! # sockscope-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire Sockscope workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the connection identity and counter
//! primitives that the event source, the tracer core and the CLI share.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
