//! Kernel program and map definitions.
//!
//! Names and binary layouts shared with the BPF programs loaded by the
//! agent.

pub mod conntrack;
