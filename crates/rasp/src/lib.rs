//! Reference host for the RASP evaluation engine.
//!
//! Loads configuration, wires the engine's sinks to JSON-lines output and
//! drives checks from the command line.

pub mod config;
pub mod replay;
pub mod sinks;
