//! Daemon library crate.
//!
//! # Purpose
//! Exposes the daemon's subsystems (config, observability, the event
//! pipeline) for use by the binary and by tests.
pub mod config;
pub mod observability;
pub mod pipeline;
