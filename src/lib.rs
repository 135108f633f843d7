//! llamaprox: supervisor daemon for a local llama.cpp inference server.
//!
//! The daemon supervises one `llama-server` process, tracks models and
//! their configuration in SQLite, samples host metrics, and exposes all of
//! it over REST and a realtime WebSocket channel. Every request is routed
//! through the [`supervisor`] bus to the subsystem that owns the method
//! prefix.

#[cfg(feature = "cli")]
pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod subsystems;
pub mod supervisor;
