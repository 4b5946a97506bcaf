//! Session Mesh Server Library
//!
//! A master/slave multiplayer session server. Slaves host bounded game
//! sessions for players over TCP and UDP; the master ranks slaves by reported
//! health and routes players to them.
//!
//! # Features
//!
//! - `metrics_http` - Prometheus endpoint on `metrics_port` (enabled by default)
//! - `dos_ratelimit` - Flood detection on inbound TCP traffic (enabled by default)

pub mod config;
pub mod metrics;
pub mod net;
pub mod node;
pub mod session;
