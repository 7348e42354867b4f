//! Cellgrid Host Library
//!
//! A real-time authoritative client/server framework: text-framed RPC over a
//! reliable stream plus datagrams, an entity/component registry with
//! subscription-scoped replication, and cell-grid interest management.
//!
//! # Features
//!
//! - `metrics_http` - Prometheus-compatible metrics endpoint (enabled by default)
//! - `minimal` - Build without optional features for testing/debugging

pub mod config;
pub mod grid;
pub mod host;
pub mod log;
pub mod metrics;
pub mod net;
pub mod persistence;
pub mod util;
pub mod world;
