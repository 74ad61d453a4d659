//! camwall-server: TCP ingest of raw YUV 4:2:0 camera streams
//!
//! Accepts up to N producers, decodes each stream to RGB and hands the
//! latest frame of every slot to a renderer. Ships with a headless
//! renderer that logs statistics and writes PNG snapshots, plus an admin
//! HTTP API for health, metrics and slot management.

pub mod admin;
pub mod cli;
pub mod config;
pub mod server;
pub mod snapshot;

pub use cli::Cli;
pub use config::{ConfigError, ServerConfig};
pub use server::IngestServer;
pub use snapshot::SnapshotRenderer;
