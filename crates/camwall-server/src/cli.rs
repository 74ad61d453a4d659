//! Command line interface

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use camwall_core::ChannelOrder;

use crate::config::ServerConfig;

/// camwall-server: show up to N raw YUV 4:2:0 camera streams side by side
#[derive(Debug, Default, Parser)]
#[command(name = "camwall-server", version, about)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long, env = "CAMWALL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Producer listen address
    #[arg(short = 'l', long)]
    pub listen_addr: Option<SocketAddr>,

    /// Number of concurrent producer slots
    #[arg(short = 'n', long)]
    pub slots: Option<usize>,

    /// Largest accepted frame (Y plane plus both chroma planes), in bytes
    #[arg(long)]
    pub max_frame_bytes: Option<usize>,

    /// Largest accepted width or height
    #[arg(long)]
    pub max_dimension: Option<u32>,

    /// Seconds a producer may stay silent before its slot is freed (0 = never)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Output pixel order: rgb or legacy-grb
    #[arg(long)]
    pub channel_order: Option<ChannelOrder>,

    /// Admin HTTP address (health, readiness, metrics, slots)
    #[arg(long, conflicts_with = "no_admin")]
    pub admin_addr: Option<SocketAddr>,

    /// Disable the admin HTTP server
    #[arg(long)]
    pub no_admin: bool,

    /// Directory to write per-slot PNG snapshots into
    #[arg(long)]
    pub snapshot_dir: Option<PathBuf>,

    /// Seconds between PNG snapshots of a slot
    #[arg(long)]
    pub snapshot_interval_secs: Option<u64>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    pub log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Cli {
    /// Overlay explicitly given flags onto `config`.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(slots) = self.slots {
            config.slots = slots;
        }
        if let Some(bytes) = self.max_frame_bytes {
            config.max_frame_bytes = bytes;
        }
        if let Some(dimension) = self.max_dimension {
            config.max_dimension = dimension;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout_secs = secs;
        }
        if let Some(order) = self.channel_order {
            config.channel_order = order;
        }
        if self.no_admin {
            config.admin_addr = None;
        } else if let Some(addr) = self.admin_addr {
            config.admin_addr = Some(addr);
        }
        if let Some(dir) = &self.snapshot_dir {
            config.snapshot_dir = Some(dir.clone());
        }
        if let Some(secs) = self.snapshot_interval_secs {
            config.snapshot_interval_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}
