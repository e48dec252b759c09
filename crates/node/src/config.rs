//! Command-line configuration for pricemeshd.

use clap::Parser;
use std::path::PathBuf;

/// pricemeshd - distributed price oracle node
#[derive(Parser, Debug, Clone)]
#[command(name = "pricemeshd")]
#[command(about = "Aggregates price observations across a peer cluster")]
pub struct Config {
    /// Multiaddrs to listen on
    #[arg(short, long, default_value = "/ip4/0.0.0.0/tcp/0")]
    pub listen: Vec<String>,

    /// Bootstrap peers (multiaddrs with /p2p/ peer ids, comma-separated)
    #[arg(long, value_delimiter = ',', env = "PRICEMESH_BOOTSTRAP")]
    pub bootstrap: Vec<String>,

    /// Settings file path (defaults to the XDG config dir)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Data directory for keys and the result store
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Disable mDNS discovery
    #[arg(long)]
    pub no_mdns: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
