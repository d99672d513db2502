use std::net::SocketAddr;

use clap::Parser;

/// Offshore half of seaproxy: accepts the single link from the ship and
/// performs the actual origin requests.
#[derive(Debug, Parser)]
#[command(name = "seaproxy-offshore", version)]
pub struct Args {
    /// Bind address for the link listener.
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub listen: SocketAddr,

    /// Log level: off, error, warn, info, debug, trace.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Colour log output.
    #[arg(long)]
    pub colored: bool,
}
