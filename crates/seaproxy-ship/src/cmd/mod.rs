use std::net::SocketAddr;

use clap::Parser;

/// Ship half of seaproxy: an explicit HTTP proxy for local user agents that
/// forwards every request over the single link to the offshore server.
#[derive(Debug, Parser)]
#[command(name = "seaproxy-ship", version)]
pub struct Args {
    /// Bind address for the local proxy listener.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Address of the offshore server on the far side of the link.
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub server: SocketAddr,

    /// Log level: off, error, warn, info, debug, trace.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Colour log output.
    #[arg(long)]
    pub colored: bool,
}
