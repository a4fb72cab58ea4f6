//! Command line definition.

use clap::{builder::PossibleValuesParser, Parser};

/// SOCKS5 proxy whose own DNS lookups travel through the tunnel.
#[derive(Debug, Parser)]
#[command(name = "leakless")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Custom DNS server, queried through the tunnel (e.g. 8.8.8.8:53)
    #[arg(long, value_name = "IP:PORT")]
    pub dns: Option<String>,

    /// Log level (debug|info|warn|error)
    #[arg(long, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    /// Upstream connect timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub connect_timeout: u64,

    /// Local SOCKS5 listen address (e.g. 127.0.0.1:1080)
    pub listen: Option<String>,
}
