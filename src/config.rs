//! Startup configuration, validated before anything listens.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use slog::o;

use crate::{
    cli::Cli,
    dialer::{Transport, TunnelDialer},
    dns::{LeakProofResolver, ResolverConfig},
    endpoint::LiteralOnly,
    relay::RelayAdapter,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub resolver: ResolverConfig,
    pub connect_timeout: Duration,
    pub log_level: slog::Level,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let listen = cli.listen.as_deref().context("missing listen address")?;
        let listen = listen
            .parse::<SocketAddr>()
            .with_context(|| format!("bad listen address '{listen}'"))?;
        let resolver = ResolverConfig::from_flag(cli.dns.as_deref())?;
        Ok(Config {
            listen,
            resolver,
            connect_timeout: Duration::from_secs(cli.connect_timeout),
            log_level: parse_level(&cli.log_level),
        })
    }

    /// Wires the dialer chain: relayed traffic resolves names through a
    /// resolver whose own queries go out over `transport` as well.
    pub fn build_proxy(&self, transport: Arc<dyn Transport>, logger: &slog::Logger) -> RelayAdapter {
        let dns_dialer = TunnelDialer::new(
            transport.clone(),
            Arc::new(LiteralOnly),
            logger.new(o!("component" => "dns")),
        )
        .with_connect_timeout(self.connect_timeout);
        let resolver = LeakProofResolver::new(
            dns_dialer,
            self.resolver,
            logger.new(o!("component" => "resolver")),
        );
        let dialer = TunnelDialer::new(transport, Arc::new(resolver), logger.clone())
            .with_connect_timeout(self.connect_timeout);
        RelayAdapter::new(dialer, logger.clone())
    }
}

fn parse_level(level: &str) -> slog::Level {
    match level {
        "debug" => slog::Level::Debug,
        "warn" => slog::Level::Warning,
        "error" => slog::Level::Error,
        _ => slog::Level::Info,
    }
}
