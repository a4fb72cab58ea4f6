//! The capability set the SOCKS5 server performs its outbound I/O through.

use std::net::SocketAddr;

use async_trait::async_trait;
use slog::debug;

use crate::{
    dialer::{Network, PacketSession, TunnelConnection, TunnelDialer},
    error::Result,
};

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: Network, addr: &str) -> Result<TunnelConnection>;

    /// Returns the session and the peer every write on it goes to.
    async fn dial_udp(&self, network: Network, addr: &str) -> Result<(PacketSession, SocketAddr)>;

    fn addr(&self) -> &str;
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<TunnelConnection> {
        TunnelDialer::dial(self, network, addr).await
    }

    async fn dial_udp(&self, network: Network, addr: &str) -> Result<(PacketSession, SocketAddr)> {
        self.dial_packet(network, addr).await
    }

    fn addr(&self) -> &str {
        TunnelDialer::addr(self)
    }
}

/// Chooses a dialer per destination and dials through it.
#[async_trait]
pub trait Proxy: Send + Sync {
    type Dialer: Dialer;

    async fn dial<'a>(
        &'a self,
        network: Network,
        addr: &str,
    ) -> Result<(TunnelConnection, &'a Self::Dialer)>;

    async fn dial_udp<'a>(
        &'a self,
        network: Network,
        addr: &str,
    ) -> Result<(PacketSession, &'a Self::Dialer, SocketAddr)>;

    fn next_dialer(&self, dst_addr: &str) -> &Self::Dialer;

    fn record(&self, dialer: &Self::Dialer, success: bool);
}

/// A proxy with exactly one upstream: no chaining, no balancing, and outcomes
/// are only logged.
pub struct RelayAdapter {
    dialer: TunnelDialer,
    logger: slog::Logger,
}

impl RelayAdapter {
    pub fn new(dialer: TunnelDialer, logger: slog::Logger) -> Self {
        RelayAdapter { dialer, logger }
    }
}

#[async_trait]
impl Proxy for RelayAdapter {
    type Dialer = TunnelDialer;

    async fn dial<'a>(
        &'a self,
        network: Network,
        addr: &str,
    ) -> Result<(TunnelConnection, &'a TunnelDialer)> {
        let dialer = self.next_dialer(addr);
        let result = Dialer::dial(dialer, network, addr).await;
        self.record(dialer, result.is_ok());
        Ok((result?, dialer))
    }

    async fn dial_udp<'a>(
        &'a self,
        network: Network,
        addr: &str,
    ) -> Result<(PacketSession, &'a TunnelDialer, SocketAddr)> {
        let dialer = self.next_dialer(addr);
        let result = dialer.dial_udp(network, addr).await;
        self.record(dialer, result.is_ok());
        let (session, peer) = result?;
        Ok((session, dialer, peer))
    }

    fn next_dialer(&self, dst_addr: &str) -> &TunnelDialer {
        debug!(self.logger, "next dialer"; "dst_addr" => dst_addr);
        &self.dialer
    }

    fn record(&self, _dialer: &TunnelDialer, success: bool) {
        debug!(self.logger, "dial outcome"; "success" => success);
    }
}
