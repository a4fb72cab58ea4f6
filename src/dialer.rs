use std::{
    fmt,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use slog::{debug, info};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, UdpSocket},
};

use crate::{
    endpoint::{resolve, NameResolver},
    error::{Error, Result},
    packet::{PacketStream, StreamPacket},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub trait AsyncSocket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T> AsyncSocket for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An open connection to the upstream, owned by a single relayed session.
pub type TunnelConnection = Box<dyn AsyncSocket>;

/// A tunnel connection used as a packet channel to its one peer.
pub type PacketSession = StreamPacket<TunnelConnection>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// The path every outbound byte takes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, network: Network, addr: SocketAddr) -> io::Result<TunnelConnection>;
}

/// Connects through the host network stack, which is where the tunnel
/// interface is expected to sit.
pub struct DirectTransport;

#[async_trait]
impl Transport for DirectTransport {
    async fn connect(&self, network: Network, addr: SocketAddr) -> io::Result<TunnelConnection> {
        match network {
            Network::Tcp => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Network::Udp => {
                let bind: SocketAddr = if addr.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(addr).await?;
                Ok(Box::new(PacketStream::new(socket, addr)))
            }
        }
    }
}

/// Opens upstream connections for `host:port` destinations, resolving names
/// through the resolver it was built with.
#[derive(Clone)]
pub struct TunnelDialer {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn NameResolver>,
    connect_timeout: Duration,
    logger: slog::Logger,
}

impl TunnelDialer {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn NameResolver>,
        logger: slog::Logger,
    ) -> Self {
        TunnelDialer {
            transport,
            resolver,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            logger,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub async fn dial(&self, network: Network, addr: &str) -> Result<TunnelConnection> {
        info!(self.logger, "dial"; "network" => %network, "addr" => addr);
        let target = resolve(addr, &*self.resolver, &self.logger).await?;
        self.connect(network, target).await
    }

    /// Dials `addr` and wraps the connection so it can stand in for a packet
    /// channel whose only peer is the resolved address.
    pub async fn dial_packet(
        &self,
        network: Network,
        addr: &str,
    ) -> Result<(PacketSession, SocketAddr)> {
        info!(self.logger, "dial packet"; "network" => %network, "addr" => addr);
        let peer = resolve(addr, &*self.resolver, &self.logger).await?;
        let conn = self.connect(network, peer).await?;
        Ok((StreamPacket::new(conn, peer), peer))
    }

    /// The dialer has no local address of its own.
    pub fn addr(&self) -> &str {
        ""
    }

    async fn connect(&self, network: Network, target: SocketAddr) -> Result<TunnelConnection> {
        debug!(self.logger, "connecting"; "network" => %network, "target" => %target);
        match tokio::time::timeout(self.connect_timeout, self.transport.connect(network, target))
            .await
        {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(Error::DialTimeout(target)),
        }
    }
}
