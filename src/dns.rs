//! Name resolution whose queries travel through the tunnel.
//!
//! Every lookup opens its own packet session with [`TunnelDialer`], so DNS
//! traffic takes the same path as the traffic it resolves names for.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{Name, RData, Record, RecordType},
};
use slog::{debug, warn};
use tokio::time::Instant;

use crate::{
    dialer::{Network, PacketSession, TunnelDialer},
    endpoint::{Endpoint, NameResolver},
    error::{Error, Result},
    packet::{recv_from, send_to},
};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ATTEMPTS: usize = 2;

const MAX_MESSAGE_SIZE: usize = 4096;

/// Where DNS queries are sent. Fixed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverConfig {
    /// Use the nameservers the host is configured with, reached through the
    /// tunnel.
    Implicit,
    /// Use one nameserver given as `ip:port`.
    Fixed(SocketAddr),
}

impl ResolverConfig {
    /// Builds the configuration from the optional `--dns` value. The value
    /// must be a literal IP and a numeric port.
    pub fn from_flag(dns: Option<&str>) -> Result<Self> {
        let Some(dns) = dns else {
            return Ok(ResolverConfig::Implicit);
        };
        let endpoint = Endpoint::parse(dns)
            .map_err(|_| Error::BadDnsAddress(format!("expected ip:port, got '{dns}'")))?;
        let ip = endpoint
            .literal_ip()
            .ok_or_else(|| Error::BadDnsAddress(format!("'{}' is not an IP address", endpoint.host)))?;
        Ok(ResolverConfig::Fixed(SocketAddr::new(ip, endpoint.port)))
    }
}

pub struct LeakProofResolver {
    dialer: TunnelDialer,
    nameservers: Vec<SocketAddr>,
    query_timeout: Duration,
    attempts: usize,
    logger: slog::Logger,
}

impl LeakProofResolver {
    /// `dialer` must be able to reach the nameservers without resolving any
    /// names itself.
    pub fn new(dialer: TunnelDialer, config: ResolverConfig, logger: slog::Logger) -> Self {
        let nameservers = match config {
            ResolverConfig::Fixed(addr) => vec![addr],
            ResolverConfig::Implicit => system_nameservers(&logger),
        };
        Self::with_nameservers(dialer, nameservers, logger)
    }

    pub fn with_nameservers(
        dialer: TunnelDialer,
        nameservers: Vec<SocketAddr>,
        logger: slog::Logger,
    ) -> Self {
        LeakProofResolver {
            dialer,
            nameservers,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            logger,
        }
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn nameservers(&self) -> &[SocketAddr] {
        &self.nameservers
    }

    async fn lookup_via(&self, nameserver: SocketAddr, name: &Name) -> Result<Vec<IpAddr>> {
        let (mut session, peer) = self
            .dialer
            .dial_packet(Network::Udp, &nameserver.to_string())
            .await?;
        let ips = self.query(&mut session, peer, name, RecordType::A).await?;
        if !ips.is_empty() {
            return Ok(ips);
        }
        self.query(&mut session, peer, name, RecordType::AAAA).await
    }

    async fn query(
        &self,
        session: &mut PacketSession,
        peer: SocketAddr,
        name: &Name,
        record_type: RecordType,
    ) -> Result<Vec<IpAddr>> {
        let id: u16 = rand::random();
        let mut request = Message::new();
        request
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        request.add_query(Query::query(name.clone(), record_type));
        let request = request
            .to_vec()
            .map_err(|e| Error::ResolutionFailed(format!("{name}: {e}")))?;

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        for attempt in 0..self.attempts {
            debug!(self.logger, "dns query";
                "name" => %name, "type" => %record_type, "server" => %peer, "attempt" => attempt);
            send_to(session, &request, peer).await?;

            let deadline = Instant::now() + self.query_timeout;
            loop {
                let n = match tokio::time::timeout_at(deadline, recv_from(session, &mut buf)).await {
                    Ok(received) => received?.0,
                    Err(_) => break,
                };
                if n == 0 {
                    return Err(Error::ResolutionFailed(format!(
                        "{name}: {peer} closed the session"
                    )));
                }
                let Ok(reply) = Message::from_vec(&buf[..n]) else {
                    continue;
                };
                if reply.id() != id || reply.message_type() != MessageType::Response {
                    continue;
                }
                return match reply.response_code() {
                    ResponseCode::NoError => Ok(addresses(reply.answers())),
                    ResponseCode::NXDomain => Ok(Vec::new()),
                    code => Err(Error::ResolutionFailed(format!("{name}: {code}"))),
                };
            }
        }
        Err(Error::ResolutionFailed(format!("{name}: no reply from {peer}")))
    }
}

#[async_trait]
impl NameResolver for LeakProofResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let mut name =
            Name::from_ascii(host).map_err(|e| Error::ResolutionFailed(format!("{host}: {e}")))?;
        name.set_fqdn(true);

        let mut last_err = None;
        for &nameserver in &self.nameservers {
            match self.lookup_via(nameserver, &name).await {
                Ok(ips) => {
                    debug!(self.logger, "lookup done"; "host" => host, "server" => %nameserver, "found" => ips.len());
                    return Ok(ips);
                }
                Err(e) => {
                    warn!(self.logger, "lookup failed"; "host" => host, "server" => %nameserver, "err" => %e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::ResolutionFailed(format!("{host}: no nameservers configured"))
        }))
    }
}

fn addresses(answers: &[Record]) -> Vec<IpAddr> {
    answers
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

fn system_nameservers(logger: &slog::Logger) -> Vec<SocketAddr> {
    match hickory_resolver::system_conf::read_system_conf() {
        Ok((config, _)) => {
            let mut addrs: Vec<SocketAddr> = Vec::new();
            for ns in config.name_servers() {
                if !addrs.contains(&ns.socket_addr) {
                    addrs.push(ns.socket_addr);
                }
            }
            if !addrs.is_empty() {
                return addrs;
            }
        }
        Err(err) => {
            warn!(logger, "failed to read system resolver config"; "err" => %err);
        }
    }
    vec![
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53),
        SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 53),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::{TunnelConnection, Transport};
    use crate::endpoint::{resolve, LiteralOnly};
    use hickory_proto::rr::rdata::{A, AAAA};
    use std::io;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Every connection lands on a fake nameserver that knows a single host.
    #[derive(Default)]
    struct FakeTunnel {
        dials: Mutex<Vec<(Network, SocketAddr)>>,
    }

    async fn serve_dns(mut remote: DuplexStream) {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            let n = match remote.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let request = Message::from_vec(&buf[..n]).unwrap();
            let query = request.queries()[0].clone();
            let mut reply = Message::new();
            reply
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query);
            reply.add_query(query.clone());
            if *query.name() != Name::from_ascii("example.org.").unwrap() {
                reply.set_response_code(ResponseCode::NXDomain);
            } else if query.query_type() == RecordType::A {
                reply.add_answer(Record::from_rdata(
                    query.name().clone(),
                    60,
                    RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
                ));
            } else if query.query_type() == RecordType::AAAA {
                reply.add_answer(Record::from_rdata(
                    query.name().clone(),
                    60,
                    RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
                ));
            }
            if remote.write_all(&reply.to_vec().unwrap()).await.is_err() {
                return;
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTunnel {
        async fn connect(
            &self,
            network: Network,
            addr: SocketAddr,
        ) -> io::Result<TunnelConnection> {
            self.dials.lock().unwrap().push((network, addr));
            let (local, remote) = tokio::io::duplex(MAX_MESSAGE_SIZE);
            tokio::spawn(serve_dns(remote));
            Ok(Box::new(local))
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn dns_dialer(tunnel: Arc<FakeTunnel>) -> TunnelDialer {
        TunnelDialer::new(tunnel, Arc::new(LiteralOnly), logger())
    }

    #[test]
    fn dns_flag_requires_literal_ip_and_port() {
        assert_eq!(ResolverConfig::from_flag(None).unwrap(), ResolverConfig::Implicit);
        assert_eq!(
            ResolverConfig::from_flag(Some("8.8.8.8:53")).unwrap(),
            ResolverConfig::Fixed("8.8.8.8:53".parse().unwrap())
        );
        for bad in ["example.com:53", "8.8.8.8:dns", "8.8.8.8", "8.8.8.8:65536"] {
            assert!(
                matches!(ResolverConfig::from_flag(Some(bad)), Err(Error::BadDnsAddress(_))),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn implicit_mode_queries_only_through_the_tunnel() {
        let tunnel = Arc::new(FakeTunnel::default());
        let resolver = LeakProofResolver::new(
            dns_dialer(tunnel.clone()),
            ResolverConfig::Implicit,
            logger(),
        );

        let ips = resolver.lookup_ip("example.org").await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);

        let dials = tunnel.dials.lock().unwrap().clone();
        assert_eq!(dials.len(), 1);
        assert_eq!(dials[0].0, Network::Udp);
        assert!(resolver.nameservers().contains(&dials[0].1));
    }

    #[tokio::test]
    async fn fixed_mode_targets_the_configured_server() {
        let tunnel = Arc::new(FakeTunnel::default());
        let server: SocketAddr = "9.9.9.9:5353".parse().unwrap();
        let resolver = LeakProofResolver::new(
            dns_dialer(tunnel.clone()),
            ResolverConfig::Fixed(server),
            logger(),
        );

        let addr = resolve("example.org:443", &resolver, &logger()).await.unwrap();
        assert_eq!(addr, "93.184.216.34:443".parse::<SocketAddr>().unwrap());
        assert_eq!(tunnel.dials.lock().unwrap().clone(), vec![(Network::Udp, server)]);
    }

    #[tokio::test]
    async fn unknown_names_fail_to_resolve() {
        let tunnel = Arc::new(FakeTunnel::default());
        let resolver = LeakProofResolver::with_nameservers(
            dns_dialer(tunnel),
            vec!["10.0.0.53:53".parse().unwrap()],
            logger(),
        );

        assert!(resolver.lookup_ip("nowhere.invalid").await.unwrap().is_empty());
        assert!(matches!(
            resolve("nowhere.invalid:80", &resolver, &logger()).await,
            Err(Error::ResolutionFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_nameservers_time_out() {
        struct BlackHole(Mutex<Vec<DuplexStream>>);

        #[async_trait]
        impl Transport for BlackHole {
            async fn connect(&self, _: Network, _: SocketAddr) -> io::Result<TunnelConnection> {
                let (local, remote) = tokio::io::duplex(MAX_MESSAGE_SIZE);
                self.0.lock().unwrap().push(remote);
                Ok(Box::new(local))
            }
        }

        let dialer = TunnelDialer::new(
            Arc::new(BlackHole(Mutex::new(Vec::new()))),
            Arc::new(LiteralOnly),
            logger(),
        );
        let resolver = LeakProofResolver::with_nameservers(
            dialer,
            vec!["10.0.0.53:53".parse().unwrap()],
            logger(),
        )
        .with_query_timeout(Duration::from_secs(1));

        let started = Instant::now();
        assert!(matches!(
            resolver.lookup_ip("example.org").await,
            Err(Error::ResolutionFailed(_))
        ));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
