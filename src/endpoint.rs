//! Parsing and resolution of `host:port` destinations.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use compact_str::CompactString;
use slog::debug;

use crate::error::{Error, Result};

/// A destination as written by a client, before any resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: CompactString,
    pub port: u16,
}

impl Endpoint {
    /// Splits `addr` on its last colon.
    ///
    /// A bracketed host (`[::1]:53`) has its brackets stripped. A bare IPv6
    /// literal is still split on the last colon, so `::1:53` reads as host
    /// `::1` and port 53.
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::MalformedAddress(format!("missing port in '{addr}'")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::MalformedAddress(format!("invalid port in '{addr}'")))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(Error::MalformedAddress(format!("missing host in '{addr}'")));
        }
        Ok(Endpoint {
            host: CompactString::from(host),
            port,
        })
    }

    pub fn literal_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

/// A name-resolution service.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Returns every address found for `host`, in preference order.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver that knows no names at all. Used by dialers that must only ever
/// reach literal addresses, such as the one carrying DNS queries.
pub struct LiteralOnly;

#[async_trait]
impl NameResolver for LiteralOnly {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        Err(Error::ResolutionFailed(format!(
            "'{host}' is not an IP address"
        )))
    }
}

/// Turns `addr` into a socket address, consulting `resolver` only when the
/// host is not already an IP literal.
pub async fn resolve(
    addr: &str,
    resolver: &dyn NameResolver,
    logger: &slog::Logger,
) -> Result<SocketAddr> {
    let endpoint = Endpoint::parse(addr)?;
    let ip = match endpoint.literal_ip() {
        Some(ip) => ip,
        None => resolver
            .lookup_ip(&endpoint.host)
            .await
            .map_err(|e| match e {
                Error::ResolutionFailed(_) => e,
                other => Error::ResolutionFailed(format!("{}: {other}", endpoint.host)),
            })?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::ResolutionFailed(format!("no addresses found for '{}'", endpoint.host))
            })?,
    };
    // upstreams expect plain IPv4 rather than the ::ffff:a.b.c.d form
    let ip = ip.to_canonical();
    debug!(logger, "resolved"; "addr" => addr, "ip" => %ip, "port" => endpoint.port);
    Ok(SocketAddr::new(ip, endpoint.port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        answer: Result<Vec<IpAddr>>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(answer: Result<Vec<IpAddr>>) -> Self {
            Fixed {
                answer,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NameResolver for Fixed {
        async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.answer {
                Ok(ips) => Ok(ips.clone()),
                Err(_) => Err(Error::ResolutionFailed(host.to_string())),
            }
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn parse_splits_on_last_colon() {
        let ep = Endpoint::parse("example.org:443").unwrap();
        assert_eq!(ep.host, "example.org");
        assert_eq!(ep.port, 443);

        let ep = Endpoint::parse("::1:53").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 53);

        let ep = Endpoint::parse("[2001:db8::1]:8080").unwrap();
        assert_eq!(ep.literal_ip(), Some("2001:db8::1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn parse_rejects_missing_or_bad_port() {
        for addr in ["example.org", "example.org:http", "1.2.3.4:70000", ":80", "1.2.3.4:"] {
            assert!(
                matches!(Endpoint::parse(addr), Err(Error::MalformedAddress(_))),
                "{addr}"
            );
        }
    }

    #[tokio::test]
    async fn literal_ips_skip_the_resolver() {
        let resolver = Fixed::new(Ok(vec![]));
        let log = logger();

        let addr = resolve("93.184.216.34:80", &resolver, &log).await.unwrap();
        assert_eq!(addr, "93.184.216.34:80".parse::<SocketAddr>().unwrap());

        let addr = resolve("[::1]:53", &resolver, &log).await.unwrap();
        assert_eq!(addr.ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn names_resolve_to_the_first_answer() {
        let resolver = Fixed::new(Ok(vec![
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        ]));
        let addr = resolve("example.org:80", &resolver, &logger()).await.unwrap();
        assert_eq!(addr, "10.0.0.1:80".parse::<SocketAddr>().unwrap());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mapped_ipv4_is_normalized() {
        let mapped = Ipv4Addr::new(192, 0, 2, 7).to_ipv6_mapped();
        let resolver = Fixed::new(Ok(vec![IpAddr::V6(mapped)]));
        let addr = resolve("example.org:80", &resolver, &logger()).await.unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));

        let addr = resolve("::ffff:192.0.2.8:80", &resolver, &logger())
            .await
            .unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 8)));
    }

    #[tokio::test]
    async fn empty_or_failed_lookups_are_resolution_failures() {
        let empty = Fixed::new(Ok(vec![]));
        assert!(matches!(
            resolve("example.org:80", &empty, &logger()).await,
            Err(Error::ResolutionFailed(_))
        ));

        let failing = Fixed::new(Err(Error::ResolutionFailed(String::new())));
        assert!(matches!(
            resolve("example.org:80", &failing, &logger()).await,
            Err(Error::ResolutionFailed(_))
        ));

        assert!(matches!(
            resolve("example.org:80", &LiteralOnly, &logger()).await,
            Err(Error::ResolutionFailed(_))
        ));
    }

    #[tokio::test]
    async fn malformed_input_never_reaches_the_resolver() {
        let resolver = Fixed::new(Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]));
        assert!(matches!(
            resolve("example.org:dns", &resolver, &logger()).await,
            Err(Error::MalformedAddress(_))
        ));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }
}
