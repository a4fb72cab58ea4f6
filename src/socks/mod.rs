mod server;
mod socks5;
mod udp;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use compact_str::CompactString;

pub use server::Server;

const SOCKS5: u8 = 5;

const COMMAND_CONNECT: u8 = 0x01;
const COMMAND_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

type Bytes = smallvec::SmallVec<[u8; 32]>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Address {
    IPv4([u8; 4]),
    IPv6([u8; 16]),
    Domain(CompactString),
}

impl Address {
    /// Formats the destination as the `host:port` string dialers take.
    fn target(&self, port: u16) -> String {
        match self {
            Address::IPv4(ip) => SocketAddr::from((Ipv4Addr::from(*ip), port)).to_string(),
            Address::IPv6(ip) => SocketAddr::from((Ipv6Addr::from(*ip), port)).to_string(),
            Address::Domain(d) => format!("{d}:{port}"),
        }
    }
}
