//! SOCKS5 UDP request header:
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```

use std::net::{IpAddr, SocketAddr};

use anyhow::bail;
use compact_str::CompactString;

use crate::socks::{Address, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

pub struct Datagram<'a> {
    address: Address,
    port: u16,
    pub data: &'a [u8],
}

impl<'a> Datagram<'a> {
    pub fn decode(buf: &'a [u8]) -> anyhow::Result<Self> {
        if buf.len() < 4 {
            bail!("datagram too short: {} bytes", buf.len());
        }
        if buf[2] != 0 {
            bail!("fragmented datagram: frag={}", buf[2]);
        }
        let rest = &buf[4..];
        let (address, rest) = match buf[3] {
            ATYP_IPV4 => {
                let (ip, rest) = split(rest, 4)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(ip);
                (Address::IPv4(octets), rest)
            }
            ATYP_IPV6 => {
                let (ip, rest) = split(rest, 16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip);
                (Address::IPv6(octets), rest)
            }
            ATYP_DOMAIN => {
                let (len, rest) = split(rest, 1)?;
                let (domain, rest) = split(rest, len[0] as usize)?;
                (Address::Domain(CompactString::from_utf8_lossy(domain)), rest)
            }
            x => bail!("unknown address type: {x}"),
        };
        let (port, data) = split(rest, 2)?;
        Ok(Datagram {
            address,
            port: u16::from_be_bytes([port[0], port[1]]),
            data,
        })
    }

    pub fn target(&self) -> String {
        self.address.target(self.port)
    }
}

fn split(buf: &[u8], n: usize) -> anyhow::Result<(&[u8], &[u8])> {
    if buf.len() < n {
        bail!("datagram truncated");
    }
    Ok(buf.split_at(n))
}

/// Prefixes `data` with a header naming `from` as its source.
pub fn encode(from: SocketAddr, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22 + data.len());
    buf.extend_from_slice(&[0, 0, 0]);
    match from.ip() {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&from.port().to_be_bytes());
    buf.extend_from_slice(data);
    buf
}
