use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};

use anyhow::bail;
use compact_str::CompactString;
use smallvec::smallvec;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::socks::{
    Address, Bytes, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, COMMAND_CONNECT, COMMAND_UDP_ASSOCIATE,
    SOCKS5,
};

#[repr(u8)]
enum AuthMethod {
    None = 0x00,
    NoAcceptableMethods = 0xff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Granted = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        match err {
            Error::ResolutionFailed(_) | Error::DialTimeout(_) => Status::HostUnreachable,
            Error::Io(e) if e.kind() == ErrorKind::ConnectionRefused => Status::ConnectionRefused,
            _ => Status::GeneralFailure,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown address type: {0}")]
struct UnknownAddressType(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

#[derive(Debug)]
pub struct Request {
    pub command: Command,
    address: Address,
    port: u16,
}

impl Request {
    pub fn target(&self) -> String {
        self.address.target(self.port)
    }
}

/// Runs method negotiation and reads the client's request. Unsupported
/// commands are refused on the wire before an error is returned.
pub async fn handle(
    reader: &mut (impl AsyncBufRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    n_auth: u8,
) -> anyhow::Result<Request> {
    negotiate_auth(reader, writer, n_auth).await?;
    let (command, address, port) = match read_request(reader).await {
        Ok(request) => request,
        Err(e) => {
            let status = if e.is::<UnknownAddressType>() {
                Status::AddressTypeNotSupported
            } else {
                Status::GeneralFailure
            };
            write_response(writer, status, None).await?;
            return Err(e);
        }
    };
    let command = match command {
        COMMAND_CONNECT => Command::Connect,
        COMMAND_UDP_ASSOCIATE => Command::UdpAssociate,
        x => {
            write_response(writer, Status::CommandNotSupported, None).await?;
            bail!("command not supported: {x}");
        }
    };
    Ok(Request {
        command,
        address,
        port,
    })
}

async fn read_available_methods(
    reader: &mut (impl AsyncBufRead + Unpin),
    n_auth: u8,
) -> anyhow::Result<Bytes> {
    let mut buf = smallvec![0u8; n_auth as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_server_choice(
    writer: &mut (impl AsyncWrite + Unpin),
    chosen_auth_method: AuthMethod,
) -> anyhow::Result<()> {
    writer.write_all(&[SOCKS5, chosen_auth_method as u8]).await?;
    Ok(())
}

async fn negotiate_auth(
    reader: &mut (impl AsyncBufRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    n_auth: u8,
) -> anyhow::Result<()> {
    let methods = read_available_methods(reader, n_auth).await?;

    if methods.contains(&(AuthMethod::None as u8)) {
        write_server_choice(writer, AuthMethod::None).await?;
        return Ok(());
    }

    write_server_choice(writer, AuthMethod::NoAcceptableMethods).await?;
    bail!("no acceptable auth methods")
}

async fn read_request(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> anyhow::Result<(u8, Address, u16)> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    if head[0] != SOCKS5 {
        bail!("request is not SOCKS5");
    }
    let command = head[1];
    let address = match head[3] {
        ATYP_IPV4 => {
            let mut ipv4_buf = [0u8; 4];
            reader.read_exact(&mut ipv4_buf).await?;
            Address::IPv4(ipv4_buf)
        }
        ATYP_IPV6 => {
            let mut ipv6_buf = [0u8; 16];
            reader.read_exact(&mut ipv6_buf).await?;
            Address::IPv6(ipv6_buf)
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await?;
            let mut buf: Bytes = smallvec![0u8; len as usize];
            reader.read_exact(&mut buf).await?;
            Address::Domain(CompactString::from_utf8_lossy(&buf))
        }
        x => return Err(UnknownAddressType(x).into()),
    };
    let port = reader.read_u16().await?;
    Ok((command, address, port))
}

/// Writes a reply carrying `bound`, or the zero IPv4 address when there is
/// nothing meaningful to report.
pub async fn write_response(
    writer: &mut (impl AsyncWrite + Unpin),
    status: Status,
    bound: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let mut buf: Bytes = smallvec![SOCKS5, status as u8, 0x00];
    match bound {
        Some(addr) => {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    buf.push(ATYP_IPV4);
                    buf.extend_from_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    buf.push(ATYP_IPV6);
                    buf.extend_from_slice(&ip.octets());
                }
            }
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        #[rustfmt::skip]
        None => buf.extend_from_slice(&[
            ATYP_IPV4,              // address type
            0x00, 0x00, 0x00, 0x00, // IPv4 address
            0x00, 0x00,             // port
        ]),
    }
    writer.write_all(&buf).await?;
    Ok(())
}
