//! leakless - a local SOCKS5 proxy whose own name resolution is carried
//! through the same upstream path as the traffic it relays.

pub mod cli;
pub mod config;
pub mod dialer;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod packet;
pub mod relay;
pub mod socks;

pub use cli::Cli;
pub use config::Config;
pub use dialer::{DirectTransport, Network, PacketSession, Transport, TunnelConnection, TunnelDialer};
pub use dns::{LeakProofResolver, ResolverConfig};
pub use endpoint::{resolve, Endpoint, LiteralOnly, NameResolver};
pub use error::{Error, Result};
pub use relay::{Dialer, Proxy, RelayAdapter};
