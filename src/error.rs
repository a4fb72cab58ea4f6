use std::{io, net::SocketAddr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("dial {0} timed out")]
    DialTimeout(SocketAddr),

    #[error("bad dns address: {0}")]
    BadDnsAddress(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
