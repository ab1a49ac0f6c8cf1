use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("frame too large: len is {len} but the limit is {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("link closed")]
    LinkClosed,
    #[error("tunnel {0} overran its receive window")]
    WindowExceeded(crate::protocol::TunnelId),
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            Error::LinkClosed => io::Error::from(io::ErrorKind::BrokenPipe),
            e => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
        }
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
