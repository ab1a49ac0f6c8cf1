use std::io;

use meshlink_core::address::Address;
use meshlink_core::protocol::ErrorInfo;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] meshlink_core::error::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("authentication failed for {0}")]
    AuthFailed(String),
    #[error("node {0} is already connected")]
    DuplicateNode(String),
    #[error("no route to {0}")]
    NoRoute(String),
    #[error("no such component: {0}")]
    NoSuchComponent(Address),
    #[error("component {0} already exists")]
    ComponentExists(Address),
    #[error("unsupported component type: {kind} in {name}")]
    UnsupportedComponent { kind: String, name: Address },
    #[error("invalid options for {name}: {reason}")]
    InvalidOptions { name: Address, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("mesh is shut down")]
    Shutdown,
}

impl Error {
    /// The form this error takes when it ends a tunnel.
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::from_error(self)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
