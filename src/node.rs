//! Instance addressing

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when parsing an `ip:port` address
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AddrParseError {
    #[error("address '{0}' is missing a port")]
    MissingPort(String),

    #[error("address '{0}' has an invalid port")]
    InvalidPort(String),

    #[error("address '{0}' has an empty host")]
    EmptyHost(String),
}

/// Network address of one engine instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr {
    /// Host IP (catalog records key sources by IP, never by hostname)
    pub ip: String,

    /// Service port
    pub port: u16,
}

impl NodeAddr {
    /// Create an address from its parts
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// File-system friendly form, used for staging and lock paths
    pub fn slug(&self) -> String {
        format!("{}_{}", self.ip, self.port)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddrParseError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddrParseError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}
