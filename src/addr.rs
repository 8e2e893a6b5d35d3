use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Address family selector for [`dial`](crate::Connection::dial) and
/// [`listen`](crate::Listener::listen): `"tcp"` accepts either family,
/// `"tcp4"` / `"tcp6"` pin one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }

    fn admits(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Network> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(Error::Resolve {
                network: "tcp|tcp4|tcp6",
                addr: other.to_string(),
            }),
        }
    }
}

/// Resolves `host:port`, keeping only addresses of the requested family.
pub(crate) async fn resolve(network: Network, addr: &str) -> Result<SocketAddr> {
    let resolve_err = || Error::Resolve {
        network: network.as_str(),
        addr: addr.to_string(),
    };

    let mut candidates = tokio::net::lookup_host(addr).await.map_err(|_| resolve_err())?;
    candidates.find(|a| network.admits(a)).ok_or_else(resolve_err)
}
