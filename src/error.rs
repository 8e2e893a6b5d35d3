use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Errors surfaced by endpoint construction and the packet-conn operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The `host:port` string did not resolve to an address of the requested family.
    #[error("failed to resolve {addr:?} as a {network} address")]
    Resolve { network: &'static str, addr: String },

    /// No link-layer interface carries the local IP the kernel routed through.
    #[error("no interface is assigned the local address {0}")]
    NoSuitableInterface(IpAddr),

    /// Opening the live capture channel on the selected interface failed.
    #[error("failed to open capture on interface {iface}: {source}")]
    CaptureOpen {
        iface: String,
        #[source]
        source: io::Error,
    },

    /// The kernel-side TCP (or route-probe UDP) socket could not be set up.
    #[error("kernel socket: {0}")]
    KernelSocket(#[source] io::Error),

    /// Handing a crafted frame to the link-layer injection facility failed.
    #[error("failed to inject frame: {0}")]
    Inject(#[source] io::Error),

    /// A [`Config`](crate::Config) field is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The endpoint has been closed.
    #[error("endpoint is closed")]
    Closed,

    /// Deadlines are not supported by this transport.
    #[error("operation not implemented")]
    NotImplemented,
}

pub type Result<T> = std::result::Result<T, Error>;
