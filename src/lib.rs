//! Packet-oriented pseudo-datagram transport riding on real TCP connections.
//!
//! A [`Connection`] (dialing side) or [`Listener`] (accepting side) lets the
//! kernel perform a genuine TCP handshake, so every NAT and firewall on path
//! sees an ordinary connection, then takes the conversation over: incoming
//! segments are sniffed at link layer to track per-peer sequence/acknowledgment
//! counters, outgoing datagrams are injected as hand-crafted `PSH|ACK` segments
//! with valid checksums, and the kernel's own transmissions are neutralized so
//! they never reach the remote. The result feels like UDP with message
//! boundaries, but traverses networks that only admit TCP.
//!
//! There is no reliability layer: no retransmission, no reordering, no
//! congestion control, and deadlines are not implemented. Callers who need
//! those bring their own, exactly as they would over UDP.
//!
//! ```no_run
//! # async fn run() -> tcpgram::Result<()> {
//! let server = tcpgram::Listener::listen("tcp", "192.0.2.10:9000").await?;
//! let client = tcpgram::Connection::dial("tcp", "192.0.2.10:9000").await?;
//!
//! client.send_to(b"ping", "192.0.2.10:9000".parse().unwrap()).await?;
//!
//! let mut buf = [0u8; 1500];
//! let (n, peer) = server.recv_from(&mut buf).await?;
//! server.send_to(&buf[..n], peer).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Capturing and injecting raw frames requires elevated privileges
//! (`CAP_NET_RAW` or root on Linux).

mod addr;
mod capture;
mod config;
mod conn;
mod endpoint;
mod error;
mod flow;
mod inject;
mod kernel;
mod listener;
mod segment;

#[cfg(test)]
mod test_util;

pub use addr::Network;
pub use config::Config;
pub use conn::Connection;
pub use error::{Error, Result};
pub use listener::Listener;
