use std::time::Duration;

use crate::error::{Error, Result};

/// Capture tuning for an endpoint.
///
/// The defaults mirror what the transport needs in practice; most callers never
/// touch this and go through [`Connection::dial`](crate::Connection::dial) /
/// [`Listener::listen`](crate::Listener::listen).
#[derive(Debug, Clone)]
pub struct Config {
    /// Snapshot length for the live capture. Frames longer than this are
    /// truncated by the capture facility before we ever see them, so it must
    /// exceed the largest segment the conversation can carry.
    pub snaplen: usize,

    /// Poll timeout of the blocking capture read. This bounds how long the
    /// capture task can go without observing the shutdown signal, so it is
    /// also the worst-case latency of tearing the task down on close.
    pub read_timeout: Duration,

    /// Whether the capture handle is opened in promiscuous mode.
    pub promiscuous: bool,

    /// Capacity of the bounded receive queue between the capture task and
    /// `recv_from`. When it fills up, the capture task blocks (and with it
    /// frame consumption) until the application drains packets.
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            snaplen: 65536,
            read_timeout: Duration::from_secs(1),
            promiscuous: true,
            queue_capacity: 256,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.snaplen < 128 {
            return Err(Error::InvalidConfig("snaplen is too small to hold a TCP segment"));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::InvalidConfig("read timeout must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue capacity must be non-zero"));
        }
        Ok(())
    }
}
