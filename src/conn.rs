use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::addr::{resolve, Network};
use crate::capture::{self, LinkSource, SegmentFilter};
use crate::config::Config;
use crate::endpoint::EndpointCore;
use crate::error::{Error, Result};
use crate::flow::AtomicFlow;
use crate::inject::LinkSink;
use crate::kernel;

/// The dialing side of a pseudo-datagram conversation.
///
/// `dial` lets the kernel establish a real TCP connection (so NAT and firewall
/// state exists on path), then shadows it: incoming segments are sniffed at
/// link layer to maintain the `(seq, ack)` pair, and every `send_to` injects a
/// hand-crafted PSH|ACK segment that is indistinguishable from ordinary TCP
/// traffic to any on-path observer.
pub struct Connection {
    core: EndpointCore,
    flow: Arc<AtomicFlow>,
}

impl Connection {
    /// Connects to `addr` (`"host:port"`) over `network` (`"tcp"`, `"tcp4"` or
    /// `"tcp6"`).
    pub async fn dial(network: &str, addr: &str) -> Result<Connection> {
        Connection::dial_with_config(network, addr, Config::default()).await
    }

    pub async fn dial_with_config(network: &str, addr: &str, config: Config) -> Result<Connection> {
        config.validate()?;
        let network: Network = network.parse()?;
        let remote = resolve(network, addr).await?;

        // a throwaway connected UDP socket makes the kernel's routing decision
        // reveal the egress interface and local address a real connection will
        // get
        let local_hint = kernel::probe_route(remote).await?;
        let interface = capture::find_interface(local_hint.ip())?;
        let link_kind = capture::link_kind(&interface);
        let (inject_tx, capture_rx) = capture::open_capture(&interface, &config)?;
        debug!(iface = %interface.name, %remote, "capture open");

        let stream = kernel::connect_from(local_hint, remote).await?;
        let local_addr = stream.local_addr().map_err(Error::KernelSocket)?;
        kernel::neutralize(&stream);
        info!(%local_addr, %remote, "shadowed kernel connection established");

        let flow = Arc::new(AtomicFlow::new());
        let core = EndpointCore::start(
            local_addr,
            Box::new(LinkSource(capture_rx)),
            Box::new(LinkSink(inject_tx)),
            link_kind,
            SegmentFilter::for_connection(local_addr, remote),
            flow.clone(),
            config.queue_capacity,
        );
        kernel::spawn_drain(stream, core.shutdown_signal());

        Ok(Connection { core, flow })
    }

    /// Receives the next datagram, returning the byte count and the sender.
    /// A payload larger than `buf` is truncated silently.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.core.recv_from(buf).await
    }

    /// Sends `payload` as a single crafted TCP segment.
    ///
    /// The first call blocks until the capture side has seen the remote's
    /// SYN-ACK and populated the header templates. Concurrent callers get
    /// unique sequence numbers, but their wire order is unspecified; callers
    /// that need an ordered stream must serialize their writes.
    pub async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> Result<usize> {
        self.core.wait_ready().await?;
        let flow = self.flow.snapshot();
        self.core.emit(peer, flow, payload)?;
        self.flow.advance_seq(payload.len() as u32);
        Ok(payload.len())
    }

    /// The kernel-side local address of the shadowed connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    /// Shuts the endpoint down: pending and future reads and writes fail with
    /// [`Error::Closed`], the capture task winds down, and the kernel socket
    /// is released. Idempotent.
    pub fn close(&self) {
        if self.core.begin_close() {
            debug!(local_addr = %self.core.local_addr(), "connection closed");
        }
    }

    pub fn set_deadline(&self, _deadline: Instant) -> Result<()> {
        Err(Error::NotImplemented)
    }

    pub fn set_read_deadline(&self, _deadline: Instant) -> Result<()> {
        Err(Error::NotImplemented)
    }

    pub fn set_write_deadline(&self, _deadline: Instant) -> Result<()> {
        Err(Error::NotImplemented)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.core.begin_close();
    }
}

#[cfg(test)]
impl Connection {
    /// A connection running against an in-memory wire instead of a live
    /// capture handle and kernel socket.
    pub(crate) fn for_testing(
        local: SocketAddr,
        remote: SocketAddr,
        source: Box<dyn crate::capture::FrameSource>,
        sink: Box<dyn crate::inject::FrameSink>,
    ) -> Connection {
        let flow = Arc::new(AtomicFlow::new());
        let core = EndpointCore::start(
            local,
            source,
            sink,
            crate::segment::LinkKind::Ethernet,
            SegmentFilter::for_connection(local, remote),
            flow.clone(),
            16,
        );
        Connection { core, flow }
    }
}
