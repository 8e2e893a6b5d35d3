use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener as KernelListener;
use tracing::{debug, info};

use crate::addr::{resolve, Network};
use crate::capture::{self, LinkSource, SegmentFilter};
use crate::config::Config;
use crate::endpoint::EndpointCore;
use crate::error::{Error, Result};
use crate::flow::FlowTable;
use crate::inject::LinkSink;
use crate::kernel;

/// The accepting side of pseudo-datagram conversations.
///
/// One `Listener` shadows arbitrarily many inbound kernel TCP connections on a
/// single port, keeping a `(seq, ack)` pair per remote peer. Datagrams from
/// all peers arrive through the same `recv_from`; `send_to` picks the flow of
/// the addressed peer.
///
/// The link- and network-layer header templates are captured from the first
/// segment the listener observes, from whichever peer that is. All peers must
/// therefore share the same interface path, which holds for single-NIC
/// deployments.
pub struct Listener {
    core: EndpointCore,
    flows: Arc<FlowTable>,
}

impl Listener {
    /// Listens on `addr` (`"host:port"`, concrete host) over `network`
    /// (`"tcp"`, `"tcp4"` or `"tcp6"`).
    pub async fn listen(network: &str, addr: &str) -> Result<Listener> {
        Listener::listen_with_config(network, addr, Config::default()).await
    }

    pub async fn listen_with_config(network: &str, addr: &str, config: Config) -> Result<Listener> {
        config.validate()?;
        let network: Network = network.parse()?;
        let requested = resolve(network, addr).await?;

        let interface = capture::find_interface(requested.ip())?;
        let link_kind = capture::link_kind(&interface);
        let (inject_tx, capture_rx) = capture::open_capture(&interface, &config)?;
        debug!(iface = %interface.name, "capture open");

        let kernel_listener = KernelListener::bind(requested).await.map_err(Error::KernelSocket)?;
        let local_addr = kernel_listener.local_addr().map_err(Error::KernelSocket)?;
        info!(%local_addr, "listening for shadowed connections");

        let flows = Arc::new(FlowTable::new());
        let core = EndpointCore::start(
            local_addr,
            Box::new(LinkSource(capture_rx)),
            Box::new(LinkSink(inject_tx)),
            link_kind,
            SegmentFilter::for_listener(local_addr),
            flows.clone(),
            config.queue_capacity,
        );
        kernel::spawn_accept_loop(kernel_listener, core.shutdown_signal());

        Ok(Listener { core, flows })
    }

    /// Receives the next datagram from any peer, returning the byte count and
    /// the sender. A payload larger than `buf` is truncated silently.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.core.recv_from(buf).await
    }

    /// Sends `payload` as a single crafted TCP segment to `peer`, using that
    /// peer's flow counters.
    ///
    /// A peer without a flow (never observed, or already FIN'd) gets
    /// zero-valued counters; the remote will almost certainly reject such a
    /// segment, which is a caller error this side does not signal. Concurrent
    /// callers get unique sequence numbers but unspecified wire order.
    pub async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> Result<usize> {
        self.core.wait_ready().await?;
        let flow = self.flows.snapshot(peer);
        self.core.emit(peer, flow, payload)?;
        self.flows
            .with_flow(peer, |flow| flow.seq = flow.seq.wrapping_add(payload.len() as u32));
        Ok(payload.len())
    }

    /// The kernel-side listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    /// The peers with a live flow, i.e. those observed since their last FIN.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.flows.peers()
    }

    /// Shuts the endpoint down: pending and future reads and writes fail with
    /// [`Error::Closed`], the capture task winds down, and the kernel listener
    /// is released. Idempotent.
    pub fn close(&self) {
        if self.core.begin_close() {
            debug!(local_addr = %self.core.local_addr(), "listener closed");
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

impl Drop for Listener {
    fn drop(&mut self) {
        self.core.begin_close();
    }
}

#[cfg(test)]
impl Listener {
    /// A listener running against an in-memory wire instead of a live capture
    /// handle and kernel listener.
    pub(crate) fn for_testing(
        local: SocketAddr,
        source: Box<dyn crate::capture::FrameSource>,
        sink: Box<dyn crate::inject::FrameSink>,
    ) -> Listener {
        let flows = Arc::new(FlowTable::new());
        let core = EndpointCore::start(
            local,
            source,
            sink,
            crate::segment::LinkKind::Ethernet,
            SegmentFilter::for_listener(local),
            flows.clone(),
            16,
        );
        Listener { core, flows }
    }
}
