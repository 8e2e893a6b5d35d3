use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::FlowTracker;
use crate::inject::HeaderTemplates;
use crate::segment::{LinkKind, SegmentMeta, TcpSegment};

/// One datagram as it crosses the endpoint boundary.
#[derive(Debug, Clone)]
pub(crate) struct Packet {
    pub payload: Bytes,
    pub peer: SocketAddr,
}

/// Where captured frames come from. Production wraps the live capture handle;
/// tests substitute a scripted source.
pub(crate) trait FrameSource: Send + 'static {
    /// Blocking read of the next frame. Returns `TimedOut` / `WouldBlock` when
    /// the poll timeout elapses without traffic.
    fn next_frame(&mut self) -> io::Result<&[u8]>;
}

/// The real capture facility.
pub(crate) struct LinkSource(pub Box<dyn DataLinkReceiver>);

impl FrameSource for LinkSource {
    fn next_frame(&mut self) -> io::Result<&[u8]> {
        self.0.next()
    }
}

/// Locates the interface that carries `local_ip`, the way the kernel's routing
/// decision already picked it.
pub(crate) fn find_interface(local_ip: IpAddr) -> Result<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.ips.iter().any(|net| net.ip() == local_ip))
        .ok_or(Error::NoSuitableInterface(local_ip))
}

pub(crate) fn link_kind(interface: &NetworkInterface) -> LinkKind {
    // BSD loopback devices use null framing; everything else speaks Ethernet
    let bsd = cfg!(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ));
    if bsd && interface.is_loopback() {
        LinkKind::Null
    } else {
        LinkKind::Ethernet
    }
}

/// Opens the live capture channel on `interface`.
pub(crate) fn open_capture(
    interface: &NetworkInterface,
    config: &Config,
) -> Result<(Box<dyn DataLinkSender>, Box<dyn DataLinkReceiver>)> {
    let channel_config = datalink::Config {
        read_buffer_size: config.snaplen,
        write_buffer_size: config.snaplen,
        read_timeout: Some(config.read_timeout),
        promiscuous: config.promiscuous,
        ..Default::default()
    };
    match datalink::channel(interface, channel_config) {
        Ok(Channel::Ethernet(tx, rx)) => Ok((tx, rx)),
        Ok(_) => Err(Error::CaptureOpen {
            iface: interface.name.clone(),
            source: io::Error::new(io::ErrorKind::Unsupported, "unsupported channel type"),
        }),
        Err(source) => Err(Error::CaptureOpen {
            iface: interface.name.clone(),
            source,
        }),
    }
}

/// Admits only segments of the shadowed conversation. This is the capture
/// facility's BPF expression expressed as a userspace predicate: destination
/// must be our kernel-side local address, and a dialed connection additionally
/// pins the source to the dialed remote.
pub(crate) struct SegmentFilter {
    local: SocketAddr,
    remote: Option<SocketAddr>,
}

impl SegmentFilter {
    pub fn for_connection(local: SocketAddr, remote: SocketAddr) -> SegmentFilter {
        SegmentFilter {
            local,
            remote: Some(remote),
        }
    }

    pub fn for_listener(local: SocketAddr) -> SegmentFilter {
        SegmentFilter { local, remote: None }
    }

    pub fn admits(&self, meta: &SegmentMeta) -> bool {
        if meta.dst_port != self.local.port() {
            return false;
        }
        if !self.local.ip().is_unspecified() && meta.network.dst_ip() != self.local.ip() {
            return false;
        }
        match self.remote {
            Some(remote) => meta.network.src_ip() == remote.ip() && meta.src_port == remote.port(),
            None => true,
        }
    }
}

/// The background task that shadows the kernel's TCP conversation: it consumes
/// captured frames, keeps per-flow counters current, captures the header
/// templates from the first admitted frame, and forwards data-bearing segments
/// to the receive queue.
pub(crate) struct CaptureLoop {
    pub source: Box<dyn FrameSource>,
    pub link_kind: LinkKind,
    pub filter: SegmentFilter,
    pub tracker: Arc<dyn FlowTracker>,
    pub templates: Arc<OnceLock<HeaderTemplates>>,
    pub ready: watch::Sender<bool>,
    pub queue: mpsc::Sender<Packet>,
    pub shutdown: watch::Receiver<bool>,
}

impl CaptureLoop {
    /// Moves the loop onto a blocking task. The capture read is a blocking
    /// facility, so the loop lives on the blocking pool and re-enters the
    /// runtime through `handle` whenever it needs to wait on the queue.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || self.run(handle))
    }

    fn run(mut self, handle: Handle) {
        debug!("capture loop running");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let frame = match self.source.next_frame() {
                Ok(frame) => frame,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("capture source failed: {}", e);
                    break;
                }
            };

            let Some(segment) = TcpSegment::parse(frame, self.link_kind) else {
                trace!(len = frame.len(), "dropping unparsable frame");
                continue;
            };
            if !self.filter.admits(&segment.meta) {
                continue;
            }

            let meta = segment.meta;
            let payload = if meta.is_psh() {
                Bytes::copy_from_slice(segment.payload)
            } else {
                Bytes::new()
            };

            if self.on_segment(meta, payload, &handle).is_break() {
                break;
            }
        }
        debug!("capture loop exiting");
    }

    fn on_segment(&self, meta: SegmentMeta, payload: Bytes, handle: &Handle) -> ControlFlow<()> {
        let peer = meta.peer();

        // the remote's cumulative ACK is exactly the next sequence number we
        // should emit; for a new flow its sequence number seeds our ack
        self.tracker.observe(peer, meta.seq, meta.ack);

        if self.templates.get().is_none() && self.templates.set(HeaderTemplates::reversed_from(&meta)).is_ok() {
            debug!(?peer, "header templates captured, endpoint ready");
            let _ = self.ready.send(true);
        }

        if meta.is_syn() {
            self.tracker.advance_ack(peer, 1);
        } else if meta.is_psh() {
            self.tracker.advance_ack(peer, payload.len() as u32);
            trace!(?peer, len = payload.len(), "datagram received");

            let mut shutdown = self.shutdown.clone();
            let queue = &self.queue;
            let delivered = handle.block_on(async move {
                tokio::select! {
                    sent = queue.send(Packet { payload, peer }) => sent.is_ok(),
                    _ = shutdown.wait_for(|stopped| *stopped) => false,
                }
            });
            if !delivered {
                return ControlFlow::Break(());
            }
        } else if meta.is_fin() {
            debug!(?peer, "FIN observed, dropping flow");
            self.tracker.remove_flow(peer);
        }

        ControlFlow::Continue(())
    }
}
