use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::capture::{CaptureLoop, FrameSource, Packet, SegmentFilter};
use crate::error::{Error, Result};
use crate::flow::{FlowTracker, TcpFlow};
use crate::inject::{FrameSink, HeaderTemplates, Injector, OutboundSegment};
use crate::segment::LinkKind;

/// Everything a dialed connection and a listener have in common: the receive
/// queue, the one-shot ready and shutdown signals, the frozen header templates
/// and the injection path.
pub(crate) struct EndpointCore {
    local_addr: SocketAddr,
    templates: Arc<OnceLock<HeaderTemplates>>,
    injector: Injector,
    queue: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    ready: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl EndpointCore {
    /// Wires up the shared machinery and starts the capture loop.
    pub fn start(
        local_addr: SocketAddr,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        link_kind: LinkKind,
        filter: SegmentFilter,
        tracker: Arc<dyn FlowTracker>,
        queue_capacity: usize,
    ) -> EndpointCore {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        let templates = Arc::new(OnceLock::new());

        CaptureLoop {
            source,
            link_kind,
            filter,
            tracker,
            templates: templates.clone(),
            ready: ready_tx,
            queue: queue_tx,
            shutdown: shutdown_rx,
        }
        .spawn();

        EndpointCore {
            local_addr,
            templates,
            injector: Injector::new(sink),
            queue: tokio::sync::Mutex::new(queue_rx),
            ready: ready_rx,
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A fresh observer of the shutdown signal, for the kernel-side tasks.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// One-shot close guard. Returns `true` to exactly one caller, which then
    /// owns the teardown; everyone else observes the already-closed state.
    pub fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown.send(true);
        true
    }

    /// Dequeues the next datagram, copying at most `buf.len()` bytes of its
    /// payload. A payload larger than the buffer is truncated silently,
    /// UDP-style.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut shutdown = self.shutdown.subscribe();
        let mut queue = self.queue.lock().await;
        tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => Err(Error::Closed),
            packet = queue.recv() => match packet {
                Some(packet) => {
                    let n = buf.len().min(packet.payload.len());
                    buf[..n].copy_from_slice(&packet.payload[..n]);
                    Ok((n, packet.peer))
                }
                // the capture side is gone for good
                None => Err(Error::Closed),
            }
        }
    }

    /// Blocks until the first captured frame has populated the header
    /// templates. Nothing can be emitted before that.
    pub async fn wait_ready(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut ready = self.ready.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => return Err(Error::Closed),
            observed = ready.wait_for(|ready| *ready) => {
                if observed.is_err() {
                    // the capture loop died before anything arrived
                    return Err(Error::Closed);
                }
            }
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Emits one PSH|ACK segment towards `peer` with the given counters. Only
    /// valid once [`wait_ready`](Self::wait_ready) has returned.
    pub fn emit(&self, peer: SocketAddr, flow: TcpFlow, payload: &[u8]) -> Result<()> {
        let templates = self
            .templates
            .get()
            .expect("templates are populated before the ready signal fires");
        let segment = OutboundSegment {
            src_port: self.local_addr.port(),
            dst_port: peer.port(),
            seq: flow.seq,
            ack: flow.ack,
            // the remote engine ignores the advertised window
            window: rand::thread_rng().gen(),
        };
        self.injector.send_segment(templates, segment, payload)
    }
}
