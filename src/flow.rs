use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use rustc_hash::FxHashMap;

/// The sequence/acknowledgment pair tracked per remote peer.
///
/// `seq` is the next sequence number to place in an outbound segment; it is
/// refreshed from the remote's cumulative ACK on every captured segment and
/// advanced locally after a successful send. `ack` is the next remote sequence
/// number we acknowledge: the remote's ISN at flow creation, +1 per observed
/// SYN, +payload length per observed data segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TcpFlow {
    pub seq: u32,
    pub ack: u32,
}

/// How the capture loop publishes per-segment counter updates. The dialed
/// connection backs this with atomics for its single flow; the listener backs
/// it with the mutex-guarded flow table.
pub(crate) trait FlowTracker: Send + Sync + 'static {
    /// Called for every admitted segment: refresh `seq` from the remote's ACK
    /// field, and initialize `ack` from the remote's sequence number if this
    /// peer has no flow yet.
    fn observe(&self, peer: SocketAddr, tcp_seq: u32, tcp_ack: u32);

    /// Advance `ack` (by 1 for a SYN, by the payload length for a data segment).
    fn advance_ack(&self, peer: SocketAddr, by: u32);

    /// A FIN was observed from `peer`.
    fn remove_flow(&self, peer: SocketAddr);
}

/// Lock-free counters for the single flow of a dialed connection.
pub(crate) struct AtomicFlow {
    seq: AtomicU32,
    ack: AtomicU32,
    initialized: AtomicBool,
}

impl AtomicFlow {
    pub fn new() -> AtomicFlow {
        AtomicFlow {
            seq: AtomicU32::new(0),
            ack: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> TcpFlow {
        TcpFlow {
            seq: self.seq.load(Ordering::SeqCst),
            ack: self.ack.load(Ordering::SeqCst),
        }
    }

    pub fn advance_seq(&self, by: u32) {
        self.seq.fetch_add(by, Ordering::SeqCst);
    }
}

impl FlowTracker for AtomicFlow {
    fn observe(&self, _peer: SocketAddr, tcp_seq: u32, tcp_ack: u32) {
        self.seq.store(tcp_ack, Ordering::SeqCst);
        if !self.initialized.swap(true, Ordering::SeqCst) {
            self.ack.store(tcp_seq, Ordering::SeqCst);
        }
    }

    fn advance_ack(&self, _peer: SocketAddr, by: u32) {
        self.ack.fetch_add(by, Ordering::SeqCst);
    }

    fn remove_flow(&self, _peer: SocketAddr) {
        // the dialed connection keeps its flow until close
    }
}

/// Per-peer flow table of a listener. One mutex guards the map; every
/// read-modify-write happens under it.
pub(crate) struct FlowTable {
    flows: Mutex<FxHashMap<SocketAddr, TcpFlow>>,
}

impl FlowTable {
    pub fn new() -> FlowTable {
        FlowTable {
            flows: Mutex::new(FxHashMap::default()),
        }
    }

    /// Runs `f` on the peer's flow under the table lock, creating a
    /// zero-initialized entry if the peer is unknown.
    pub fn with_flow<R>(&self, peer: SocketAddr, f: impl FnOnce(&mut TcpFlow) -> R) -> R {
        let mut flows = self.flows.lock().expect("flow table mutex poisoned");
        f(flows.entry(peer).or_default())
    }

    /// Current counters for `peer`; zero for an unknown peer (a write to such a
    /// peer is a caller error that the remote will reject, not something we
    /// signal).
    pub fn snapshot(&self, peer: SocketAddr) -> TcpFlow {
        self.flows
            .lock()
            .expect("flow table mutex poisoned")
            .get(&peer)
            .copied()
            .unwrap_or_default()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.flows
            .lock()
            .expect("flow table mutex poisoned")
            .keys()
            .copied()
            .collect()
    }
}

impl FlowTracker for FlowTable {
    fn observe(&self, peer: SocketAddr, tcp_seq: u32, tcp_ack: u32) {
        let mut flows = self.flows.lock().expect("flow table mutex poisoned");
        flows
            .entry(peer)
            .and_modify(|flow| flow.seq = tcp_ack)
            .or_insert(TcpFlow {
                seq: tcp_ack,
                ack: tcp_seq,
            });
    }

    fn advance_ack(&self, peer: SocketAddr, by: u32) {
        self.with_flow(peer, |flow| flow.ack = flow.ack.wrapping_add(by));
    }

    fn remove_flow(&self, peer: SocketAddr) {
        self.flows.lock().expect("flow table mutex poisoned").remove(&peer);
    }
}
