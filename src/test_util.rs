//! Shared test fixtures: canned frame builders and an in-memory stand-in for
//! the capture/injection facility, so the full engine can be exercised without
//! privileges or live interfaces.

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc;
use std::time::Duration;

use crate::capture::FrameSource;
use crate::inject::FrameSink;

/// Replays a fixed list of frames, then idles with poll timeouts like a quiet
/// capture handle.
pub(crate) struct ScriptedSource {
    frames: VecDeque<Vec<u8>>,
    current: Vec<u8>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Vec<u8>>) -> ScriptedSource {
        ScriptedSource {
            frames: frames.into(),
            current: Vec::new(),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> io::Result<&[u8]> {
        match self.frames.pop_front() {
            Some(frame) => {
                self.current = frame;
                Ok(&self.current)
            }
            None => {
                std::thread::sleep(Duration::from_millis(5));
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }
}

/// One direction of an in-memory wire.
pub(crate) fn wire() -> (WireSink, WireSource) {
    let (tx, rx) = mpsc::channel();
    (
        WireSink { tx },
        WireSource {
            rx,
            current: Vec::new(),
        },
    )
}

/// Like [`wire`], but hands back the raw receiving end so a test can inspect
/// the frames an endpoint emits.
pub(crate) fn tapped_wire() -> (WireSink, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel();
    (WireSink { tx }, rx)
}

pub(crate) struct WireSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl WireSink {
    /// An extra handle for the test itself to place frames on the wire, e.g.
    /// to play the kernel's part of the handshake.
    pub fn tap(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }

    /// A second sink feeding the same wire, for scenarios where several
    /// endpoints inject towards one capture side.
    pub fn split(&self) -> WireSink {
        WireSink { tx: self.tx.clone() }
    }
}

impl FrameSink for WireSink {
    fn inject(&mut self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "wire torn down"))
    }
}

pub(crate) struct WireSource {
    rx: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
}

impl FrameSource for WireSource {
    fn next_frame(&mut self) -> io::Result<&[u8]> {
        match self.rx.recv_timeout(Duration::from_millis(25)) {
            Ok(frame) => {
                self.current = frame;
                Ok(&self.current)
            }
            // a disconnected wire is just a quiet one; shutdown ends the loop
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }
}

pub(crate) mod frames {
    use std::net::SocketAddr;

    use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::packet::ipv4::{self, MutableIpv4Packet};
    use pnet::packet::ipv6::MutableIpv6Packet;
    use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags};
    use pnet::util::MacAddr;

    /// Builds arbitrary TCP frames from the perspective of a remote kernel.
    pub(crate) struct Frame {
        src: SocketAddr,
        dst: SocketAddr,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: Vec<u8>,
        src_mac: MacAddr,
        dst_mac: MacAddr,
        null_link: bool,
    }

    impl Frame {
        pub const DEFAULT_SRC_MAC: MacAddr = MacAddr(2, 0, 0, 0, 0, 0xaa);
        pub const DEFAULT_DST_MAC: MacAddr = MacAddr(2, 0, 0, 0, 0, 0xbb);

        pub fn v4(src: &str, dst: &str) -> Frame {
            Frame::new(src.parse().unwrap(), dst.parse().unwrap())
        }

        pub fn v6(src: &str, dst: &str) -> Frame {
            Frame::new(src.parse().unwrap(), dst.parse().unwrap())
        }

        fn new(src: SocketAddr, dst: SocketAddr) -> Frame {
            assert_eq!(src.is_ipv4(), dst.is_ipv4(), "mixed-family frame");
            Frame {
                src,
                dst,
                seq: 0,
                ack: 0,
                flags: TcpFlags::ACK,
                payload: Vec::new(),
                src_mac: Self::DEFAULT_SRC_MAC,
                dst_mac: Self::DEFAULT_DST_MAC,
                null_link: false,
            }
        }

        pub fn seq(mut self, seq: u32) -> Frame {
            self.seq = seq;
            self
        }

        pub fn ack(mut self, ack: u32) -> Frame {
            self.ack = ack;
            self
        }

        pub fn flags(mut self, flags: u8) -> Frame {
            self.flags = flags;
            self
        }

        pub fn payload(mut self, payload: &[u8]) -> Frame {
            self.payload = payload.to_vec();
            self
        }

        pub fn src_mac(mut self, mac: MacAddr) -> Frame {
            self.src_mac = mac;
            self
        }

        pub fn dst_mac(mut self, mac: MacAddr) -> Frame {
            self.dst_mac = mac;
            self
        }

        pub fn null_link(mut self) -> Frame {
            self.null_link = true;
            self
        }

        pub fn build(self) -> Vec<u8> {
            let link_len = if self.null_link { 4 } else { 14 };
            let net_len = if self.src.is_ipv4() { 20 } else { 40 };
            let tcp_len = 20 + self.payload.len();
            let mut frame = vec![0u8; link_len + net_len + tcp_len];

            if self.null_link {
                let family: u32 = if self.src.is_ipv4() { 2 } else { 30 };
                frame[..4].copy_from_slice(&family.to_ne_bytes());
            } else {
                let mut eth = MutableEthernetPacket::new(&mut frame[..14]).unwrap();
                eth.set_source(self.src_mac);
                eth.set_destination(self.dst_mac);
                eth.set_ethertype(if self.src.is_ipv4() {
                    EtherTypes::Ipv4
                } else {
                    EtherTypes::Ipv6
                });
            }

            let tcp_at = link_len + net_len;
            match (self.src, self.dst) {
                (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
                    let mut ip = MutableIpv4Packet::new(&mut frame[link_len..tcp_at]).unwrap();
                    ip.set_version(4);
                    ip.set_header_length(5);
                    ip.set_total_length((net_len + tcp_len) as u16);
                    ip.set_identification(4242);
                    ip.set_ttl(64);
                    ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
                    ip.set_source(*src.ip());
                    ip.set_destination(*dst.ip());
                    let checksum = ipv4::checksum(&ip.to_immutable());
                    ip.set_checksum(checksum);
                }
                (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
                    let mut ip = MutableIpv6Packet::new(&mut frame[link_len..tcp_at]).unwrap();
                    ip.set_version(6);
                    ip.set_payload_length(tcp_len as u16);
                    ip.set_next_header(IpNextHeaderProtocols::Tcp);
                    ip.set_hop_limit(64);
                    ip.set_source(*src.ip());
                    ip.set_destination(*dst.ip());
                }
                _ => unreachable!("mixed-family frame"),
            }

            frame[tcp_at + 20..].copy_from_slice(&self.payload);
            let mut tcp = MutableTcpPacket::new(&mut frame[tcp_at..]).unwrap();
            tcp.set_source(self.src.port());
            tcp.set_destination(self.dst.port());
            tcp.set_sequence(self.seq);
            tcp.set_acknowledgement(self.ack);
            tcp.set_data_offset(5);
            tcp.set_flags(self.flags);
            tcp.set_window(65535);
            let checksum = match (self.src, self.dst) {
                (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
                    tcp::ipv4_checksum(&tcp.to_immutable(), src.ip(), dst.ip())
                }
                (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
                    tcp::ipv6_checksum(&tcp.to_immutable(), src.ip(), dst.ip())
                }
                _ => unreachable!("mixed-family frame"),
            };
            tcp.set_checksum(checksum);

            frame
        }
    }

    /// An Ethernet frame that is not IP at all.
    pub(crate) fn arp_frame() -> Vec<u8> {
        let mut frame = vec![0u8; 42];
        let mut eth = MutableEthernetPacket::new(&mut frame[..14]).unwrap();
        eth.set_source(Frame::DEFAULT_SRC_MAC);
        eth.set_destination(Frame::DEFAULT_DST_MAC);
        eth.set_ethertype(EtherTypes::Arp);
        frame
    }

    /// An IPv4 frame that carries UDP instead of TCP.
    pub(crate) fn udp_frame() -> Vec<u8> {
        let mut frame = vec![0u8; 14 + 20 + 8];
        let mut eth = MutableEthernetPacket::new(&mut frame[..14]).unwrap();
        eth.set_source(Frame::DEFAULT_SRC_MAC);
        eth.set_destination(Frame::DEFAULT_DST_MAC);
        eth.set_ethertype(EtherTypes::Ipv4);
        let mut ip = MutableIpv4Packet::new(&mut frame[14..34]).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(28);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source("10.0.0.2".parse().unwrap());
        ip.set_destination("10.0.0.1".parse().unwrap());
        frame
    }
}
