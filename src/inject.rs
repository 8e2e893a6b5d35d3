use std::io;
use std::sync::Mutex;

use pnet::datalink::DataLinkSender;
use pnet::packet::ethernet::MutableEthernetPacket;
use pnet::packet::ipv4::{self, Ipv4Flags, MutableIpv4Packet};
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags};
use tracing::trace;

use crate::error::{Error, Result};
use crate::segment::{LinkHeader, NetworkHeader, SegmentMeta};

/// TTL / hop limit stamped on every crafted packet.
const OUTBOUND_TTL: u8 = 64;

const ETHERNET_LEN: usize = 14;
const NULL_LEN: usize = 4;
const IPV4_LEN: usize = 20;
const IPV6_LEN: usize = 40;
const TCP_LEN: usize = 20;

/// The frozen link- and network-layer headers used for every outbound frame.
///
/// Captured exactly once, from the first inbound frame of the endpoint's
/// lifetime, with the direction reversed: we send back the way packets came in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeaderTemplates {
    pub link: LinkHeader,
    pub network: NetworkHeader,
}

impl HeaderTemplates {
    pub fn reversed_from(meta: &SegmentMeta) -> HeaderTemplates {
        let link = match meta.link {
            LinkHeader::Ethernet { src, dst, ethertype } => LinkHeader::Ethernet {
                src: dst,
                dst: src,
                ethertype,
            },
            LinkHeader::Null { family } => LinkHeader::Null { family },
        };
        let network = match meta.network {
            NetworkHeader::V4 { src, dst, id, protocol } => NetworkHeader::V4 {
                src: dst,
                dst: src,
                id,
                protocol,
            },
            NetworkHeader::V6 { src, dst, next_header } => NetworkHeader::V6 {
                src: dst,
                dst: src,
                next_header,
            },
        };
        HeaderTemplates { link, network }
    }
}

/// TCP header fields of one outbound segment. Flags are always PSH|ACK; the
/// remote engine ignores the window, so any value is acceptable.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OutboundSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
}

/// Where finished frames go. Production wraps the link-layer injection handle;
/// tests substitute an in-memory wire.
pub(crate) trait FrameSink: Send + 'static {
    fn inject(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// The real injection facility.
pub(crate) struct LinkSink(pub Box<dyn DataLinkSender>);

impl FrameSink for LinkSink {
    fn inject(&mut self, frame: &[u8]) -> io::Result<()> {
        match self.0.send_to(frame, None) {
            Some(result) => result,
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "link-layer sender refused the frame",
            )),
        }
    }
}

/// Serializes outbound frames and hands them to the injection facility. One
/// capture loop reads the channel; many concurrent writers share this sink, so
/// the handle sits behind a mutex.
pub(crate) struct Injector {
    sink: Mutex<Box<dyn FrameSink>>,
}

impl Injector {
    pub fn new(sink: Box<dyn FrameSink>) -> Injector {
        Injector { sink: Mutex::new(sink) }
    }

    pub fn send_segment(
        &self,
        templates: &HeaderTemplates,
        segment: OutboundSegment,
        payload: &[u8],
    ) -> Result<()> {
        let frame = build_frame(templates, segment, payload);
        trace!(len = frame.len(), seq = segment.seq, ack = segment.ack, "injecting frame");
        self.sink
            .lock()
            .expect("injector mutex poisoned")
            .inject(&frame)
            .map_err(Error::Inject)
    }
}

/// Serializes link || network || TCP || payload with length fields filled in,
/// the IPv4 header checksum computed, and the TCP checksum computed against the
/// network-layer pseudo-header.
pub(crate) fn build_frame(
    templates: &HeaderTemplates,
    segment: OutboundSegment,
    payload: &[u8],
) -> Vec<u8> {
    let link_len = match templates.link {
        LinkHeader::Ethernet { .. } => ETHERNET_LEN,
        LinkHeader::Null { .. } => NULL_LEN,
    };
    let net_len = match templates.network {
        NetworkHeader::V4 { .. } => IPV4_LEN,
        NetworkHeader::V6 { .. } => IPV6_LEN,
    };
    let tcp_len = TCP_LEN + payload.len();

    let mut frame = vec![0u8; link_len + net_len + tcp_len];

    match templates.link {
        LinkHeader::Ethernet { src, dst, ethertype } => {
            let mut eth = MutableEthernetPacket::new(&mut frame[..ETHERNET_LEN])
                .expect("frame buffer holds an Ethernet header");
            eth.set_source(src);
            eth.set_destination(dst);
            eth.set_ethertype(ethertype);
        }
        LinkHeader::Null { family } => {
            frame[..NULL_LEN].copy_from_slice(&family.to_ne_bytes());
        }
    }

    let tcp_at = link_len + net_len;
    match templates.network {
        NetworkHeader::V4 { src, dst, id, protocol } => {
            let mut ip = MutableIpv4Packet::new(&mut frame[link_len..tcp_at])
                .expect("frame buffer holds an IPv4 header");
            ip.set_version(4);
            ip.set_header_length((IPV4_LEN / 4) as u8);
            ip.set_total_length((net_len + tcp_len) as u16);
            ip.set_identification(id);
            ip.set_flags(Ipv4Flags::DontFragment);
            ip.set_ttl(OUTBOUND_TTL);
            ip.set_next_level_protocol(protocol);
            ip.set_source(src);
            ip.set_destination(dst);
            let checksum = ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(checksum);
        }
        NetworkHeader::V6 { src, dst, next_header } => {
            let mut ip = MutableIpv6Packet::new(&mut frame[link_len..tcp_at])
                .expect("frame buffer holds an IPv6 header");
            ip.set_version(6);
            ip.set_payload_length(tcp_len as u16);
            ip.set_next_header(next_header);
            ip.set_hop_limit(OUTBOUND_TTL);
            ip.set_source(src);
            ip.set_destination(dst);
        }
    }

    frame[tcp_at + TCP_LEN..].copy_from_slice(payload);
    let mut tcp = MutableTcpPacket::new(&mut frame[tcp_at..])
        .expect("frame buffer holds a TCP segment");
    tcp.set_source(segment.src_port);
    tcp.set_destination(segment.dst_port);
    tcp.set_sequence(segment.seq);
    tcp.set_acknowledgement(segment.ack);
    tcp.set_data_offset((TCP_LEN / 4) as u8);
    tcp.set_flags(TcpFlags::PSH | TcpFlags::ACK);
    tcp.set_window(segment.window);
    let checksum = match templates.network {
        NetworkHeader::V4 { src, dst, .. } => tcp::ipv4_checksum(&tcp.to_immutable(), &src, &dst),
        NetworkHeader::V6 { src, dst, .. } => tcp::ipv6_checksum(&tcp.to_immutable(), &src, &dst),
    };
    tcp.set_checksum(checksum);

    frame
}
