use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::{TcpFlags, TcpPacket};
use pnet::util::MacAddr;

/// Framing of the capture channel. Everything is Ethernet except the BSD-style
/// loopback device, which prefixes packets with a 4-byte address-family word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkKind {
    Ethernet,
    Null,
}

/// Address-family words seen in null/loopback framing (host byte order on the
/// wire): AF_INET, plus the AF_INET6 values of the various BSDs and Linux.
const NULL_FAMILY_INET: u32 = 2;
const NULL_FAMILIES_INET6: [u32; 4] = [10, 24, 28, 30];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkHeader {
    Ethernet {
        src: MacAddr,
        dst: MacAddr,
        ethertype: EtherType,
    },
    Null {
        family: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NetworkHeader {
    V4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        id: u16,
        protocol: IpNextHeaderProtocol,
    },
    V6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        next_header: IpNextHeaderProtocol,
    },
}

impl NetworkHeader {
    pub fn src_ip(&self) -> IpAddr {
        match self {
            NetworkHeader::V4 { src, .. } => IpAddr::V4(*src),
            NetworkHeader::V6 { src, .. } => IpAddr::V6(*src),
        }
    }

    pub fn dst_ip(&self) -> IpAddr {
        match self {
            NetworkHeader::V4 { dst, .. } => IpAddr::V4(*dst),
            NetworkHeader::V6 { dst, .. } => IpAddr::V6(*dst),
        }
    }
}

/// The owned part of a parsed segment: everything the flow engine needs except
/// the payload bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentMeta {
    pub link: LinkHeader,
    pub network: NetworkHeader,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
}

impl SegmentMeta {
    /// The remote peer this segment came from.
    pub fn peer(&self) -> SocketAddr {
        SocketAddr::new(self.network.src_ip(), self.src_port)
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TcpFlags::SYN != 0
    }

    pub fn is_psh(&self) -> bool {
        self.flags & TcpFlags::PSH != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & TcpFlags::FIN != 0
    }
}

/// A captured TCP segment, borrowing its payload from the capture buffer.
pub(crate) struct TcpSegment<'a> {
    pub meta: SegmentMeta,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Parses one captured frame. Returns `None` for anything that is not a
    /// well-formed TCP-in-IP packet under the given framing; the capture loop
    /// drops those frames without further note.
    pub fn parse(frame: &'a [u8], link: LinkKind) -> Option<TcpSegment<'a>> {
        let (link_header, ip_bytes) = match link {
            LinkKind::Ethernet => {
                let eth = EthernetPacket::new(frame)?;
                let link_header = LinkHeader::Ethernet {
                    src: eth.get_source(),
                    dst: eth.get_destination(),
                    ethertype: eth.get_ethertype(),
                };
                let ip_bytes = &frame[EthernetPacket::minimum_packet_size()..];
                match eth.get_ethertype() {
                    EtherTypes::Ipv4 | EtherTypes::Ipv6 => (link_header, ip_bytes),
                    _ => return None,
                }
            }
            LinkKind::Null => {
                if frame.len() < 4 {
                    return None;
                }
                let family = u32::from_ne_bytes(frame[..4].try_into().ok()?);
                if family != NULL_FAMILY_INET && !NULL_FAMILIES_INET6.contains(&family) {
                    return None;
                }
                (LinkHeader::Null { family }, &frame[4..])
            }
        };

        let (network, tcp_bytes) = parse_ip(ip_bytes)?;

        let tcp = TcpPacket::new(tcp_bytes)?;
        let data_offset = usize::from(tcp.get_data_offset()) * 4;
        if data_offset < TcpPacket::minimum_packet_size() || data_offset > tcp_bytes.len() {
            return None;
        }

        Some(TcpSegment {
            meta: SegmentMeta {
                link: link_header,
                network,
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
                seq: tcp.get_sequence(),
                ack: tcp.get_acknowledgement(),
                flags: tcp.get_flags(),
            },
            payload: &tcp_bytes[data_offset..],
        })
    }
}

/// Extracts the network header and the exact TCP segment bytes. The slice is
/// trimmed to the IP length fields so that link-layer padding (Ethernet frames
/// are padded to 60 bytes) never leaks into payload accounting.
fn parse_ip(ip_bytes: &[u8]) -> Option<(NetworkHeader, &[u8])> {
    match ip_bytes.first()? >> 4 {
        4 => {
            let ip = Ipv4Packet::new(ip_bytes)?;
            if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            let header_len = usize::from(ip.get_header_length()) * 4;
            let total_len = usize::from(ip.get_total_length());
            if header_len < Ipv4Packet::minimum_packet_size()
                || total_len < header_len
                || total_len > ip_bytes.len()
            {
                return None;
            }
            let network = NetworkHeader::V4 {
                src: ip.get_source(),
                dst: ip.get_destination(),
                id: ip.get_identification(),
                protocol: ip.get_next_level_protocol(),
            };
            Some((network, &ip_bytes[header_len..total_len]))
        }
        6 => {
            let ip = Ipv6Packet::new(ip_bytes)?;
            // extension headers are not walked: the engine only shadows plain
            // TCP conversations
            if ip.get_next_header() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            let header_len = Ipv6Packet::minimum_packet_size();
            let end = header_len.checked_add(usize::from(ip.get_payload_length()))?;
            if end > ip_bytes.len() {
                return None;
            }
            let network = NetworkHeader::V6 {
                src: ip.get_source(),
                dst: ip.get_destination(),
                next_header: ip.get_next_header(),
            };
            Some((network, &ip_bytes[header_len..end]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_util::frames;

    #[test]
    fn parses_an_ethernet_ipv4_data_segment() {
        let frame = frames::Frame::v4("10.0.0.2:443", "10.0.0.1:50000")
            .seq(1000)
            .ack(2000)
            .flags(TcpFlags::PSH | TcpFlags::ACK)
            .payload(b"hello")
            .build();

        let seg = TcpSegment::parse(&frame, LinkKind::Ethernet).unwrap();
        assert_eq!(seg.meta.peer(), "10.0.0.2:443".parse().unwrap());
        assert_eq!(seg.meta.dst_port, 50000);
        assert_eq!(seg.meta.seq, 1000);
        assert_eq!(seg.meta.ack, 2000);
        assert!(seg.meta.is_psh() && !seg.meta.is_syn() && !seg.meta.is_fin());
        assert_eq!(seg.payload, b"hello");
    }

    #[test]
    fn trims_ethernet_padding_from_the_payload() {
        let mut frame = frames::Frame::v4("10.0.0.2:443", "10.0.0.1:50000")
            .flags(TcpFlags::PSH | TcpFlags::ACK)
            .payload(b"ab")
            .build();
        // pad to the 60-byte Ethernet minimum
        frame.resize(60, 0);

        let seg = TcpSegment::parse(&frame, LinkKind::Ethernet).unwrap();
        assert_eq!(seg.payload, b"ab");
    }

    #[test]
    fn parses_an_ipv6_segment() {
        let frame = frames::Frame::v6("[2001:db8::2]:443", "[2001:db8::1]:50000")
            .seq(7)
            .flags(TcpFlags::SYN)
            .build();

        let seg = TcpSegment::parse(&frame, LinkKind::Ethernet).unwrap();
        assert!(seg.meta.is_syn());
        assert_eq!(seg.meta.peer(), "[2001:db8::2]:443".parse().unwrap());
        assert!(matches!(seg.meta.network, NetworkHeader::V6 { .. }));
        assert!(seg.payload.is_empty());
    }

    #[test]
    fn parses_null_framing() {
        let frame = frames::Frame::v4("127.0.0.1:9000", "127.0.0.1:50000")
            .null_link()
            .flags(TcpFlags::PSH | TcpFlags::ACK)
            .payload(b"loop")
            .build();

        let seg = TcpSegment::parse(&frame, LinkKind::Null).unwrap();
        assert_eq!(seg.meta.link, LinkHeader::Null { family: 2 });
        assert_eq!(seg.payload, b"loop");
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_ethernet(vec![0u8; 10])]
    #[case::not_ip(frames::arp_frame())]
    #[case::udp_inside(frames::udp_frame())]
    fn malformed_frames_parse_to_none(#[case] frame: Vec<u8>) {
        assert!(TcpSegment::parse(&frame, LinkKind::Ethernet).is_none());
    }

    #[test]
    fn truncated_ip_length_is_rejected() {
        let mut frame = frames::Frame::v4("10.0.0.2:443", "10.0.0.1:50000")
            .flags(TcpFlags::PSH | TcpFlags::ACK)
            .payload(b"hello world")
            .build();
        // chop the frame below the length the IP header claims
        frame.truncate(frame.len() - 6);
        assert!(TcpSegment::parse(&frame, LinkKind::Ethernet).is_none());
    }

    #[test]
    fn unknown_null_family_is_rejected() {
        let mut frame = frames::Frame::v4("127.0.0.1:9000", "127.0.0.1:50000")
            .null_link()
            .build();
        frame[..4].copy_from_slice(&77u32.to_ne_bytes());
        assert!(TcpSegment::parse(&frame, LinkKind::Null).is_none());
    }
}
