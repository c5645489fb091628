//! Shallow header parsing for diverted packets.
//!
//! Packets are opaque byte buffers to the shaper. The only fields ever read
//! are the protocol, addresses and ports needed to attribute a packet to a
//! process. Nothing is ever written back.

use crate::process::{PacketTuple, Protocol};
use pnet_packet::Packet;
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use std::net::IpAddr;

/// Parse a raw IP packet (starting at the IP header) into its addressing tuple.
///
/// Returns `None` for anything that is not TCP or UDP over IPv4/IPv6, or that is
/// truncated. Callers treat `None` exactly like an unresolved packet.
pub fn parse_tuple(data: &[u8]) -> Option<PacketTuple> {
    let version = data.first()? >> 4;
    match version {
        4 => {
            let ip = Ipv4Packet::new(data)?;
            transport_tuple(
                ip.get_next_level_protocol(),
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                ip.payload(),
            )
        }
        6 => {
            let ip = Ipv6Packet::new(data)?;
            transport_tuple(
                ip.get_next_header(),
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                ip.payload(),
            )
        }
        _ => None,
    }
}

fn transport_tuple(
    next: IpNextHeaderProtocol,
    src_addr: IpAddr,
    dst_addr: IpAddr,
    payload: &[u8],
) -> Option<PacketTuple> {
    match next {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(payload)?;
            Some(PacketTuple {
                protocol: Protocol::Tcp,
                src_addr,
                src_port: tcp.get_source(),
                dst_addr,
                dst_port: tcp.get_destination(),
            })
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(payload)?;
            Some(PacketTuple {
                protocol: Protocol::Udp,
                src_addr,
                src_port: udp.get_source(),
                dst_addr,
                dst_port: udp.get_destination(),
            })
        }
        _ => None,
    }
}
