//! Packet codec: IPv4/IPv6 + TCP/UDP decoding on top of smoltcp wire types,
//! and packet synthesis for everything the engine writes back to the TUN.

use crate::error::{Result, StackError};
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// MSS assumed when the peer's SYN carries no MSS option (RFC 879)
pub const DEFAULT_MSS: u16 = 536;

const DEFAULT_TTL: u8 = 64;
const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ICMPV6: u8 = 58;

/// Minimum IPv6 MTU; ICMPv6 errors must fit in it
const IPV6_MIN_MTU: usize = 1280;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_only() -> Self {
        Self { syn: true, ..Default::default() }
    }
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

/// Decoded TCP segment; `payload` borrows from the raw packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl TcpSegment<'_> {
    /// Sequence space consumed by this segment (SYN and FIN count as one each)
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.flags.syn as u32 + self.flags.fin as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Transport layer of a decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
    /// Anything the engine does not relay (ICMP, extension headers, ...)
    Other { protocol: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket<'a> {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub transport: Transport<'a>,
}

impl<'a> ParsedPacket<'a> {
    /// TCP segment from `src` to `dst`
    #[allow(clippy::too_many_arguments)]
    pub fn tcp(
        src: SocketAddr,
        dst: SocketAddr,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        window: u16,
        mss: Option<u16>,
        payload: &'a [u8],
    ) -> Self {
        Self {
            src_addr: src.ip(),
            dst_addr: dst.ip(),
            transport: Transport::Tcp(TcpSegment {
                src_port: src.port(),
                dst_port: dst.port(),
                seq,
                ack,
                flags,
                window,
                mss,
                payload,
            }),
        }
    }

    /// UDP datagram from `src` to `dst`
    pub fn udp(src: SocketAddr, dst: SocketAddr, payload: &'a [u8]) -> Self {
        Self {
            src_addr: src.ip(),
            dst_addr: dst.ip(),
            transport: Transport::Udp(UdpDatagram {
                src_port: src.port(),
                dst_port: dst.port(),
                payload,
            }),
        }
    }

    pub fn src_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(t) => Some(SocketAddr::new(self.src_addr, t.src_port)),
            Transport::Udp(u) => Some(SocketAddr::new(self.src_addr, u.src_port)),
            Transport::Other { .. } => None,
        }
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(t) => Some(SocketAddr::new(self.dst_addr, t.dst_port)),
            Transport::Udp(u) => Some(SocketAddr::new(self.dst_addr, u.dst_port)),
            Transport::Other { .. } => None,
        }
    }

    pub fn is_tcp_syn(&self) -> bool {
        matches!(&self.transport, Transport::Tcp(t) if t.flags.syn && !t.flags.ack)
    }

    pub fn payload(&self) -> &'a [u8] {
        match &self.transport {
            Transport::Tcp(t) => t.payload,
            Transport::Udp(u) => u.payload,
            Transport::Other { .. } => &[],
        }
    }
}

/// Decode a raw IP packet read from the TUN device.
///
/// With `verify_checksums` unset the IPv4 header and transport checksums are
/// trusted (the kernel already validated locally generated traffic).
pub fn decode(data: &[u8], verify_checksums: bool) -> Result<ParsedPacket<'_>> {
    if data.is_empty() {
        return Err(StackError::PacketTooShort { expected: 1, actual: 0 });
    }

    let version = data[0] >> 4;
    match version {
        4 => decode_ipv4(data, verify_checksums),
        6 => decode_ipv6(data, verify_checksums),
        _ => Err(StackError::InvalidIpVersion(version)),
    }
}

fn decode_ipv4(data: &[u8], verify: bool) -> Result<ParsedPacket<'_>> {
    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| StackError::InvalidPacket(format!("IPv4: {}", e)))?;

    let header_len = ((data[0] & 0x0F) as usize) * 4;
    if verify && fold(sum_words(&data[..header_len], 0)) != 0 {
        return Err(StackError::BadChecksum("IPv4 header"));
    }
    if pkt.more_frags() || pkt.frag_offset() != 0 {
        return Err(StackError::Unsupported("IPv4 fragment".to_string()));
    }

    let src = IpAddr::V4(pkt.src_addr());
    let dst = IpAddr::V4(pkt.dst_addr());
    let transport = decode_transport(pkt.next_header(), src, dst, pkt.payload(), verify)?;

    Ok(ParsedPacket { src_addr: src, dst_addr: dst, transport })
}

fn decode_ipv6(data: &[u8], verify: bool) -> Result<ParsedPacket<'_>> {
    let pkt = Ipv6Packet::new_checked(data)
        .map_err(|e| StackError::InvalidPacket(format!("IPv6: {}", e)))?;

    let src = IpAddr::V6(pkt.src_addr());
    let dst = IpAddr::V6(pkt.dst_addr());
    let transport = decode_transport(pkt.next_header(), src, dst, pkt.payload(), verify)?;

    Ok(ParsedPacket { src_addr: src, dst_addr: dst, transport })
}

fn decode_transport<'a>(
    protocol: IpProtocol,
    src: IpAddr,
    dst: IpAddr,
    payload: &'a [u8],
    verify: bool,
) -> Result<Transport<'a>> {
    match protocol {
        IpProtocol::Tcp => decode_tcp(src, dst, payload, verify),
        IpProtocol::Udp => decode_udp(src, dst, payload, verify),
        other => Ok(Transport::Other { protocol: other.into() }),
    }
}

fn decode_tcp<'a>(src: IpAddr, dst: IpAddr, data: &'a [u8], verify: bool) -> Result<Transport<'a>> {
    let pkt = TcpPacket::new_checked(data)
        .map_err(|e| StackError::InvalidPacket(format!("TCP: {}", e)))?;

    if verify && transport_checksum(src, dst, PROTO_TCP, data) != 0 {
        return Err(StackError::BadChecksum("TCP"));
    }

    let header_len = pkt.header_len() as usize;
    let mss = parse_mss_option(&data[TCP_HEADER_LEN..header_len]);

    Ok(Transport::Tcp(TcpSegment {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        mss,
        payload: &data[header_len..],
    }))
}

fn parse_mss_option(opts: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break,
            1 => i += 1,
            2 if i + 4 <= opts.len() && opts[i + 1] == 4 => {
                return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
            }
            _ => {
                if i + 1 < opts.len() && opts[i + 1] >= 2 {
                    i += opts[i + 1] as usize;
                } else {
                    break;
                }
            }
        }
    }
    None
}

fn decode_udp<'a>(src: IpAddr, dst: IpAddr, data: &'a [u8], verify: bool) -> Result<Transport<'a>> {
    let pkt = UdpPacket::new_checked(data)
        .map_err(|e| StackError::InvalidPacket(format!("UDP: {}", e)))?;

    let udp_len = pkt.len() as usize;
    let stored = u16::from_be_bytes([data[6], data[7]]);
    // A zero checksum means "not computed", legal over IPv4 only
    let must_verify = verify && !(stored == 0 && src.is_ipv4());
    if must_verify && transport_checksum(src, dst, PROTO_UDP, &data[..udp_len]) != 0 {
        return Err(StackError::BadChecksum("UDP"));
    }

    Ok(Transport::Udp(UdpDatagram {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        payload: &data[UDP_HEADER_LEN..udp_len],
    }))
}

/// Encode a packet into raw bytes ready to be written to the TUN device
pub fn encode(packet: &ParsedPacket<'_>) -> Result<Vec<u8>> {
    let (protocol, transport) = match &packet.transport {
        Transport::Tcp(seg) => (PROTO_TCP, encode_tcp(seg)),
        Transport::Udp(dgram) => (PROTO_UDP, encode_udp(dgram)),
        Transport::Other { protocol } => {
            return Err(StackError::Unsupported(format!("encoding protocol {}", protocol)))
        }
    };
    wrap_ip(packet.src_addr, packet.dst_addr, protocol, transport)
}

fn encode_tcp(seg: &TcpSegment<'_>) -> Vec<u8> {
    let opts_len = if seg.flags.syn && seg.mss.is_some() { 4 } else { 0 };
    let header_len = TCP_HEADER_LEN + opts_len;
    let mut buf = vec![0u8; header_len + seg.payload.len()];

    buf[0..2].copy_from_slice(&seg.src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&seg.dst_port.to_be_bytes());
    buf[4..8].copy_from_slice(&seg.seq.to_be_bytes());
    buf[8..12].copy_from_slice(&seg.ack.to_be_bytes());
    buf[12] = ((header_len / 4) as u8) << 4;
    buf[13] = seg.flags.to_byte();
    buf[14..16].copy_from_slice(&seg.window.to_be_bytes());

    if let (true, Some(mss)) = (seg.flags.syn, seg.mss) {
        buf[20] = 2;
        buf[21] = 4;
        buf[22..24].copy_from_slice(&mss.to_be_bytes());
    }
    buf[header_len..].copy_from_slice(seg.payload);
    buf
}

fn encode_udp(dgram: &UdpDatagram<'_>) -> Vec<u8> {
    let len = UDP_HEADER_LEN + dgram.payload.len();
    let mut buf = vec![0u8; len];
    buf[0..2].copy_from_slice(&dgram.src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dgram.dst_port.to_be_bytes());
    buf[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    buf[UDP_HEADER_LEN..].copy_from_slice(dgram.payload);
    buf
}

/// Prefix an IP header and fill in the transport checksum
fn wrap_ip(src: IpAddr, dst: IpAddr, protocol: u8, mut transport: Vec<u8>) -> Result<Vec<u8>> {
    let cksum_at = match protocol {
        PROTO_TCP => Some(16),
        PROTO_UDP => Some(6),
        PROTO_ICMP | PROTO_ICMPV6 => Some(2),
        _ => None,
    };
    if let Some(at) = cksum_at {
        transport[at..at + 2].fill(0);
        let mut cksum = if protocol == PROTO_ICMP {
            fold(sum_words(&transport, 0))
        } else {
            transport_checksum(src, dst, protocol, &transport)
        };
        if protocol == PROTO_UDP && cksum == 0 {
            cksum = 0xFFFF;
        }
        transport[at..at + 2].copy_from_slice(&cksum.to_be_bytes());
    }

    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            static IP_ID: AtomicU16 = AtomicU16::new(1);

            let total_len = IPV4_HEADER_LEN + transport.len();
            if total_len > u16::MAX as usize {
                return Err(StackError::InvalidPacket(format!("packet too large: {}", total_len)));
            }
            let mut pkt = Vec::with_capacity(total_len);
            pkt.extend_from_slice(&[0x45, 0x00]);
            pkt.extend_from_slice(&(total_len as u16).to_be_bytes());
            pkt.extend_from_slice(&IP_ID.fetch_add(1, Ordering::Relaxed).to_be_bytes());
            pkt.extend_from_slice(&0x4000u16.to_be_bytes()); // DF
            pkt.push(DEFAULT_TTL);
            pkt.push(protocol);
            pkt.extend_from_slice(&[0, 0]);
            pkt.extend_from_slice(&s.octets());
            pkt.extend_from_slice(&d.octets());
            let cksum = fold(sum_words(&pkt[..IPV4_HEADER_LEN], 0));
            pkt[10..12].copy_from_slice(&cksum.to_be_bytes());
            pkt.extend_from_slice(&transport);
            Ok(pkt)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            if transport.len() > u16::MAX as usize {
                return Err(StackError::InvalidPacket(format!(
                    "payload too large: {}",
                    transport.len()
                )));
            }
            let mut pkt = Vec::with_capacity(IPV6_HEADER_LEN + transport.len());
            pkt.extend_from_slice(&[0x60, 0, 0, 0]);
            pkt.extend_from_slice(&(transport.len() as u16).to_be_bytes());
            pkt.push(protocol);
            pkt.push(DEFAULT_TTL);
            pkt.extend_from_slice(&s.octets());
            pkt.extend_from_slice(&d.octets());
            pkt.extend_from_slice(&transport);
            Ok(pkt)
        }
        _ => Err(StackError::Unsupported("mixed IPv4/IPv6 endpoints".to_string())),
    }
}

/// Synthesize a destination-unreachable error for `original`, addressed back
/// to its sender. Returns `None` for input that cannot be quoted.
pub fn icmp_unreachable(original: &[u8]) -> Option<Vec<u8>> {
    let parsed = decode(original, false).ok()?;
    match (parsed.src_addr, parsed.dst_addr) {
        (src @ IpAddr::V4(_), dst @ IpAddr::V4(_)) => {
            let header_len = ((original[0] & 0x0F) as usize) * 4;
            let quote_len = (header_len + 8).min(original.len());
            // type 3 (unreachable), code 1 (host unreachable)
            let mut icmp = vec![3, 1, 0, 0, 0, 0, 0, 0];
            icmp.extend_from_slice(&original[..quote_len]);
            wrap_ip(dst, src, PROTO_ICMP, icmp).ok()
        }
        (src @ IpAddr::V6(_), dst @ IpAddr::V6(_)) => {
            let room = IPV6_MIN_MTU - IPV6_HEADER_LEN - 8;
            let quote_len = original.len().min(room);
            // type 1 (unreachable), code 3 (address unreachable)
            let mut icmp = vec![1, 3, 0, 0, 0, 0, 0, 0];
            icmp.extend_from_slice(&original[..quote_len]);
            wrap_ip(dst, src, PROTO_ICMPV6, icmp).ok()
        }
        _ => None,
    }
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// One's complement checksum over the pseudo-header and `data`. Over a
/// segment that already carries a valid checksum the result is zero.
fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, data: &[u8]) -> u16 {
    let mut sum = 0u32;
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum = sum_words(&s.octets(), sum);
            sum = sum_words(&d.octets(), sum);
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            sum = sum_words(&s.octets(), sum);
            sum = sum_words(&d.octets(), sum);
        }
        _ => {}
    }
    sum = sum.wrapping_add(protocol as u32);
    sum = sum.wrapping_add(data.len() as u32);
    fold(sum_words(data, sum))
}
