//! Bounds-checked Ethernet/IPv4/TCP/UDP parsing.
//!
//! One parser serves both execution domains: the classifier fast path uses
//! it to reach a verdict, and the drainer re-parses steered frames to fill
//! the enriched record fields. Every access is bounds-checked against the
//! frame end; malformed input is reported through [`ParseError`], never by
//! panicking.

use thiserror::Error;

use crate::record;

/// Ethernet header length (no VLAN tags).
pub const ETH_HDR_LEN: usize = 14;

/// Ethertype for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Parse failures for a single frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame shorter than an Ethernet header")]
    TruncatedEthernet,

    #[error("ethertype 0x{0:04x} is not IPv4")]
    NotIpv4(u16),

    #[error("frame shorter than the IPv4 header")]
    TruncatedIpv4,

    #[error("bad IPv4 header: version {version}, ihl {ihl}")]
    BadIpv4Header { version: u8, ihl: u8 },

    #[error("frame shorter than the {0} header")]
    TruncatedTransport(&'static str),

    #[error("malformed TCP data offset")]
    BadTcpOffset,
}

impl ParseError {
    /// True for frames that are simply not ours (non-IPv4 ethertypes).
    /// These pass through without counting as parse drops.
    pub fn is_foreign(&self) -> bool {
        matches!(self, ParseError::NotIpv4(_))
    }
}

/// Header fields lifted out of a frame, all in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub protocol: u8,
    pub ttl: u8,

    /// IPv4 total length
    pub pkt_len: u16,

    /// 0 for transports without ports
    pub src_port: u16,
    pub dst_port: u16,

    /// TCP flag byte, 0 for non-TCP
    pub tcp_flags: u8,

    /// TCP window size, 0 for non-TCP
    pub window_size: u16,

    /// Offset of the payload from the frame start
    pub payload_offset: usize,

    /// pkt_len minus L3 and L4 header bytes
    pub payload_len: u16,
}

impl ParsedPacket {
    /// Flow identifier for this packet's 5-tuple.
    pub fn flow_hash(&self) -> u64 {
        record::flow_hash(
            self.protocol,
            self.src_ip,
            self.dst_ip,
            self.src_port,
            self.dst_port,
        )
    }

    /// Payload bytes actually present in `frame`.
    ///
    /// The slice is bounded by both the IPv4 total length and the captured
    /// frame end, so a truncated capture yields a shorter (possibly empty)
    /// payload rather than out-of-bounds access.
    pub fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        let claimed_end = ETH_HDR_LEN + self.pkt_len as usize;
        let end = claimed_end.min(frame.len());
        if self.payload_offset >= end {
            return &[];
        }
        &frame[self.payload_offset..end]
    }
}

fn read_u16(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

fn read_u32(frame: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ])
}

/// Parse a raw Ethernet frame down to the transport layer.
///
/// ICMP and other non-TCP/UDP transports parse successfully with zero
/// ports; only genuinely malformed frames fail.
pub fn parse_frame(frame: &[u8]) -> Result<ParsedPacket, ParseError> {
    if frame.len() < ETH_HDR_LEN {
        return Err(ParseError::TruncatedEthernet);
    }

    let ethertype = read_u16(frame, 12);
    if ethertype != ETHERTYPE_IPV4 {
        return Err(ParseError::NotIpv4(ethertype));
    }

    if frame.len() < ETH_HDR_LEN + 20 {
        return Err(ParseError::TruncatedIpv4);
    }

    let ip = &frame[ETH_HDR_LEN..];
    let version = ip[0] >> 4;
    let ihl = ip[0] & 0x0f;
    if version != 4 || ihl < 5 {
        return Err(ParseError::BadIpv4Header { version, ihl });
    }

    let ip_hdr_len = ihl as usize * 4;
    if frame.len() < ETH_HDR_LEN + ip_hdr_len {
        return Err(ParseError::TruncatedIpv4);
    }

    let pkt_len = read_u16(ip, 2);
    let ttl = ip[8];
    let protocol = ip[9];
    let src_ip = read_u32(ip, 12);
    let dst_ip = read_u32(ip, 16);

    let l4_offset = ETH_HDR_LEN + ip_hdr_len;
    let mut src_port = 0u16;
    let mut dst_port = 0u16;
    let mut tcp_flags = 0u8;
    let mut window_size = 0u16;
    let l4_hdr_len;

    match protocol {
        IPPROTO_TCP => {
            if frame.len() < l4_offset + 20 {
                return Err(ParseError::TruncatedTransport("TCP"));
            }
            let tcp = &frame[l4_offset..];
            let doff = tcp[12] >> 4;
            if doff < 5 {
                return Err(ParseError::BadTcpOffset);
            }
            src_port = read_u16(tcp, 0);
            dst_port = read_u16(tcp, 2);
            tcp_flags = tcp[13];
            window_size = read_u16(tcp, 14);
            l4_hdr_len = doff as usize * 4;
        }
        IPPROTO_UDP => {
            if frame.len() < l4_offset + 8 {
                return Err(ParseError::TruncatedTransport("UDP"));
            }
            let udp = &frame[l4_offset..];
            src_port = read_u16(udp, 0);
            dst_port = read_u16(udp, 2);
            l4_hdr_len = 8;
        }
        // ICMP and everything else: no ports, payload starts after IPv4.
        _ => l4_hdr_len = 0,
    }

    let header_len = ip_hdr_len + l4_hdr_len;
    let payload_len = (pkt_len as usize).saturating_sub(header_len) as u16;

    Ok(ParsedPacket {
        src_ip,
        dst_ip,
        protocol,
        ttl,
        pkt_len,
        src_port,
        dst_port,
        tcp_flags,
        window_size,
        payload_offset: ETH_HDR_LEN + header_len,
        payload_len,
    })
}
