//! Feature records extracted from network packets.
//!
//! A [`FeatureRecord`] is the fixed-shape artifact handed to the analysis
//! callback: network identifiers, packet characteristics and a handful of
//! derived features (flow hash, payload entropy, inter-arrival time).
//! All addresses and ports are stored in host byte order; conversion from
//! network order happens once, in the parser.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Coarse traffic classification attached by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TrafficClass {
    /// Ordinary traffic
    Normal = 0,

    /// Both endpoints ephemeral, or a protocol outside TCP/UDP
    Suspicious = 1,

    /// Well-known service traffic (SSH, DNS, HTTP, HTTPS)
    Priority = 2,
}

/// Packet direction relative to the monitored host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    Inbound = 0,
    Outbound = 1,
}

/// Fixed-shape feature record delivered to the analysis callback.
///
/// The record is constructed on the drainer stack and lent to the callback
/// for the duration of the call; callbacks must not retain it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// Source IPv4 address, host byte order
    pub src_ip: u32,

    /// Destination IPv4 address, host byte order
    pub dst_ip: u32,

    /// Source port, 0 when the transport has none
    pub src_port: u16,

    /// Destination port, 0 when the transport has none
    pub dst_port: u16,

    /// IANA protocol number from the IPv4 header
    pub protocol: u8,

    /// IPv4 total length
    pub pkt_len: u16,

    /// Bytes past the last parsed header, 0 when headers consume the packet
    pub payload_len: u16,

    /// TCP flag byte, 0 for non-TCP
    pub tcp_flags: u8,

    /// TCP window size, 0 for non-TCP
    pub window_size: u16,

    /// IPv4 time-to-live
    pub ttl: u8,

    /// Flow identifier derived from the 5-tuple.
    ///
    /// The hash is direction-sensitive: forward and reverse directions of
    /// the same flow hash to different values. Consumers that need
    /// bidirectional aggregation must canonicalize the tuple themselves.
    pub flow_hash: u64,

    /// Monotonic nanoseconds at extraction time
    pub timestamp: u64,

    /// Shannon entropy of the payload scaled to [0, 255]
    pub packet_entropy: u8,

    /// Microseconds since the previous packet of this flow, 0 if unknown
    pub inter_arrival_time: u32,

    /// Classifier verdict tag
    pub traffic_class: TrafficClass,

    /// Direction relative to the monitored host
    pub direction: Direction,
}

impl FeatureRecord {
    /// Source address as a displayable type.
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip)
    }

    /// Destination address as a displayable type.
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_ip)
    }
}

impl fmt::Display for FeatureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto={} len={} entropy={} class={:?}",
            self.src_addr(),
            self.src_port,
            self.dst_addr(),
            self.dst_port,
            self.protocol,
            self.pkt_len,
            self.packet_entropy,
            self.traffic_class,
        )
    }
}

/// Compute the flow identifier for a 5-tuple.
///
/// A cheap xor/shift mix that both execution domains can compute
/// identically. Direction-sensitive by design; see
/// [`FeatureRecord::flow_hash`].
pub fn flow_hash(protocol: u8, src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16) -> u64 {
    let mut hash = src_ip as u64;
    hash ^= (dst_ip as u64) << 32;
    hash ^= (src_port as u64) << 16;
    hash ^= (dst_port as u64) << 48;
    hash ^= (protocol as u64) << 8;
    hash
}

/// Shannon entropy of `payload` in bits/byte, scaled by 32 and saturated
/// to 255. An empty or single-valued payload scores 0; uniformly random
/// bytes approach 255. Used for encryption/compression detection.
pub fn payload_entropy(payload: &[u8]) -> u8 {
    if payload.is_empty() {
        return 0;
    }

    let mut freq = [0u32; 256];
    for &b in payload {
        freq[b as usize] += 1;
    }

    let len = payload.len() as f64;
    let mut entropy = 0.0f64;
    for &count in freq.iter() {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }

    // 8 bits/byte of entropy maps to 256, saturated into the u8 range.
    (entropy * 32.0).min(255.0) as u8
}

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since an arbitrary process-local epoch.
///
/// Timestamps taken on the same thread never decrease; timestamps from
/// different drainers share the epoch but may interleave.
pub fn monotonic_ns() -> u64 {
    CLOCK_EPOCH.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_hash_deterministic() {
        let a = flow_hash(17, 0x0a000001, 0x0a000002, 40000, 53);
        let b = flow_hash(17, 0x0a000001, 0x0a000002, 40000, 53);
        assert_eq!(a, b);

        let c = flow_hash(6, 0x0a000001, 0x0a000002, 40000, 53);
        assert_ne!(a, c);
    }

    #[test]
    fn test_flow_hash_direction_sensitive() {
        let fwd = flow_hash(6, 0x0a000001, 0x0a000002, 40000, 443);
        let rev = flow_hash(6, 0x0a000002, 0x0a000001, 443, 40000);
        assert_ne!(fwd, rev);
    }

    #[test]
    fn test_entropy_empty() {
        assert_eq!(payload_entropy(&[]), 0);
    }

    #[test]
    fn test_entropy_uniform_payload() {
        let payload = vec![0x41u8; 100];
        assert_eq!(payload_entropy(&payload), 0);
    }

    #[test]
    fn test_entropy_two_symbols() {
        // Alternating bytes carry exactly 1 bit/byte, scaled to 32.
        let payload: Vec<u8> = (0..128).map(|i| (i % 2) as u8).collect();
        assert_eq!(payload_entropy(&payload), 32);
    }

    #[test]
    fn test_entropy_saturates() {
        // All 256 byte values equally likely: 8 bits/byte, clamps to 255.
        let payload: Vec<u8> = (0..=255u8).collect();
        assert_eq!(payload_entropy(&payload), 255);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_record_display() {
        let record = FeatureRecord {
            src_ip: 0x0a000001,
            dst_ip: 0x0a000002,
            src_port: 40000,
            dst_port: 53,
            protocol: 17,
            pkt_len: 128,
            payload_len: 100,
            tcp_flags: 0,
            window_size: 0,
            ttl: 64,
            flow_hash: 0,
            timestamp: 0,
            packet_entropy: 0,
            inter_arrival_time: 0,
            traffic_class: TrafficClass::Priority,
            direction: Direction::Outbound,
        };
        let s = record.to_string();
        assert!(s.contains("10.0.0.1:40000"));
        assert!(s.contains("10.0.0.2:53"));
    }
}
