//! Per-packet classification fast path.
//!
//! The classifier is invoked once per received frame. It parses L2-L4,
//! maintains counters, applies the protocol filter and the sampling
//! decision, and returns a [`Verdict`]. All parse failures are non-fatal:
//! the default verdict is "do not interfere", so errors surface only
//! through the statistics table. The fast path takes no locks and
//! allocates nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;

use crate::maps::{ConfigSlot, StatId, StatsMap, SteerTable};
use crate::parse::{self, ParsedPacket, IPPROTO_TCP, IPPROTO_UDP};
use crate::record::TrafficClass;
use crate::source::FrameSource;
use crate::transport::{FrameDesc, SteerQueue};

/// Per-packet verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the packet continue down the normal stack.
    Pass,

    /// Discard the packet. The built-in algorithm never produces this;
    /// it exists for embedders that wire their own verdict handling.
    Drop,

    /// Hand the frame to the user-space queue with this id.
    Steer(u32),
}

/// Replaceable traffic-tagging heuristic (the classification rule set).
pub trait TagPolicy: Send + Sync {
    fn tag(&self, pkt: &ParsedPacket) -> TrafficClass;
}

/// Built-in rule set: well-known service ports are priority, purely
/// ephemeral port pairs and non-TCP/UDP transports are suspicious.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTagPolicy;

/// First port outside the IANA ephemeral boundary minus one; ports above
/// this are considered ephemeral.
const EPHEMERAL_FLOOR: u16 = 49151;

const SERVICE_PORTS: [u16; 4] = [22, 53, 80, 443];

impl TagPolicy for DefaultTagPolicy {
    fn tag(&self, pkt: &ParsedPacket) -> TrafficClass {
        if SERVICE_PORTS.contains(&pkt.src_port) || SERVICE_PORTS.contains(&pkt.dst_port) {
            return TrafficClass::Priority;
        }
        let both_ephemeral = pkt.src_port > EPHEMERAL_FLOOR && pkt.dst_port > EPHEMERAL_FLOOR;
        let exotic_transport = pkt.protocol != IPPROTO_TCP && pkt.protocol != IPPROTO_UDP;
        if both_ephemeral || exotic_transport {
            return TrafficClass::Suspicious;
        }
        TrafficClass::Normal
    }
}

/// Atomic slot holding the active tag policy; readers never block.
pub struct PolicySlot {
    inner: ArcSwap<Box<dyn TagPolicy>>,
}

impl PolicySlot {
    pub fn new(policy: Box<dyn TagPolicy>) -> Self {
        Self {
            inner: ArcSwap::from_pointee(policy),
        }
    }

    /// Swap in a new policy; takes effect on the next packet.
    pub fn replace(&self, policy: Box<dyn TagPolicy>) {
        self.inner.store(Arc::new(policy));
    }

    /// Tag a packet with the currently installed policy.
    #[inline]
    pub fn tag(&self, pkt: &ParsedPacket) -> TrafficClass {
        self.inner.load().tag(pkt)
    }
}

impl Default for PolicySlot {
    fn default() -> Self {
        Self::new(Box::new(DefaultTagPolicy))
    }
}

/// The classification fast path for one receive queue.
///
/// Each queue owns its own classifier instance, so the sampling counter
/// is strictly per queue: verdict sequences are deterministic per queue
/// and no cross-queue serialization exists.
pub struct Classifier {
    stats: Arc<StatsMap>,
    config: Arc<ConfigSlot>,
    sample_counter: u64,
}

impl Classifier {
    pub fn new(stats: Arc<StatsMap>, config: Arc<ConfigSlot>) -> Self {
        Self {
            stats,
            config,
            sample_counter: 0,
        }
    }

    /// Classify one frame: parse, count, filter, sample.
    ///
    /// Reads one configuration snapshot, updates counters as side
    /// effects, and never fails: malformed frames yield `Pass` with
    /// `dropped_packets` incremented.
    pub fn classify(&mut self, frame: &[u8]) -> Verdict {
        let started = Instant::now();
        self.stats.add(StatId::TotalPackets, 1);
        self.stats.add(StatId::TotalBytes, frame.len() as u64);

        let verdict = self.classify_inner(frame);

        self.stats
            .add(StatId::ClassifierCpuNs, started.elapsed().as_nanos() as u64);
        verdict
    }

    fn classify_inner(&mut self, frame: &[u8]) -> Verdict {
        let parsed = match parse::parse_frame(frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                if !err.is_foreign() {
                    self.stats.add(StatId::DroppedPackets, 1);
                }
                return Verdict::Pass;
            }
        };

        match parsed.protocol {
            IPPROTO_TCP => self.stats.add(StatId::TcpPackets, 1),
            IPPROTO_UDP => self.stats.add(StatId::UdpPackets, 1),
            _ => self.stats.add(StatId::OtherPackets, 1),
        }

        let cfg = self.config.load();
        if !cfg.protocol_filter_mask.allows(parsed.protocol) {
            return Verdict::Pass;
        }
        self.stats.add(StatId::FilteredPackets, 1);

        self.sample_counter = self.sample_counter.wrapping_add(1);
        let stride = cfg.sampling_stride.max(1) as u64;
        if self.sample_counter % stride != 0 {
            return Verdict::Pass;
        }
        self.stats.add(StatId::SampledPackets, 1);

        Verdict::Steer(cfg.steer_queue_id)
    }
}

/// Receive worker: pulls frames from a source, runs the classifier and
/// performs the steering side effect.
///
/// In zero-copy mode the worker receives directly into a reserved pool
/// frame and publishing transfers ownership to the drainer without a
/// copy. A frame that is not steered stays reserved and is reused for
/// the next receive.
pub(crate) struct RxWorker {
    pub source: Box<dyn FrameSource>,
    pub classifier: Classifier,
    pub steer: Arc<SteerTable<SteerQueue>>,
    /// Steer-table index this worker publishes to.
    pub steer_id: u32,
    pub stats: Arc<StatsMap>,
    pub stop: Arc<AtomicBool>,
    pub frame_size: usize,
}

impl RxWorker {
    /// Run until stop. Returns pool frames still held by this worker so
    /// the engine can return them to their fill rings once all workers
    /// have been joined.
    pub fn run(mut self) -> Vec<(Arc<SteerQueue>, u64)> {
        let mut scratch = vec![0u8; self.frame_size];
        let mut current: Option<(Arc<SteerQueue>, u64)> = None;
        let mut parked: Vec<(Arc<SteerQueue>, u64)> = Vec::new();

        tracing::debug!(queue = self.steer_id, "rx worker started");

        while !self.stop.load(Ordering::Acquire) {
            let target = self.steer.get(self.steer_id);

            // A held frame whose queue was re-steered can no longer be
            // published or returned here; park it for shutdown recycling.
            if let Some((queue, offset)) = current.take() {
                match &target {
                    Some(t) if Arc::ptr_eq(&queue, t) => current = Some((queue, offset)),
                    _ => parked.push((queue, offset)),
                }
            }

            // Reserve a receive frame when steering into a ring.
            if current.is_none() {
                if let Some(t) = &target {
                    if let SteerQueue::Ring(ring) = &**t {
                        if let Some(offset) = ring.reserve() {
                            current = Some((Arc::clone(t), offset));
                        }
                    }
                }
            }

            let len = {
                let buf: &mut [u8] = match &current {
                    Some((queue, offset)) => match &**queue {
                        SteerQueue::Ring(ring) => ring.reserved_frame_mut(*offset),
                        SteerQueue::Copy(_) => &mut scratch,
                    },
                    None => &mut scratch,
                };
                match self.source.recv_frame(buf) {
                    Ok(Some(len)) => len.min(self.frame_size),
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::error!(queue = self.steer_id, error = %err, "receive error");
                        continue;
                    }
                }
            };

            let verdict = {
                let frame: &[u8] = match &current {
                    Some((queue, offset)) => match &**queue {
                        SteerQueue::Ring(ring) => ring.pool().frame(*offset, len),
                        SteerQueue::Copy(_) => &scratch[..len],
                    },
                    None => &scratch[..len],
                };
                self.classifier.classify(frame)
            };

            if !matches!(verdict, Verdict::Steer(_)) {
                // Pass and Drop both end here in the user-space
                // rendition; the held frame is reused for the next
                // receive.
                continue;
            }

            match &target {
                Some(t) => match &**t {
                    SteerQueue::Ring(ring) => match current.take() {
                        Some((queue, offset)) => {
                            if ring.publish(FrameDesc::new(offset, len as u16)) {
                                self.stats.add(StatId::SteeredPackets, 1);
                            } else {
                                // RX ring full: observable loss, never an
                                // error. Keep the frame for the next packet.
                                self.stats.add(StatId::DroppedPackets, 1);
                                current = Some((queue, offset));
                            }
                        }
                        None => {
                            // Fill ring was empty: drainer starvation.
                            self.stats.add(StatId::DroppedPackets, 1);
                        }
                    },
                    SteerQueue::Copy(copy) => {
                        if copy.push(scratch[..len].to_vec()) {
                            self.stats.add(StatId::SteeredPackets, 1);
                        } else {
                            self.stats.add(StatId::DroppedPackets, 1);
                        }
                    }
                },
                None => {
                    // No user-space queue registered for this index.
                    self.stats.add(StatId::DroppedPackets, 1);
                }
            }
        }

        tracing::debug!(queue = self.steer_id, "rx worker stopped");

        parked.extend(current);
        parked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::{ProtocolMask, RuntimeConfig};
    use crate::parse::ETHERTYPE_IPV4;

    fn build_udp(sport: u16, dport: u16, payload_len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; 14];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let total = 20 + 8 + payload_len as u16;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total.to_be_bytes());
        ip[8] = 64;
        ip[9] = IPPROTO_UDP;
        ip[12..16].copy_from_slice(&0x0a000001u32.to_be_bytes());
        ip[16..20].copy_from_slice(&0x0a000002u32.to_be_bytes());
        frame.extend_from_slice(&ip);
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&sport.to_be_bytes());
        udp[2..4].copy_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&udp);
        frame.extend(std::iter::repeat(0x41).take(payload_len));
        frame
    }

    fn classifier_with(cfg: RuntimeConfig) -> (Classifier, Arc<StatsMap>) {
        let stats = Arc::new(StatsMap::new());
        let config = Arc::new(ConfigSlot::new(cfg));
        (Classifier::new(Arc::clone(&stats), config), stats)
    }

    #[test]
    fn test_stride_one_steers_every_filtered_packet() {
        let (mut c, stats) = classifier_with(RuntimeConfig::default());
        for _ in 0..10 {
            assert_eq!(c.classify(&build_udp(40000, 53, 10)), Verdict::Steer(0));
        }
        assert_eq!(stats.read(StatId::TotalPackets), 10);
        assert_eq!(stats.read(StatId::UdpPackets), 10);
        assert_eq!(stats.read(StatId::SampledPackets), 10);
    }

    #[test]
    fn test_stride_ten_samples_one_in_ten() {
        let (mut c, stats) = classifier_with(RuntimeConfig {
            sampling_stride: 10,
            ..RuntimeConfig::default()
        });
        let steered = (0..1000)
            .filter(|_| matches!(c.classify(&build_udp(40000, 53, 10)), Verdict::Steer(_)))
            .count();
        assert_eq!(steered, 100);
        assert_eq!(stats.read(StatId::SampledPackets), 100);
        assert_eq!(stats.read(StatId::FilteredPackets), 1000);
    }

    #[test]
    fn test_filter_mask_passes_without_steering() {
        let (mut c, stats) = classifier_with(RuntimeConfig {
            protocol_filter_mask: ProtocolMask::TCP,
            ..RuntimeConfig::default()
        });
        assert_eq!(c.classify(&build_udp(1000, 2000, 10)), Verdict::Pass);
        // Protocol counters tick before the filter applies.
        assert_eq!(stats.read(StatId::UdpPackets), 1);
        assert_eq!(stats.read(StatId::FilteredPackets), 0);
        assert_eq!(stats.read(StatId::SampledPackets), 0);
    }

    #[test]
    fn test_malformed_frame_counts_drop_and_passes() {
        let (mut c, stats) = classifier_with(RuntimeConfig::default());
        // Ethernet header only: truncated IPv4.
        let mut frame = vec![0u8; 20];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        assert_eq!(c.classify(&frame), Verdict::Pass);
        assert_eq!(stats.read(StatId::TotalPackets), 1);
        assert_eq!(stats.read(StatId::DroppedPackets), 1);
    }

    #[test]
    fn test_non_ipv4_passes_without_drop() {
        let (mut c, stats) = classifier_with(RuntimeConfig::default());
        let mut frame = vec![0u8; 60];
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes()); // ARP
        assert_eq!(c.classify(&frame), Verdict::Pass);
        assert_eq!(stats.read(StatId::TotalPackets), 1);
        assert_eq!(stats.read(StatId::DroppedPackets), 0);
    }

    #[test]
    fn test_verdicts_deterministic() {
        let frames: Vec<Vec<u8>> = (0..50).map(|i| build_udp(40000 + i, 53, 8)).collect();
        let run = |stride| {
            let (mut c, _) = classifier_with(RuntimeConfig {
                sampling_stride: stride,
                ..RuntimeConfig::default()
            });
            frames.iter().map(|f| c.classify(f)).collect::<Vec<_>>()
        };
        assert_eq!(run(3), run(3));
    }

    #[test]
    fn test_cpu_time_accumulates() {
        let (mut c, stats) = classifier_with(RuntimeConfig::default());
        c.classify(&build_udp(1, 2, 100));
        c.classify(&build_udp(1, 2, 100));
        assert!(stats.read(StatId::ClassifierCpuNs) > 0);
        assert_eq!(stats.read(StatId::TotalBytes), 2 * 142);
    }

    #[test]
    fn test_default_tag_policy() {
        let policy = DefaultTagPolicy;
        let tag = |frame: &[u8]| policy.tag(&parse::parse_frame(frame).unwrap());

        assert_eq!(tag(&build_udp(40000, 53, 0)), TrafficClass::Priority);
        assert_eq!(tag(&build_udp(22, 50000, 0)), TrafficClass::Priority);
        assert_eq!(tag(&build_udp(50000, 60000, 0)), TrafficClass::Suspicious);
        assert_eq!(tag(&build_udp(40000, 8080, 0)), TrafficClass::Normal);
        // Boundary: 49151 is not ephemeral.
        assert_eq!(tag(&build_udp(49151, 60000, 0)), TrafficClass::Normal);
    }

    #[test]
    fn test_policy_slot_replace() {
        struct AlwaysSuspicious;
        impl TagPolicy for AlwaysSuspicious {
            fn tag(&self, _pkt: &ParsedPacket) -> TrafficClass {
                TrafficClass::Suspicious
            }
        }

        let slot = PolicySlot::default();
        let parsed = parse::parse_frame(&build_udp(40000, 53, 0)).unwrap();
        assert_eq!(slot.tag(&parsed), TrafficClass::Priority);

        slot.replace(Box::new(AlwaysSuspicious));
        assert_eq!(slot.tag(&parsed), TrafficClass::Suspicious);
    }
}
