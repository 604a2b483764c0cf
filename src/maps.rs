//! Shared map layer: statistics counters, the live configuration slot and
//! the queue steering table.
//!
//! These are the tables both execution domains touch. The fast path only
//! ever performs lock-free operations on them: relaxed fetch-adds on the
//! counters, a pointer load on the config slot, a pointer load on a steer
//! slot. Writers live on the control plane and swap whole snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::parse::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};

/// Statistics counter indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatId {
    /// Every frame seen by the classifier
    TotalPackets = 0,

    /// Frames that passed the protocol filter
    FilteredPackets,

    /// Frames selected by the sampling decision
    SampledPackets,

    /// Frames handed to a user-space ring
    SteeredPackets,

    /// Parse failures plus ring-pressure losses
    DroppedPackets,

    TcpPackets,
    UdpPackets,
    OtherPackets,

    /// Bytes seen by the classifier
    TotalBytes,

    /// Accumulated classifier wall time
    ClassifierCpuNs,

    /// Records actually delivered to the analysis callback
    RecordsDelivered,

    /// Non-zero callback returns plus callback panics
    AnomalySignals,
}

pub const STAT_COUNT: usize = StatId::AnomalySignals as usize + 1;

/// Lock-free statistics table.
///
/// Counters are monotonic u64s updated with wrapping fetch-adds; readers
/// are eventually consistent and must tolerate unsigned wrap.
#[derive(Debug)]
pub struct StatsMap {
    counters: [CachePadded<AtomicU64>; STAT_COUNT],
}

impl StatsMap {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| CachePadded::new(AtomicU64::new(0))),
        }
    }

    /// Atomic fetch-add, safe from any context.
    #[inline]
    pub fn add(&self, id: StatId, delta: u64) {
        self.counters[id as usize].fetch_add(delta, Ordering::Relaxed);
    }

    /// Non-blocking read of a single counter.
    #[inline]
    pub fn read(&self, id: StatId) -> u64 {
        self.counters[id as usize].load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot. Counters are read independently, so a
    /// snapshot may see one counter advance before another.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_packets: self.read(StatId::TotalPackets),
            filtered_packets: self.read(StatId::FilteredPackets),
            sampled_packets: self.read(StatId::SampledPackets),
            steered_packets: self.read(StatId::SteeredPackets),
            dropped_packets: self.read(StatId::DroppedPackets),
            tcp_packets: self.read(StatId::TcpPackets),
            udp_packets: self.read(StatId::UdpPackets),
            other_packets: self.read(StatId::OtherPackets),
            total_bytes: self.read(StatId::TotalBytes),
            classifier_cpu_ns: self.read(StatId::ClassifierCpuNs),
            records_delivered: self.read(StatId::RecordsDelivered),
            anomaly_signals: self.read(StatId::AnomalySignals),
        }
    }
}

impl Default for StatsMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of the statistics table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_packets: u64,
    pub filtered_packets: u64,
    pub sampled_packets: u64,
    pub steered_packets: u64,
    pub dropped_packets: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub other_packets: u64,
    pub total_bytes: u64,
    pub classifier_cpu_ns: u64,
    pub records_delivered: u64,
    pub anomaly_signals: u64,
}

/// Protocol selection bitset for the classifier filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMask(pub u8);

impl ProtocolMask {
    pub const TCP: ProtocolMask = ProtocolMask(1 << 0);
    pub const UDP: ProtocolMask = ProtocolMask(1 << 1);
    pub const ICMP: ProtocolMask = ProtocolMask(1 << 2);
    pub const OTHER: ProtocolMask = ProtocolMask(1 << 3);
    pub const ALL: ProtocolMask = ProtocolMask(0b1111);

    pub const fn union(self, other: ProtocolMask) -> ProtocolMask {
        ProtocolMask(self.0 | other.0)
    }

    pub const fn contains(self, other: ProtocolMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether a packet of the given IANA protocol passes the filter.
    pub fn allows(self, protocol: u8) -> bool {
        let bit = match protocol {
            IPPROTO_TCP => Self::TCP,
            IPPROTO_UDP => Self::UDP,
            IPPROTO_ICMP => Self::ICMP,
            _ => Self::OTHER,
        };
        self.0 & bit.0 != 0
    }
}

impl Default for ProtocolMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Behavioral configuration read by the classifier, one snapshot per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 1-in-N sampling; 1 steers every packet passing the filter
    pub sampling_stride: u32,

    /// Callback invocations per second, 0 for unlimited
    pub max_user_rate: u32,

    /// Protocols eligible for steering
    pub protocol_filter_mask: ProtocolMask,

    /// Ring to push steered frames to (single-queue deployments)
    pub steer_queue_id: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sampling_stride: 1,
            max_user_rate: 0,
            protocol_filter_mask: ProtocolMask::ALL,
            steer_queue_id: 0,
        }
    }
}

/// Single-slot configuration table with atomic snapshot replacement.
///
/// Readers observe either the old or the new snapshot, never a torn value.
#[derive(Debug)]
pub struct ConfigSlot {
    inner: ArcSwap<RuntimeConfig>,
}

impl ConfigSlot {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    /// Consistent snapshot for one packet's worth of decisions.
    #[inline]
    pub fn load(&self) -> RuntimeConfig {
        **self.inner.load()
    }

    /// Install a new snapshot; takes effect on the next packet.
    pub fn store(&self, config: RuntimeConfig) {
        self.inner.store(Arc::new(config));
    }
}

/// Maximum steerable queues, mirroring the classic 64-entry XSKMAP.
pub const MAX_STEER_QUEUES: usize = 64;

/// Queue-index to user-space-queue steering table.
///
/// Control-plane writers install or clear handles; the classifier resolves
/// a handle per steered packet with a lock-free pointer load.
pub struct SteerTable<T> {
    slots: Box<[ArcSwapOption<T>]>,
}

impl<T> SteerTable<T> {
    pub fn new() -> Self {
        let slots: Vec<ArcSwapOption<T>> = (0..MAX_STEER_QUEUES)
            .map(|_| ArcSwapOption::const_empty())
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Install a handle for `queue_id`. Returns false when the index is
    /// outside the table; the table has static capacity by design.
    pub fn set(&self, queue_id: u32, handle: Arc<T>) -> bool {
        match self.slots.get(queue_id as usize) {
            Some(slot) => {
                slot.store(Some(handle));
                true
            }
            None => false,
        }
    }

    /// Clear the handle for `queue_id`.
    pub fn unset(&self, queue_id: u32) {
        if let Some(slot) = self.slots.get(queue_id as usize) {
            slot.store(None);
        }
    }

    /// Resolve the handle for `queue_id`, if any.
    #[inline]
    pub fn get(&self, queue_id: u32) -> Option<Arc<T>> {
        self.slots.get(queue_id as usize)?.load_full()
    }
}

impl<T> Default for SteerTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_add_and_read() {
        let stats = StatsMap::new();
        stats.add(StatId::TotalPackets, 3);
        stats.add(StatId::TotalPackets, 2);
        assert_eq!(stats.read(StatId::TotalPackets), 5);
        assert_eq!(stats.read(StatId::DroppedPackets), 0);
    }

    #[test]
    fn test_stats_wrap() {
        let stats = StatsMap::new();
        stats.add(StatId::TotalBytes, u64::MAX);
        stats.add(StatId::TotalBytes, 2);
        assert_eq!(stats.read(StatId::TotalBytes), 1);
    }

    #[test]
    fn test_snapshot_monotonic() {
        let stats = StatsMap::new();
        stats.add(StatId::TcpPackets, 1);
        let a = stats.snapshot();
        stats.add(StatId::TcpPackets, 1);
        let b = stats.snapshot();
        assert!(b.tcp_packets >= a.tcp_packets);
    }

    #[test]
    fn test_protocol_mask() {
        let mask = ProtocolMask::TCP.union(ProtocolMask::UDP);
        assert!(mask.allows(IPPROTO_TCP));
        assert!(mask.allows(IPPROTO_UDP));
        assert!(!mask.allows(IPPROTO_ICMP));
        assert!(!mask.allows(47)); // GRE falls into OTHER
        assert!(ProtocolMask::ALL.allows(47));
    }

    #[test]
    fn test_config_slot_swap() {
        let slot = ConfigSlot::new(RuntimeConfig::default());
        assert_eq!(slot.load().sampling_stride, 1);

        slot.store(RuntimeConfig {
            sampling_stride: 100,
            ..RuntimeConfig::default()
        });
        assert_eq!(slot.load().sampling_stride, 100);
    }

    #[test]
    fn test_steer_table() {
        let table: SteerTable<u32> = SteerTable::new();
        assert!(table.get(0).is_none());

        assert!(table.set(3, Arc::new(42)));
        assert_eq!(*table.get(3).unwrap(), 42);

        table.unset(3);
        assert!(table.get(3).is_none());

        assert!(!table.set(MAX_STEER_QUEUES as u32, Arc::new(1)));
    }
}
