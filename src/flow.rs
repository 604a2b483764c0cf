//! Per-drainer flow tracking.
//!
//! A bounded map from flow hash to last-seen state, used to derive the
//! inter-arrival feature. Each drainer owns its own table, so lookups and
//! eviction need no synchronization. Entries expire by timeout on lookup
//! and by age-based eviction when the table is full.

use std::collections::HashMap;

/// State kept per tracked flow.
#[derive(Debug, Clone, Copy)]
pub struct FlowState {
    pub last_seen_ns: u64,
    pub packet_count: u64,
}

/// Flow-tracking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    /// Maximum tracked flows per drainer
    pub max_entries: usize,

    /// Idle time after which a flow is forgotten
    pub timeout_ns: u64,
}

/// Bounded per-drainer flow table.
pub struct FlowTable {
    entries: HashMap<u64, FlowState>,
    config: FlowConfig,
}

impl FlowTable {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            entries: HashMap::with_capacity(config.max_entries.min(4096)),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a packet for `flow_hash` at `now_ns` and return the
    /// microseconds since the flow's previous packet.
    ///
    /// Returns 0 for flows seen for the first time or after expiry. The
    /// delta is clamped to the u32 range.
    pub fn observe(&mut self, flow_hash: u64, now_ns: u64) -> u32 {
        if let Some(state) = self.entries.get_mut(&flow_hash) {
            let age = now_ns.saturating_sub(state.last_seen_ns);
            if age <= self.config.timeout_ns {
                state.packet_count += 1;
                state.last_seen_ns = now_ns;
                return (age / 1_000).min(u32::MAX as u64) as u32;
            }
            // Expired: treat as a fresh flow.
            state.packet_count = 1;
            state.last_seen_ns = now_ns;
            return 0;
        }

        if self.entries.len() >= self.config.max_entries {
            self.evict(now_ns);
        }
        self.entries.insert(
            flow_hash,
            FlowState {
                last_seen_ns: now_ns,
                packet_count: 1,
            },
        );
        0
    }

    pub fn get(&self, flow_hash: u64) -> Option<&FlowState> {
        self.entries.get(&flow_hash)
    }

    /// Drop expired flows; if none expired, drop the oldest eighth so
    /// one eviction pays for many inserts.
    fn evict(&mut self, now_ns: u64) {
        let timeout = self.config.timeout_ns;
        let before = self.entries.len();
        self.entries
            .retain(|_, state| now_ns.saturating_sub(state.last_seen_ns) <= timeout);
        if self.entries.len() < before {
            return;
        }

        let mut by_age: Vec<(u64, u64)> = self
            .entries
            .iter()
            .map(|(&hash, state)| (state.last_seen_ns, hash))
            .collect();
        by_age.sort_unstable();

        let to_remove = (self.entries.len() / 8).max(1);
        for &(_, hash) in by_age.iter().take(to_remove) {
            self.entries.remove(&hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn table(max_entries: usize, timeout_ns: u64) -> FlowTable {
        FlowTable::new(FlowConfig {
            max_entries,
            timeout_ns,
        })
    }

    #[test]
    fn test_first_sighting_is_zero() {
        let mut t = table(16, 60_000 * MS);
        assert_eq!(t.observe(42, 1000 * MS), 0);
        assert_eq!(t.get(42).unwrap().packet_count, 1);
    }

    #[test]
    fn test_inter_arrival_microseconds() {
        let mut t = table(16, 60_000 * MS);
        t.observe(42, 1000 * MS);
        // 5 ms later: 5000 us.
        assert_eq!(t.observe(42, 1005 * MS), 5000);
        assert_eq!(t.get(42).unwrap().packet_count, 2);
    }

    #[test]
    fn test_timeout_resets_flow() {
        let mut t = table(16, 10 * MS);
        t.observe(7, 0);
        assert_eq!(t.observe(7, 100 * MS), 0, "expired flow restarts");
        assert_eq!(t.get(7).unwrap().packet_count, 1);
    }

    #[test]
    fn test_clamped_to_u32() {
        let mut t = table(16, u64::MAX);
        t.observe(9, 0);
        // Far beyond u32::MAX microseconds.
        assert_eq!(t.observe(9, u64::MAX / 2), u32::MAX);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut t = table(8, u64::MAX);
        for hash in 0..100u64 {
            t.observe(hash, hash);
        }
        assert!(t.len() <= 8);
    }

    #[test]
    fn test_eviction_prefers_expired() {
        let mut t = table(4, 10 * MS);
        t.observe(1, 0);
        t.observe(2, 0);
        t.observe(3, 50 * MS);
        t.observe(4, 50 * MS);
        // Flows 1 and 2 are expired at insert time and get evicted.
        t.observe(5, 51 * MS);
        assert!(t.get(1).is_none());
        assert!(t.get(2).is_none());
        assert!(t.get(3).is_some());
        assert!(t.get(5).is_some());
    }

    #[test]
    fn test_eviction_falls_back_to_oldest() {
        let mut t = table(4, u64::MAX);
        for hash in 1..=4u64 {
            t.observe(hash, hash * MS);
        }
        t.observe(5, 10 * MS);
        assert!(t.get(1).is_none(), "oldest flow evicted");
        assert!(t.get(5).is_some());
        assert!(t.len() <= 4);
    }
}
