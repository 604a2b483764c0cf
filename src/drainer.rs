//! User-space drainer.
//!
//! One drainer per steered queue. Each iteration waits for ring
//! readiness with a bounded timeout, peeks a batch of descriptors,
//! re-parses each frame into a [`FeatureRecord`], invokes the analysis
//! callback, and returns the batch to the fill ring. Frames are always
//! returned, even when the callback panics or the delivery budget is
//! exhausted.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use ipnet::Ipv4Net;

use crate::capture::CaptureTee;
use crate::classifier::PolicySlot;
use crate::flow::{FlowConfig, FlowTable};
use crate::maps::{ConfigSlot, StatId, StatsMap};
use crate::parse;
use crate::record::{monotonic_ns, payload_entropy, Direction, FeatureRecord};
use crate::transport::SteerQueue;

/// Analysis callback invoked for every delivered record.
///
/// Invocations are synchronous and may run concurrently from multiple
/// drainer threads (one per queue); implementations must be reentrant.
/// The record is borrowed for the duration of the call and must not be
/// retained. The returned integer is opaque to the engine: non-zero
/// returns are tallied into the `anomaly_signals` counter, nothing more.
pub trait AnalysisCallback: Send + Sync {
    fn on_record(&self, record: &FeatureRecord) -> i32;
}

impl<F> AnalysisCallback for F
where
    F: Fn(&FeatureRecord) -> i32 + Send + Sync,
{
    fn on_record(&self, record: &FeatureRecord) -> i32 {
        self(record)
    }
}

/// How the drainer decides a record's direction.
#[derive(Debug, Clone)]
pub enum DirectionPolicy {
    /// Default heuristic: a higher source port marks locally originated
    /// traffic.
    PortHeuristic,

    /// A source address inside one of these networks marks the packet
    /// outbound.
    LocalSubnets(Vec<Ipv4Net>),
}

impl Default for DirectionPolicy {
    fn default() -> Self {
        DirectionPolicy::PortHeuristic
    }
}

impl DirectionPolicy {
    pub fn direction(&self, src_ip: u32, src_port: u16, dst_port: u16) -> Direction {
        match self {
            DirectionPolicy::PortHeuristic => {
                if src_port > dst_port {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                }
            }
            DirectionPolicy::LocalSubnets(nets) => {
                let src = std::net::Ipv4Addr::from(src_ip);
                if nets.iter().any(|net| net.contains(&src)) {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                }
            }
        }
    }
}

/// Extract the full feature record from a raw frame.
///
/// This is the drainer's re-parse: the classifier's per-packet state is
/// not carried across the ring, so all enriched fields are derived here.
/// Returns None for frames that no longer parse (which the drainer
/// counts as drops).
pub fn extract_record(
    frame: &[u8],
    policy: &PolicySlot,
    direction: &DirectionPolicy,
    flow: Option<&mut FlowTable>,
) -> Option<FeatureRecord> {
    let parsed = parse::parse_frame(frame).ok()?;
    let now = monotonic_ns();
    let flow_hash = parsed.flow_hash();

    let inter_arrival_time = match flow {
        Some(table) => table.observe(flow_hash, now),
        None => 0,
    };

    Some(FeatureRecord {
        src_ip: parsed.src_ip,
        dst_ip: parsed.dst_ip,
        src_port: parsed.src_port,
        dst_port: parsed.dst_port,
        protocol: parsed.protocol,
        pkt_len: parsed.pkt_len,
        payload_len: parsed.payload_len,
        tcp_flags: parsed.tcp_flags,
        window_size: parsed.window_size,
        ttl: parsed.ttl,
        flow_hash,
        timestamp: now,
        packet_entropy: payload_entropy(parsed.payload(frame)),
        inter_arrival_time,
        traffic_class: policy.tag(&parsed),
        direction: direction.direction(parsed.src_ip, parsed.src_port, parsed.dst_port),
    })
}

/// Per-second delivery budget for `max_user_rate`.
struct RateBudget {
    window_start: Instant,
    used: u32,
}

impl RateBudget {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            used: 0,
        }
    }

    /// Whether one more callback fits the current one-second window.
    fn allow(&mut self, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.used = 0;
        }
        if self.used < limit {
            self.used += 1;
            true
        } else {
            false
        }
    }
}

/// Drainer thread body for one steered queue.
pub(crate) struct DrainerWorker {
    pub queue: Arc<SteerQueue>,
    pub queue_id: u32,
    pub stats: Arc<StatsMap>,
    pub config: Arc<ConfigSlot>,
    pub policy: Arc<PolicySlot>,
    pub direction: DirectionPolicy,
    /// Flow tracking parameters; swapping in a value enables tracking
    /// live, each drainer then builds its own table.
    pub flow: Arc<ArcSwapOption<FlowConfig>>,
    pub capture: Arc<ArcSwapOption<CaptureTee>>,
    pub callback: Arc<dyn AnalysisCallback>,
    pub stop: Arc<AtomicBool>,
    pub batch_size: usize,
    pub wait_timeout: Duration,
}

impl DrainerWorker {
    pub fn run(self) {
        let mut flow_table: Option<FlowTable> = None;
        let mut flow_active: Option<FlowConfig> = None;
        let mut budget = RateBudget::new();
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut copied: Vec<Vec<u8>> = Vec::with_capacity(self.batch_size);

        tracing::debug!(queue = self.queue_id, "drainer started");

        while !self.stop.load(Ordering::Acquire) {
            if !self.queue.wait_ready(self.wait_timeout) {
                continue;
            }

            // Pick up live flow-tracking changes between batches.
            let wanted = self.flow.load_full().map(|cfg| *cfg);
            if wanted != flow_active {
                flow_table = wanted.map(FlowTable::new);
                flow_active = wanted;
            }

            match &*self.queue {
                SteerQueue::Ring(ring) => {
                    let n = ring.peek(&mut batch, self.batch_size);
                    if n == 0 {
                        continue;
                    }
                    for desc in &batch[..n] {
                        self.process_frame(ring.frame(*desc), flow_table.as_mut(), &mut budget);
                    }
                    // The whole batch goes back to the fill ring, record
                    // or no record.
                    ring.release(&batch[..n]);
                }
                SteerQueue::Copy(queue) => {
                    let n = queue.pop_batch(&mut copied, self.batch_size);
                    for frame in &copied[..n] {
                        self.process_frame(frame, flow_table.as_mut(), &mut budget);
                    }
                }
            }
        }

        tracing::debug!(queue = self.queue_id, "drainer stopped");
    }

    fn process_frame(&self, frame: &[u8], flow: Option<&mut FlowTable>, budget: &mut RateBudget) {
        let record = match extract_record(frame, &self.policy, &self.direction, flow) {
            Some(record) => record,
            None => {
                self.stats.add(StatId::DroppedPackets, 1);
                return;
            }
        };

        if let Some(tee) = self.capture.load_full() {
            tee.tee(frame, &record);
        }

        let cfg = self.config.load();
        if !budget.allow(cfg.max_user_rate) {
            // Budget exhausted: skip delivery, the frame still returns.
            return;
        }

        match catch_unwind(AssertUnwindSafe(|| self.callback.on_record(&record))) {
            Ok(signal) => {
                self.stats.add(StatId::RecordsDelivered, 1);
                if signal != 0 {
                    self.stats.add(StatId::AnomalySignals, 1);
                }
            }
            Err(_) => {
                // A panicking callback is signal noise, not a reason to
                // stall frame return.
                self.stats.add(StatId::AnomalySignals, 1);
                tracing::warn!(queue = self.queue_id, "analysis callback panicked");
            }
        }
    }
}
