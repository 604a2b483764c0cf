//! Engine lifecycle and control surface.
//!
//! [`Engine`] ties the components together: per-queue receive workers
//! running the classifier fast path, per-queue drainer threads, the
//! shared maps, and the live-updatable knobs. Control operations return
//! [`EngineError`]; data-path trouble (parse failures, ring pressure) is
//! counted in statistics and never surfaces as an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::{CaptureSink, CaptureTee};
use crate::classifier::{Classifier, PolicySlot, RxWorker, TagPolicy};
use crate::drainer::{AnalysisCallback, DirectionPolicy, DrainerWorker};
use crate::flow::FlowConfig;
use crate::maps::{
    ConfigSlot, ProtocolMask, RuntimeConfig, StatsMap, StatsSnapshot, SteerTable,
    MAX_STEER_QUEUES,
};
use crate::source::{self, FrameSource};
use crate::transport::{
    CopyQueue, RingQueue, SteerQueue, DEFAULT_BATCH_SIZE, DEFAULT_FRAME_SIZE,
    DEFAULT_RING_CAPACITY,
};

/// Control-surface error taxonomy.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("insufficient privileges to open raw packet sockets")]
    PermissionDenied,

    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("failed to attach to the interface: {0}")]
    AttachFailed(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("engine not initialized for this operation")]
    NotInitialized,

    #[error("engine is already running")]
    AlreadyRunning,

    /// Callback failures never abort processing; they are tallied into
    /// the `anomaly_signals` counter. The variant exists for embedders
    /// that surface callback health through their own plumbing.
    #[error("analysis callback failed: {0}")]
    CallbackFailed(String),
}

/// Full engine configuration.
///
/// The behavioral subset (stride, rate, filter mask, steer queue) can be
/// replaced live through [`Engine::update_config`]; the structural knobs
/// (rings, pool, interface, queues) are fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// NIC to attach to
    pub interface: String,

    /// Receive queues to serve, one worker pair per entry
    pub queue_ids: Vec<u32>,

    /// 1-in-N sampling; 1 steers every packet passing the filter
    pub sampling_stride: u32,

    /// Callback invocations per second, 0 for unlimited
    pub max_user_rate: u32,

    /// Protocols eligible for steering
    pub protocol_filter_mask: ProtocolMask,

    /// Target ring for single-queue deployments
    pub steer_queue_id: u32,

    /// Drainer peek limit per batch
    pub batch_size: usize,

    /// RX ring slots, power of two
    pub ring_capacity: u32,

    /// Frame slot size in bytes; must fit MTU plus headroom
    pub frame_size: usize,

    /// Frames in the pool backing each queue
    pub pool_frames: u32,

    /// Zero-copy ring delivery; false selects the copy-based fallback
    pub zero_copy_mode: bool,

    /// Drainer readiness-wait bound in milliseconds
    pub drainer_wait_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            queue_ids: vec![0],
            sampling_stride: 1,
            max_user_rate: 0,
            protocol_filter_mask: ProtocolMask::ALL,
            steer_queue_id: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            ring_capacity: DEFAULT_RING_CAPACITY,
            frame_size: DEFAULT_FRAME_SIZE,
            pool_frames: 2 * DEFAULT_RING_CAPACITY,
            zero_copy_mode: true,
            drainer_wait_timeout_ms: 1_000,
        }
    }
}

impl EngineConfig {
    /// Sized-up configuration for a target packet rate.
    ///
    /// Rings are sized for roughly two seconds of buffering at the
    /// target rate; undersized rings are the classic loss source.
    pub fn for_target_pps(target_pps: u32) -> Self {
        let ring_capacity = (2 * target_pps).next_power_of_two().clamp(1_024, 65_536);
        Self {
            ring_capacity,
            pool_frames: 2 * ring_capacity,
            batch_size: if target_pps > 100_000 { 128 } else { DEFAULT_BATCH_SIZE },
            ..Self::default()
        }
    }

    /// The live-swappable subset read by the classifier per packet.
    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            sampling_stride: self.sampling_stride,
            max_user_rate: self.max_user_rate,
            protocol_filter_mask: self.protocol_filter_mask,
            steer_queue_id: self.steer_queue_id,
        }
    }

    /// Validate everything that can be rejected before resources exist.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sampling_stride == 0 {
            return Err(EngineError::InvalidArgument(
                "sampling_stride must be at least 1".into(),
            ));
        }
        if self.ring_capacity == 0 || !self.ring_capacity.is_power_of_two() {
            return Err(EngineError::InvalidArgument(format!(
                "ring_capacity must be a power of two, got {}",
                self.ring_capacity
            )));
        }
        if self.frame_size < 64 {
            return Err(EngineError::InvalidArgument(format!(
                "frame_size {} is too small for an Ethernet frame",
                self.frame_size
            )));
        }
        if self.pool_frames == 0 {
            return Err(EngineError::InvalidArgument("pool_frames must be non-zero".into()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::InvalidArgument("batch_size must be non-zero".into()));
        }
        if self.queue_ids.is_empty() {
            return Err(EngineError::InvalidArgument("queue_ids must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for &queue in &self.queue_ids {
            if queue as usize >= MAX_STEER_QUEUES {
                return Err(EngineError::InvalidArgument(format!(
                    "queue id {queue} exceeds the {MAX_STEER_QUEUES}-entry steer table"
                )));
            }
            if !seen.insert(queue) {
                return Err(EngineError::InvalidArgument(format!(
                    "duplicate queue id {queue}"
                )));
            }
        }
        if self.steer_queue_id as usize >= MAX_STEER_QUEUES {
            return Err(EngineError::InvalidArgument(format!(
                "steer_queue_id {} exceeds the {MAX_STEER_QUEUES}-entry steer table",
                self.steer_queue_id
            )));
        }
        let pool_bytes = self.pool_frames as u64 * self.frame_size as u64;
        if pool_bytes >= 1 << 48 {
            return Err(EngineError::ResourceExhausted(format!(
                "frame pool of {pool_bytes} bytes exceeds the descriptor offset space"
            )));
        }
        Ok(())
    }

    fn drainer_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.drainer_wait_timeout_ms)
    }

    /// Steer-table index for each configured queue. A single-queue
    /// engine publishes under `steer_queue_id`; multi-queue engines
    /// steer each queue to its own ring.
    fn steer_targets(&self) -> Vec<u32> {
        if self.queue_ids.len() == 1 {
            vec![self.steer_queue_id]
        } else {
            self.queue_ids.clone()
        }
    }

    /// Fields that cannot change while workers are running.
    fn structurally_equal(&self, other: &EngineConfig) -> bool {
        self.interface == other.interface
            && self.queue_ids == other.queue_ids
            && self.batch_size == other.batch_size
            && self.ring_capacity == other.ring_capacity
            && self.frame_size == other.frame_size
            && self.pool_frames == other.pool_frames
            && self.zero_copy_mode == other.zero_copy_mode
            && self.drainer_wait_timeout_ms == other.drainer_wait_timeout_ms
    }
}

/// Per-queue frame accounting, for conservation checks and operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueOccupancy {
    pub steer_id: u32,
    pub pool_frames: u64,
    pub free_frames: u64,
    pub ready_frames: u64,
}

/// The packet preprocessing engine.
///
/// Create with [`Engine::init`] (NIC-backed) or [`Engine::with_sources`]
/// (embedder-supplied frame sources), then [`Engine::start`]. Dropping a
/// running engine stops it.
pub struct Engine {
    config: Mutex<EngineConfig>,
    runtime: Arc<ConfigSlot>,
    stats: Arc<StatsMap>,
    policy: Arc<PolicySlot>,
    steer: Arc<SteerTable<SteerQueue>>,
    flow: Arc<ArcSwapOption<FlowConfig>>,
    capture: Arc<ArcSwapOption<CaptureTee>>,
    callback: Arc<dyn AnalysisCallback>,
    direction: Mutex<DirectionPolicy>,
    stop: Arc<AtomicBool>,
    running: Mutex<bool>,
    pending_sources: Mutex<Vec<Box<dyn FrameSource>>>,
    rx_handles: Mutex<Vec<JoinHandle<Vec<(Arc<SteerQueue>, u64)>>>>,
    drainer_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Initialize a NIC-backed engine.
    ///
    /// Fails fast on misconfiguration: an unknown interface is
    /// `InterfaceNotFound`, missing raw-socket privilege is
    /// `PermissionDenied`. Sockets are opened by [`Engine::start`].
    pub fn init(
        config: EngineConfig,
        callback: Arc<dyn AnalysisCallback>,
    ) -> Result<Engine, EngineError> {
        config.validate()?;
        if config.interface.is_empty() {
            return Err(EngineError::InvalidArgument("interface is required".into()));
        }
        if source::if_index(&config.interface).is_none() {
            return Err(EngineError::InterfaceNotFound(config.interface.clone()));
        }
        if !source::check_permissions() {
            return Err(EngineError::PermissionDenied);
        }
        Ok(Self::build(config, callback, Vec::new()))
    }

    /// Initialize with caller-supplied frame sources, one per configured
    /// queue, in `queue_ids` order. Used by tests, benchmarks and
    /// embedders that feed frames from something other than a NIC.
    pub fn with_sources(
        config: EngineConfig,
        callback: Arc<dyn AnalysisCallback>,
        sources: Vec<Box<dyn FrameSource>>,
    ) -> Result<Engine, EngineError> {
        config.validate()?;
        if sources.len() != config.queue_ids.len() {
            return Err(EngineError::InvalidArgument(format!(
                "{} sources supplied for {} queues",
                sources.len(),
                config.queue_ids.len()
            )));
        }
        Ok(Self::build(config, callback, sources))
    }

    fn build(
        config: EngineConfig,
        callback: Arc<dyn AnalysisCallback>,
        sources: Vec<Box<dyn FrameSource>>,
    ) -> Engine {
        let runtime = Arc::new(ConfigSlot::new(config.runtime()));
        Engine {
            runtime,
            stats: Arc::new(StatsMap::new()),
            policy: Arc::new(PolicySlot::default()),
            steer: Arc::new(SteerTable::new()),
            flow: Arc::new(ArcSwapOption::const_empty()),
            capture: Arc::new(ArcSwapOption::const_empty()),
            callback,
            direction: Mutex::new(DirectionPolicy::default()),
            stop: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(false),
            pending_sources: Mutex::new(sources),
            rx_handles: Mutex::new(Vec::new()),
            drainer_handles: Mutex::new(Vec::new()),
            config: Mutex::new(config),
        }
    }

    /// Spawn the per-queue worker pairs and begin processing.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock();
        if *running {
            return Err(EngineError::AlreadyRunning);
        }

        let config = self.config.lock().clone();
        let sources = self.take_sources(&config)?;
        let targets = config.steer_targets();

        self.stop.store(false, Ordering::Release);

        let mut rx_handles = self.rx_handles.lock();
        let mut drainer_handles = self.drainer_handles.lock();

        for (source, &steer_id) in sources.into_iter().zip(&targets) {
            let queue: Arc<SteerQueue> = Arc::new(if config.zero_copy_mode {
                SteerQueue::Ring(RingQueue::new(
                    config.ring_capacity,
                    config.pool_frames,
                    config.frame_size,
                ))
            } else {
                SteerQueue::Copy(CopyQueue::new(config.ring_capacity as usize))
            });
            self.steer.set(steer_id, Arc::clone(&queue));

            let rx = RxWorker {
                source,
                classifier: Classifier::new(Arc::clone(&self.stats), Arc::clone(&self.runtime)),
                steer: Arc::clone(&self.steer),
                steer_id,
                stats: Arc::clone(&self.stats),
                stop: Arc::clone(&self.stop),
                frame_size: config.frame_size,
            };
            let rx_handle = std::thread::Builder::new()
                .name(format!("xfeat-rx{steer_id}"))
                .spawn(move || rx.run())
                .map_err(|e| EngineError::ResourceExhausted(e.to_string()))?;
            rx_handles.push(rx_handle);

            let drainer = DrainerWorker {
                queue,
                queue_id: steer_id,
                stats: Arc::clone(&self.stats),
                config: Arc::clone(&self.runtime),
                policy: Arc::clone(&self.policy),
                direction: self.direction.lock().clone(),
                flow: Arc::clone(&self.flow),
                capture: Arc::clone(&self.capture),
                callback: Arc::clone(&self.callback),
                stop: Arc::clone(&self.stop),
                batch_size: config.batch_size,
                wait_timeout: config.drainer_wait_timeout(),
            };
            let drainer_handle = std::thread::Builder::new()
                .name(format!("xfeat-drain{steer_id}"))
                .spawn(move || drainer.run())
                .map_err(|e| EngineError::ResourceExhausted(e.to_string()))?;
            drainer_handles.push(drainer_handle);
        }

        *running = true;
        tracing::info!(
            queues = targets.len(),
            zero_copy = config.zero_copy_mode,
            "engine started"
        );
        Ok(())
    }

    fn take_sources(&self, config: &EngineConfig) -> Result<Vec<Box<dyn FrameSource>>, EngineError> {
        let mut pending = self.pending_sources.lock();
        if !pending.is_empty() {
            return Ok(std::mem::take(&mut *pending));
        }
        if config.interface.is_empty() {
            return Err(EngineError::AttachFailed(
                "no frame sources available; supplied sources are consumed by start".into(),
            ));
        }
        self.open_nic_sources(config)
    }

    #[cfg(target_os = "linux")]
    fn open_nic_sources(&self, config: &EngineConfig) -> Result<Vec<Box<dyn FrameSource>>, EngineError> {
        // Fanout groups are per (group-id, interface); derive one from
        // the pid so concurrent engines do not collide.
        let fanout = if config.queue_ids.len() > 1 {
            Some((std::process::id() & 0xffff) as u16)
        } else {
            None
        };
        let mut sources: Vec<Box<dyn FrameSource>> = Vec::with_capacity(config.queue_ids.len());
        for &queue in &config.queue_ids {
            sources.push(Box::new(source::AfPacketSource::open(
                &config.interface,
                queue,
                fanout,
            )?));
        }
        Ok(sources)
    }

    #[cfg(not(target_os = "linux"))]
    fn open_nic_sources(&self, _config: &EngineConfig) -> Result<Vec<Box<dyn FrameSource>>, EngineError> {
        Err(EngineError::AttachFailed(
            "NIC attachment requires Linux AF_PACKET support".into(),
        ))
    }

    /// Request a cooperative stop and block until every worker exits.
    ///
    /// Idempotent; returns once all drainers have drained their peeked
    /// batches and returned their frames.
    pub fn stop(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock();
        if !*running {
            return Ok(());
        }
        self.stop.store(true, Ordering::Release);

        let mut leftovers = Vec::new();
        for handle in self.rx_handles.lock().drain(..) {
            match handle.join() {
                Ok(held) => leftovers.extend(held),
                Err(_) => tracing::error!("receive worker panicked"),
            }
        }
        for handle in self.drainer_handles.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("drainer worker panicked");
            }
        }

        // With every worker joined the fill rings have no producer left,
        // so frames the receive workers still held can go back now.
        for (queue, offset) in leftovers {
            if let SteerQueue::Ring(ring) = &*queue {
                ring.recycle(offset);
            }
        }

        *running = false;
        tracing::info!("engine stopped");
        Ok(())
    }

    /// Whether workers are currently running.
    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Point-in-time statistics snapshot.
    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Replace the configuration.
    ///
    /// While running, only the behavioral subset may change; structural
    /// knobs (interface, queues, rings, pool, delivery mode) are
    /// rejected with `InvalidArgument`. The new behavioral snapshot is
    /// visible to the classifier on its next packet.
    pub fn update_config(&self, new: EngineConfig) -> Result<(), EngineError> {
        new.validate()?;
        // Lock order everywhere: running before config.
        let running = self.running.lock();
        let mut config = self.config.lock();
        if *running && !config.structurally_equal(&new) {
            return Err(EngineError::InvalidArgument(
                "structural configuration changes require re-init".into(),
            ));
        }
        self.runtime.store(new.runtime());
        *config = new;
        Ok(())
    }

    /// Replace the traffic-tagging rule set; live.
    pub fn set_classifier(&self, policy: Box<dyn TagPolicy>) {
        self.policy.replace(policy);
    }

    /// Replace the direction policy. Drainers capture the policy at
    /// spawn, so this must be called before [`Engine::start`].
    pub fn set_direction_policy(&self, policy: DirectionPolicy) -> Result<(), EngineError> {
        if *self.running.lock() {
            return Err(EngineError::AlreadyRunning);
        }
        *self.direction.lock() = policy;
        Ok(())
    }

    /// Tee raw frames plus extracted records into `sink`, stopping after
    /// `max_frames`. Live; replaces any previous capture.
    pub fn enable_capture(&self, sink: Box<dyn CaptureSink>, max_frames: u32) {
        self.capture
            .store(Some(Arc::new(CaptureTee::new(sink, max_frames))));
    }

    /// Enable per-drainer flow tracking; live. Each drainer keeps its
    /// own bounded table, so memory cost is per queue.
    pub fn enable_flow_tracking(
        &self,
        max_entries: usize,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        if max_entries == 0 {
            return Err(EngineError::InvalidArgument(
                "flow table needs at least one entry".into(),
            ));
        }
        self.flow.store(Some(Arc::new(FlowConfig {
            max_entries,
            timeout_ns: timeout.as_nanos() as u64,
        })));
        Ok(())
    }

    /// Frame accounting per registered queue. In zero-copy mode,
    /// `free + ready` equals `pool` whenever no worker holds frames.
    pub fn occupancy(&self) -> Vec<QueueOccupancy> {
        let config = self.config.lock();
        config
            .steer_targets()
            .iter()
            .filter_map(|&steer_id| {
                let queue = self.steer.get(steer_id)?;
                match &*queue {
                    SteerQueue::Ring(ring) => Some(QueueOccupancy {
                        steer_id,
                        pool_frames: ring.pool().frames() as u64,
                        free_frames: ring.free_frames(),
                        ready_frames: ring.ready_frames(),
                    }),
                    SteerQueue::Copy(copy) => Some(QueueOccupancy {
                        steer_id,
                        pool_frames: 0,
                        free_frames: 0,
                        ready_frames: copy.len() as u64,
                    }),
                }
            })
            .collect()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
