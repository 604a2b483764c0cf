//! XFEAT: zero-copy packet feature extraction engine
//!
//! A high-throughput preprocessing engine that turns live network traffic
//! into fixed-shape feature records for downstream analytics (intrusion
//! detection, flow telemetry, ML inference).
//!
//! ## Architecture
//!
//! - **Classifier fast path**: per-packet L2-L4 parse, counters,
//!   protocol filter and sampling, ending in a verdict
//! - **Zero-copy transport**: per-queue SPSC ring pairs over a shared
//!   frame pool hand selected frames to user space without copying
//! - **Drainer**: batch consumption, enriched feature extraction and a
//!   pluggable analysis callback, isolated from callback failures
//! - **Shared maps**: lock-free statistics, an atomically swappable
//!   configuration slot and a queue steering table
//! - **Observability**: structured tracing plus Prometheus export
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use xfeat::{Engine, EngineConfig, FeatureRecord};
//!
//! let config = EngineConfig {
//!     interface: "eth0".into(),
//!     sampling_stride: 10,
//!     ..EngineConfig::default()
//! };
//!
//! let callback = Arc::new(|record: &FeatureRecord| -> i32 {
//!     if record.packet_entropy > 200 { 1 } else { 0 }
//! });
//!
//! let engine = Engine::init(config, callback)?;
//! engine.start()?;
//! // ...
//! engine.stop()?;
//! # Ok::<(), xfeat::EngineError>(())
//! ```

pub mod capture;
pub mod classifier;
pub mod drainer;
pub mod engine;
pub mod flow;
pub mod maps;
pub mod metrics;
pub mod parse;
pub mod record;
pub mod source;
pub mod transport;

// --- primary API re-exports ---

pub use engine::{Engine, EngineConfig, EngineError, QueueOccupancy};

pub use record::{flow_hash, payload_entropy, Direction, FeatureRecord, TrafficClass};

pub use classifier::{DefaultTagPolicy, TagPolicy, Verdict};

pub use drainer::{AnalysisCallback, DirectionPolicy};

pub use maps::{ProtocolMask, RuntimeConfig, StatsSnapshot};

pub use capture::{CaptureSink, PcapCapture};

pub use source::{channel_source, FrameInjector, FrameSource};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information.
pub mod build_info {
    /// Git commit hash (if available)
    pub const GIT_HASH: &str = match option_env!("GIT_HASH") {
        Some(v) => v,
        None => "unknown",
    };

    /// Build timestamp
    pub const BUILD_TIME: &str = match option_env!("BUILD_TIME") {
        Some(v) => v,
        None => "unknown",
    };

    /// Target triple
    pub const TARGET: &str = env!("TARGET");
}

/// Default configuration constants.
pub mod defaults {
    /// Default drainer batch size
    pub const BATCH_SIZE: usize = crate::transport::DEFAULT_BATCH_SIZE;

    /// Default RX ring capacity
    pub const RING_CAPACITY: u32 = crate::transport::DEFAULT_RING_CAPACITY;

    /// Default frame slot size
    pub const FRAME_SIZE: usize = crate::transport::DEFAULT_FRAME_SIZE;

    /// Default drainer readiness-wait bound in milliseconds
    pub const DRAINER_WAIT_TIMEOUT_MS: u64 = 1_000;
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::drainer::{AnalysisCallback, DirectionPolicy};
    pub use crate::engine::{Engine, EngineConfig, EngineError};
    pub use crate::maps::{ProtocolMask, StatsSnapshot};
    pub use crate::record::{Direction, FeatureRecord, TrafficClass};
}
