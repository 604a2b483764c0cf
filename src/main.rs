//! xfeat reference utility.
//!
//! Embeds the engine with one of three built-in analysis callbacks:
//! - `classify`: log every delivered feature record
//! - `anomaly`: entropy and heuristics based anomaly flagging
//! - `security`: flow tracking with suspicious-flow reporting
//!
//! Exit codes: 0 success, 1 configuration error, 2 attach/bind failure,
//! 3 permission denied, 4 runtime error. SIGINT and SIGTERM stop the
//! engine gracefully.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use parking_lot::Mutex;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xfeat::{
    metrics, source, AnalysisCallback, Engine, EngineConfig, EngineError, FeatureRecord,
    TrafficClass,
};

/// Analysis mode for the reference utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Log every delivered record
    Classify,
    /// Built-in anomaly heuristics (entropy, class, size patterns)
    Anomaly,
    /// Flow tracking plus suspicious-flow reporting
    Security,
}

#[derive(Debug, Parser)]
#[command(name = "xfeat", version, about = "Zero-copy packet feature extraction engine")]
struct Cli {
    /// Network interface to attach to
    interface: String,

    /// Analysis mode
    #[arg(value_enum)]
    mode: Mode,

    /// Number of receive queues to serve
    #[arg(long, default_value_t = 1)]
    queues: u32,

    /// 1-in-N sampling stride
    #[arg(long = "sample-stride", default_value_t = 1)]
    sample_stride: u32,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Drainer batch size
    #[arg(long, default_value_t = xfeat::defaults::BATCH_SIZE)]
    batch: usize,

    /// Callback invocations per second, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    rate: u32,

    /// Use the copy-based delivery path instead of zero-copy rings
    #[arg(long = "no-zero-copy")]
    no_zero_copy: bool,

    /// Per-record logging and debug output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            interface: self.interface.clone(),
            queue_ids: (0..self.queues.max(1)).collect(),
            sampling_stride: self.sample_stride,
            max_user_rate: self.rate,
            batch_size: self.batch,
            zero_copy_mode: !self.no_zero_copy,
            ..EngineConfig::default()
        }
    }
}

/// Map an engine error onto the documented exit codes.
fn exit_code_for(err: &EngineError) -> ExitCode {
    match err {
        EngineError::InvalidArgument(_)
        | EngineError::NotInitialized
        | EngineError::AlreadyRunning => ExitCode::from(1),
        EngineError::InterfaceNotFound(_) | EngineError::AttachFailed(_) => ExitCode::from(2),
        EngineError::PermissionDenied => ExitCode::from(3),
        EngineError::ResourceExhausted(_) | EngineError::CallbackFailed(_) => ExitCode::from(4),
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "xfeat=debug" } else { "xfeat=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

/// Counts records and logs them when verbose.
struct ClassifyMode {
    verbose: bool,
    records: AtomicU64,
}

impl AnalysisCallback for ClassifyMode {
    fn on_record(&self, record: &FeatureRecord) -> i32 {
        self.records.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            tracing::info!(%record, "record");
        } else {
            tracing::trace!(%record, "record");
        }
        0
    }
}

/// The built-in anomaly heuristics: high payload entropy (likely
/// encrypted or compressed), suspicious classification, and large
/// packets with improbably low entropy.
struct AnomalyMode {
    records: AtomicU64,
    anomalies: AtomicU64,
}

impl AnalysisCallback for AnomalyMode {
    fn on_record(&self, record: &FeatureRecord) -> i32 {
        self.records.fetch_add(1, Ordering::Relaxed);

        let high_entropy = record.packet_entropy > 200;
        let suspicious = record.traffic_class == TrafficClass::Suspicious;
        let padded_bulk = record.pkt_len > 1400 && record.packet_entropy < 50;

        if high_entropy || suspicious || padded_bulk {
            self.anomalies.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                %record,
                high_entropy,
                suspicious,
                padded_bulk,
                "anomaly"
            );
            1
        } else {
            0
        }
    }
}

/// Tracks suspicious flows and reports each one once.
struct SecurityMode {
    records: AtomicU64,
    flows: Mutex<HashMap<u64, u64>>,
}

impl AnalysisCallback for SecurityMode {
    fn on_record(&self, record: &FeatureRecord) -> i32 {
        self.records.fetch_add(1, Ordering::Relaxed);
        if record.traffic_class != TrafficClass::Suspicious {
            return 0;
        }

        let mut flows = self.flows.lock();
        let hits = flows.entry(record.flow_hash).or_insert(0);
        *hits += 1;
        if *hits == 1 {
            tracing::warn!(flow = record.flow_hash, %record, "suspicious flow");
        }
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage mistakes are configuration errors (exit 1), not clap's
    // default exit 2, which is reserved for attach failures here.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(if err.use_stderr() { 1 } else { 0 });
        }
    };
    init_logging(cli.verbose);
    metrics::init();

    tracing::info!(
        version = xfeat::VERSION,
        interface = %cli.interface,
        mode = ?cli.mode,
        queues = cli.queues,
        stride = cli.sample_stride,
        zero_copy = !cli.no_zero_copy,
        "starting xfeat"
    );

    let config = cli.engine_config();
    if let Err(err) = config.validate() {
        tracing::error!(error = %err, "invalid configuration");
        return exit_code_for(&err);
    }

    let callback: Arc<dyn AnalysisCallback> = match cli.mode {
        Mode::Classify => Arc::new(ClassifyMode {
            verbose: cli.verbose,
            records: AtomicU64::new(0),
        }),
        Mode::Anomaly => Arc::new(AnomalyMode {
            records: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
        }),
        Mode::Security => Arc::new(SecurityMode {
            records: AtomicU64::new(0),
            flows: Mutex::new(HashMap::new()),
        }),
    };

    let engine = match Engine::init(config, callback) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            tracing::error!(error = %err, "engine init failed");
            if matches!(err, EngineError::InterfaceNotFound(_)) {
                let known = source::list_interfaces();
                if !known.is_empty() {
                    tracing::info!(interfaces = ?known, "available interfaces");
                }
            }
            return exit_code_for(&err);
        }
    };

    if cli.mode == Mode::Security {
        if let Err(err) = engine.enable_flow_tracking(65_536, Duration::from_secs(300)) {
            tracing::error!(error = %err, "flow tracking setup failed");
            return exit_code_for(&err);
        }
    }

    if let Err(err) = engine.start() {
        tracing::error!(error = %err, "engine start failed");
        return exit_code_for(&err);
    }
    tracing::info!("engine running; Ctrl+C to stop");

    // Periodic throughput reporter.
    let reporter_engine = Arc::clone(&engine);
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        interval.tick().await;
        let mut last = reporter_engine.get_stats();
        loop {
            interval.tick().await;
            let stats = reporter_engine.get_stats();
            metrics::sync(&stats);

            let pps = (stats.total_packets.wrapping_sub(last.total_packets)) / 5;
            let delivered =
                (stats.records_delivered.wrapping_sub(last.records_delivered)) / 5;
            let dropped = stats.dropped_packets.wrapping_sub(last.dropped_packets);
            tracing::info!(pps, delivered_per_sec = delivered, dropped_in_window = dropped, "throughput");
            last = stats;
        }
    });

    // Run until a signal arrives or the requested duration elapses.
    match cli.duration {
        Some(secs) => {
            tokio::select! {
                _ = shutdown_signal() => {},
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    tracing::info!(secs, "duration elapsed");
                }
            }
        }
        None => shutdown_signal().await,
    }

    reporter.abort();

    tracing::info!("stopping engine");
    if let Err(err) = engine.stop() {
        tracing::error!(error = %err, "engine stop failed");
        return exit_code_for(&err);
    }

    let stats = engine.get_stats();
    metrics::sync(&stats);

    println!();
    println!("=== xfeat run summary ===");
    println!("total packets:     {}", stats.total_packets);
    println!("total bytes:       {}", stats.total_bytes);
    println!("tcp/udp/other:     {}/{}/{}", stats.tcp_packets, stats.udp_packets, stats.other_packets);
    println!("filtered:          {}", stats.filtered_packets);
    println!("sampled:           {}", stats.sampled_packets);
    println!("steered:           {}", stats.steered_packets);
    println!("dropped:           {}", stats.dropped_packets);
    println!("records delivered: {}", stats.records_delivered);
    println!("anomaly signals:   {}", stats.anomaly_signals);
    if stats.total_packets > 0 {
        let avg_ns = stats.classifier_cpu_ns as f64 / stats.total_packets as f64;
        println!("classifier avg:    {:.0} ns/packet", avg_ns);
    }

    ExitCode::SUCCESS
}
