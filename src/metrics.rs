//! Prometheus metrics for the engine.
//!
//! The engine's native statistics live in the lock-free
//! [`StatsMap`](crate::maps::StatsMap); this module mirrors a snapshot
//! into Prometheus gauges for scraping alongside the rest of a fleet.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_gauge, register_int_gauge_vec, Encoder, Histogram, IntGauge,
    IntGaugeVec, TextEncoder,
};

use crate::maps::StatsSnapshot;

/// Packet counters by stage.
pub static PACKETS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "xfeat_packets_total",
        "Packet counts by processing stage",
        &["stage"]
    )
    .unwrap()
});

/// Protocol breakdown.
pub static PROTOCOLS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "xfeat_protocol_packets_total",
        "Packet counts by protocol",
        &["protocol"]
    )
    .unwrap()
});

/// Bytes seen by the classifier.
pub static BYTES_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("xfeat_bytes_total", "Total bytes seen by the classifier").unwrap()
});

/// Records delivered to the analysis callback.
pub static RECORDS_DELIVERED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "xfeat_records_delivered_total",
        "Feature records delivered to the analysis callback"
    )
    .unwrap()
});

/// Non-zero callback signals.
pub static ANOMALY_SIGNALS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "xfeat_anomaly_signals_total",
        "Non-zero analysis callback returns"
    )
    .unwrap()
});

/// Classifier time per packet.
pub static CLASSIFIER_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "xfeat_classifier_latency_seconds",
        "Average classifier time per packet, sampled at sync",
        vec![0.00000005, 0.0000001, 0.00000025, 0.0000005, 0.000001, 0.000005]
    )
    .unwrap()
});

/// Initialize all metrics (call at startup).
pub fn init() {
    let _ = &*PACKETS;
    let _ = &*PROTOCOLS;
    let _ = &*BYTES_TOTAL;
    let _ = &*RECORDS_DELIVERED;
    let _ = &*ANOMALY_SIGNALS;
    let _ = &*CLASSIFIER_LATENCY;
}

/// Mirror an engine snapshot into the Prometheus registry.
pub fn sync(stats: &StatsSnapshot) {
    PACKETS
        .with_label_values(&["total"])
        .set(stats.total_packets as i64);
    PACKETS
        .with_label_values(&["filtered"])
        .set(stats.filtered_packets as i64);
    PACKETS
        .with_label_values(&["sampled"])
        .set(stats.sampled_packets as i64);
    PACKETS
        .with_label_values(&["steered"])
        .set(stats.steered_packets as i64);
    PACKETS
        .with_label_values(&["dropped"])
        .set(stats.dropped_packets as i64);

    PROTOCOLS
        .with_label_values(&["tcp"])
        .set(stats.tcp_packets as i64);
    PROTOCOLS
        .with_label_values(&["udp"])
        .set(stats.udp_packets as i64);
    PROTOCOLS
        .with_label_values(&["other"])
        .set(stats.other_packets as i64);

    BYTES_TOTAL.set(stats.total_bytes as i64);
    RECORDS_DELIVERED.set(stats.records_delivered as i64);
    ANOMALY_SIGNALS.set(stats.anomaly_signals as i64);

    if stats.total_packets > 0 {
        let per_packet = stats.classifier_cpu_ns as f64 / stats.total_packets as f64;
        CLASSIFIER_LATENCY.observe(per_packet / 1e9);
    }
}

/// Metrics in Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_and_gather() {
        init();
        let stats = StatsSnapshot {
            total_packets: 10,
            steered_packets: 4,
            tcp_packets: 6,
            total_bytes: 1400,
            ..StatsSnapshot::default()
        };
        sync(&stats);

        let text = gather();
        assert!(text.contains("xfeat_packets_total"));
        assert!(text.contains("xfeat_protocol_packets_total"));
    }
}
