//! Capture metrics for sysprobe
//!
//! Counters are bumped from the capture hot path, so everything here is a
//! relaxed atomic. Per-event-type counts sit behind a read-mostly lock that is
//! only written the first time an event type is seen.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Global metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    /// When the collector was started
    start_time: Instant,
    /// Producer-side metrics
    pub capture: CaptureMetrics,
    /// Consumer-side metrics
    pub consumer: ConsumerMetrics,
    /// Per event type counters, keyed by event name
    event_types: parking_lot::RwLock<BTreeMap<&'static str, Arc<EventTypeMetrics>>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            capture: CaptureMetrics::default(),
            consumer: ConsumerMetrics::default(),
            event_types: parking_lot::RwLock::new(BTreeMap::new()),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Counters for one event type, created on first use
    pub fn event_type(&self, name: &'static str) -> Arc<EventTypeMetrics> {
        if let Some(metrics) = self.event_types.read().get(name) {
            return metrics.clone();
        }
        self.event_types
            .write()
            .entry(name)
            .or_insert_with(|| Arc::new(EventTypeMetrics::default()))
            .clone()
    }

    /// Record a submitted event of `len` bytes
    pub fn record_submit(&self, name: &'static str, len: usize) {
        self.capture.events_submitted.fetch_add(1, Ordering::Relaxed);
        self.capture
            .bytes_submitted
            .fetch_add(len as u64, Ordering::Relaxed);
        self.event_type(name).submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event dropped because the ring buffer was full
    pub fn record_drop(&self, name: &'static str) {
        self.capture.dropped.fetch_add(1, Ordering::Relaxed);
        self.event_type(name).dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP sysprobe_uptime_seconds Time since sensor started\n");
        output.push_str("# TYPE sysprobe_uptime_seconds gauge\n");
        output.push_str(&format!(
            "sysprobe_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        let counters = [
            (
                "sysprobe_events_submitted_total",
                "Events made visible to the consumer",
                &self.capture.events_submitted,
            ),
            (
                "sysprobe_bytes_submitted_total",
                "Bytes made visible to the consumer",
                &self.capture.bytes_submitted,
            ),
            (
                "sysprobe_dropped_total",
                "Events dropped because the ring buffer was full",
                &self.capture.dropped,
            ),
            (
                "sysprobe_context_busy_total",
                "Events skipped because no staging buffer was available",
                &self.capture.context_busy,
            ),
            (
                "sysprobe_empty_tuples_total",
                "Socket tuples replaced by the empty marker",
                &self.capture.empty_tuples,
            ),
            (
                "sysprobe_truncated_params_total",
                "Byte buffers copied short of the requested length",
                &self.capture.truncated_params,
            ),
            (
                "sysprobe_memory_faults_total",
                "User memory reads that failed",
                &self.capture.memory_faults,
            ),
            (
                "sysprobe_ringbuf_polls_total",
                "Ring buffer poll operations",
                &self.consumer.ringbuf_polls,
            ),
            (
                "sysprobe_events_consumed_total",
                "Events read by the consumer",
                &self.consumer.events_consumed,
            ),
            (
                "sysprobe_decode_errors_total",
                "Records the consumer rejected as malformed",
                &self.consumer.decode_errors,
            ),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n\n", name, value.load(Ordering::Relaxed)));
        }

        let event_types = self.event_types.read();
        if !event_types.is_empty() {
            output.push_str("# HELP sysprobe_event_submitted_total Submitted events per event type\n");
            output.push_str("# TYPE sysprobe_event_submitted_total counter\n");
            for (name, metrics) in event_types.iter() {
                output.push_str(&format!(
                    "sysprobe_event_submitted_total{{event=\"{}\"}} {}\n",
                    name,
                    metrics.submitted.load(Ordering::Relaxed)
                ));
            }
            output.push('\n');

            output.push_str("# HELP sysprobe_event_dropped_total Dropped events per event type\n");
            output.push_str("# TYPE sysprobe_event_dropped_total counter\n");
            for (name, metrics) in event_types.iter() {
                output.push_str(&format!(
                    "sysprobe_event_dropped_total{{event=\"{}\"}} {}\n",
                    name,
                    metrics.dropped.load(Ordering::Relaxed)
                ));
            }
            output.push('\n');
        }

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let event_types: BTreeMap<&str, serde_json::Value> = self
            .event_types
            .read()
            .iter()
            .map(|(name, m)| {
                (
                    *name,
                    serde_json::json!({
                        "submitted": m.submitted.load(Ordering::Relaxed),
                        "dropped": m.dropped.load(Ordering::Relaxed),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "capture": {
                "events_submitted": self.capture.events_submitted.load(Ordering::Relaxed),
                "bytes_submitted": self.capture.bytes_submitted.load(Ordering::Relaxed),
                "dropped": self.capture.dropped.load(Ordering::Relaxed),
                "context_busy": self.capture.context_busy.load(Ordering::Relaxed),
                "empty_tuples": self.capture.empty_tuples.load(Ordering::Relaxed),
                "truncated_params": self.capture.truncated_params.load(Ordering::Relaxed),
                "memory_faults": self.capture.memory_faults.load(Ordering::Relaxed),
            },
            "consumer": {
                "ringbuf_polls": self.consumer.ringbuf_polls.load(Ordering::Relaxed),
                "events_consumed": self.consumer.events_consumed.load(Ordering::Relaxed),
                "decode_errors": self.consumer.decode_errors.load(Ordering::Relaxed),
            },
            "event_types": event_types,
        })
    }
}

/// Producer-side metrics
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    pub events_submitted: AtomicU64,
    pub bytes_submitted: AtomicU64,
    pub dropped: AtomicU64,
    pub context_busy: AtomicU64,
    pub empty_tuples: AtomicU64,
    pub truncated_params: AtomicU64,
    pub memory_faults: AtomicU64,
}

/// Consumer-side metrics
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    pub ringbuf_polls: AtomicU64,
    pub events_consumed: AtomicU64,
    pub decode_errors: AtomicU64,
}

/// Per event type counters
#[derive(Debug, Default)]
pub struct EventTypeMetrics {
    pub submitted: AtomicU64,
    pub dropped: AtomicU64,
}

/// Shared metrics instance
pub type SharedMetrics = Arc<MetricsCollector>;

/// Create a new shared metrics collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(MetricsCollector::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_and_drop_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_submit("recvfrom_x", 120);
        metrics.record_submit("recvfrom_x", 30);
        metrics.record_drop("sendto_e");

        assert_eq!(metrics.capture.events_submitted.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.capture.bytes_submitted.load(Ordering::Relaxed), 150);
        assert_eq!(metrics.capture.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(
            metrics.event_type("recvfrom_x").submitted.load(Ordering::Relaxed),
            2
        );
        assert_eq!(metrics.event_type("sendto_e").dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = MetricsCollector::new();
        metrics.record_drop("recvfrom_e");
        let text = metrics.to_prometheus();
        assert!(text.contains("sysprobe_dropped_total 1"));
        assert!(text.contains("sysprobe_event_dropped_total{event=\"recvfrom_e\"} 1"));
    }

    #[test]
    fn test_json_export() {
        let metrics = MetricsCollector::new();
        metrics.record_submit("sendto_x", 64);
        metrics.capture.empty_tuples.fetch_add(1, Ordering::Relaxed);
        let json = metrics.to_json();
        assert_eq!(json["capture"]["events_submitted"], 1);
        assert_eq!(json["capture"]["empty_tuples"], 1);
        assert_eq!(json["event_types"]["sendto_x"]["submitted"], 1);
    }
}
