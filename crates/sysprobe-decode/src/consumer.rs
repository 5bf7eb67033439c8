//! Ring buffer consumer
//!
//! Polls the ring buffer, decodes every record and forwards the decoded
//! events over a channel. Malformed records are counted and skipped.

use crate::decoder::{DecodeResult, RecordDecoder};
use crate::event::DecodedEvent;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use sysprobe_capture::RingBuffer;
use sysprobe_core::SharedMetrics;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Default delay between two polls of an empty ring
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct RingConsumer {
    ring: Arc<RingBuffer>,
    decoder: RecordDecoder,
    metrics: SharedMetrics,
    poll_interval: Duration,
}

impl RingConsumer {
    pub fn new(ring: Arc<RingBuffer>, metrics: SharedMetrics) -> Self {
        Self {
            ring,
            decoder: RecordDecoder::new(),
            metrics,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Take everything currently in the ring
    pub fn poll_once(&self) -> Vec<DecodeResult<DecodedEvent>> {
        self.metrics
            .consumer
            .ringbuf_polls
            .fetch_add(1, Ordering::Relaxed);

        self.ring
            .drain()
            .iter()
            .map(|record| {
                self.metrics
                    .consumer
                    .events_consumed
                    .fetch_add(1, Ordering::Relaxed);
                let decoded = self.decoder.decode(record);
                if let Err(e) = &decoded {
                    warn!("Dropping malformed record: {}", e);
                    self.metrics
                        .consumer
                        .decode_errors
                        .fetch_add(1, Ordering::Relaxed);
                }
                decoded
            })
            .collect()
    }

    /// Forward decoded events to `tx` until `shutdown` flips to true or the
    /// receiver goes away. The ring is drained one last time on shutdown.
    /// Returns the number of events forwarded.
    pub async fn run(
        self,
        tx: mpsc::Sender<DecodedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> u64 {
        info!("Ring buffer consumer started");
        let mut forwarded = 0u64;
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            let stopping = tokio::select! {
                _ = interval.tick() => false,
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };

            for event in self.poll_once().into_iter().flatten() {
                if tx.send(event).await.is_err() {
                    debug!("Event receiver closed");
                    return forwarded;
                }
                forwarded += 1;
            }

            if stopping {
                break;
            }
        }

        info!(forwarded, "Ring buffer consumer stopped");
        forwarded
    }
}
