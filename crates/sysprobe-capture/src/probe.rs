//! Capture core facade
//!
//! [`Probe`] owns everything the capture handlers share: the ring buffer,
//! the staging pool, the snaplen policy and the metrics. Handlers talk to
//! it only through the operations below.

use crate::context::TaskContext;
use crate::event::EventType;
use crate::fixed::FixedEvent;
use crate::ringbuf::RingBuffer;
use crate::snaplen::{DestinationHint, SnaplenArgs, SnaplenPolicy};
use crate::staged::{StagedEvent, StagingPool};
use crate::tuple::{self, Direction, SockTuple, UserAddr};
use crate::wire::{HEADER_LEN, PARAM_LEN};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sysprobe_core::{CaptureSettings, SharedMetrics};
use tracing::{debug, trace};

pub struct Probe {
    ring: Arc<RingBuffer>,
    staging: StagingPool,
    snaplen: SnaplenPolicy,
    metrics: SharedMetrics,
}

impl Probe {
    pub fn new(settings: &CaptureSettings, metrics: SharedMetrics) -> Self {
        let probe = Self::with_parts(
            Arc::new(RingBuffer::new(settings.ringbuf_size)),
            settings.effective_contexts(),
            SnaplenPolicy::from_settings(settings),
            metrics,
        );
        debug!(
            ringbuf_size = settings.ringbuf_size,
            contexts = probe.staging.contexts(),
            snaplen = settings.snaplen,
            dynamic_snaplen = settings.dynamic_snaplen,
            "capture probe ready"
        );
        probe
    }

    pub fn with_parts(
        ring: Arc<RingBuffer>,
        contexts: usize,
        snaplen: SnaplenPolicy,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            ring,
            staging: StagingPool::new(contexts),
            snaplen,
            metrics,
        }
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn snaplen_policy(&self) -> &SnaplenPolicy {
        &self.snaplen
    }

    pub fn contexts(&self) -> usize {
        self.staging.contexts()
    }

    /// Reserve `size` bytes in the ring and write the header.
    ///
    /// `None` when the ring is full; the drop is counted once here.
    pub fn reserve_fixed(
        &self,
        task: &dyn TaskContext,
        event_type: EventType,
        size: usize,
    ) -> Option<FixedEvent<'_>> {
        debug_assert!(
            event_type
                .schema()
                .fixed_size()
                .is_none_or(|fixed| fixed == size),
            "reserved size does not match {} schema",
            event_type.name()
        );
        if size < HEADER_LEN + event_type.nparams() * PARAM_LEN {
            debug!(event = event_type.name(), size, "reservation smaller than header");
            return None;
        }

        let Some(reservation) = self.ring.reserve(size) else {
            trace!(event = event_type.name(), size, "ring buffer full, event dropped");
            self.metrics.record_drop(event_type.name());
            return None;
        };
        Some(FixedEvent::new(
            reservation,
            event_type,
            task.now_ns(),
            task.tid(),
            &self.metrics,
        ))
    }

    /// Acquire the staging buffer of the task's context and write a
    /// placeholder header.
    ///
    /// `None` when the context's buffer is already in use.
    pub fn preload_staged(&self, task: &dyn TaskContext, event_type: EventType) -> Option<StagedEvent<'_>> {
        let Some(buf) = self.staging.acquire(task.context_id()) else {
            trace!(
                event = event_type.name(),
                context = task.context_id(),
                "staging buffer unavailable"
            );
            self.metrics
                .capture
                .context_busy
                .fetch_add(1, Ordering::Relaxed);
            return None;
        };
        Some(StagedEvent::preload(
            buf,
            &self.ring,
            &self.metrics,
            event_type,
            task.now_ns(),
            task.tid(),
        ))
    }

    /// Where the data of `fd` goes. An unconnected inet socket takes its
    /// remote port from the address passed to the syscall. The payload at
    /// `data` is sniffed only when the protocol heuristics are on.
    pub fn destination_hint(
        &self,
        task: &dyn TaskContext,
        fd: i64,
        data: u64,
        raw_addr: Option<u64>,
    ) -> Option<DestinationHint> {
        if fd < 0 {
            return None;
        }
        let state = task.sockets().lookup(fd)?;
        let mut hint = DestinationHint::from_socket(&state)?;
        if hint.remote_port == 0 {
            if let Some(UserAddr::Inet(addr)) =
                raw_addr.and_then(|addr| tuple::read_sockaddr(task.memory(), addr))
            {
                hint.remote_port = addr.port();
            }
        }
        if self.snaplen.is_dynamic() {
            Some(hint.sniff(task.memory(), data))
        } else {
            Some(hint)
        }
    }

    pub fn effective_snaplen(
        &self,
        event_type: EventType,
        hint: Option<&DestinationHint>,
        available: usize,
    ) -> usize {
        self.snaplen
            .effective(SnaplenArgs::new(event_type), hint, available)
    }

    pub fn resolve_tuple(
        &self,
        task: &dyn TaskContext,
        fd: i64,
        direction: Direction,
        raw_addr: Option<u64>,
    ) -> Option<SockTuple> {
        tuple::resolve_tuple(task.sockets(), task.memory(), fd, direction, raw_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RECVFROM_E_SIZE;
    use crate::sim::SimTask;
    use crate::writer::EventWriter;
    use sysprobe_core::create_metrics;

    fn probe(ring: usize, contexts: usize) -> Probe {
        Probe::with_parts(
            Arc::new(RingBuffer::new(ring)),
            contexts,
            SnaplenPolicy::new(80),
            create_metrics(),
        )
    }

    #[test]
    fn test_reserve_fixed_drop_counted_once() {
        let probe = probe(64, 1);
        let task = SimTask::new(0, 100);
        let event = probe.reserve_fixed(&task, EventType::RecvfromE, RECVFROM_E_SIZE);
        assert!(event.is_some());
        drop(event);
        // 42 + 8 rounds to 56: a second one never fits alongside the first
        let mut first = probe.reserve_fixed(&task, EventType::RecvfromE, RECVFROM_E_SIZE).unwrap();
        first.store_s64(1);
        first.store_u32(2);
        first.submit();
        assert!(probe.reserve_fixed(&task, EventType::RecvfromE, RECVFROM_E_SIZE).is_none());

        let metrics = probe.metrics();
        assert_eq!(metrics.capture.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(probe.ring().pending(), 1);
    }

    #[test]
    fn test_preload_on_busy_context() {
        let probe = probe(4096, 1);
        let task = SimTask::new(0, 100);
        let held = probe.preload_staged(&task, EventType::SendtoE).unwrap();
        assert!(probe.preload_staged(&task, EventType::SendtoE).is_none());
        assert!(probe.preload_staged(&SimTask::new(5, 1), EventType::SendtoE).is_none());
        drop(held);
        assert_eq!(
            probe.metrics().capture.context_busy.load(Ordering::Relaxed),
            2
        );
        assert!(probe.ring().poll().is_none());
    }

    #[test]
    fn test_header_records_task_identity() {
        let probe = probe(4096, 1);
        let task = SimTask::new(0, 4242);
        let mut event = probe
            .reserve_fixed(&task, EventType::RecvfromE, RECVFROM_E_SIZE)
            .unwrap();
        event.store_s64(3);
        event.store_u32(10);
        event.submit();

        let record = probe.ring().poll().unwrap();
        let raw = crate::wire::RawEvent::parse(&record).unwrap();
        assert_eq!(raw.header.tid, 4242);
        assert!(raw.header.ts > 0);
    }
}
