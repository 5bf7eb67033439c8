//! Staged transport path
//!
//! Variable-size events are built in a per-context staging buffer, then
//! copied into the ring buffer with a single reservation. The protocol is
//! enforced by the types:
//!
//! ```text
//! StagingPool::acquire -> StagedEvent --finalize()--> FinalizedEvent --submit()
//! ```
//!
//! A [`StagedEvent`] cannot be submitted, so a record whose header length
//! has not been patched never reaches the consumer.

use crate::event::EventType;
use crate::ringbuf::RingBuffer;
use crate::wire::{self, EventHeader, MAX_EVENT_SIZE};
use crate::writer::{EventWriter, SlotCursor};
use parking_lot::{Mutex, MutexGuard};
use sysprobe_core::MetricsCollector;
use tracing::trace;

/// Scratch region for one execution context
#[derive(Debug)]
pub struct StagingBuffer {
    data: Box<[u8]>,
}

impl StagingBuffer {
    fn new() -> Self {
        Self {
            data: vec![0u8; MAX_EVENT_SIZE].into_boxed_slice(),
        }
    }
}

/// One preallocated staging buffer per execution context
///
/// Buffers are indexed by context id. A context finding its buffer taken
/// means two captures overlapped on one context; the second is refused
/// instead of waiting.
#[derive(Debug)]
pub struct StagingPool {
    slots: Box<[Mutex<StagingBuffer>]>,
}

impl StagingPool {
    pub fn new(contexts: usize) -> Self {
        Self {
            slots: (0..contexts.max(1))
                .map(|_| Mutex::new(StagingBuffer::new()))
                .collect(),
        }
    }

    pub fn contexts(&self) -> usize {
        self.slots.len()
    }

    /// Take the buffer of `context_id`, without blocking
    pub fn acquire(&self, context_id: usize) -> Option<MutexGuard<'_, StagingBuffer>> {
        self.slots.get(context_id)?.try_lock()
    }
}

/// An event being appended to in a staging buffer
pub struct StagedEvent<'a> {
    buf: MutexGuard<'a, StagingBuffer>,
    ring: &'a RingBuffer,
    metrics: &'a MetricsCollector,
    event_type: EventType,
    cursor: SlotCursor,
}

impl<'a> StagedEvent<'a> {
    /// Write a header with a placeholder length into `buf`
    pub(crate) fn preload(
        mut buf: MutexGuard<'a, StagingBuffer>,
        ring: &'a RingBuffer,
        metrics: &'a MetricsCollector,
        event_type: EventType,
        ts: u64,
        tid: u64,
    ) -> Self {
        let nparams = event_type.nparams();
        EventHeader {
            ts,
            tid,
            len: 0,
            event_type: event_type.tag(),
            nparams: nparams as u32,
        }
        .write(&mut buf.data);

        Self {
            buf,
            ring,
            metrics,
            event_type,
            cursor: SlotCursor::new(nparams),
        }
    }

    /// Pad missing parameters and patch the header with the final length
    pub fn finalize(mut self) -> FinalizedEvent<'a> {
        while self.cursor.params < self.cursor.nparams {
            self.store_empty();
        }
        let len = self.cursor.payload_pos;
        wire::patch_len(&mut self.buf.data, len as u32);
        wire::patch_nparams(&mut self.buf.data, self.cursor.params as u32);

        FinalizedEvent {
            buf: self.buf,
            ring: self.ring,
            metrics: self.metrics,
            event_type: self.event_type,
            len,
        }
    }
}

impl EventWriter for StagedEvent<'_> {
    fn event_type(&self) -> EventType {
        self.event_type
    }

    fn params_written(&self) -> usize {
        self.cursor.params
    }

    fn payload_room(&self) -> usize {
        self.cursor.room(MAX_EVENT_SIZE)
    }

    fn metrics(&self) -> &MetricsCollector {
        self.metrics
    }

    fn append_slot(&mut self, max_len: usize, fill: &mut dyn FnMut(&mut [u8]) -> usize) -> usize {
        self.cursor
            .append(self.event_type, &mut self.buf.data, max_len, fill)
    }
}

/// A complete record waiting to be copied into the ring buffer
pub struct FinalizedEvent<'a> {
    buf: MutexGuard<'a, StagingBuffer>,
    ring: &'a RingBuffer,
    metrics: &'a MetricsCollector,
    event_type: EventType,
    len: usize,
}

impl FinalizedEvent<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf.data[..self.len]
    }

    /// Copy the record into the ring buffer in one reservation.
    ///
    /// Returns `false` when the ring is full; the event is then dropped and
    /// counted, and the staging buffer is released either way.
    pub fn submit(self) -> bool {
        let name = self.event_type.name();
        if self.ring.output(self.as_bytes()) {
            self.metrics.record_submit(name, self.len);
            true
        } else {
            trace!(event = name, len = self.len, "ring buffer full, event dropped");
            self.metrics.record_drop(name);
            false
        }
    }
}
