//! Fixed-size transport path
//!
//! For events whose size is known before any field is written: the record
//! is reserved at its final size directly in the ring buffer, filled in
//! place and submitted.

use crate::event::EventType;
use crate::ringbuf::Reservation;
use crate::wire::{self, EventHeader};
use crate::writer::{EventWriter, SlotCursor};
use sysprobe_core::MetricsCollector;

/// An event being written straight into a ring-buffer reservation
pub struct FixedEvent<'a> {
    reservation: Reservation<'a>,
    event_type: EventType,
    cursor: SlotCursor,
    metrics: &'a MetricsCollector,
}

impl<'a> FixedEvent<'a> {
    /// Write the header into `reservation`; its length is the reserved size
    pub(crate) fn new(
        mut reservation: Reservation<'a>,
        event_type: EventType,
        ts: u64,
        tid: u64,
        metrics: &'a MetricsCollector,
    ) -> Self {
        let nparams = event_type.nparams();
        EventHeader {
            ts,
            tid,
            len: reservation.len() as u32,
            event_type: event_type.tag(),
            nparams: nparams as u32,
        }
        .write(reservation.as_mut_slice());

        Self {
            reservation,
            event_type,
            cursor: SlotCursor::new(nparams),
            metrics,
        }
    }

    /// Make the event visible to the consumer and return its length.
    ///
    /// Parameters that were never stored become empty slots; a record that
    /// came out shorter than reserved is shrunk so the header length always
    /// equals the bytes present.
    pub fn submit(mut self) -> usize {
        while self.cursor.params < self.cursor.nparams {
            self.store_empty();
        }

        let len = self.cursor.payload_pos;
        if len < self.reservation.len() {
            self.reservation.shrink(len);
            wire::patch_len(self.reservation.as_mut_slice(), len as u32);
        }
        self.reservation.submit();
        self.metrics.record_submit(self.event_type.name(), len);
        len
    }
}

impl EventWriter for FixedEvent<'_> {
    fn event_type(&self) -> EventType {
        self.event_type
    }

    fn params_written(&self) -> usize {
        self.cursor.params
    }

    fn payload_room(&self) -> usize {
        self.cursor.room(self.reservation.len())
    }

    fn metrics(&self) -> &MetricsCollector {
        self.metrics
    }

    fn append_slot(&mut self, max_len: usize, fill: &mut dyn FnMut(&mut [u8]) -> usize) -> usize {
        self.cursor
            .append(self.event_type, self.reservation.as_mut_slice(), max_len, fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RECVFROM_E_SIZE;
    use crate::ringbuf::RingBuffer;
    use crate::wire::RawEvent;

    #[test]
    fn test_fixed_event_layout() {
        let ring = RingBuffer::new(4096);
        let metrics = MetricsCollector::new();
        let reservation = ring.reserve(RECVFROM_E_SIZE).unwrap();
        let mut event = FixedEvent::new(reservation, EventType::RecvfromE, 100, 7, &metrics);
        event.store_s64(5);
        event.store_u32(1500);
        assert_eq!(event.submit(), RECVFROM_E_SIZE);

        let record = ring.poll().unwrap();
        let raw = RawEvent::parse(&record).unwrap();
        assert_eq!(raw.header.len as usize, RECVFROM_E_SIZE);
        assert_eq!(raw.header.event_type, 34);
        assert_eq!(raw.header.ts, 100);
        assert_eq!(raw.header.tid, 7);
        assert_eq!(raw.param(0), Some(&5i64.to_le_bytes()[..]));
        assert_eq!(raw.param(1), Some(&1500u32.to_le_bytes()[..]));
        assert_eq!(metrics.capture.events_submitted.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_missing_params_are_padded_and_len_patched() {
        let ring = RingBuffer::new(4096);
        let metrics = MetricsCollector::new();
        let reservation = ring.reserve(RECVFROM_E_SIZE).unwrap();
        let mut event = FixedEvent::new(reservation, EventType::RecvfromE, 0, 0, &metrics);
        event.store_s64(5);
        let len = event.submit();

        let record = ring.poll().unwrap();
        assert_eq!(record.len(), len);
        let raw = RawEvent::parse(&record).unwrap();
        assert_eq!(raw.nparams(), 2);
        assert_eq!(raw.param(1), Some(&b""[..]));
    }

    #[test]
    fn test_extra_params_are_ignored() {
        let ring = RingBuffer::new(4096);
        let metrics = MetricsCollector::new();
        let reservation = ring.reserve(RECVFROM_E_SIZE).unwrap();
        let mut event = FixedEvent::new(reservation, EventType::RecvfromE, 0, 0, &metrics);
        event.store_s64(1);
        event.store_u32(2);
        event.store_u32(3);
        assert_eq!(event.params_written(), 2);
        assert_eq!(event.submit(), RECVFROM_E_SIZE);
    }

    #[test]
    fn test_dropped_fixed_event_is_invisible() {
        let ring = RingBuffer::new(4096);
        let metrics = MetricsCollector::new();
        {
            let reservation = ring.reserve(RECVFROM_E_SIZE).unwrap();
            let mut event = FixedEvent::new(reservation, EventType::RecvfromE, 0, 0, &metrics);
            event.store_s64(1);
        }
        assert!(ring.poll().is_none());
    }
}
