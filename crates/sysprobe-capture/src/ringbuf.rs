//! Shared producer/consumer ring buffer
//!
//! Records are laid out back to back in a fixed byte region. Each record
//! accounts for an 8-byte bookkeeping header and is padded to 8 bytes, the
//! same footprint the kernel ring buffer uses. A record never straddles the
//! end of the region: when it would, the producer skips to the start and the
//! skipped bytes are released together with that record.
//!
//! A [`Reservation`] holds the producer lock until it is submitted or
//! dropped, so at most one record is in flight and concurrent reservations
//! can never overlap. Writers only do bounded copies while holding it.

use crate::wire::MAX_EVENT_SIZE;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;

/// Per-record bookkeeping overhead
pub const RECORD_HDR_LEN: usize = 8;

const RECORD_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Record {
    /// Logical offset of the record (monotonic, not wrapped)
    start: usize,
    len: usize,
    footprint: usize,
}

#[derive(Debug)]
struct RingState {
    data: Box<[u8]>,
    /// Logical consumer position
    head: usize,
    /// Logical producer position
    tail: usize,
    records: VecDeque<Record>,
}

/// Fixed-capacity byte ring shared by every execution context
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    state: Mutex<RingState>,
}

fn footprint(len: usize) -> usize {
    (len + RECORD_HDR_LEN + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(RingState {
                data: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                records: VecDeque::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve exactly `len` bytes. `None` when the ring has no room.
    pub fn reserve(&self, len: usize) -> Option<Reservation<'_>> {
        if len == 0 || len > MAX_EVENT_SIZE {
            return None;
        }
        let footprint = footprint(len);
        if footprint > self.capacity {
            return None;
        }

        let mut state = self.state.lock();
        let prev_tail = state.tail;
        let phys = prev_tail % self.capacity;
        let start = if phys + footprint > self.capacity {
            prev_tail + (self.capacity - phys)
        } else {
            prev_tail
        };
        if start + footprint - state.head > self.capacity {
            return None;
        }

        state.tail = start + footprint;
        state.records.push_back(Record {
            start,
            len,
            footprint,
        });

        Some(Reservation {
            state,
            capacity: self.capacity,
            start,
            len,
            prev_tail,
            submitted: false,
        })
    }

    /// Copy a finished record into the ring in one reservation
    pub fn output(&self, record: &[u8]) -> bool {
        match self.reserve(record.len()) {
            Some(mut reservation) => {
                reservation.as_mut_slice().copy_from_slice(record);
                reservation.submit();
                true
            }
            None => false,
        }
    }

    /// Take the oldest submitted record, if any
    pub fn poll(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let record = state.records.pop_front()?;
        let offset = record.start % self.capacity + RECORD_HDR_LEN;
        let bytes = state.data[offset..offset + record.len].to_vec();
        state.head = record.start + record.footprint;
        Some(bytes)
    }

    /// Take every submitted record
    pub fn drain(&self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.poll()).collect()
    }

    /// Number of records waiting for the consumer
    pub fn pending(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Bytes currently held, bookkeeping and padding included
    pub fn used_bytes(&self) -> usize {
        let state = self.state.lock();
        state.tail - state.head
    }
}

/// Space reserved in the ring for one record
///
/// Dropping a reservation without [`Reservation::submit`] discards it: no
/// byte of it ever becomes visible to the consumer.
pub struct Reservation<'a> {
    state: MutexGuard<'a, RingState>,
    capacity: usize,
    start: usize,
    len: usize,
    prev_tail: usize,
    submitted: bool,
}

impl Reservation<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let offset = self.start % self.capacity + RECORD_HDR_LEN;
        &mut self.state.data[offset..offset + self.len]
    }

    /// Give back the tail of the reservation; growing is not possible
    pub fn shrink(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        let footprint = footprint(len);
        if let Some(record) = self.state.records.back_mut() {
            record.len = len;
            record.footprint = footprint;
        }
        self.state.tail = self.start + footprint;
        self.len = len;
    }

    /// Make the record visible to the consumer
    pub fn submit(mut self) {
        self.submitted = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.submitted {
            self.state.records.pop_back();
            self.state.tail = self.prev_tail;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_submit_poll() {
        let ring = RingBuffer::new(4096);
        let mut r = ring.reserve(5).unwrap();
        r.as_mut_slice().copy_from_slice(b"hello");
        r.submit();

        assert_eq!(ring.pending(), 1);
        assert_eq!(ring.used_bytes(), 16);
        assert_eq!(ring.poll().unwrap(), b"hello");
        assert!(ring.poll().is_none());
        assert_eq!(ring.used_bytes(), 0);
    }

    #[test]
    fn test_discard_leaves_nothing_visible() {
        let ring = RingBuffer::new(4096);
        {
            let mut r = ring.reserve(32).unwrap();
            r.as_mut_slice().fill(0xff);
        }
        assert_eq!(ring.pending(), 0);
        assert_eq!(ring.used_bytes(), 0);
        assert!(ring.poll().is_none());
    }

    #[test]
    fn test_full_ring_refuses_reservation() {
        let ring = RingBuffer::new(64);
        assert!(ring.output(&[1u8; 24]));
        assert!(ring.output(&[2u8; 24]));
        assert!(ring.reserve(8).is_none());

        assert_eq!(ring.poll().unwrap(), vec![1u8; 24]);
        assert!(ring.output(&[3u8; 24]));
        assert_eq!(ring.drain(), vec![vec![2u8; 24], vec![3u8; 24]]);
    }

    #[test]
    fn test_wraparound_skips_tail_gap() {
        let ring = RingBuffer::new(64);
        // 40-byte footprint, leaves a 24-byte tail gap
        assert!(ring.output(&[1u8; 30]));
        assert_eq!(ring.poll().unwrap(), vec![1u8; 30]);
        // 32-byte footprint does not fit in the gap, wraps to offset 0
        assert!(ring.output(&[2u8; 24]));
        assert_eq!(ring.used_bytes(), 24 + 32);
        assert_eq!(ring.poll().unwrap(), vec![2u8; 24]);
        assert_eq!(ring.used_bytes(), 0);
    }

    #[test]
    fn test_shrink_releases_space() {
        let ring = RingBuffer::new(4096);
        let mut r = ring.reserve(100).unwrap();
        r.shrink(10);
        r.as_mut_slice().copy_from_slice(&[7u8; 10]);
        r.submit();
        assert_eq!(ring.used_bytes(), 24);
        assert_eq!(ring.poll().unwrap(), vec![7u8; 10]);
    }

    #[test]
    fn test_oversized_reservation() {
        let ring = RingBuffer::new(1 << 20);
        assert!(ring.reserve(MAX_EVENT_SIZE + 1).is_none());
        assert!(ring.reserve(0).is_none());
    }
}
