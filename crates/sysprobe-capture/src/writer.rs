//! Parameter encoders
//!
//! [`EventWriter`] is the capability shared by the fixed-size and staged
//! transport paths: each implementation only knows how to append one
//! length-prefixed slot, and the typed `store_*` encoders are built on top.
//! Every encoder appends exactly one slot, so the parameter count of an
//! event never depends on runtime outcomes.

use crate::context::UserMemory;
use crate::event::EventType;
use crate::tuple::SockTuple;
use crate::wire::{HEADER_LEN, MAX_PARAM_SIZE, PARAM_LEN};
use std::sync::atomic::Ordering;
use sysprobe_core::MetricsCollector;
use tracing::trace;

pub trait EventWriter {
    fn event_type(&self) -> EventType;

    /// Slots appended so far
    fn params_written(&self) -> usize;

    /// Payload bytes the next slot may still use
    fn payload_room(&self) -> usize;

    fn metrics(&self) -> &MetricsCollector;

    /// Append one slot of at most `max_len` bytes.
    ///
    /// `fill` receives the destination, already clamped to the remaining
    /// capacity, and returns how many bytes it wrote. The slot length is
    /// the number of bytes written, never the number requested. Returns
    /// that length.
    fn append_slot(&mut self, max_len: usize, fill: &mut dyn FnMut(&mut [u8]) -> usize) -> usize;

    fn store_s64(&mut self, value: i64) {
        self.store_raw(&value.to_le_bytes());
    }

    fn store_u32(&mut self, value: u32) {
        self.store_raw(&value.to_le_bytes());
    }

    /// Zero-length slot standing in for a value that could not be computed
    fn store_empty(&mut self) {
        self.append_slot(0, &mut |_| 0);
    }

    /// Copy bytes already owned by the capture
    fn store_raw(&mut self, bytes: &[u8]) -> usize {
        self.append_slot(bytes.len(), &mut |dst| {
            let n = dst.len();
            dst.copy_from_slice(&bytes[..n]);
            n
        })
    }

    /// Copy up to `cap` of the `len` bytes of traced-task memory at `addr`.
    ///
    /// The copy is also clamped to the slot limit and the remaining
    /// capacity of the event. Copying fewer than `len` bytes counts as a
    /// truncation; an unreadable source yields an empty slot.
    fn store_bytebuf(&mut self, mem: &dyn UserMemory, addr: u64, len: usize, cap: usize) -> usize {
        if addr == 0 || len == 0 {
            self.store_empty();
            return 0;
        }

        let want = len.min(cap).min(MAX_PARAM_SIZE);
        let mut faulted = false;
        let copied = self.append_slot(want, &mut |dst| match mem.read(addr, dst) {
            Ok(()) => dst.len(),
            Err(fault) => {
                trace!(%fault, "bytebuf read failed");
                faulted = true;
                0
            }
        });

        let capture = &self.metrics().capture;
        if faulted {
            capture.memory_faults.fetch_add(1, Ordering::Relaxed);
        } else if copied < len {
            capture.truncated_params.fetch_add(1, Ordering::Relaxed);
        }
        copied
    }

    /// Encode a resolved tuple, or the empty marker when resolution failed.
    ///
    /// A tuple that does not fit in the remaining capacity is replaced by
    /// the empty marker rather than written partially.
    fn store_socktuple(&mut self, tuple: Option<&SockTuple>) {
        let written = match tuple {
            Some(tuple) => {
                let needed = tuple.encoded_len();
                self.append_slot(needed, &mut |dst| {
                    if dst.len() < needed {
                        0
                    } else {
                        tuple.encode(dst)
                    }
                })
            }
            None => {
                self.store_empty();
                0
            }
        };
        if written == 0 {
            self.metrics()
                .capture
                .empty_tuples
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Slot bookkeeping shared by both writers: where the next length entry
/// and the next payload byte go.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotCursor {
    pub nparams: usize,
    pub params: usize,
    pub lengths_pos: usize,
    pub payload_pos: usize,
}

impl SlotCursor {
    pub fn new(nparams: usize) -> Self {
        Self {
            nparams,
            params: 0,
            lengths_pos: HEADER_LEN,
            payload_pos: HEADER_LEN + nparams * PARAM_LEN,
        }
    }

    /// Append one slot into `buf`, which spans the whole record
    pub fn append(
        &mut self,
        event_type: EventType,
        buf: &mut [u8],
        max_len: usize,
        fill: &mut dyn FnMut(&mut [u8]) -> usize,
    ) -> usize {
        if self.params >= self.nparams {
            trace!(event = event_type.name(), "slot beyond schema ignored");
            return 0;
        }

        let room = buf.len().saturating_sub(self.payload_pos);
        let max = max_len.min(room).min(MAX_PARAM_SIZE);
        let dst = &mut buf[self.payload_pos..self.payload_pos + max];
        let written = fill(dst).min(max);

        buf[self.lengths_pos..self.lengths_pos + PARAM_LEN]
            .copy_from_slice(&(written as u16).to_le_bytes());
        self.lengths_pos += PARAM_LEN;
        self.payload_pos += written;
        self.params += 1;
        written
    }

    pub fn room(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.payload_pos)
    }
}
