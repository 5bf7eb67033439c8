//! Binary record layout shared by producer and consumer
//!
//! ```text
//! [ts:u64][tid:u64][len:u32][type:u16][nparams:u32]   header, 26 bytes, packed
//! [len_0:u16] ... [len_{n-1}:u16]                    slot lengths table
//! [payload_0] ... [payload_{n-1}]                    slot payloads
//! ```
//!
//! All integers are little-endian. The layout must stay byte-stable across
//! producer and consumer builds.

use thiserror::Error;

/// Size of the packed event header
pub const HEADER_LEN: usize = 26;

/// Size of one entry of the slot lengths table
pub const PARAM_LEN: usize = 2;

/// Hard upper bound for a single record
pub const MAX_EVENT_SIZE: usize = 64 * 1024;

/// Largest payload a single slot can declare
pub const MAX_PARAM_SIZE: usize = u16::MAX as usize;

const TS_OFFSET: usize = 0;
const TID_OFFSET: usize = 8;
const LEN_OFFSET: usize = 16;
const TYPE_OFFSET: usize = 20;
const NPARAMS_OFFSET: usize = 22;

/// Decoded event header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventHeader {
    /// Timestamp in nanoseconds
    pub ts: u64,
    /// Thread id of the interrupted context
    pub tid: u64,
    /// Total record length, header included
    pub len: u32,
    /// Event-type tag
    pub event_type: u16,
    /// Number of parameters
    pub nparams: u32,
}

impl EventHeader {
    /// Write the header into the first `HEADER_LEN` bytes of `dst`
    pub fn write(&self, dst: &mut [u8]) {
        dst[TS_OFFSET..TID_OFFSET].copy_from_slice(&self.ts.to_le_bytes());
        dst[TID_OFFSET..LEN_OFFSET].copy_from_slice(&self.tid.to_le_bytes());
        dst[LEN_OFFSET..TYPE_OFFSET].copy_from_slice(&self.len.to_le_bytes());
        dst[TYPE_OFFSET..NPARAMS_OFFSET].copy_from_slice(&self.event_type.to_le_bytes());
        dst[NPARAMS_OFFSET..HEADER_LEN].copy_from_slice(&self.nparams.to_le_bytes());
    }

    pub fn read(src: &[u8]) -> Result<Self, WireError> {
        if src.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                available: src.len(),
            });
        }
        Ok(Self {
            ts: read_u64(src, TS_OFFSET),
            tid: read_u64(src, TID_OFFSET),
            len: read_u32(src, LEN_OFFSET),
            event_type: read_u16(src, TYPE_OFFSET),
            nparams: read_u32(src, NPARAMS_OFFSET),
        })
    }
}

/// Patch the length field of an already written header
pub(crate) fn patch_len(dst: &mut [u8], len: u32) {
    dst[LEN_OFFSET..TYPE_OFFSET].copy_from_slice(&len.to_le_bytes());
}

pub(crate) fn patch_nparams(dst: &mut [u8], nparams: u32) {
    dst[NPARAMS_OFFSET..HEADER_LEN].copy_from_slice(&nparams.to_le_bytes());
}

/// Errors found while parsing a record
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("record truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("header length {header} does not match record size {actual}")]
    LengthMismatch { header: usize, actual: usize },

    #[error("slot lengths sum to {declared} but {available} payload bytes follow")]
    PayloadMismatch { declared: usize, available: usize },
}

/// A parsed, length-checked view over one record
#[derive(Clone, Debug)]
pub struct RawEvent<'a> {
    pub header: EventHeader,
    lengths: &'a [u8],
    payload: &'a [u8],
}

impl<'a> RawEvent<'a> {
    /// Parse `record`, checking the header length and the slot table
    /// against the bytes actually present.
    pub fn parse(record: &'a [u8]) -> Result<Self, WireError> {
        let header = EventHeader::read(record)?;
        if header.len as usize != record.len() {
            return Err(WireError::LengthMismatch {
                header: header.len as usize,
                actual: record.len(),
            });
        }

        let table_end = HEADER_LEN + header.nparams as usize * PARAM_LEN;
        if record.len() < table_end {
            return Err(WireError::Truncated {
                needed: table_end,
                available: record.len(),
            });
        }

        let lengths = &record[HEADER_LEN..table_end];
        let payload = &record[table_end..];
        let declared: usize = lengths
            .chunks_exact(PARAM_LEN)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as usize)
            .sum();
        if declared != payload.len() {
            return Err(WireError::PayloadMismatch {
                declared,
                available: payload.len(),
            });
        }

        Ok(Self {
            header,
            lengths,
            payload,
        })
    }

    pub fn nparams(&self) -> usize {
        self.header.nparams as usize
    }

    /// Declared length of slot `index`
    pub fn param_len(&self, index: usize) -> Option<usize> {
        let at = index * PARAM_LEN;
        let bytes = self.lengths.get(at..at + PARAM_LEN)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
    }

    /// Payload of slot `index`; an empty slice is the empty marker
    pub fn param(&self, index: usize) -> Option<&'a [u8]> {
        if index >= self.nparams() {
            return None;
        }
        let offset: usize = (0..index).filter_map(|i| self.param_len(i)).sum();
        let len = self.param_len(index)?;
        self.payload.get(offset..offset + len)
    }

    /// All slot payloads in order
    pub fn params(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        let payload = self.payload;
        let mut offset = 0;
        (0..self.nparams()).map(move |i| {
            let len = self.param_len(i).unwrap_or(0);
            let slot = &payload[offset..offset + len];
            offset += len;
            slot
        })
    }
}

pub(crate) fn read_u16(src: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([src[at], src[at + 1]])
}

pub(crate) fn read_u32(src: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[at..at + 4]);
    u32::from_le_bytes(buf)
}

pub(crate) fn read_u64(src: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lengths: &[u16], payload: &[u8]) -> Vec<u8> {
        let len = HEADER_LEN + lengths.len() * PARAM_LEN + payload.len();
        let mut buf = vec![0u8; len];
        EventHeader {
            ts: 7,
            tid: 42,
            len: len as u32,
            event_type: 35,
            nparams: lengths.len() as u32,
        }
        .write(&mut buf);
        let mut at = HEADER_LEN;
        for l in lengths {
            buf[at..at + 2].copy_from_slice(&l.to_le_bytes());
            at += 2;
        }
        buf[at..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn test_header_layout_is_packed_le() {
        let mut buf = [0u8; HEADER_LEN];
        EventHeader {
            ts: 0x0102030405060708,
            tid: 9,
            len: 0x2a,
            event_type: 0x23,
            nparams: 5,
        }
        .write(&mut buf);
        assert_eq!(&buf[0..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(buf[8], 9);
        assert_eq!(&buf[16..20], &[0x2a, 0, 0, 0]);
        assert_eq!(&buf[20..22], &[0x23, 0]);
        assert_eq!(&buf[22..26], &[5, 0, 0, 0]);
    }

    #[test]
    fn test_parse_slots() {
        let buf = record(&[3, 0, 2], b"abcde");
        let event = RawEvent::parse(&buf).unwrap();
        assert_eq!(event.header.tid, 42);
        assert_eq!(event.param(0), Some(&b"abc"[..]));
        assert_eq!(event.param(1), Some(&b""[..]));
        assert_eq!(event.param(2), Some(&b"de"[..]));
        assert_eq!(event.param(3), None);
        let all: Vec<&[u8]> = event.params().collect();
        assert_eq!(all, vec![&b"abc"[..], &b""[..], &b"de"[..]]);
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let mut buf = record(&[1], b"x");
        patch_len(&mut buf, 100);
        assert!(matches!(
            RawEvent::parse(&buf),
            Err(WireError::LengthMismatch { header: 100, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_payload_mismatch() {
        let mut buf = record(&[1], b"x");
        buf[HEADER_LEN] = 4;
        assert!(matches!(
            RawEvent::parse(&buf),
            Err(WireError::PayloadMismatch { declared: 4, available: 1 })
        ));
    }

    #[test]
    fn test_parse_rejects_short_header() {
        assert!(matches!(
            RawEvent::parse(&[0u8; 10]),
            Err(WireError::Truncated { needed: HEADER_LEN, available: 10 })
        ));
    }
}
