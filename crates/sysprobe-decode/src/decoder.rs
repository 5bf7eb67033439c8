//! Record decoder
//!
//! Validates raw ring-buffer records against the event schema registry and
//! turns them into [`DecodedEvent`]s. Validation is strict: the header
//! length, the parameter count and every fixed-width slot must match.

use crate::event::{DecodedEvent, DecodedParam, ParamValue, TupleValue};
use chrono::{DateTime, Utc};
use sysprobe_capture::{EventType, ParamKind, RawEvent, SockTuple, WireError};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed record: {0}")]
    Wire(#[from] WireError),

    #[error("unknown event type tag {0}")]
    UnknownEventType(u16),

    #[error("{event}: expected {expected} parameters, found {actual}")]
    ParamCount {
        event: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{event}.{param}: expected {expected} bytes, found {actual}")]
    ParamWidth {
        event: &'static str,
        param: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{event}.{param}: invalid socket tuple")]
    BadTuple {
        event: &'static str,
        param: &'static str,
    },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Stateless record decoder
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordDecoder;

impl RecordDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, record: &[u8]) -> DecodeResult<DecodedEvent> {
        let raw = RawEvent::parse(record)?;
        let event_type = EventType::from_tag(raw.header.event_type)
            .ok_or(DecodeError::UnknownEventType(raw.header.event_type))?;
        let schema = event_type.schema();

        if raw.nparams() != schema.nparams() {
            return Err(DecodeError::ParamCount {
                event: schema.name,
                expected: schema.nparams(),
                actual: raw.nparams(),
            });
        }

        let params = schema
            .params
            .iter()
            .zip(raw.params())
            .map(|(info, slot)| {
                decode_param(info.kind, slot)
                    .map(|value| DecodedParam {
                        name: info.name,
                        value,
                    })
                    .map_err(|err| err.with_names(schema.name, info.name))
            })
            .collect::<DecodeResult<Vec<_>>>()?;

        Ok(DecodedEvent {
            timestamp: timestamp(raw.header.ts),
            ts_ns: raw.header.ts,
            tid: raw.header.tid,
            event_type: schema.name,
            tag: raw.header.event_type,
            len: raw.header.len,
            params,
        })
    }
}

fn timestamp(ts_ns: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ts_ns as i64)
}

/// Slot-level failure before the event and parameter names are known
enum SlotError {
    Width { expected: usize, actual: usize },
    Tuple,
}

impl SlotError {
    fn with_names(self, event: &'static str, param: &'static str) -> DecodeError {
        match self {
            SlotError::Width { expected, actual } => DecodeError::ParamWidth {
                event,
                param,
                expected,
                actual,
            },
            SlotError::Tuple => DecodeError::BadTuple { event, param },
        }
    }
}

fn decode_param(kind: ParamKind, slot: &[u8]) -> Result<ParamValue, SlotError> {
    if slot.is_empty() {
        return Ok(ParamValue::Empty);
    }
    if let Some(expected) = kind.fixed_width() {
        if slot.len() != expected {
            return Err(SlotError::Width {
                expected,
                actual: slot.len(),
            });
        }
    }

    let value = match kind {
        ParamKind::Fd => ParamValue::Fd {
            value: i64::from_le_bytes(to_array(slot)),
        },
        ParamKind::Errno => ParamValue::Errno {
            value: i64::from_le_bytes(to_array(slot)),
        },
        ParamKind::Uint32 => ParamValue::Uint32 {
            value: u32::from_le_bytes(to_array(slot)),
        },
        ParamKind::ByteBuf => ParamValue::bytes(slot),
        ParamKind::SockTuple => {
            let tuple = SockTuple::decode(slot).ok_or(SlotError::Tuple)?;
            ParamValue::Tuple(TupleValue::from(&tuple))
        }
    };
    Ok(value)
}

/// Width already checked against the schema
fn to_array<const N: usize>(slot: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slot[..N]);
    out
}
