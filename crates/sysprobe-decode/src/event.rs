//! Decoded, serializable events

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use sysprobe_capture::SockTuple;

/// Bytes of a buffer shown in text output
const TEXT_PREVIEW_LEN: usize = 32;

/// One record after validation
#[derive(Debug, Clone, Serialize)]
pub struct DecodedEvent {
    pub timestamp: DateTime<Utc>,
    pub ts_ns: u64,
    pub tid: u64,
    pub event_type: &'static str,
    pub tag: u16,
    /// Record length on the wire
    pub len: u32,
    pub params: Vec<DecodedParam>,
}

impl DecodedEvent {
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tid={} {}",
            self.timestamp.format("%H:%M:%S%.6f"),
            self.tid,
            self.event_type
        )?;
        for param in &self.params {
            write!(f, " {}={}", param.name, param.value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedParam {
    pub name: &'static str,
    pub value: ParamValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamValue {
    Fd { value: i64 },
    Errno { value: i64 },
    Uint32 { value: u32 },
    Bytes { len: usize, hex: String },
    Tuple(TupleValue),
    /// Zero-length slot
    Empty,
}

impl ParamValue {
    pub(crate) fn bytes(data: &[u8]) -> Self {
        ParamValue::Bytes {
            len: data.len(),
            hex: hex::encode(data),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Fd { value } | ParamValue::Errno { value } => Some(*value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ParamValue::Empty)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Fd { value } | ParamValue::Errno { value } => write!(f, "{}", value),
            ParamValue::Uint32 { value } => write!(f, "{}", value),
            ParamValue::Bytes { len, hex } => {
                let raw = hex::decode(hex).unwrap_or_default();
                let preview: String = raw
                    .iter()
                    .take(TEXT_PREVIEW_LEN)
                    .map(|b| {
                        if b.is_ascii_graphic() || *b == b' ' {
                            *b as char
                        } else {
                            '.'
                        }
                    })
                    .collect();
                if *len > TEXT_PREVIEW_LEN {
                    write!(f, "\"{}\"...({} bytes)", preview, len)
                } else {
                    write!(f, "\"{}\"", preview)
                }
            }
            ParamValue::Tuple(tuple) => write!(f, "{}", tuple),
            ParamValue::Empty => write!(f, "<NA>"),
        }
    }
}

/// Endpoint pair as shown to users
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum TupleValue {
    Inet { src: String, dst: String },
    Inet6 { src: String, dst: String },
    Unix { src: String, dst: String, path: String },
}

impl From<&SockTuple> for TupleValue {
    fn from(tuple: &SockTuple) -> Self {
        match tuple {
            SockTuple::Inet { src, dst } => TupleValue::Inet {
                src: src.to_string(),
                dst: dst.to_string(),
            },
            SockTuple::Inet6 { src, dst } => TupleValue::Inet6 {
                src: src.to_string(),
                dst: dst.to_string(),
            },
            SockTuple::Unix { src, dst, .. } => TupleValue::Unix {
                src: format!("{:#x}", src),
                dst: format!("{:#x}", dst),
                path: tuple.unix_path().unwrap_or_default(),
            },
        }
    }
}

impl fmt::Display for TupleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TupleValue::Inet { src, dst } | TupleValue::Inet6 { src, dst } => {
                write!(f, "{}->{}", src, dst)
            }
            TupleValue::Unix { src, dst, path } => write!(f, "{}->{} {}", src, dst, path),
        }
    }
}
