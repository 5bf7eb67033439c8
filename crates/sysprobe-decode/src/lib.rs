//! User-space side of sysprobe
//!
//! - **RecordDecoder**: validates raw records against the event schemas
//! - **RingConsumer**: polls the ring buffer and forwards decoded events

pub mod consumer;
pub mod decoder;
pub mod event;

pub use consumer::RingConsumer;
pub use decoder::{DecodeError, DecodeResult, RecordDecoder};
pub use event::{DecodedEvent, DecodedParam, ParamValue, TupleValue};
