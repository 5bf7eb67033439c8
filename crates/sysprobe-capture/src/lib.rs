//! Syscall event capture core
//!
//! Encodes observed syscalls into compact binary records and moves them to
//! a user-space consumer through a shared ring buffer. Records are built
//! either directly in a ring-buffer reservation ([`FixedEvent`]) when their
//! size is known up front, or in a per-context staging buffer
//! ([`StagedEvent`]) when it depends on runtime data.

pub mod args;
pub mod context;
pub mod event;
pub mod fixed;
pub mod handlers;
pub mod probe;
pub mod ringbuf;
pub mod sim;
pub mod snaplen;
pub mod staged;
pub mod tuple;
pub mod wire;
pub mod writer;

pub use args::{Abi, CallContext};
pub use context::{MemoryFault, TaskContext, UserMemory};
pub use event::{EventSchema, EventType, ParamInfo, ParamKind};
pub use fixed::FixedEvent;
pub use probe::Probe;
pub use ringbuf::RingBuffer;
pub use snaplen::{DestinationHint, SnaplenPolicy};
pub use staged::{FinalizedEvent, StagedEvent, StagingPool};
pub use tuple::{Direction, Protocol, SockTuple, SocketState, SocketTable};
pub use wire::{EventHeader, RawEvent, WireError};
pub use writer::EventWriter;
