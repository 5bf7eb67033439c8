//! The interrupted execution context a capture runs in
//!
//! Everything a capture handler needs from the host (clock, thread id,
//! user memory of the traced task, the task's socket table) comes through
//! these traits, so the core never touches kernel state directly.

use crate::tuple::SocketTable;
use thiserror::Error;

/// A failed read of traced-task memory
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot read {len} bytes of user memory at {addr:#x}")]
pub struct MemoryFault {
    pub addr: u64,
    pub len: usize,
}

/// Read access to the traced task's address space
pub trait UserMemory {
    /// Fill `dst` completely from `addr`, or fail without a partial guarantee.
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault>;

    fn read_u32(&self, addr: u64) -> Result<u32, MemoryFault> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Result<u64, MemoryFault> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// One interrupted execution context (a syscall entry or exit on one thread)
pub trait TaskContext {
    /// Index of the execution context (CPU); selects the staging buffer
    fn context_id(&self) -> usize;

    /// Thread id recorded in the event header
    fn tid(&self) -> u64;

    /// Timestamp in nanoseconds recorded in the event header
    fn now_ns(&self) -> u64;

    fn memory(&self) -> &dyn UserMemory;

    fn sockets(&self) -> &dyn SocketTable;
}
