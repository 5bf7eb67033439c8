//! Argument normalization
//!
//! The same logical operation can reach a capture handler through its own
//! syscall or through the multiplexed `socketcall` entry point, which
//! passes a call number plus a pointer to an argument array in user
//! memory. [`CallContext`] captures which of the two happened, and
//! [`CallContext::extract`] returns the argument vector in one shape
//! either way.

use crate::context::UserMemory;
use tracing::trace;

/// Syscall number of `socketcall` on the 32-bit compat ABI
pub const SOCKETCALL_COMPAT_NR: i64 = 102;

/// Largest argument vector any socket call takes
pub const MAX_ARGS: usize = 6;

/// `socketcall` call numbers
pub mod socketcall {
    pub const SYS_SOCKET: u32 = 1;
    pub const SYS_BIND: u32 = 2;
    pub const SYS_CONNECT: u32 = 3;
    pub const SYS_LISTEN: u32 = 4;
    pub const SYS_ACCEPT: u32 = 5;
    pub const SYS_SEND: u32 = 9;
    pub const SYS_RECV: u32 = 10;
    pub const SYS_SENDTO: u32 = 11;
    pub const SYS_RECVFROM: u32 = 12;
}

/// Register values of the interrupted syscall
pub type Registers = [u64; MAX_ARGS];

/// Word width of the traced task
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Abi {
    #[default]
    Native,
    /// 32-bit task on a 64-bit kernel
    Compat32,
}

impl Abi {
    pub const fn word_size(self) -> usize {
        match self {
            Abi::Native => 8,
            Abi::Compat32 => 4,
        }
    }
}

/// How the observed operation was invoked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallContext {
    /// Through the operation's own syscall
    Direct { regs: Registers, abi: Abi },
    /// Through `socketcall(call, args_ptr)`
    Multiplexed { call: u32, args_ptr: u64, abi: Abi },
}

impl CallContext {
    /// Classify a raw syscall. Only `socketcall` on the compat ABI is
    /// multiplexed; every other number is a direct call.
    pub fn classify(syscall_nr: i64, regs: Registers, abi: Abi) -> Self {
        if abi == Abi::Compat32 && syscall_nr == SOCKETCALL_COMPAT_NR {
            CallContext::Multiplexed {
                call: regs[0] as u32,
                args_ptr: regs[1] & u32::MAX as u64,
                abi,
            }
        } else {
            CallContext::Direct { regs, abi }
        }
    }

    pub fn direct(regs: Registers) -> Self {
        CallContext::Direct {
            regs,
            abi: Abi::Native,
        }
    }

    pub fn abi(&self) -> Abi {
        match self {
            CallContext::Direct { abi, .. } | CallContext::Multiplexed { abi, .. } => *abi,
        }
    }

    /// The `socketcall` number, for multiplexed calls
    pub fn socketcall(&self) -> Option<u32> {
        match self {
            CallContext::Multiplexed { call, .. } => Some(*call),
            CallContext::Direct { .. } => None,
        }
    }

    /// The first `N` arguments, zero-extended to 64 bits.
    ///
    /// Arguments that cannot be read from user memory come back as 0 so
    /// the handler can still emit a degraded event.
    pub fn extract<const N: usize>(&self, mem: &dyn UserMemory) -> [u64; N] {
        let mut out = [0u64; N];
        let n = N.min(MAX_ARGS);
        match *self {
            CallContext::Direct { regs, abi } => {
                for (dst, reg) in out.iter_mut().zip(&regs[..n]) {
                    *dst = match abi {
                        Abi::Native => *reg,
                        Abi::Compat32 => *reg & u32::MAX as u64,
                    };
                }
            }
            CallContext::Multiplexed {
                call,
                args_ptr,
                abi,
            } => {
                let word = abi.word_size();
                for (i, dst) in out.iter_mut().take(n).enumerate() {
                    let addr = args_ptr.wrapping_add((i * word) as u64);
                    let value = match abi {
                        Abi::Compat32 => mem.read_u32(addr).map(u64::from),
                        Abi::Native => mem.read_u64(addr),
                    };
                    match value {
                        Ok(v) => *dst = v,
                        Err(fault) => trace!(call, index = i, %fault, "socketcall argument unreadable"),
                    }
                }
            }
        }
        out
    }
}

/// Sign-extend a file descriptor argument (`int` in the syscall ABI)
pub fn fd_arg(raw: u64) -> i64 {
    raw as i32 as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMemory;

    #[test]
    fn test_direct_native() {
        let mem = SimMemory::new();
        let call = CallContext::classify(45, [3, 0x1000, 64, 0, 0x2000, 0x3000], Abi::Native);
        assert_eq!(call.socketcall(), None);
        let args: [u64; 5] = call.extract(&mem);
        assert_eq!(args, [3, 0x1000, 64, 0, 0x2000]);
    }

    #[test]
    fn test_direct_compat_truncates() {
        let mem = SimMemory::new();
        let call = CallContext::classify(
            369,
            [0xffff_ffff_0000_0003, 0x1_0000_1000, 0, 0, 0, 0],
            Abi::Compat32,
        );
        let args: [u64; 2] = call.extract(&mem);
        assert_eq!(args, [3, 0x1000]);
    }

    #[test]
    fn test_socketcall_reads_compat_words() {
        let mem = SimMemory::new();
        let words: Vec<u8> = [7u32, 0x8000, 120, 0, 0x9000, 0x9100]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        mem.map(0x4000, words);

        let call = CallContext::classify(
            SOCKETCALL_COMPAT_NR,
            [socketcall::SYS_RECVFROM as u64, 0x4000, 0, 0, 0, 0],
            Abi::Compat32,
        );
        assert_eq!(call.socketcall(), Some(socketcall::SYS_RECVFROM));
        let args: [u64; 5] = call.extract(&mem);
        assert_eq!(args, [7, 0x8000, 120, 0, 0x9000]);
    }

    #[test]
    fn test_socketcall_native_is_direct() {
        let mem = SimMemory::new();
        let call = CallContext::classify(SOCKETCALL_COMPAT_NR, [1, 2, 3, 4, 5, 6], Abi::Native);
        assert!(matches!(call, CallContext::Direct { .. }));
        let args: [u64; 3] = call.extract(&mem);
        assert_eq!(args, [1, 2, 3]);
    }

    #[test]
    fn test_unreadable_socketcall_args_are_zero() {
        let mem = SimMemory::new();
        // only the first two words are mapped
        mem.map(0x4000, [5u32, 0x8000].iter().flat_map(|w| w.to_le_bytes()).collect::<Vec<u8>>());
        let call = CallContext::Multiplexed {
            call: socketcall::SYS_SENDTO,
            args_ptr: 0x4000,
            abi: Abi::Compat32,
        };
        let args: [u64; 5] = call.extract(&mem);
        assert_eq!(args, [5, 0x8000, 0, 0, 0]);
    }

    #[test]
    fn test_args_array_at_top_of_address_space() {
        let mem = SimMemory::new();
        let top = u64::MAX - 7;
        mem.map(top, 9u64.to_le_bytes());
        let call = CallContext::Multiplexed {
            call: socketcall::SYS_RECVFROM,
            args_ptr: top,
            abi: Abi::Native,
        };
        let args: [u64; 5] = call.extract(&mem);
        assert_eq!(args, [9, 0, 0, 0, 0]);
    }

    #[test]
    fn test_fd_sign_extension() {
        assert_eq!(fd_arg(3), 3);
        assert_eq!(fd_arg(0xffff_ffff), -1);
    }
}
