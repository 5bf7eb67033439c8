//! Simulated task environment
//!
//! Stands in for the kernel so the capture core can run in tests and in
//! the sensor demo: sparse user memory, a socket table, a task that issues
//! `recvfrom`/`sendto` through the real handlers, and a workload that
//! drives a task through a mix of traffic.

use crate::args::{socketcall, Abi, CallContext, Registers, SOCKETCALL_COMPAT_NR};
use crate::context::{MemoryFault, TaskContext, UserMemory};
use crate::handlers;
use crate::probe::Probe;
use crate::tuple::{unix_path, Protocol, SocketState, SocketTable, AF_INET};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Syscall numbers used when a task calls directly
pub mod nr {
    pub const SENDTO: i64 = 44;
    pub const RECVFROM: i64 = 45;
    pub const SENDTO_COMPAT: i64 = 369;
    pub const RECVFROM_COMPAT: i64 = 371;
}

/// Sparse address space made of mapped regions
#[derive(Debug, Default)]
pub struct SimMemory {
    regions: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `addr`, replacing a region starting there
    pub fn map(&self, addr: u64, bytes: impl Into<Vec<u8>>) {
        self.regions.write().insert(addr, bytes.into());
    }

    pub fn unmap(&self, addr: u64) {
        self.regions.write().remove(&addr);
    }
}

impl UserMemory for SimMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault> {
        let fault = MemoryFault {
            addr,
            len: dst.len(),
        };
        let regions = self.regions.read();
        let (start, bytes) = regions.range(..=addr).next_back().ok_or(fault)?;
        let offset = (addr - start) as usize;
        let end = offset.checked_add(dst.len()).ok_or(fault)?;
        let src = bytes.get(offset..end).ok_or(fault)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// File descriptor table holding only sockets
#[derive(Debug, Default)]
pub struct SimSockets {
    sockets: RwLock<HashMap<i64, SocketState>>,
}

impl SimSockets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, fd: i64, state: SocketState) {
        self.sockets.write().insert(fd, state);
    }

    pub fn close(&self, fd: i64) {
        self.sockets.write().remove(&fd);
    }
}

impl SocketTable for SimSockets {
    fn lookup(&self, fd: i64) -> Option<SocketState> {
        self.sockets.read().get(&fd).copied()
    }
}

const CLOCK_BASE_NS: u64 = 1_700_000_000_000_000_000;
const CLOCK_TICK_NS: u64 = 1_000;

/// Base address of the `socketcall` argument array of compat tasks
const SOCKETCALL_ARGS_ADDR: u64 = 0x0fff_0000;

/// Arguments of one `recvfrom`/`sendto` call
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketCall {
    pub fd: i64,
    pub buf: u64,
    pub len: usize,
    /// `src_addr` / `dest_addr`, 0 when not passed
    pub addr: u64,
}

/// One traced thread bound to an execution context
#[derive(Debug)]
pub struct SimTask {
    context_id: usize,
    tid: u64,
    abi: Abi,
    clock: AtomicU64,
    memory: SimMemory,
    sockets: SimSockets,
}

impl SimTask {
    pub fn new(context_id: usize, tid: u64) -> Self {
        Self {
            context_id,
            tid,
            abi: Abi::Native,
            clock: AtomicU64::new(CLOCK_BASE_NS),
            memory: SimMemory::new(),
            sockets: SimSockets::new(),
        }
    }

    /// Make the task a 32-bit one; its socket calls go through `socketcall`
    pub fn with_abi(mut self, abi: Abi) -> Self {
        self.abi = abi;
        self
    }

    pub fn user_memory(&self) -> &SimMemory {
        &self.memory
    }

    pub fn socket_table(&self) -> &SimSockets {
        &self.sockets
    }

    fn call_context(&self, direct_nr: i64, compat_nr: i64, op: u32, call: &SocketCall) -> CallContext {
        let regs: Registers = [call.fd as u64, call.buf, call.len as u64, 0, call.addr, 0];
        match self.abi {
            Abi::Native => CallContext::classify(direct_nr, regs, Abi::Native),
            Abi::Compat32 => {
                if op == 0 {
                    return CallContext::classify(compat_nr, regs, Abi::Compat32);
                }
                let words: Vec<u8> = regs
                    .iter()
                    .flat_map(|r| (*r as u32).to_le_bytes())
                    .collect();
                self.memory.map(SOCKETCALL_ARGS_ADDR, words);
                CallContext::classify(
                    SOCKETCALL_COMPAT_NR,
                    [op as u64, SOCKETCALL_ARGS_ADDR, 0, 0, 0, 0],
                    Abi::Compat32,
                )
            }
        }
    }

    /// Issue `recvfrom`. `Ok(data)` is what the kernel copied into `buf`;
    /// `Err(errno)` fails the call.
    pub fn recvfrom(&self, probe: &Probe, call: &SocketCall, outcome: Result<&[u8], i64>) {
        let ctx = self.call_context(nr::RECVFROM, nr::RECVFROM_COMPAT, socketcall::SYS_RECVFROM, call);
        handlers::recvfrom_enter(probe, self, &ctx);
        let ret = match outcome {
            Ok(data) => {
                self.memory.map(call.buf, data);
                data.len() as i64
            }
            Err(errno) => -errno,
        };
        handlers::recvfrom_exit(probe, self, &ctx, ret);
    }

    /// Same as [`SimTask::recvfrom`] but through the direct compat syscall
    pub fn recvfrom_direct(&self, probe: &Probe, call: &SocketCall, data: &[u8]) {
        let ctx = self.call_context(nr::RECVFROM, nr::RECVFROM_COMPAT, 0, call);
        handlers::recvfrom_enter(probe, self, &ctx);
        self.memory.map(call.buf, data);
        handlers::recvfrom_exit(probe, self, &ctx, data.len() as i64);
    }

    /// Issue `sendto` of `data`; `ret` is what the kernel returns
    pub fn sendto(&self, probe: &Probe, call: &SocketCall, data: &[u8], ret: i64) {
        self.memory.map(call.buf, data);
        let ctx = self.call_context(nr::SENDTO, nr::SENDTO_COMPAT, socketcall::SYS_SENDTO, call);
        handlers::sendto_enter(probe, self, &ctx);
        handlers::sendto_exit(probe, self, &ctx, ret);
    }
}

impl TaskContext for SimTask {
    fn context_id(&self) -> usize {
        self.context_id
    }

    fn tid(&self) -> u64 {
        self.tid
    }

    fn now_ns(&self) -> u64 {
        self.clock.fetch_add(CLOCK_TICK_NS, Ordering::Relaxed)
    }

    fn memory(&self) -> &dyn UserMemory {
        &self.memory
    }

    fn sockets(&self) -> &dyn SocketTable {
        &self.sockets
    }
}

/// Write a `sockaddr_in` for `ip:port` at `addr`
pub fn map_sockaddr_in(mem: &SimMemory, addr: u64, ip: Ipv4Addr, port: u16) {
    let mut raw = vec![0u8; 16];
    raw[0..2].copy_from_slice(&AF_INET.to_le_bytes());
    raw[2..4].copy_from_slice(&port.to_be_bytes());
    raw[4..8].copy_from_slice(&ip.octets());
    mem.map(addr, raw);
}

/// Configuration for [`Workload`]
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Rounds of traffic; each round issues two syscalls
    pub iterations: u64,

    /// Every n-th receive fails with EAGAIN (0 = never)
    pub failure_every: u64,

    /// Size of the response bodies
    pub payload_len: usize,

    pub abi: Abi,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            iterations: 100,
            failure_every: 10,
            payload_len: 512,
            abi: Abi::Native,
        }
    }
}

const FD_HTTP: i64 = 3;
const FD_HTTPS: i64 = 4;
const FD_STATSD: i64 = 5;
const FD_UNIX: i64 = 6;

const BUF_ADDR: u64 = 0x1000_0000;
const ADDR_ADDR: u64 = 0x2000_0000;

const EAGAIN: i64 = 11;

/// Contexts share a block of this many local ports per socket
const PORTS_PER_BLOCK: usize = 1000;

/// Local port of a context's socket within the block starting at `base`
fn ephemeral_port(base: u16, context_id: usize) -> u16 {
    base + (context_id % PORTS_PER_BLOCK) as u16
}

/// Traffic generator for one task: HTTP and HTTPS clients, a statsd
/// emitter on an unconnected UDP socket and a Unix-socket peer.
pub struct Workload {
    config: WorkloadConfig,
    task: SimTask,
}

impl Workload {
    pub fn new(context_id: usize, tid: u64, config: WorkloadConfig) -> Self {
        let task = SimTask::new(context_id, tid).with_abi(config.abi);
        let local = |port| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), port));
        let remote = |port| Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 80), port)));

        let sockets = task.socket_table();
        sockets.insert(
            FD_HTTP,
            SocketState::Inet {
                protocol: Protocol::Tcp,
                local: local(ephemeral_port(40000, context_id)),
                remote: remote(8080),
            },
        );
        sockets.insert(
            FD_HTTPS,
            SocketState::Inet {
                protocol: Protocol::Tcp,
                local: local(ephemeral_port(41000, context_id)),
                remote: remote(443),
            },
        );
        sockets.insert(
            FD_STATSD,
            SocketState::Inet {
                protocol: Protocol::Udp,
                local: local(ephemeral_port(42000, context_id)),
                remote: None,
            },
        );
        sockets.insert(
            FD_UNIX,
            SocketState::Unix {
                sk: 0xffff_8800_0000_1000_u64.wrapping_add(context_id as u64),
                peer: 0xffff_8800_0000_2000_u64.wrapping_add(context_id as u64),
                path: unix_path(b"/run/sysprobe-demo.sock"),
            },
        );
        map_sockaddr_in(task.user_memory(), ADDR_ADDR, Ipv4Addr::LOCALHOST, 8125);

        Self { config, task }
    }

    pub fn task(&self) -> &SimTask {
        &self.task
    }

    fn body(&self, prefix: &[u8]) -> Vec<u8> {
        let mut body = prefix.to_vec();
        body.resize(self.config.payload_len.max(prefix.len()), b'x');
        body
    }

    /// Run every round through `probe`; returns the number of syscalls
    pub fn run(&self, probe: &Probe) -> u64 {
        let mut syscalls = 0;
        for round in 0..self.config.iterations {
            let fail = self.config.failure_every != 0 && (round + 1) % self.config.failure_every == 0;
            let buf = BUF_ADDR;
            let cap = self.config.payload_len.max(64);

            match round % 4 {
                0 => {
                    let req = b"GET /v1/items HTTP/1.1\r\nHost: api\r\n\r\n";
                    let call = SocketCall { fd: FD_HTTP, buf, len: req.len(), addr: 0 };
                    self.task.sendto(probe, &call, req, req.len() as i64);
                    let call = SocketCall { fd: FD_HTTP, buf, len: cap, addr: 0 };
                    let resp = self.body(b"HTTP/1.1 200 OK\r\n\r\n");
                    self.receive(probe, &call, &resp, fail);
                }
                1 => {
                    let hello = [0x16u8, 0x03, 0x01, 0x00, 0x2a];
                    let call = SocketCall { fd: FD_HTTPS, buf, len: hello.len(), addr: 0 };
                    self.task.sendto(probe, &call, &hello, hello.len() as i64);
                    let call = SocketCall { fd: FD_HTTPS, buf, len: cap, addr: 0 };
                    let resp = self.body(&[0x17, 0x03, 0x03]);
                    self.receive(probe, &call, &resp, fail);
                }
                2 => {
                    let metric = b"requests:1|c";
                    let call = SocketCall { fd: FD_STATSD, buf, len: metric.len(), addr: ADDR_ADDR };
                    self.task.sendto(probe, &call, metric, metric.len() as i64);
                    let call = SocketCall { fd: FD_STATSD, buf, len: cap, addr: ADDR_ADDR };
                    self.receive(probe, &call, b"ack", fail);
                }
                _ => {
                    let msg = b"{\"op\":\"ping\"}";
                    let call = SocketCall { fd: FD_UNIX, buf, len: msg.len(), addr: 0 };
                    self.task.sendto(probe, &call, msg, msg.len() as i64);
                    let call = SocketCall { fd: FD_UNIX, buf, len: cap, addr: 0 };
                    self.receive(probe, &call, b"{\"op\":\"pong\"}", fail);
                }
            }
            syscalls += 2;
        }
        debug!(
            context = self.task.context_id,
            tid = self.task.tid,
            syscalls,
            "workload finished"
        );
        syscalls
    }

    fn receive(&self, probe: &Probe, call: &SocketCall, data: &[u8], fail: bool) {
        let outcome = if fail { Err(EAGAIN) } else { Ok(data) };
        self.task.recvfrom(probe, call, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_regions() {
        let mem = SimMemory::new();
        mem.map(0x1000, b"abcdef".to_vec());

        let mut buf = [0u8; 3];
        mem.read(0x1002, &mut buf).unwrap();
        assert_eq!(&buf, b"cde");
        assert!(mem.read(0x1004, &mut buf).is_err());
        assert!(mem.read(0x0fff, &mut buf).is_err());
        assert_eq!(mem.read_u32(0x5000), Err(MemoryFault { addr: 0x5000, len: 4 }));

        mem.unmap(0x1000);
        assert!(mem.read(0x1000, &mut buf).is_err());
    }

    #[test]
    fn test_socket_table() {
        let sockets = SimSockets::new();
        sockets.insert(3, SocketState::Unsupported { family: 16 });
        assert!(sockets.lookup(3).is_some());
        sockets.close(3);
        assert!(sockets.lookup(3).is_none());
    }

    #[test]
    fn test_ephemeral_port_stays_in_block() {
        assert_eq!(ephemeral_port(40000, 0), 40000);
        assert_eq!(ephemeral_port(40000, 7), 40007);
        assert_eq!(ephemeral_port(42000, 30_999), 42999);
        assert!(ephemeral_port(42000, usize::MAX) < 43000);
    }

    #[test]
    fn test_workload_with_large_context_id() {
        let workload = Workload::new(70_000, 1, WorkloadConfig::default());
        let Some(SocketState::Inet { local, .. }) = workload.task().socket_table().lookup(FD_HTTP)
        else {
            panic!("http socket missing");
        };
        assert_eq!(local.port(), 40000);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let task = SimTask::new(0, 1);
        let a = task.now_ns();
        let b = task.now_ns();
        assert!(b > a);
    }
}
