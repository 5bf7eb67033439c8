//! Capture handlers for `recvfrom` and `sendto`
//!
//! Each handler first normalizes its arguments, then builds the record on
//! the fixed path when its size is static and on the staged path
//! otherwise. Failed calls (negative return) carry empty data and tuple
//! slots.

use crate::args::{fd_arg, CallContext};
use crate::context::TaskContext;
use crate::event::{EventType, RECVFROM_E_SIZE};
use crate::probe::Probe;
use crate::tuple::Direction;
use crate::writer::EventWriter;

fn nonzero(addr: u64) -> Option<u64> {
    (addr != 0).then_some(addr)
}

/// `recvfrom(fd, buf, len, flags, src_addr, addrlen)` entry
pub fn recvfrom_enter(probe: &Probe, task: &dyn TaskContext, call: &CallContext) {
    let args: [u64; 3] = call.extract(task.memory());

    let Some(mut event) = probe.reserve_fixed(task, EventType::RecvfromE, RECVFROM_E_SIZE) else {
        return;
    };
    event.store_s64(fd_arg(args[0]));
    event.store_u32(args[2] as u32);
    event.submit();
}

/// `recvfrom` exit with return value `ret`
pub fn recvfrom_exit(probe: &Probe, task: &dyn TaskContext, call: &CallContext, ret: i64) {
    let args: [u64; 5] = call.extract(task.memory());
    let fd = fd_arg(args[0]);

    let Some(mut event) = probe.preload_staged(task, EventType::RecvfromX) else {
        return;
    };
    event.store_s64(ret);

    if ret >= 0 {
        let hint = probe.destination_hint(task, fd, args[1], nonzero(args[4]));
        let snaplen = probe.effective_snaplen(EventType::RecvfromX, hint.as_ref(), ret as usize);
        event.store_bytebuf(task.memory(), args[1], ret as usize, snaplen);

        let tuple = probe.resolve_tuple(task, fd, Direction::Inbound, nonzero(args[4]));
        event.store_socktuple(tuple.as_ref());
    } else {
        event.store_empty();
        event.store_empty();
    }

    event.store_s64(fd);
    event.store_u32(args[2] as u32);
    event.finalize().submit();
}

/// `sendto(fd, buf, len, flags, dest_addr, addrlen)` entry
pub fn sendto_enter(probe: &Probe, task: &dyn TaskContext, call: &CallContext) {
    let args: [u64; 5] = call.extract(task.memory());
    let fd = fd_arg(args[0]);

    let Some(mut event) = probe.preload_staged(task, EventType::SendtoE) else {
        return;
    };
    event.store_s64(fd);
    event.store_u32(args[2] as u32);
    let tuple = probe.resolve_tuple(task, fd, Direction::Outbound, nonzero(args[4]));
    event.store_socktuple(tuple.as_ref());
    event.finalize().submit();
}

/// `sendto` exit with return value `ret`
pub fn sendto_exit(probe: &Probe, task: &dyn TaskContext, call: &CallContext, ret: i64) {
    let args: [u64; 5] = call.extract(task.memory());
    let fd = fd_arg(args[0]);

    let Some(mut event) = probe.preload_staged(task, EventType::SendtoX) else {
        return;
    };
    event.store_s64(ret);

    if ret >= 0 {
        let hint = probe.destination_hint(task, fd, args[1], nonzero(args[4]));
        let snaplen = probe.effective_snaplen(EventType::SendtoX, hint.as_ref(), ret as usize);
        event.store_bytebuf(task.memory(), args[1], ret as usize, snaplen);
    } else {
        event.store_empty();
    }

    event.store_s64(fd);
    event.store_u32(args[2] as u32);

    if ret >= 0 {
        let tuple = probe.resolve_tuple(task, fd, Direction::Outbound, nonzero(args[4]));
        event.store_socktuple(tuple.as_ref());
    } else {
        event.store_empty();
    }
    event.finalize().submit();
}
