//! Socket tuple resolution
//!
//! Turns a socket handle, plus the address the caller may have passed to
//! the syscall, into a fully populated endpoint pair. Resolution is
//! best-effort: any failure yields `None`, which the encoders write as the
//! empty marker. A tuple is never emitted partially.

use crate::context::UserMemory;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use tracing::trace;

/// Family byte of an encoded tuple
pub const PPM_AF_UNIX: u8 = 1;
pub const PPM_AF_INET: u8 = 2;
pub const PPM_AF_INET6: u8 = 10;

/// `sa_family` values found in user-supplied socket addresses
pub const AF_UNIX: u16 = 1;
pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

/// Size of `sun_path`
pub const UNIX_PATH_MAX: usize = 108;

const INET_TUPLE_LEN: usize = 1 + 4 + 2 + 4 + 2;
const INET6_TUPLE_LEN: usize = 1 + 16 + 2 + 16 + 2;
const UNIX_TUPLE_HDR_LEN: usize = 1 + 8 + 8;

/// Which way data flows relative to the traced task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Source is the remote endpoint
    Inbound,
    /// Source is the local endpoint
    Outbound,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    #[default]
    Other,
}

impl Protocol {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

/// NUL-padded `sun_path`
pub type UnixPath = [u8; UNIX_PATH_MAX];

/// Build a [`UnixPath`] from a byte string, truncating to fit with its NUL
pub fn unix_path(path: &[u8]) -> UnixPath {
    let mut out = [0u8; UNIX_PATH_MAX];
    let n = path.len().min(UNIX_PATH_MAX - 1);
    out[..n].copy_from_slice(&path[..n]);
    out
}

fn unix_path_bytes(path: &UnixPath) -> &[u8] {
    let end = path.iter().position(|b| *b == 0).unwrap_or(UNIX_PATH_MAX);
    &path[..end]
}

/// Kernel view of an open socket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Inet {
        protocol: Protocol,
        local: SocketAddr,
        /// `None` while unconnected
        remote: Option<SocketAddr>,
    },
    Unix {
        /// Kernel address of this socket
        sk: u64,
        /// Kernel address of the peer, 0 when unconnected
        peer: u64,
        path: UnixPath,
    },
    /// Any family the resolver does not encode
    Unsupported { family: u16 },
}

impl SocketState {
    pub fn protocol(&self) -> Protocol {
        match self {
            SocketState::Inet { protocol, .. } => *protocol,
            _ => Protocol::Other,
        }
    }
}

/// Lookup of a traced task's open sockets by file descriptor
pub trait SocketTable {
    /// `None` when `fd` is not an open socket
    fn lookup(&self, fd: i64) -> Option<SocketState>;
}

/// Fully populated endpoint pair, already ordered by direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockTuple {
    Inet {
        src: SocketAddrV4,
        dst: SocketAddrV4,
    },
    Inet6 {
        src: SocketAddrV6,
        dst: SocketAddrV6,
    },
    Unix {
        src: u64,
        dst: u64,
        path: UnixPath,
    },
}

impl SockTuple {
    /// Order `local` and `remote` into source and destination
    fn from_endpoints(direction: Direction, local: SocketAddr, remote: SocketAddr) -> Option<Self> {
        let (local, remote) = match (local, remote) {
            (SocketAddr::V4(l), SocketAddr::V4(r)) => (Endpoints::V4(l), Endpoints::V4(r)),
            (SocketAddr::V6(l), SocketAddr::V6(r)) => (Endpoints::V6(l), Endpoints::V6(r)),
            // dual-stack socket talking to an IPv4 peer
            (SocketAddr::V6(l), SocketAddr::V4(r)) => (
                Endpoints::V6(l),
                Endpoints::V6(SocketAddrV6::new(r.ip().to_ipv6_mapped(), r.port(), 0, 0)),
            ),
            (SocketAddr::V4(l), SocketAddr::V6(r)) => {
                let ip = r.ip().to_ipv4_mapped()?;
                (Endpoints::V4(l), Endpoints::V4(SocketAddrV4::new(ip, r.port())))
            }
        };
        let (src, dst) = match direction {
            Direction::Outbound => (local, remote),
            Direction::Inbound => (remote, local),
        };
        match (src, dst) {
            (Endpoints::V4(src), Endpoints::V4(dst)) => Some(SockTuple::Inet { src, dst }),
            (Endpoints::V6(src), Endpoints::V6(dst)) => Some(SockTuple::Inet6 { src, dst }),
            _ => None,
        }
    }

    pub fn family(&self) -> u8 {
        match self {
            SockTuple::Inet { .. } => PPM_AF_INET,
            SockTuple::Inet6 { .. } => PPM_AF_INET6,
            SockTuple::Unix { .. } => PPM_AF_UNIX,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            SockTuple::Inet { .. } => INET_TUPLE_LEN,
            SockTuple::Inet6 { .. } => INET6_TUPLE_LEN,
            SockTuple::Unix { path, .. } => UNIX_TUPLE_HDR_LEN + unix_path_bytes(path).len() + 1,
        }
    }

    /// Write the wire form into `dst` and return its length.
    ///
    /// `dst` must hold at least [`SockTuple::encoded_len`] bytes.
    pub fn encode(&self, dst: &mut [u8]) -> usize {
        dst[0] = self.family();
        match self {
            SockTuple::Inet { src, dst: d } => {
                dst[1..5].copy_from_slice(&src.ip().octets());
                dst[5..7].copy_from_slice(&src.port().to_le_bytes());
                dst[7..11].copy_from_slice(&d.ip().octets());
                dst[11..13].copy_from_slice(&d.port().to_le_bytes());
            }
            SockTuple::Inet6 { src, dst: d } => {
                dst[1..17].copy_from_slice(&src.ip().octets());
                dst[17..19].copy_from_slice(&src.port().to_le_bytes());
                dst[19..35].copy_from_slice(&d.ip().octets());
                dst[35..37].copy_from_slice(&d.port().to_le_bytes());
            }
            SockTuple::Unix { src, dst: d, path } => {
                let path = unix_path_bytes(path);
                dst[1..9].copy_from_slice(&src.to_le_bytes());
                dst[9..17].copy_from_slice(&d.to_le_bytes());
                dst[17..17 + path.len()].copy_from_slice(path);
                dst[17 + path.len()] = 0;
            }
        }
        self.encoded_len()
    }

    /// Parse the wire form. `None` for the empty marker or malformed input.
    pub fn decode(src: &[u8]) -> Option<Self> {
        let (&family, rest) = src.split_first()?;
        match family {
            PPM_AF_INET if src.len() == INET_TUPLE_LEN => {
                let ip = |at: usize| Ipv4Addr::new(rest[at], rest[at + 1], rest[at + 2], rest[at + 3]);
                let port = |at: usize| u16::from_le_bytes([rest[at], rest[at + 1]]);
                Some(SockTuple::Inet {
                    src: SocketAddrV4::new(ip(0), port(4)),
                    dst: SocketAddrV4::new(ip(6), port(10)),
                })
            }
            PPM_AF_INET6 if src.len() == INET6_TUPLE_LEN => {
                let ip = |at: usize| {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&rest[at..at + 16]);
                    Ipv6Addr::from(octets)
                };
                let port = |at: usize| u16::from_le_bytes([rest[at], rest[at + 1]]);
                Some(SockTuple::Inet6 {
                    src: SocketAddrV6::new(ip(0), port(16), 0, 0),
                    dst: SocketAddrV6::new(ip(18), port(34), 0, 0),
                })
            }
            PPM_AF_UNIX if src.len() > UNIX_TUPLE_HDR_LEN => {
                let mut word = [0u8; 8];
                word.copy_from_slice(&rest[0..8]);
                let s = u64::from_le_bytes(word);
                word.copy_from_slice(&rest[8..16]);
                let d = u64::from_le_bytes(word);
                let raw = &rest[16..];
                let end = raw.iter().position(|b| *b == 0)?;
                Some(SockTuple::Unix {
                    src: s,
                    dst: d,
                    path: unix_path(&raw[..end]),
                })
            }
            _ => None,
        }
    }

    /// Path of a Unix tuple as a lossy string
    pub fn unix_path(&self) -> Option<String> {
        match self {
            SockTuple::Unix { path, .. } => {
                Some(String::from_utf8_lossy(unix_path_bytes(path)).into_owned())
            }
            _ => None,
        }
    }
}

enum Endpoints {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

/// A socket address read from traced-task memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserAddr {
    Inet(SocketAddr),
    Unix(UnixPath),
}

/// Read a `struct sockaddr` from user memory.
///
/// Only the families the resolver encodes are accepted; anything else,
/// or an unreadable address, yields `None`.
pub fn read_sockaddr(mem: &dyn UserMemory, addr: u64) -> Option<UserAddr> {
    if addr == 0 {
        return None;
    }
    let mut family = [0u8; 2];
    mem.read(addr, &mut family).ok()?;
    match u16::from_le_bytes(family) {
        AF_INET => {
            // sockaddr_in: family, port (be), addr
            let mut raw = [0u8; 6];
            mem.read(addr.wrapping_add(2), &mut raw).ok()?;
            let port = u16::from_be_bytes([raw[0], raw[1]]);
            let ip = Ipv4Addr::new(raw[2], raw[3], raw[4], raw[5]);
            Some(UserAddr::Inet(SocketAddr::V4(SocketAddrV4::new(ip, port))))
        }
        AF_INET6 => {
            // sockaddr_in6: family, port (be), flowinfo, addr, scope id
            let mut raw = [0u8; 22];
            mem.read(addr.wrapping_add(2), &mut raw).ok()?;
            let port = u16::from_be_bytes([raw[0], raw[1]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[6..22]);
            Some(UserAddr::Inet(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                0,
                0,
            ))))
        }
        AF_UNIX => {
            let mut path = [0u8; UNIX_PATH_MAX];
            mem.read(addr.wrapping_add(2), &mut path).ok()?;
            path[UNIX_PATH_MAX - 1] = 0;
            Some(UserAddr::Unix(path))
        }
        family => {
            trace!(family, "unsupported sockaddr family");
            None
        }
    }
}

fn has_port(addr: &SocketAddr) -> bool {
    addr.port() != 0
}

/// Resolve the endpoint tuple of `fd`.
///
/// For outbound data the address passed to the syscall, when present,
/// names the destination; otherwise the connected peer is used. For
/// inbound data the connected peer is used, falling back to the address
/// the kernel filled in for an unconnected socket.
pub fn resolve_tuple(
    sockets: &dyn SocketTable,
    mem: &dyn UserMemory,
    fd: i64,
    direction: Direction,
    raw_addr: Option<u64>,
) -> Option<SockTuple> {
    if fd < 0 {
        return None;
    }
    let Some(state) = sockets.lookup(fd) else {
        trace!(fd, "no socket behind fd");
        return None;
    };
    let user = raw_addr.and_then(|addr| read_sockaddr(mem, addr));

    match state {
        SocketState::Inet { local, remote, .. } => {
            let user = match user {
                Some(UserAddr::Inet(addr)) if has_port(&addr) => Some(addr),
                _ => None,
            };
            let remote = remote.filter(has_port);
            let remote = match direction {
                Direction::Outbound => user.or(remote),
                Direction::Inbound => remote.or(user),
            }?;
            SockTuple::from_endpoints(direction, local, remote)
        }
        SocketState::Unix { sk, peer, path } => {
            let path = match user {
                Some(UserAddr::Unix(p)) if p[0] != 0 => p,
                _ => path,
            };
            let (src, dst) = match direction {
                Direction::Outbound => (sk, peer),
                Direction::Inbound => (peer, sk),
            };
            Some(SockTuple::Unix { src, dst, path })
        }
        SocketState::Unsupported { family } => {
            trace!(fd, family, "unsupported socket family");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimMemory, SimSockets};

    fn v4(a: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(a), port))
    }

    fn sockaddr_in(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut raw = vec![0u8; 16];
        raw[0..2].copy_from_slice(&AF_INET.to_le_bytes());
        raw[2..4].copy_from_slice(&port.to_be_bytes());
        raw[4..8].copy_from_slice(&ip);
        raw
    }

    #[test]
    fn test_inet_encoding_layout() {
        let tuple = SockTuple::Inet {
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 0x1234),
            dst: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 443),
        };
        let mut buf = [0u8; 64];
        let n = tuple.encode(&mut buf);
        assert_eq!(n, 13);
        assert_eq!(buf[0], PPM_AF_INET);
        assert_eq!(&buf[1..5], &[10, 0, 0, 1]);
        assert_eq!(&buf[5..7], &[0x34, 0x12]);
        assert_eq!(&buf[7..11], &[10, 0, 0, 2]);
        assert_eq!(&buf[11..13], &443u16.to_le_bytes());
        assert_eq!(SockTuple::decode(&buf[..n]), Some(tuple));
    }

    #[test]
    fn test_unix_encoding_is_nul_terminated() {
        let tuple = SockTuple::Unix {
            src: 0xdead,
            dst: 0xbeef,
            path: unix_path(b"/run/app.sock"),
        };
        let mut buf = [0u8; 200];
        let n = tuple.encode(&mut buf);
        assert_eq!(n, 17 + 13 + 1);
        assert_eq!(buf[n - 1], 0);
        let decoded = SockTuple::decode(&buf[..n]).unwrap();
        assert_eq!(decoded.unix_path().as_deref(), Some("/run/app.sock"));
    }

    #[test]
    fn test_decode_rejects_empty_and_garbage() {
        assert_eq!(SockTuple::decode(&[]), None);
        assert_eq!(SockTuple::decode(&[PPM_AF_INET, 1, 2]), None);
        assert_eq!(SockTuple::decode(&[99; 13]), None);
    }

    #[test]
    fn test_inbound_puts_remote_first() {
        let sockets = SimSockets::new();
        sockets.insert(
            3,
            SocketState::Inet {
                protocol: Protocol::Tcp,
                local: v4([10, 0, 0, 1], 8080),
                remote: Some(v4([10, 0, 0, 9], 51000)),
            },
        );
        let mem = SimMemory::new();

        let tuple = resolve_tuple(&sockets, &mem, 3, Direction::Inbound, None).unwrap();
        assert_eq!(
            tuple,
            SockTuple::Inet {
                src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 51000),
                dst: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 8080),
            }
        );

        let tuple = resolve_tuple(&sockets, &mem, 3, Direction::Outbound, None).unwrap();
        assert!(matches!(tuple, SockTuple::Inet { src, .. } if src.port() == 8080));
    }

    #[test]
    fn test_outbound_prefers_user_address() {
        let sockets = SimSockets::new();
        sockets.insert(
            4,
            SocketState::Inet {
                protocol: Protocol::Udp,
                local: v4([192, 168, 1, 2], 40000),
                remote: None,
            },
        );
        let mem = SimMemory::new();
        mem.map(0x1000, sockaddr_in([8, 8, 8, 8], 53));

        let tuple = resolve_tuple(&sockets, &mem, 4, Direction::Outbound, Some(0x1000)).unwrap();
        assert_eq!(
            tuple,
            SockTuple::Inet {
                src: SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 40000),
                dst: SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
            }
        );
    }

    #[test]
    fn test_unconnected_inbound_falls_back_to_user_address() {
        let sockets = SimSockets::new();
        sockets.insert(
            5,
            SocketState::Inet {
                protocol: Protocol::Udp,
                local: v4([0, 0, 0, 0], 8125),
                remote: None,
            },
        );
        let mem = SimMemory::new();
        mem.map(0x2000, sockaddr_in([127, 0, 0, 1], 39000));

        assert!(resolve_tuple(&sockets, &mem, 5, Direction::Inbound, None).is_none());
        let tuple = resolve_tuple(&sockets, &mem, 5, Direction::Inbound, Some(0x2000)).unwrap();
        assert!(matches!(tuple, SockTuple::Inet { src, .. } if src.port() == 39000));
    }

    #[test]
    fn test_failures_yield_none() {
        let sockets = SimSockets::new();
        sockets.insert(6, SocketState::Unsupported { family: 16 });
        let mem = SimMemory::new();

        assert!(resolve_tuple(&sockets, &mem, -1, Direction::Inbound, None).is_none());
        assert!(resolve_tuple(&sockets, &mem, 99, Direction::Inbound, None).is_none());
        assert!(resolve_tuple(&sockets, &mem, 6, Direction::Inbound, None).is_none());
    }

    #[test]
    fn test_dual_stack_maps_ipv4_peer() {
        let sockets = SimSockets::new();
        sockets.insert(
            7,
            SocketState::Inet {
                protocol: Protocol::Tcp,
                local: SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 443, 0, 0)),
                remote: Some(v4([1, 2, 3, 4], 60000)),
            },
        );
        let mem = SimMemory::new();
        let tuple = resolve_tuple(&sockets, &mem, 7, Direction::Inbound, None).unwrap();
        assert_eq!(tuple.family(), PPM_AF_INET6);
        assert_eq!(tuple.encoded_len(), 37);
    }

    #[test]
    fn test_unix_directions() {
        let sockets = SimSockets::new();
        sockets.insert(
            8,
            SocketState::Unix {
                sk: 1,
                peer: 2,
                path: unix_path(b"/tmp/s"),
            },
        );
        let mem = SimMemory::new();
        let out = resolve_tuple(&sockets, &mem, 8, Direction::Outbound, None).unwrap();
        let inb = resolve_tuple(&sockets, &mem, 8, Direction::Inbound, None).unwrap();
        assert!(matches!(out, SockTuple::Unix { src: 1, dst: 2, .. }));
        assert!(matches!(inb, SockTuple::Unix { src: 2, dst: 1, .. }));
    }

    #[test]
    fn test_sockaddr_at_top_of_address_space() {
        let mem = SimMemory::new();
        let top = u64::MAX - 1;
        mem.map(top, AF_INET.to_le_bytes());
        assert_eq!(read_sockaddr(&mem, top), None);
    }
}
