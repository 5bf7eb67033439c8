//! Event types and their parameter schemas
//!
//! The tag values and parameter lists are part of the wire contract: the
//! consumer looks up the schema by tag and expects exactly the parameters
//! listed here, in this order.

use crate::wire::{HEADER_LEN, PARAM_LEN};

/// Parameter kind as seen by the consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    /// File descriptor, i64
    Fd,
    /// Syscall return value, i64 (negative errno on failure)
    Errno,
    /// u32
    Uint32,
    /// Raw bytes, possibly truncated
    ByteBuf,
    /// Socket tuple
    SockTuple,
}

impl ParamKind {
    /// Payload width when the kind is fixed-size
    pub const fn fixed_width(self) -> Option<usize> {
        match self {
            ParamKind::Fd | ParamKind::Errno => Some(8),
            ParamKind::Uint32 => Some(4),
            ParamKind::ByteBuf | ParamKind::SockTuple => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ParamKind::Fd => "PT_FD",
            ParamKind::Errno => "PT_ERRNO",
            ParamKind::Uint32 => "PT_UINT32",
            ParamKind::ByteBuf => "PT_BYTEBUF",
            ParamKind::SockTuple => "PT_SOCKTUPLE",
        }
    }
}

/// One entry of an event schema
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamInfo {
    pub name: &'static str,
    pub kind: ParamKind,
}

const fn param(name: &'static str, kind: ParamKind) -> ParamInfo {
    ParamInfo { name, kind }
}

/// Name and parameter list registered for an event type
#[derive(Clone, Copy, Debug)]
pub struct EventSchema {
    pub name: &'static str,
    pub params: &'static [ParamInfo],
}

impl EventSchema {
    pub const fn nparams(&self) -> usize {
        self.params.len()
    }

    /// Total record size when every parameter has a static width
    pub const fn fixed_size(&self) -> Option<usize> {
        let mut size = HEADER_LEN + self.params.len() * PARAM_LEN;
        let mut i = 0;
        while i < self.params.len() {
            match self.params[i].kind.fixed_width() {
                Some(width) => size += width,
                None => return None,
            }
            i += 1;
        }
        Some(size)
    }
}

static SENDTO_E: EventSchema = EventSchema {
    name: "sendto_e",
    params: &[
        param("fd", ParamKind::Fd),
        param("size", ParamKind::Uint32),
        param("tuple", ParamKind::SockTuple),
    ],
};

static SENDTO_X: EventSchema = EventSchema {
    name: "sendto_x",
    params: &[
        param("res", ParamKind::Errno),
        param("data", ParamKind::ByteBuf),
        param("fd", ParamKind::Fd),
        param("size", ParamKind::Uint32),
        param("tuple", ParamKind::SockTuple),
    ],
};

static RECVFROM_E: EventSchema = EventSchema {
    name: "recvfrom_e",
    params: &[param("fd", ParamKind::Fd), param("size", ParamKind::Uint32)],
};

static RECVFROM_X: EventSchema = EventSchema {
    name: "recvfrom_x",
    params: &[
        param("res", ParamKind::Errno),
        param("data", ParamKind::ByteBuf),
        param("tuple", ParamKind::SockTuple),
        param("fd", ParamKind::Fd),
        param("size", ParamKind::Uint32),
    ],
};

/// Event-type tag carried in every record header
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    SendtoE = 30,
    SendtoX = 31,
    RecvfromE = 34,
    RecvfromX = 35,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::SendtoE,
        EventType::SendtoX,
        EventType::RecvfromE,
        EventType::RecvfromX,
    ];

    pub const fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    pub fn schema(self) -> &'static EventSchema {
        match self {
            EventType::SendtoE => &SENDTO_E,
            EventType::SendtoX => &SENDTO_X,
            EventType::RecvfromE => &RECVFROM_E,
            EventType::RecvfromX => &RECVFROM_X,
        }
    }

    pub fn name(self) -> &'static str {
        self.schema().name
    }

    pub fn nparams(self) -> usize {
        self.schema().nparams()
    }
}

/// Size of a `recvfrom` enter record: fd + size
pub const RECVFROM_E_SIZE: usize = HEADER_LEN + 2 * PARAM_LEN + 8 + 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size_matches_constant() {
        assert_eq!(
            EventType::RecvfromE.schema().fixed_size(),
            Some(RECVFROM_E_SIZE)
        );
        assert_eq!(RECVFROM_E_SIZE, 42);
    }

    #[test]
    fn test_variable_schemas_have_no_fixed_size() {
        assert_eq!(EventType::RecvfromX.schema().fixed_size(), None);
        assert_eq!(EventType::SendtoE.schema().fixed_size(), None);
        assert_eq!(EventType::SendtoX.schema().fixed_size(), None);
    }

    #[test]
    fn test_tag_lookup() {
        for ty in EventType::ALL {
            assert_eq!(EventType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(EventType::from_tag(0), None);
        assert_eq!(EventType::RecvfromX.nparams(), 5);
        assert_eq!(EventType::RecvfromX.name(), "recvfrom_x");
    }
}
