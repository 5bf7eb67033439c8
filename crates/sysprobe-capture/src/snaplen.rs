//! Snapshot-length policy
//!
//! Decides, before any copy happens, how many payload bytes a data
//! parameter may carry. Order of evaluation:
//!
//! 1. the global cap;
//! 2. when dynamic snaplen is on, the well-known protocol heuristics;
//! 3. explicit protocol/port overrides, first match wins;
//! 4. clamp to the slot limit and to the bytes actually available.

use crate::context::UserMemory;
use crate::event::EventType;
use crate::tuple::{Protocol, SocketState};
use crate::wire::MAX_PARAM_SIZE;
use std::net::SocketAddr;
use sysprobe_core::{CaptureSettings, PortRange};
use tracing::trace;

/// Cap used for ports in the full-capture range
pub const SNAPLEN_FULLCAPTURE_PORT: usize = 16000;

/// Cap used for recognised protocols
pub const SNAPLEN_EXTENDED: usize = 2000;

const DB_PORTS: [u16; 3] = [3306, 5432, 27017];

const HTTP_PREFIXES: [&[u8; 4]; 8] = [
    b"GET ", b"POST", b"PUT ", b"DELE", b"TRAC", b"CONN", b"OPTI", b"HTTP",
];

/// Where the data of an event is going to or coming from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DestinationHint {
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote_port: u16,
    /// First bytes of the payload, when they could be read
    pub payload_prefix: Option<[u8; 4]>,
}

impl DestinationHint {
    pub fn new(protocol: Protocol, local_port: u16, remote_port: u16) -> Self {
        Self {
            protocol,
            local_port,
            remote_port,
            payload_prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: [u8; 4]) -> Self {
        self.payload_prefix = Some(prefix);
        self
    }

    /// Hint from the kernel socket state; only inet sockets carry ports
    pub fn from_socket(state: &SocketState) -> Option<Self> {
        match state {
            SocketState::Inet {
                protocol,
                local,
                remote,
            } => Some(Self::new(
                *protocol,
                local.port(),
                remote.as_ref().map(SocketAddr::port).unwrap_or(0),
            )),
            _ => None,
        }
    }

    /// Attach the first four payload bytes, if readable
    pub fn sniff(mut self, mem: &dyn UserMemory, data: u64) -> Self {
        let mut prefix = [0u8; 4];
        if data != 0 && mem.read(data, &mut prefix).is_ok() {
            self.payload_prefix = Some(prefix);
        }
        self
    }

    fn matches_port(&self, range: &PortRange) -> bool {
        range.contains(self.local_port) || range.contains(self.remote_port)
    }
}

/// Per-call inputs of the policy
#[derive(Clone, Copy, Debug)]
pub struct SnaplenArgs {
    pub event_type: EventType,
    /// Stop after the full-capture port range check
    pub only_port_range: bool,
}

impl SnaplenArgs {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            only_port_range: false,
        }
    }
}

/// One explicit override
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortRule {
    /// `None` matches every protocol
    pub protocol: Option<Protocol>,
    pub ports: PortRange,
    pub snaplen: usize,
}

impl PortRule {
    fn matches(&self, hint: &DestinationHint) -> bool {
        self.protocol.is_none_or(|p| p == hint.protocol) && hint.matches_port(&self.ports)
    }
}

#[derive(Clone, Debug)]
pub struct SnaplenPolicy {
    default: usize,
    dynamic: bool,
    fullcapture_ports: Option<PortRange>,
    statsd_port: Option<u16>,
    overrides: Vec<PortRule>,
}

impl SnaplenPolicy {
    pub fn new(default: usize) -> Self {
        Self {
            default,
            dynamic: false,
            fullcapture_ports: None,
            statsd_port: None,
            overrides: Vec::new(),
        }
    }

    /// Build from validated capture settings
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        let overrides = settings
            .snaplen_overrides
            .iter()
            .map(|o| PortRule {
                protocol: o.protocol.as_deref().and_then(Protocol::parse),
                ports: o.ports,
                snaplen: o.snaplen as usize,
            })
            .collect();
        Self {
            default: settings.snaplen as usize,
            dynamic: settings.dynamic_snaplen,
            fullcapture_ports: settings.fullcapture_ports.filter(|r| !r.is_disabled()),
            statsd_port: settings.statsd_port,
            overrides,
        }
    }

    pub fn with_override(mut self, protocol: Option<Protocol>, ports: PortRange, snaplen: usize) -> Self {
        self.overrides.push(PortRule {
            protocol,
            ports,
            snaplen,
        });
        self
    }

    pub fn with_dynamic(mut self, fullcapture_ports: Option<PortRange>, statsd_port: Option<u16>) -> Self {
        self.dynamic = true;
        self.fullcapture_ports = fullcapture_ports;
        self.statsd_port = statsd_port;
        self
    }

    pub fn default_snaplen(&self) -> usize {
        self.default
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn overrides(&self) -> &[PortRule] {
        &self.overrides
    }

    /// Cap before the availability clamp
    pub fn configured(&self, args: SnaplenArgs, hint: Option<&DestinationHint>) -> usize {
        let mut cap = self.default;
        let Some(hint) = hint else {
            return cap.min(MAX_PARAM_SIZE);
        };

        if self.dynamic {
            if let Some(cap_dyn) = self.heuristic(args, hint) {
                cap = cap.max(cap_dyn);
            }
        }

        if let Some(rule) = self.overrides.iter().find(|r| r.matches(hint)) {
            trace!(
                event = args.event_type.name(),
                snaplen = rule.snaplen,
                "snaplen override"
            );
            cap = rule.snaplen;
        }

        cap.min(MAX_PARAM_SIZE)
    }

    fn heuristic(&self, args: SnaplenArgs, hint: &DestinationHint) -> Option<usize> {
        if self
            .fullcapture_ports
            .is_some_and(|range| hint.matches_port(&range))
        {
            return Some(SNAPLEN_FULLCAPTURE_PORT);
        }
        if args.only_port_range {
            return None;
        }
        if hint.protocol == Protocol::Udp && self.statsd_port == Some(hint.remote_port) {
            return Some(SNAPLEN_EXTENDED);
        }
        if DB_PORTS
            .iter()
            .any(|p| *p == hint.local_port || *p == hint.remote_port)
        {
            return Some(SNAPLEN_EXTENDED);
        }
        if hint
            .payload_prefix
            .is_some_and(|prefix| HTTP_PREFIXES.iter().any(|m| **m == prefix))
        {
            return Some(SNAPLEN_EXTENDED);
        }
        None
    }

    /// Effective cap: never above the configured cap nor `available`
    pub fn effective(&self, args: SnaplenArgs, hint: Option<&DestinationHint>, available: usize) -> usize {
        self.configured(args, hint).min(available)
    }
}

impl Default for SnaplenPolicy {
    fn default() -> Self {
        Self::from_settings(&CaptureSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SnaplenArgs {
        SnaplenArgs::new(EventType::RecvfromX)
    }

    fn https_policy() -> SnaplenPolicy {
        SnaplenPolicy::new(80).with_override(None, PortRange::single(443), 200)
    }

    #[test]
    fn test_global_and_override() {
        let policy = https_policy();
        let other = DestinationHint::new(Protocol::Tcp, 51000, 8080);
        let https = DestinationHint::new(Protocol::Tcp, 51000, 443);

        assert_eq!(policy.effective(args(), Some(&other), 300), 80);
        assert_eq!(policy.effective(args(), Some(&https), 300), 200);
        assert_eq!(policy.effective(args(), Some(&https), 50), 50);
        assert_eq!(policy.effective(args(), None, 300), 80);
    }

    #[test]
    fn test_override_protocol_filter() {
        let policy =
            SnaplenPolicy::new(80).with_override(Some(Protocol::Udp), PortRange::new(5000, 5010), 512);
        let udp = DestinationHint::new(Protocol::Udp, 40000, 5005);
        let tcp = DestinationHint::new(Protocol::Tcp, 40000, 5005);
        assert_eq!(policy.configured(args(), Some(&udp)), 512);
        assert_eq!(policy.configured(args(), Some(&tcp)), 80);
    }

    #[test]
    fn test_first_override_wins() {
        let policy = SnaplenPolicy::new(80)
            .with_override(None, PortRange::single(443), 200)
            .with_override(None, PortRange::new(1, 1024), 1000);
        let https = DestinationHint::new(Protocol::Tcp, 50000, 443);
        assert_eq!(policy.configured(args(), Some(&https)), 200);
    }

    #[test]
    fn test_dynamic_heuristics() {
        let policy = SnaplenPolicy::new(80).with_dynamic(Some(PortRange::new(9000, 9010)), Some(8125));

        let full = DestinationHint::new(Protocol::Tcp, 9005, 40000);
        assert_eq!(policy.configured(args(), Some(&full)), SNAPLEN_FULLCAPTURE_PORT);

        let statsd = DestinationHint::new(Protocol::Udp, 40000, 8125);
        assert_eq!(policy.configured(args(), Some(&statsd)), SNAPLEN_EXTENDED);
        let statsd_tcp = DestinationHint::new(Protocol::Tcp, 40000, 8125);
        assert_eq!(policy.configured(args(), Some(&statsd_tcp)), 80);

        let pg = DestinationHint::new(Protocol::Tcp, 40000, 5432);
        assert_eq!(policy.configured(args(), Some(&pg)), SNAPLEN_EXTENDED);

        let http = DestinationHint::new(Protocol::Tcp, 40000, 8080).with_prefix(*b"GET ");
        assert_eq!(policy.configured(args(), Some(&http)), SNAPLEN_EXTENDED);
        let binary = DestinationHint::new(Protocol::Tcp, 40000, 8080).with_prefix([0, 1, 2, 3]);
        assert_eq!(policy.configured(args(), Some(&binary)), 80);
    }

    #[test]
    fn test_only_port_range_skips_protocol_heuristics() {
        let policy = SnaplenPolicy::new(80).with_dynamic(None, Some(8125));
        let pg = DestinationHint::new(Protocol::Tcp, 40000, 5432);
        let args = SnaplenArgs {
            only_port_range: true,
            ..args()
        };
        assert_eq!(policy.configured(args, Some(&pg)), 80);
    }

    #[test]
    fn test_heuristics_off_by_default() {
        let policy = SnaplenPolicy::default();
        let pg = DestinationHint::new(Protocol::Tcp, 40000, 5432);
        assert!(!policy.is_dynamic());
        assert_eq!(policy.configured(args(), Some(&pg)), 80);
    }

    #[test]
    fn test_override_replaces_heuristic() {
        let policy = SnaplenPolicy::new(80)
            .with_dynamic(None, None)
            .with_override(Some(Protocol::Tcp), PortRange::single(5432), 64);
        let pg = DestinationHint::new(Protocol::Tcp, 40000, 5432);
        assert_eq!(policy.configured(args(), Some(&pg)), 64);
    }

    #[test]
    fn test_clamped_to_slot_limit() {
        let policy = SnaplenPolicy::new(80).with_override(None, PortRange::single(1), 1 << 20);
        let hint = DestinationHint::new(Protocol::Tcp, 1, 2);
        assert_eq!(policy.effective(args(), Some(&hint), usize::MAX), MAX_PARAM_SIZE);
    }
}
