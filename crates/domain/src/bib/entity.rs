use serde::{Deserialize, Serialize};

use super::error::BibError;
use crate::common::entity::{
    Pool6Prefix, Protocol, TransportAddr4, TransportAddr6,
};

/// TCP session states, RFC 6146 section 3.5.2.
///
/// `Established` is the zero value so UDP and ICMP sessions, which are
/// always logically established, can leave the field alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcpState {
    #[default]
    Established,
    /// A SYN arrived from the IPv6 side; awaiting the v4 answer.
    V6Init,
    /// A SYN arrived from the IPv4 side; awaiting the v6 answer.
    V4Init,
    /// The IPv4 node sent FIN. Data can still flow; awaiting an IPv6 FIN.
    V4FinRcv,
    /// The IPv6 node sent FIN. Data can still flow; awaiting an IPv4 FIN.
    V6FinRcv,
    /// Both sides issued FIN. Packets can still flow for a short time.
    V4FinV6FinRcv,
    /// The session might die in a short while.
    Trans,
}

impl TcpState {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Established => 0,
            Self::V6Init => 1,
            Self::V4Init => 2,
            Self::V4FinRcv => 3,
            Self::V6FinRcv => 4,
            Self::V4FinV6FinRcv => 5,
            Self::Trans => 6,
        }
    }

    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Established),
            1 => Some(Self::V6Init),
            2 => Some(Self::V4Init),
            3 => Some(Self::V4FinRcv),
            4 => Some(Self::V6FinRcv),
            5 => Some(Self::V4FinV6FinRcv),
            6 => Some(Self::Trans),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Established => "ESTABLISHED",
            Self::V6Init => "V6 INIT",
            Self::V4Init => "V4 INIT",
            Self::V4FinRcv => "V4 FIN RCV",
            Self::V6FinRcv => "V6 FIN RCV",
            Self::V4FinV6FinRcv => "V4 FIN + V6 FIN RCV",
            Self::Trans => "TRANS",
        }
    }
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of a table's three expiration lists a session lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionTimer {
    /// Established sessions; long lifetimes.
    Est,
    /// Transitory sessions (TCP only).
    Trans,
    /// `V4 INIT` sessions awaiting the IPv6 answer to an external SYN.
    Syn4,
}

impl SessionTimer {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Est => 0,
            Self::Trans => 1,
            Self::Syn4 => 2,
        }
    }

    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Est),
            1 => Some(Self::Trans),
            2 => Some(Self::Syn4),
            _ => None,
        }
    }
}

/// TCP header flags the state machine cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

impl SegmentFlags {
    pub const SYN: Self = Self { syn: true, fin: false, rst: false };
    pub const FIN: Self = Self { syn: false, fin: true, rst: false };
    pub const RST: Self = Self { syn: false, fin: false, rst: true };
    /// A plain data or ACK segment.
    pub const NONE: Self = Self { syn: false, fin: false, rst: false };
}

/// Which side of the translator a packet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromV6,
    FromV4,
}

/// An owned raw packet buffer.
///
/// Deliberately not `Clone`: when an operation stores the packet (for
/// simultaneous-open resolution), ownership moves into the database and the
/// caller no longer holds a handle it could accidentally forward or free.
#[derive(Debug)]
pub struct Packet {
    data: Vec<u8>,
    flags: SegmentFlags,
}

impl Packet {
    pub fn new(data: Vec<u8>, flags: SegmentFlags) -> Self {
        Self { data, flags }
    }

    pub fn flags(&self) -> SegmentFlags {
        self.flags
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Snapshot of a BIB entry: one inside IPv6 transport address mapped to one
/// outside IPv4 transport address, for one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BibEntry {
    pub src6: TransportAddr6,
    pub src4: TransportAddr4,
    pub proto: Protocol,
    pub is_static: bool,
}

impl std::fmt::Display for BibEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to {} ({})", self.src6, self.src4, self.proto)
    }
}

/// Snapshot of one session: the full quintuple plus lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub src6: TransportAddr6,
    pub dst6: TransportAddr6,
    pub src4: TransportAddr4,
    pub dst4: TransportAddr4,
    pub proto: Protocol,
    pub state: TcpState,
    pub timer: SessionTimer,
    /// Monotonic milliseconds at last activity.
    pub update_time: u64,
    /// Effective timeout of the timer list the session is on, in ms.
    pub timeout: u64,
    pub has_stored: bool,
}

impl std::fmt::Display for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.src6, self.dst6, self.src4, self.dst4, self.proto
        )
    }
}

/// What a data-plane lookup hands back to the translator: always the BIB
/// half, and the session half whenever one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BibSession {
    pub bib: BibEntry,
    pub session: Option<SessionEntry>,
}

/// Runtime knobs of the session database. Defaults follow RFC 6146
/// section 4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BibSettings {
    /// Pool6 prefix; translated addresses are validated against it.
    #[serde(default = "Pool6Prefix::well_known")]
    pub pool6: Pool6Prefix,
    /// Established TCP idle timeout, seconds.
    #[serde(default = "default_tcp_est")]
    pub tcp_est_timeout_secs: u64,
    /// Transitory TCP timeout, seconds.
    #[serde(default = "default_tcp_trans")]
    pub tcp_trans_timeout_secs: u64,
    /// UDP session timeout, seconds. The RFC floor is 120.
    #[serde(default = "default_udp")]
    pub udp_timeout_secs: u64,
    /// ICMP query timeout, seconds.
    #[serde(default = "default_icmp")]
    pub icmp_timeout_secs: u64,
    /// Address-dependent filtering: accept inbound flows only from peers the
    /// inside endpoint has already contacted.
    #[serde(default)]
    pub drop_by_addr: bool,
    /// Refuse externally-initiated TCP entirely.
    #[serde(default)]
    pub drop_external_tcp: bool,
    /// Treat RST like FIN while half of the connection is already closed.
    #[serde(default)]
    pub handle_fin_rcv_rst: bool,
    /// Combined cap on stored packets (queue entries plus per-session
    /// attachments).
    #[serde(default = "default_max_stored_pkts")]
    pub max_stored_pkts: usize,
    /// Log every BIB mapping created or forgotten.
    #[serde(default)]
    pub bib_logging: bool,
    /// Log every session created or forgotten.
    #[serde(default)]
    pub session_logging: bool,
}

fn default_max_stored_pkts() -> usize {
    DEFAULT_MAX_STORED_PKTS
}

fn default_tcp_est() -> u64 {
    TCP_EST_TIMEOUT_SECS
}

fn default_tcp_trans() -> u64 {
    TCP_TRANS_TIMEOUT_SECS
}

fn default_udp() -> u64 {
    UDP_TIMEOUT_SECS
}

fn default_icmp() -> u64 {
    ICMP_TIMEOUT_SECS
}

/// RFC 6146 session lifetimes, seconds.
pub const TCP_EST_TIMEOUT_SECS: u64 = 2 * 60 * 60;
pub const TCP_TRANS_TIMEOUT_SECS: u64 = 4 * 60;
/// Lifetime of sessions (and stored packets) created by an unanswered
/// external SYN. Not configurable, on purpose.
pub const TCP_INCOMING_SYN_SECS: u64 = 6;
pub const UDP_TIMEOUT_SECS: u64 = 5 * 60;
pub const UDP_MIN_TIMEOUT_SECS: u64 = 2 * 60;
pub const ICMP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_STORED_PKTS: usize = 10;

impl Default for BibSettings {
    fn default() -> Self {
        Self {
            pool6: Pool6Prefix::well_known(),
            tcp_est_timeout_secs: TCP_EST_TIMEOUT_SECS,
            tcp_trans_timeout_secs: TCP_TRANS_TIMEOUT_SECS,
            udp_timeout_secs: UDP_TIMEOUT_SECS,
            icmp_timeout_secs: ICMP_TIMEOUT_SECS,
            drop_by_addr: false,
            drop_external_tcp: false,
            handle_fin_rcv_rst: false,
            max_stored_pkts: DEFAULT_MAX_STORED_PKTS,
            bib_logging: false,
            session_logging: false,
        }
    }
}

impl BibSettings {
    pub fn validate(&self) -> Result<(), BibError> {
        if self.udp_timeout_secs < UDP_MIN_TIMEOUT_SECS {
            return Err(BibError::InvalidSettings {
                field: "udp_timeout_secs",
                reason: "below the RFC 6146 floor of 120 seconds",
            });
        }
        if self.tcp_est_timeout_secs == 0
            || self.tcp_trans_timeout_secs == 0
            || self.icmp_timeout_secs == 0
        {
            return Err(BibError::InvalidSettings {
                field: "timeouts",
                reason: "session lifetimes must be nonzero",
            });
        }
        if self.max_stored_pkts == 0 {
            return Err(BibError::InvalidSettings {
                field: "max_stored_pkts",
                reason: "must allow at least one stored packet",
            });
        }
        Ok(())
    }

    /// Timeout (ms) of the given timer list in this protocol's table.
    pub fn timeout_ms(&self, proto: Protocol, timer: SessionTimer) -> u64 {
        let secs = match (proto, timer) {
            (Protocol::Tcp, SessionTimer::Est) => self.tcp_est_timeout_secs,
            (Protocol::Tcp, SessionTimer::Trans) => self.tcp_trans_timeout_secs,
            (_, SessionTimer::Syn4) => TCP_INCOMING_SYN_SECS,
            (Protocol::Udp, _) => self.udp_timeout_secs,
            (Protocol::Icmp, _) => self.icmp_timeout_secs,
        };
        secs.saturating_mul(1000)
    }
}
