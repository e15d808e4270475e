use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    /// Convert to the IP protocol number (ICMP reported as its IPv4 value).
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
        }
    }

    /// Create from a raw protocol number. `58` (ICMPv6) also maps to ICMP,
    /// since the two are the same conversation on either side of the
    /// translator.
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            1 | 58 => Some(Self::Icmp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An IPv6 transport address: L3 address plus L4 identifier (port, or the
/// ICMP query identifier).
///
/// `Ord` is lexicographic on `(addr, port)`, which is the key order of every
/// v6-indexed tree in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransportAddr6 {
    pub addr: Ipv6Addr,
    pub port: u16,
}

impl TransportAddr6 {
    pub fn new(addr: Ipv6Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl std::fmt::Display for TransportAddr6 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.addr, self.port)
    }
}

/// An IPv4 transport address. Same ordering contract as [`TransportAddr6`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransportAddr4 {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl TransportAddr4 {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl std::fmt::Display for TransportAddr4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.addr, self.port)
    }
}

/// The IPv6 prefix used to embed IPv4 addresses (RFC 6052). Only /96 is
/// supported here; other embedding lengths are a concern of the prefix
/// store, which computes the translated addresses before they reach the
/// session engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool6Prefix {
    addr: Ipv6Addr,
    len: u8,
}

impl Pool6Prefix {
    /// The well-known prefix, `64:ff9b::/96` (RFC 6052 section 2.1).
    pub const fn well_known() -> Self {
        Self {
            addr: Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0),
            len: 96,
        }
    }

    pub fn new(addr: Ipv6Addr, len: u8) -> Result<Self, &'static str> {
        if len != 96 {
            return Err("only /96 prefixes are supported");
        }
        let octets = addr.octets();
        if octets[12..] != [0, 0, 0, 0] {
            return Err("prefix has nonzero bits past its length");
        }
        Ok(Self { addr, len })
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        addr.octets()[..12] == self.addr.octets()[..12]
    }

    /// Strip the prefix from `addr`, recovering the embedded IPv4 address.
    pub fn extract(&self, addr: &Ipv6Addr) -> Option<Ipv4Addr> {
        if !self.contains(addr) {
            return None;
        }
        let o = addr.octets();
        Some(Ipv4Addr::new(o[12], o[13], o[14], o[15]))
    }

    /// Embed an IPv4 address under the prefix.
    pub fn embed(&self, addr: &Ipv4Addr) -> Ipv6Addr {
        let mut o = self.addr.octets();
        o[12..].copy_from_slice(&addr.octets());
        Ipv6Addr::from(o)
    }
}

impl std::fmt::Display for Pool6Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for Pool6Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| format!("'{s}': expected addr/len"))?;
        let addr: Ipv6Addr = addr
            .parse()
            .map_err(|e| format!("'{s}': invalid IPv6 address: {e}"))?;
        let len: u8 = len
            .parse()
            .map_err(|_| format!("'{s}': invalid prefix length"))?;
        Self::new(addr, len).map_err(|e| format!("'{s}': {e}"))
    }
}

impl Serialize for Pool6Prefix {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Pool6Prefix {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An IPv4 prefix, used to select ranges of outside addresses for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Prefix {
    pub addr: Ipv4Addr,
    pub len: u8,
}

impl Ipv4Prefix {
    pub fn new(addr: Ipv4Addr, len: u8) -> Result<Self, &'static str> {
        if len > 32 {
            return Err("prefix length must be 0-32");
        }
        Ok(Self { addr, len })
    }

    pub fn contains(&self, addr: &Ipv4Addr) -> bool {
        if self.len == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - u32::from(self.len));
        (u32::from(self.addr) & mask) == (u32::from(*addr) & mask)
    }

    /// First address covered by the prefix.
    pub fn first_addr(&self) -> Ipv4Addr {
        if self.len == 0 {
            return Ipv4Addr::UNSPECIFIED;
        }
        let mask = u32::MAX << (32 - u32::from(self.len));
        Ipv4Addr::from(u32::from(self.addr) & mask)
    }
}

impl std::fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Inclusive L4 port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }

    pub fn count(&self) -> u32 {
        u32::from(self.max.saturating_sub(self.min)) + 1
    }
}

/// A 6-to-4 flow as seen on the IPv6 side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple6 {
    pub src: TransportAddr6,
    pub dst: TransportAddr6,
    pub proto: Protocol,
}

/// A 4-to-6 flow as seen on the IPv4 side. `dst` is the outside transport
/// address owned by the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple4 {
    pub src: TransportAddr4,
    pub dst: TransportAddr4,
    pub proto: Protocol,
}
