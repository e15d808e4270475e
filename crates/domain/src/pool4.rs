//! The view the session engine gets of the outside address pool.
//!
//! The pool itself lives elsewhere; per translated packet the engine only
//! receives a *mask domain*: an iterable set of candidate `(address, port)`
//! pairs the packet is allowed to be masked with, plus enough metadata to
//! notice when a live binding's address has been yanked out from under it.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::common::entity::TransportAddr4;

pub trait MaskDomain {
    /// Yield the next candidate transport address. The flag is true when
    /// the candidate is the immediate successor of the previous one, which
    /// lets the consumer probe the next tree slot instead of descending
    /// again. Never true on the first yield.
    fn next(&mut self) -> Option<(TransportAddr4, bool)>;

    /// Whether `addr` belongs to this domain.
    fn matches(&self, addr: &TransportAddr4) -> bool;

    /// Dynamic domains can shrink at runtime; bindings into them must be
    /// revalidated. Static (EAM-style) domains never evict.
    fn is_dynamic(&self) -> bool;

    /// The pool mark this domain was derived from, for diagnostics.
    fn mark(&self) -> u32;
}

/// One contiguous slice of pool addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskRange {
    pub addr: Ipv4Addr,
    pub min_port: u16,
    pub max_port: u16,
}

impl MaskRange {
    pub fn count(&self) -> u32 {
        u32::from(self.max_port.saturating_sub(self.min_port)) + 1
    }
}

/// A materialized mask domain over a list of address/port ranges.
///
/// Iteration starts at an arbitrary offset and wraps around once, so
/// consecutive packets spread over the pool instead of always contending
/// for the first free port.
#[derive(Debug, Clone)]
pub struct PoolMaskDomain {
    mark: u32,
    dynamic: bool,
    ranges: Vec<MaskRange>,
    total: u32,
    /// Flat index of the next candidate.
    cursor: u32,
    yielded: u32,
    last: Option<TransportAddr4>,
}

impl PoolMaskDomain {
    pub fn new(mark: u32, dynamic: bool, ranges: Vec<(Ipv4Addr, u16, u16)>) -> Self {
        let ranges: Vec<MaskRange> = ranges
            .into_iter()
            .filter(|(_, min, max)| min <= max)
            .map(|(addr, min_port, max_port)| MaskRange { addr, min_port, max_port })
            .collect();
        let total = ranges.iter().map(MaskRange::count).sum();
        Self {
            mark,
            dynamic,
            ranges,
            total,
            cursor: 0,
            yielded: 0,
            last: None,
        }
    }

    /// Start iteration at a flat offset (typically a hash of the flow).
    pub fn with_offset(mut self, offset: u32) -> Self {
        if self.total > 0 {
            self.cursor = offset % self.total;
        }
        self
    }

    fn nth(&self, flat: u32) -> Option<TransportAddr4> {
        let mut rest = flat;
        for range in &self.ranges {
            let count = range.count();
            if rest < count {
                let port = range.min_port.checked_add(rest as u16)?;
                return Some(TransportAddr4::new(range.addr, port));
            }
            rest -= count;
        }
        None
    }
}

impl MaskDomain for PoolMaskDomain {
    fn next(&mut self) -> Option<(TransportAddr4, bool)> {
        if self.yielded >= self.total {
            return None;
        }
        let addr = self.nth(self.cursor)?;
        self.cursor = (self.cursor + 1) % self.total;
        self.yielded += 1;

        let consecutive = matches!(
            self.last,
            Some(prev) if prev.addr == addr.addr && prev.port.checked_add(1) == Some(addr.port)
        );
        self.last = Some(addr);
        Some((addr, consecutive))
    }

    fn matches(&self, addr: &TransportAddr4) -> bool {
        self.ranges.iter().any(|range| {
            range.addr == addr.addr
                && range.min_port <= addr.port
                && addr.port <= range.max_port
        })
    }

    fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    fn mark(&self) -> u32 {
        self.mark
    }
}
