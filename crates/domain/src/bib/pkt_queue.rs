//! Storage for externally-initiated TCP SYNs that have no binding yet
//! ("type 1" packets).
//!
//! When a v4 SYN arrives and nothing matches it, it might be the first half
//! of a Simultaneous Open. The packet is parked here for a few seconds; if
//! the v6 peer's own SYN shows up in time, the 6-to-4 path upgrades the
//! stored descriptor into a real binding and session. If not, the sweep
//! answers the stored packet with an ICMP error.
//!
//! Packets stored inside a provisional session ("type 2") do not live here;
//! they hang off the session itself. Both kinds share the table's packet
//! budget, which is why this queue does not count on its own.

use super::entity::Packet;
use super::error::BibError;
use crate::common::entity::{TransportAddr4, TransportAddr6};
use crate::pool4::MaskDomain;

/// One parked SYN, remembered by the flow it wants to exist.
#[derive(Debug)]
pub(crate) struct StoredSyn {
    /// The outside transport address the SYN was aimed at.
    pub src4: TransportAddr4,
    /// The v4 sender, both views.
    pub dst4: TransportAddr4,
    pub dst6: TransportAddr6,
    pub pkt: Packet,
    pub update_time: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PktQueue {
    /// Keyed by `(src4, dst4)`; two SYNs for the same flow collide.
    nodes: std::collections::BTreeMap<(TransportAddr4, TransportAddr4), StoredSyn>,
}

impl PktQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Park a SYN. `full` is the table's verdict on the shared packet
    /// budget; the queue itself only detects duplicates.
    pub fn add(
        &mut self,
        src4: TransportAddr4,
        dst4: TransportAddr4,
        dst6: TransportAddr6,
        pkt: Packet,
        now_ms: u64,
        full: bool,
    ) -> Result<(), (BibError, Packet)> {
        if self.nodes.contains_key(&(src4, dst4)) {
            return Err((BibError::AlreadyStored, pkt));
        }
        if full {
            return Err((BibError::QueueFull, pkt));
        }
        self.nodes.insert(
            (src4, dst4),
            StoredSyn { src4, dst4, dst6, pkt, update_time: now_ms },
        );
        Ok(())
    }

    /// Find the stored SYN a v6-initiated flow toward `dst6` completes,
    /// provided its target address is one the flow may draw from. Removes
    /// and returns the descriptor.
    pub fn find_upgrade(
        &mut self,
        dst6: &TransportAddr6,
        masks: Option<&dyn MaskDomain>,
    ) -> Option<StoredSyn> {
        let key = self.nodes.iter().find_map(|(key, node)| {
            if node.dst6 != *dst6 {
                return None;
            }
            match masks {
                Some(m) if !m.matches(&node.src4) => None,
                _ => Some(*key),
            }
        })?;
        self.nodes.remove(&key)
    }

    /// Drop every stored SYN aimed at `src4`. Returns how many were
    /// discarded.
    pub fn rm(&mut self, src4: &TransportAddr4) -> usize {
        let keys: Vec<_> = self
            .nodes
            .range((*src4, TransportAddr4::new(std::net::Ipv4Addr::UNSPECIFIED, 0))..)
            .take_while(|((s, _), _)| s == src4)
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            self.nodes.remove(key);
        }
        keys.len()
    }

    /// Harvest every entry older than `timeout_ms` so the caller can answer
    /// them with ICMP errors outside the lock.
    pub fn prepare_clean(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<StoredSyn> {
        let expired: Vec<_> = self
            .nodes
            .iter()
            .filter(|(_, node)| now_ms.saturating_sub(node.update_time) >= timeout_ms)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.nodes.remove(&key))
            .collect()
    }
}
