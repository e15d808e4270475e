//! The per-protocol binding and session table.
//!
//! One `BibTable` holds every mapping of one transport protocol: a tree of
//! BIB entries indexed both by their inside (IPv6) and outside (IPv4)
//! transport addresses, a per-entry tree of sessions keyed by the outside
//! peer, three expiration lists, and (for TCP) the parking queue for
//! simultaneous-open SYNs.
//!
//! Sessions only need one tree per entry. For TCP and UDP the v4 peer
//! address is the v6 peer address minus the pool6 prefix, so a dst4-keyed
//! tree orders exactly like a dst6-keyed one would. For ICMP, dst4's
//! identifier equals the entry's own outside identifier and is constant
//! across the entry's sessions, so only dst4's address discriminates, and
//! that is again the dst6 address minus the prefix. Three trees do the work
//! of four.
//!
//! The table itself is not thread-safe; the caller serializes access
//! (one lock per protocol). Work that must not happen while that lock is
//! held, like sending probes or dropping whole subtrees, is returned to the
//! caller through [`SideEffects`].

use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};
use std::iter::Peekable;
use std::ops::Bound;

use tracing::{debug, info, warn};

use super::entity::{
    BibEntry, BibSession, BibSettings, Direction, Packet, SegmentFlags, SessionEntry,
    SessionTimer, TcpState, TCP_INCOMING_SYN_SECS,
};
use super::error::BibError;
use super::pkt_queue::PktQueue;
use super::state_machine::{self, Fate, Transition};
use crate::common::entity::{
    FlowTuple4, FlowTuple6, Ipv4Prefix, PortRange, Protocol, TransportAddr4, TransportAddr6,
};
use crate::pool4::MaskDomain;

type BibId = u64;

/// Timer lists are ordered sets of `(update_time, entry, peer)`. Keeping the
/// timestamp first makes every list sorted by last activity, and makes the
/// sync import path's out-of-order inserts land in the right place without
/// special handling.
type TimerKey = (u64, BibId, TransportAddr4);

#[derive(Debug)]
struct TabledSession {
    dst6: TransportAddr6,
    dst4: TransportAddr4,
    state: TcpState,
    timer: SessionTimer,
    update_time: u64,
    stored: Option<Packet>,
}

#[derive(Debug)]
struct TabledBib {
    src6: TransportAddr6,
    src4: TransportAddr4,
    is_static: bool,
    sessions: BTreeMap<TransportAddr4, TabledSession>,
}

/// A BIB entry (with its whole session subtree) that has been unlinked from
/// the table. Dropping it is the actual release; callers hold these until
/// after the table lock is gone.
#[derive(Debug)]
pub struct DetachedBib {
    proto: Protocol,
    bib: TabledBib,
}

impl DetachedBib {
    pub fn entry(&self) -> BibEntry {
        BibEntry {
            src6: self.bib.src6,
            src4: self.bib.src4,
            proto: self.proto,
            is_static: self.bib.is_static,
        }
    }

    pub fn session_count(&self) -> usize {
        self.bib.sessions.len()
    }
}

/// An outbound transmission requested by the table, to be performed after
/// its lock is released.
#[derive(Debug)]
pub enum Emission {
    /// Empty-ACK liveness probe toward the session's IPv6 endpoint.
    TcpProbe(SessionEntry),
    /// ICMP Port Unreachable answering a stored packet whose handshake
    /// never completed.
    IcmpPortUnreachable(Packet),
}

/// Everything a table operation wants done once the caller drops the lock,
/// plus bookkeeping for metrics.
#[derive(Debug, Default)]
pub struct SideEffects {
    pub emissions: Vec<Emission>,
    pub evicted: Vec<DetachedBib>,
    pub bibs_created: u64,
    pub sessions_created: u64,
    pub sessions_removed: u64,
}

impl SideEffects {
    pub fn is_empty(&self) -> bool {
        self.emissions.is_empty() && self.evicted.is_empty()
    }
}

/// Result of the TCP 6-to-4 operation.
#[derive(Debug)]
pub enum Tcp6Verdict {
    /// Translate using this session.
    Session(BibSession),
    /// No session and the segment is not a SYN; nothing was created. The
    /// snapshot lets the caller translate a stray RST or similar.
    BibOnly(BibEntry),
}

/// Result of the TCP 4-to-6 operation. The packet rides along in every
/// variant that leaves it with the caller.
#[derive(Debug)]
pub enum Tcp4Verdict {
    Session(BibSession, Packet),
    BibOnly(BibEntry, Packet),
    /// The packet is now owned by the table (type 1 queue or a provisional
    /// session). It must not be forwarded or freed by the caller.
    Stored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub bibs: usize,
    pub sessions: u64,
    pub stored_pkts: usize,
}

/// Outcome of the shared 6-to-4 find phase.
enum Found6 {
    /// A live session; `key` is its slot in the entry's session tree.
    Session { id: BibId, key: TransportAddr4 },
    /// The BIB entry exists but the session does not.
    Bib { id: BibId, key: TransportAddr4 },
    /// Neither exists; a mask allocation is required.
    Nothing,
}

pub struct BibTable {
    proto: Protocol,
    bibs: BTreeMap<BibId, TabledBib>,
    tree6: BTreeMap<TransportAddr6, BibId>,
    tree4: BTreeMap<TransportAddr4, BibId>,
    next_id: BibId,
    session_count: u64,
    est: BTreeSet<TimerKey>,
    trans: BTreeSet<TimerKey>,
    syn4: BTreeSet<TimerKey>,
    /// Stored packets charged to this table: queue entries plus per-session
    /// attachments.
    pkt_count: usize,
    /// Type 1 storage; TCP only.
    pkt_queue: Option<PktQueue>,
}

impl BibTable {
    pub fn new(proto: Protocol) -> Self {
        Self {
            proto,
            bibs: BTreeMap::new(),
            tree6: BTreeMap::new(),
            tree4: BTreeMap::new(),
            next_id: 1,
            session_count: 0,
            est: BTreeSet::new(),
            trans: BTreeSet::new(),
            syn4: BTreeSet::new(),
            pkt_count: 0,
            pkt_queue: (proto == Protocol::Tcp).then(PktQueue::new),
        }
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            bibs: self.bibs.len(),
            sessions: self.session_count,
            stored_pkts: self.pkt_count,
        }
    }

    // ── Snapshots ─────────────────────────────────────────────────

    fn bib_snapshot(&self, bib: &TabledBib) -> BibEntry {
        BibEntry {
            src6: bib.src6,
            src4: bib.src4,
            proto: self.proto,
            is_static: bib.is_static,
        }
    }

    fn session_snapshot(
        &self,
        bib: &TabledBib,
        session: &TabledSession,
        settings: &BibSettings,
    ) -> SessionEntry {
        SessionEntry {
            src6: bib.src6,
            dst6: session.dst6,
            src4: bib.src4,
            dst4: session.dst4,
            proto: self.proto,
            state: session.state,
            timer: session.timer,
            update_time: session.update_time,
            timeout: settings.timeout_ms(self.proto, session.timer),
            has_stored: session.stored.is_some(),
        }
    }

    fn snapshot(&self, id: BibId, key: TransportAddr4, settings: &BibSettings) -> BibSession {
        let bib = &self.bibs[&id];
        BibSession {
            bib: self.bib_snapshot(bib),
            session: bib
                .sessions
                .get(&key)
                .map(|s| self.session_snapshot(bib, s, settings)),
        }
    }

    // ── Timer lists ───────────────────────────────────────────────

    /// Put the session on `timer`, stamped `now`. The session must not be
    /// on any list.
    fn attach_timer(&mut self, id: BibId, key: TransportAddr4, timer: SessionTimer, now_ms: u64) {
        if let Some(bib) = self.bibs.get_mut(&id)
            && let Some(s) = bib.sessions.get_mut(&key)
        {
            s.timer = timer;
            s.update_time = now_ms;
        }
        let list = match timer {
            SessionTimer::Est => &mut self.est,
            SessionTimer::Trans => &mut self.trans,
            SessionTimer::Syn4 => &mut self.syn4,
        };
        list.insert((now_ms, id, key));
    }

    /// Take the session off whatever list it is on.
    fn detach_timer(&mut self, id: BibId, key: TransportAddr4) {
        let Some(bib) = self.bibs.get(&id) else { return };
        let Some(s) = bib.sessions.get(&key) else { return };
        let tk = (s.update_time, id, key);
        let list = match s.timer {
            SessionTimer::Est => &mut self.est,
            SessionTimer::Trans => &mut self.trans,
            SessionTimer::Syn4 => &mut self.syn4,
        };
        list.remove(&tk);
    }

    /// Detach and re-file stamped `now_ms`. Normal touches pass the
    /// current tick, landing the session at the tail of its (possibly new)
    /// list; the import path passes the snapshot's own timestamp and the
    /// ordered list places it wherever that belongs.
    fn move_timer(&mut self, id: BibId, key: TransportAddr4, timer: SessionTimer, now_ms: u64) {
        self.detach_timer(id, key);
        self.attach_timer(id, key, timer, now_ms);
    }

    // ── Creation and removal ──────────────────────────────────────

    fn commit_bib(
        &mut self,
        src6: TransportAddr6,
        src4: TransportAddr4,
        is_static: bool,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) -> BibId {
        let id = self.next_id;
        self.next_id += 1;
        let bib = TabledBib {
            src6,
            src4,
            is_static,
            sessions: BTreeMap::new(),
        };
        if settings.bib_logging {
            info!("Mapped {}", self.bib_snapshot(&bib));
        }
        self.tree6.insert(src6, id);
        self.tree4.insert(src4, id);
        self.bibs.insert(id, bib);
        effects.bibs_created += 1;
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_session(
        &mut self,
        id: BibId,
        key: TransportAddr4,
        dst6: TransportAddr6,
        state: TcpState,
        stored: Option<Packet>,
        timer: SessionTimer,
        now_ms: u64,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) {
        let has_stored = stored.is_some();
        if let Some(bib) = self.bibs.get_mut(&id) {
            bib.sessions.insert(
                key,
                TabledSession {
                    dst6,
                    dst4: key,
                    state,
                    timer,
                    update_time: now_ms,
                    stored,
                },
            );
        }
        self.session_count += 1;
        if has_stored {
            self.pkt_count += 1;
        }
        self.attach_timer(id, key, timer, now_ms);
        effects.sessions_created += 1;
        if settings.session_logging {
            let bib = &self.bibs[&id];
            if let Some(s) = bib.sessions.get(&key) {
                info!("Added session {}", self.session_snapshot(bib, s, settings));
            }
        }
    }

    /// Remove one session; cascade into the BIB entry when it goes
    /// sessionless and is not static. A still-stored packet is answered
    /// with an ICMP error.
    fn rm_session(
        &mut self,
        id: BibId,
        key: TransportAddr4,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) {
        self.detach_timer(id, key);
        let (session, cascade, src6, src4) = {
            let Some(bib) = self.bibs.get_mut(&id) else { return };
            let Some(session) = bib.sessions.remove(&key) else { return };
            let cascade = !bib.is_static && bib.sessions.is_empty();
            (session, cascade, bib.src6, bib.src4)
        };
        self.session_count -= 1;
        effects.sessions_removed += 1;
        if settings.session_logging {
            info!(
                "Forgot session {}|{}|{}|{}|{}",
                src6, session.dst6, src4, session.dst4, self.proto
            );
        }
        if let Some(pkt) = session.stored {
            self.pkt_count -= 1;
            effects.emissions.push(Emission::IcmpPortUnreachable(pkt));
        }
        if cascade && let Some(bib) = self.bibs.remove(&id) {
            self.tree6.remove(&bib.src6);
            self.tree4.remove(&bib.src4);
            if settings.bib_logging {
                info!("Forgot {}", self.bib_snapshot(&bib));
            }
        }
    }

    /// Unlink a BIB entry and all its sessions. The subtree is handed back
    /// for deferred release; stored packets inside it are discarded, not
    /// ICMP'd, because eviction is not a handshake timeout.
    fn detach_bib(&mut self, id: BibId, settings: &BibSettings) -> Option<DetachedBib> {
        let keys: Vec<TransportAddr4> = self
            .bibs
            .get(&id)
            .map(|bib| bib.sessions.keys().copied().collect())
            .unwrap_or_default();
        for key in keys {
            self.detach_timer(id, key);
        }
        let bib = self.bibs.remove(&id)?;
        self.tree6.remove(&bib.src6);
        self.tree4.remove(&bib.src4);
        self.session_count -= bib.sessions.len() as u64;
        self.pkt_count -= bib
            .sessions
            .values()
            .filter(|s| s.stored.is_some())
            .count();
        if settings.bib_logging {
            info!("Forgot {}", self.bib_snapshot(&bib));
        }
        Some(DetachedBib { proto: self.proto, bib })
    }

    // ── State machine plumbing ────────────────────────────────────

    /// Apply a state machine decision to a live session.
    fn apply_transition(
        &mut self,
        id: BibId,
        key: TransportAddr4,
        tr: Transition,
        now_ms: u64,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) {
        let mut cleared = false;
        {
            let Some(bib) = self.bibs.get_mut(&id) else { return };
            let Some(s) = bib.sessions.get_mut(&key) else { return };
            s.state = tr.state;
            if tr.clear_stored && s.stored.take().is_some() {
                debug!("discarding a stored packet; its handshake completed");
                cleared = true;
            }
        }
        if cleared {
            self.pkt_count -= 1;
        }

        match tr.fate {
            Fate::TimerEst => self.move_timer(id, key, SessionTimer::Est, now_ms),
            Fate::TimerTrans => self.move_timer(id, key, SessionTimer::Trans, now_ms),
            Fate::ProbeTrans => {
                let bib = &self.bibs[&id];
                if let Some(s) = bib.sessions.get(&key) {
                    let snapshot = self.session_snapshot(bib, s, settings);
                    effects.emissions.push(Emission::TcpProbe(snapshot));
                }
                self.move_timer(id, key, SessionTimer::Trans, now_ms);
            }
            Fate::Rm => self.rm_session(id, key, settings, effects),
            Fate::Preserve => {}
            // `now_ms` here is the timestamp the fate's issuer vouches
            // for, not necessarily the current tick; the sorted list
            // files the session accordingly.
            Fate::TimerSlow(timer) => self.move_timer(id, key, timer, now_ms),
        }
    }

    // ── Mask allocation ───────────────────────────────────────────

    /// Walk the mask domain for a transport address no BIB entry holds.
    ///
    /// Candidates are usually consecutive, so instead of descending the v4
    /// tree for each one, a range cursor is kept and only advanced: the
    /// previous candidate's successor answers whether the next candidate
    /// collides.
    fn find_available_mask(&self, masks: &mut dyn MaskDomain) -> Option<TransportAddr4> {
        let mut cursor: Option<Peekable<btree_map::Range<'_, TransportAddr4, BibId>>> = None;
        loop {
            let (cand, consecutive) = masks.next()?;
            if !(consecutive && cursor.is_some()) {
                cursor = Some(self.tree4.range(cand..).peekable());
            }
            let taken = match cursor.as_mut() {
                Some(it) => {
                    while it.peek().is_some_and(|(k, _)| **k < cand) {
                        it.next();
                    }
                    it.peek().is_some_and(|(k, _)| **k == cand)
                }
                None => self.tree4.contains_key(&cand),
            };
            if !taken {
                return Some(cand);
            }
        }
    }

    // ── 6-to-4 ────────────────────────────────────────────────────

    /// ICMP conversations carry the outside identifier in both directions,
    /// so the session key's L4 half is the entry's own.
    fn session_key(&self, bib_src4_port: u16, dst4: TransportAddr4) -> TransportAddr4 {
        match self.proto {
            Protocol::Icmp => TransportAddr4::new(dst4.addr, bib_src4_port),
            _ => dst4,
        }
    }

    /// The find half of every 6-to-4 operation: v6 lookup, stale-mask
    /// eviction, and the simultaneous-open upgrade.
    fn find6(
        &mut self,
        tuple6: &FlowTuple6,
        masks: &mut Option<&mut dyn MaskDomain>,
        dst4: TransportAddr4,
        now_ms: u64,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) -> Found6 {
        if let Some(&id) = self.tree6.get(&tuple6.src) {
            let src4 = self.bibs[&id].src4;
            let stale = match masks.as_deref() {
                Some(m) => m.is_dynamic() && !m.matches(&src4),
                None => false,
            };
            if !stale {
                let key = self.session_key(src4.port, dst4);
                if self.bibs[&id].sessions.contains_key(&key) {
                    return Found6::Session { id, key };
                }
                return Found6::Bib { id, key };
            }
            // The pool no longer grants this outside address. Evict the
            // whole binding; the inside host gets a fresh one below and
            // its peers will reconnect.
            debug!("outside address {src4} left the pool; evicting its binding");
            if let Some(detached) = self.detach_bib(id, settings) {
                effects.evicted.push(detached);
            }
            return Found6::Nothing;
        }

        // No binding. A stored external SYN toward this exact v6
        // destination may be the other half of a simultaneous open.
        let upgraded = match self.pkt_queue.as_mut() {
            Some(queue) => queue.find_upgrade(&tuple6.dst, masks.as_deref()),
            None => None,
        };
        if let Some(node) = upgraded {
            self.pkt_count -= 1;
            if masks.is_none() {
                // Replay path: the v4 half of the open landed on another
                // instance and the mask choice below would not honor it.
                // Pretend the stored packet never arrived.
                return Found6::Nothing;
            }
            debug!("simultaneous open: adopting the stored SYN's binding");
            let id = self.commit_bib(tuple6.src, node.src4, false, settings, effects);
            self.commit_session(
                id,
                node.dst4,
                node.dst6,
                TcpState::V4Init,
                None,
                SessionTimer::Syn4,
                now_ms,
                settings,
                effects,
            );
            return Found6::Session { id, key: node.dst4 };
        }

        Found6::Nothing
    }

    fn enforce_prefix6(
        &self,
        tuple6: &FlowTuple6,
        dst4: TransportAddr4,
        settings: &BibSettings,
    ) -> Result<(), BibError> {
        let embedded = settings.pool6.extract(&tuple6.dst.addr);
        if embedded != Some(dst4.addr) {
            return Err(BibError::PrefixMismatch);
        }
        if self.proto != Protocol::Icmp && tuple6.dst.port != dst4.port {
            return Err(BibError::PrefixMismatch);
        }
        Ok(())
    }

    /// 6-to-4 find-or-insert for UDP, ICMP, and TCP timer refreshes.
    pub fn add6(
        &mut self,
        tuple6: &FlowTuple6,
        mut masks: Option<&mut dyn MaskDomain>,
        dst4: TransportAddr4,
        now_ms: u64,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) -> Result<BibSession, BibError> {
        self.enforce_prefix6(tuple6, dst4, settings)?;
        match self.find6(tuple6, &mut masks, dst4, now_ms, settings, effects) {
            Found6::Session { id, key } => {
                self.move_timer(id, key, SessionTimer::Est, now_ms);
                Ok(self.snapshot(id, key, settings))
            }
            Found6::Bib { id, key } => {
                self.commit_session(
                    id,
                    key,
                    tuple6.dst,
                    TcpState::Established,
                    None,
                    SessionTimer::Est,
                    now_ms,
                    settings,
                    effects,
                );
                Ok(self.snapshot(id, key, settings))
            }
            Found6::Nothing => {
                let (id, key) =
                    self.allocate6(tuple6, &mut masks, dst4, settings, effects)?;
                self.commit_session(
                    id,
                    key,
                    tuple6.dst,
                    TcpState::Established,
                    None,
                    SessionTimer::Est,
                    now_ms,
                    settings,
                    effects,
                );
                Ok(self.snapshot(id, key, settings))
            }
        }
    }

    /// 6-to-4 with the TCP state machine.
    pub fn add_tcp6(
        &mut self,
        tuple6: &FlowTuple6,
        mut masks: Option<&mut dyn MaskDomain>,
        dst4: TransportAddr4,
        flags: SegmentFlags,
        now_ms: u64,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) -> Result<Tcp6Verdict, BibError> {
        self.enforce_prefix6(tuple6, dst4, settings)?;
        match self.find6(tuple6, &mut masks, dst4, now_ms, settings, effects) {
            Found6::Session { id, key } => {
                let state = self.bibs[&id].sessions[&key].state;
                let tr = state_machine::transition(
                    state,
                    Direction::FromV6,
                    flags,
                    settings.handle_fin_rcv_rst,
                );
                self.apply_transition(id, key, tr, now_ms, settings, effects);
                Ok(Tcp6Verdict::Session(self.snapshot(id, key, settings)))
            }
            Found6::Bib { id, key } => {
                if !flags.syn {
                    // CLOSED state; nothing to track, but the caller may
                    // still want to translate the stray segment.
                    return Ok(Tcp6Verdict::BibOnly(self.bib_snapshot(&self.bibs[&id])));
                }
                self.commit_session(
                    id,
                    key,
                    tuple6.dst,
                    TcpState::V6Init,
                    None,
                    SessionTimer::Trans,
                    now_ms,
                    settings,
                    effects,
                );
                Ok(Tcp6Verdict::Session(self.snapshot(id, key, settings)))
            }
            Found6::Nothing => {
                if !flags.syn {
                    debug!("segment is not a SYN and lacks state");
                    return Err(BibError::NotFound);
                }
                let (id, key) =
                    self.allocate6(tuple6, &mut masks, dst4, settings, effects)?;
                self.commit_session(
                    id,
                    key,
                    tuple6.dst,
                    TcpState::V6Init,
                    None,
                    SessionTimer::Trans,
                    now_ms,
                    settings,
                    effects,
                );
                Ok(Tcp6Verdict::Session(self.snapshot(id, key, settings)))
            }
        }
    }

    /// Mask a brand-new binding for a 6-to-4 flow.
    fn allocate6(
        &mut self,
        tuple6: &FlowTuple6,
        masks: &mut Option<&mut dyn MaskDomain>,
        dst4: TransportAddr4,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) -> Result<(BibId, TransportAddr4), BibError> {
        let Some(masks) = masks.as_deref_mut() else {
            return Err(BibError::MissingMasks);
        };
        let Some(src4) = self.find_available_mask(masks) else {
            return Err(BibError::AddressExhausted { mark: masks.mark() });
        };
        let key = self.session_key(src4.port, dst4);
        let id = self.commit_bib(tuple6.src, src4, false, settings, effects);
        Ok((id, key))
    }

    // ── 4-to-6 ────────────────────────────────────────────────────

    /// Whether any of the entry's sessions already points at `addr`. This
    /// is what authorizes an inbound flow under address-dependent
    /// filtering.
    fn peer_addr_seen(&self, id: BibId, addr: std::net::Ipv4Addr) -> bool {
        self.bibs[&id]
            .sessions
            .range(TransportAddr4::new(addr, 0)..=TransportAddr4::new(addr, u16::MAX))
            .next()
            .is_some()
    }

    fn enforce_prefix4(
        &self,
        tuple4: &FlowTuple4,
        dst6: TransportAddr6,
        settings: &BibSettings,
    ) -> Result<(), BibError> {
        if settings.pool6.embed(&tuple4.src.addr) != dst6.addr {
            return Err(BibError::PrefixMismatch);
        }
        if self.proto != Protocol::Icmp && tuple4.src.port != dst6.port {
            return Err(BibError::PrefixMismatch);
        }
        Ok(())
    }

    /// 4-to-6 find for UDP and ICMP. Never creates a BIB entry; there is
    /// no outbound address to allocate.
    pub fn add4(
        &mut self,
        tuple4: &FlowTuple4,
        dst6: TransportAddr6,
        now_ms: u64,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) -> Result<BibSession, BibError> {
        self.enforce_prefix4(tuple4, dst6, settings)?;
        let Some(&id) = self.tree4.get(&tuple4.dst) else {
            return Err(BibError::NotFound);
        };
        let key = tuple4.src;
        if self.bibs[&id].sessions.contains_key(&key) {
            self.move_timer(id, key, SessionTimer::Est, now_ms);
            return Ok(self.snapshot(id, key, settings));
        }
        if settings.drop_by_addr && !self.peer_addr_seen(id, key.addr) {
            debug!("address-dependent filtering dropped a flow from {key}");
            return Err(BibError::Forbidden);
        }
        self.commit_session(
            id,
            key,
            dst6,
            TcpState::Established,
            None,
            SessionTimer::Est,
            now_ms,
            settings,
            effects,
        );
        Ok(self.snapshot(id, key, settings))
    }

    /// 4-to-6 with the TCP state machine, simultaneous-open storage, and
    /// address-dependent filtering.
    pub fn add_tcp4(
        &mut self,
        tuple4: &FlowTuple4,
        dst6: TransportAddr6,
        pkt: Packet,
        now_ms: u64,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) -> Result<Tcp4Verdict, BibError> {
        self.enforce_prefix4(tuple4, dst6, settings)?;
        let flags = pkt.flags();
        let found = self.tree4.get(&tuple4.dst).copied();
        let key = tuple4.src;

        if let Some(id) = found
            && self.bibs[&id].sessions.contains_key(&key)
        {
            let state = self.bibs[&id].sessions[&key].state;
            let tr = state_machine::transition(
                state,
                Direction::FromV4,
                flags,
                settings.handle_fin_rcv_rst,
            );
            self.apply_transition(id, key, tr, now_ms, settings, effects);
            return Ok(Tcp4Verdict::Session(self.snapshot(id, key, settings), pkt));
        }

        // CLOSED state from here on.

        if !flags.syn {
            if let Some(id) = found {
                return Ok(Tcp4Verdict::BibOnly(self.bib_snapshot(&self.bibs[&id]), pkt));
            }
            debug!("segment is not a SYN and lacks state");
            return Err(BibError::NotFound);
        }

        if settings.drop_external_tcp {
            debug!("externally initiated TCP connections are prohibited");
            return Err(BibError::Forbidden);
        }

        let Some(id) = found else {
            // Potential simultaneous open; park the SYN until the v6 peer
            // claims it or the wait times out.
            let full = self.pkt_count >= settings.max_stored_pkts;
            let Some(queue) = self.pkt_queue.as_mut() else {
                return Err(BibError::UnsupportedProtocol(self.proto.to_u8()));
            };
            return match queue.add(tuple4.dst, tuple4.src, dst6, pkt, now_ms, full) {
                Ok(()) => {
                    self.pkt_count += 1;
                    debug!("storing an unmatched external SYN");
                    Ok(Tcp4Verdict::Stored)
                }
                Err((BibError::QueueFull, pkt)) => {
                    effects.emissions.push(Emission::IcmpPortUnreachable(pkt));
                    Err(BibError::QueueFull)
                }
                Err((err, _pkt)) => Err(err),
            };
        };

        if settings.drop_by_addr {
            if !self.peer_addr_seen(id, key.addr) {
                debug!("address-dependent filtering dropped a flow from {key}");
                return Err(BibError::Forbidden);
            }
            // Authorized peer, but the inside host has not spoken for this
            // flow yet. Hold the SYN on the short timer so a simultaneous
            // open can still resolve it.
            if self.pkt_count >= settings.max_stored_pkts {
                effects.emissions.push(Emission::IcmpPortUnreachable(pkt));
                return Err(BibError::QueueFull);
            }
            self.commit_session(
                id,
                key,
                dst6,
                TcpState::V4Init,
                Some(pkt),
                SessionTimer::Syn4,
                now_ms,
                settings,
                effects,
            );
            return Ok(Tcp4Verdict::Stored);
        }

        self.commit_session(
            id,
            key,
            dst6,
            TcpState::V4Init,
            None,
            SessionTimer::Trans,
            now_ms,
            settings,
            effects,
        );
        Ok(Tcp4Verdict::Session(self.snapshot(id, key, settings), pkt))
    }

    // ── Plain lookups ─────────────────────────────────────────────

    pub fn find_by_src6(&self, addr: &TransportAddr6) -> Option<BibEntry> {
        let id = self.tree6.get(addr)?;
        Some(self.bib_snapshot(&self.bibs[id]))
    }

    pub fn find_by_src4(&self, addr: &TransportAddr4) -> Option<BibEntry> {
        let id = self.tree4.get(addr)?;
        Some(self.bib_snapshot(&self.bibs[id]))
    }

    // ── Expiration ────────────────────────────────────────────────

    /// Sweep every timer list (and, for TCP, the type 1 queue). Probes and
    /// ICMP errors owed by dead sessions accumulate in `effects`.
    pub fn clean(&mut self, now_ms: u64, settings: &BibSettings, effects: &mut SideEffects) {
        self.sweep(SessionTimer::Est, now_ms, settings, effects);
        match self.proto {
            Protocol::Tcp => {
                self.sweep(SessionTimer::Trans, now_ms, settings, effects);
                self.sweep(SessionTimer::Syn4, now_ms, settings, effects);
            }
            _ => {
                // These lists exist on every table but only TCP uses them.
                if !self.trans.is_empty() || !self.syn4.is_empty() {
                    warn!("{} table has sessions on TCP-only timers", self.proto);
                    self.sweep(SessionTimer::Trans, now_ms, settings, effects);
                    self.sweep(SessionTimer::Syn4, now_ms, settings, effects);
                }
            }
        }
        if let Some(queue) = self.pkt_queue.as_mut() {
            let expired = queue.prepare_clean(now_ms, TCP_INCOMING_SYN_SECS * 1000);
            self.pkt_count -= expired.len();
            for node in expired {
                debug!("an unmatched external SYN timed out; answering it");
                effects
                    .emissions
                    .push(Emission::IcmpPortUnreachable(node.pkt));
            }
        }
    }

    fn sweep(
        &mut self,
        timer: SessionTimer,
        now_ms: u64,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) {
        let timeout = settings.timeout_ms(self.proto, timer);
        loop {
            let head = match timer {
                SessionTimer::Est => self.est.iter().next().copied(),
                SessionTimer::Trans => self.trans.iter().next().copied(),
                SessionTimer::Syn4 => self.syn4.iter().next().copied(),
            };
            let Some((update_time, id, key)) = head else { break };
            if now_ms.saturating_sub(update_time) < timeout {
                // Sorted by last activity: the rest is younger still.
                break;
            }
            let Some(state) = self
                .bibs
                .get(&id)
                .and_then(|bib| bib.sessions.get(&key))
                .map(|s| s.state)
            else {
                // Dangling timer node; drop it rather than spin.
                match timer {
                    SessionTimer::Est => self.est.remove(&(update_time, id, key)),
                    SessionTimer::Trans => self.trans.remove(&(update_time, id, key)),
                    SessionTimer::Syn4 => self.syn4.remove(&(update_time, id, key)),
                };
                continue;
            };
            let tr = match timer {
                SessionTimer::Est => state_machine::expire_established(self.proto, state),
                SessionTimer::Trans | SessionTimer::Syn4 => {
                    state_machine::expire_transitory(state)
                }
            };
            self.apply_transition(id, key, tr, now_ms, settings, effects);
        }
    }

    // ── Session sync import ───────────────────────────────────────

    /// Adopt a session snapshot from another translator instance. The
    /// snapshot's own timestamp is honored, so the entry is sorted into the
    /// timer list rather than appended.
    pub fn import_session(
        &mut self,
        entry: &SessionEntry,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) -> Result<(), BibError> {
        if settings.pool6.extract(&entry.dst6.addr) != Some(entry.dst4.addr) {
            return Err(BibError::PrefixMismatch);
        }
        let id = match self.tree6.get(&entry.src6) {
            Some(&id) => {
                if self.bibs[&id].src4 != entry.src4 {
                    return Err(BibError::AlreadyExists(self.bib_snapshot(&self.bibs[&id])));
                }
                id
            }
            None => {
                if let Some(&other) = self.tree4.get(&entry.src4) {
                    return Err(BibError::AlreadyExists(
                        self.bib_snapshot(&self.bibs[&other]),
                    ));
                }
                self.commit_bib(entry.src6, entry.src4, false, settings, effects)
            }
        };
        let key = entry.dst4;
        if self.bibs[&id].sessions.contains_key(&key) {
            let tr = Transition {
                state: entry.state,
                fate: Fate::TimerSlow(entry.timer),
                clear_stored: false,
            };
            self.apply_transition(id, key, tr, entry.update_time, settings, effects);
            return Ok(());
        }
        self.commit_session(
            id,
            key,
            entry.dst6,
            entry.state,
            None,
            entry.timer,
            entry.update_time,
            settings,
            effects,
        );
        Ok(())
    }

    // ── Administration ────────────────────────────────────────────

    /// Create a manual, session-independent mapping. Re-adding the exact
    /// same mapping upgrades it in place; any other overlap is a conflict.
    pub fn add_static(
        &mut self,
        src6: TransportAddr6,
        src4: TransportAddr4,
        settings: &BibSettings,
        effects: &mut SideEffects,
    ) -> Result<(), BibError> {
        if let Some(&id) = self.tree6.get(&src6) {
            if self.bibs[&id].src4 == src4 {
                if let Some(bib) = self.bibs.get_mut(&id) {
                    bib.is_static = true;
                }
                return Ok(());
            }
            return Err(BibError::AlreadyExists(self.bib_snapshot(&self.bibs[&id])));
        }
        if let Some(&id) = self.tree4.get(&src4) {
            return Err(BibError::AlreadyExists(self.bib_snapshot(&self.bibs[&id])));
        }
        self.commit_bib(src6, src4, true, settings, effects);
        // The mapping can now translate those parked SYNs, but the v4
        // client will retry anyway; forgetting them is much simpler than
        // replaying them.
        if let Some(queue) = self.pkt_queue.as_mut() {
            let dropped = queue.rm(&src4);
            self.pkt_count -= dropped;
        }
        Ok(())
    }

    /// Remove the mapping that matches `entry` exactly.
    pub fn remove(
        &mut self,
        entry: &BibEntry,
        settings: &BibSettings,
    ) -> Result<DetachedBib, BibError> {
        let id = match self.tree6.get(&entry.src6) {
            Some(&id) if self.bibs[&id].src4 == entry.src4 => id,
            _ => return Err(BibError::NotFound),
        };
        self.detach_bib(id, settings).ok_or(BibError::NotFound)
    }

    /// Remove every mapping whose outside address falls in `prefix` and
    /// whose port falls in `ports`.
    pub fn remove_range(
        &mut self,
        prefix: Ipv4Prefix,
        ports: PortRange,
        settings: &BibSettings,
    ) -> Vec<DetachedBib> {
        let start = TransportAddr4::new(prefix.first_addr(), ports.min);
        let ids: Vec<BibId> = self
            .tree4
            .range(start..)
            .take_while(|(addr, _)| prefix.contains(&addr.addr))
            .filter(|(addr, _)| ports.contains(addr.port))
            .map(|(_, &id)| id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.detach_bib(id, settings))
            .collect()
    }

    /// Detach everything.
    pub fn flush(&mut self, settings: &BibSettings) -> Vec<DetachedBib> {
        let ids: Vec<BibId> = self.bibs.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.detach_bib(id, settings))
            .collect()
    }

    /// Ordered page of BIB entries, ascending by outside address, starting
    /// after `offset`. An offset that no longer exists resolves to the next
    /// greater entry.
    pub fn list_bib(&self, offset: Option<TransportAddr4>, limit: usize) -> Vec<BibEntry> {
        let start = match offset {
            Some(addr) => Bound::Excluded(addr),
            None => Bound::Unbounded,
        };
        self.tree4
            .range((start, Bound::Unbounded))
            .take(limit)
            .map(|(_, id)| self.bib_snapshot(&self.bibs[id]))
            .collect()
    }

    /// Ordered page of sessions, ascending by `(src4, dst4)`, starting
    /// after `offset`.
    pub fn list_sessions(
        &self,
        offset: Option<(TransportAddr4, TransportAddr4)>,
        limit: usize,
        settings: &BibSettings,
    ) -> Vec<SessionEntry> {
        let mut out = Vec::new();
        let bib_start = match offset {
            Some((src4, _)) => Bound::Included(src4),
            None => Bound::Unbounded,
        };
        for (src4, id) in self.tree4.range((bib_start, Bound::Unbounded)) {
            let bib = &self.bibs[id];
            let session_start = match offset {
                Some((off_src4, off_dst4)) if *src4 == off_src4 => Bound::Excluded(off_dst4),
                _ => Bound::Unbounded,
            };
            for (_, session) in bib.sessions.range((session_start, Bound::Unbounded)) {
                if out.len() >= limit {
                    return out;
                }
                out.push(self.session_snapshot(bib, session, settings));
            }
        }
        out
    }

    // ── Consistency ───────────────────────────────────────────────

    /// Verify the table's structural invariants. Meant for tests and
    /// debugging; the cost is linear in the table size.
    pub fn check_consistency(&self, settings: &BibSettings) -> Result<(), String> {
        // Both indexes must describe the same set of entries.
        if self.tree6.len() != self.bibs.len() || self.tree4.len() != self.bibs.len() {
            return Err(format!(
                "index sizes diverge: {} entries, {} by v6, {} by v4",
                self.bibs.len(),
                self.tree6.len(),
                self.tree4.len()
            ));
        }
        for (id, bib) in &self.bibs {
            if self.tree6.get(&bib.src6) != Some(id) {
                return Err(format!("{} missing from the v6 index", bib.src6));
            }
            if self.tree4.get(&bib.src4) != Some(id) {
                return Err(format!("{} missing from the v4 index", bib.src4));
            }
            if !bib.is_static && bib.sessions.is_empty() {
                return Err(format!("{} is sessionless but not static", bib.src4));
            }
        }

        let total: u64 = self.bibs.values().map(|b| b.sessions.len() as u64).sum();
        if total != self.session_count {
            return Err(format!(
                "session_count {} but {} sessions exist",
                self.session_count, total
            ));
        }

        let timer_total = (self.est.len() + self.trans.len() + self.syn4.len()) as u64;
        if timer_total != self.session_count {
            return Err(format!(
                "{timer_total} timer nodes for {} sessions",
                self.session_count
            ));
        }
        for (id, bib) in &self.bibs {
            for (key, s) in &bib.sessions {
                let tk = (s.update_time, *id, *key);
                let present = match s.timer {
                    SessionTimer::Est => self.est.contains(&tk),
                    SessionTimer::Trans => self.trans.contains(&tk),
                    SessionTimer::Syn4 => self.syn4.contains(&tk),
                };
                if !present {
                    return Err(format!("session {key} absent from its timer list"));
                }
                if s.dst4.addr != settings.pool6.extract(&s.dst6.addr).unwrap_or(s.dst4.addr) {
                    return Err(format!("session {key}: dst4 does not match dst6"));
                }
                if self.proto == Protocol::Icmp && s.dst4.port != bib.src4.port {
                    return Err(format!("ICMP session {key}: identifier mismatch"));
                }
            }
        }

        let stored: usize = self
            .bibs
            .values()
            .flat_map(|b| b.sessions.values())
            .filter(|s| s.stored.is_some())
            .count();
        let queued = self.pkt_queue.as_ref().map_or(0, PktQueue::len);
        if stored + queued != self.pkt_count {
            return Err(format!(
                "pkt_count {} but {stored} attached and {queued} queued",
                self.pkt_count
            ));
        }
        Ok(())
    }
}
