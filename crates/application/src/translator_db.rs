//! The translator-facing session database: three protocol tables behind
//! their own locks, with everything that must not run under a lock
//! (probes, ICMP errors, bulk releases) drained afterwards.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

use tracing::warn;

use domain::bib::entity::{
    BibEntry, BibSession, BibSettings, Packet, SegmentFlags, SessionEntry,
};
use domain::bib::error::BibError;
use domain::bib::table::{
    BibTable, Emission, SideEffects, TableStats, Tcp4Verdict, Tcp6Verdict,
};
use domain::common::entity::{
    FlowTuple4, FlowTuple6, Ipv4Prefix, PortRange, Protocol, TransportAddr4, TransportAddr6,
};
use domain::pool4::MaskDomain;
use ports::secondary::metrics_port::NatMetrics;
use ports::secondary::packet_sink_port::PacketSinkPort;

use crate::session_sync::SessionSyncService;

/// Owns the three per-protocol tables. Cheap to share; wrap in `Arc`.
pub struct TranslatorDb {
    tcp: Mutex<BibTable>,
    udp: Mutex<BibTable>,
    icmp: Mutex<BibTable>,
    settings: BibSettings,
    sink: Arc<dyn PacketSinkPort>,
    metrics: Arc<dyn NatMetrics>,
    sync: OnceLock<Arc<SessionSyncService>>,
    started: Instant,
    /// Marks whose exhaustion was already reported since the last sweep.
    warned_marks: Mutex<HashSet<u32>>,
}

/// Mutex poisoning only happens after a panic in another thread; the
/// tables hold no invariant a panicked operation could have half-applied
/// that is worth dying twice for, so keep serving.
fn lock(m: &Mutex<BibTable>) -> MutexGuard<'_, BibTable> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl TranslatorDb {
    pub fn new(
        settings: BibSettings,
        sink: Arc<dyn PacketSinkPort>,
        metrics: Arc<dyn NatMetrics>,
    ) -> Result<Self, BibError> {
        settings.validate()?;
        Ok(Self {
            tcp: Mutex::new(BibTable::new(Protocol::Tcp)),
            udp: Mutex::new(BibTable::new(Protocol::Udp)),
            icmp: Mutex::new(BibTable::new(Protocol::Icmp)),
            settings,
            sink,
            metrics,
            sync: OnceLock::new(),
            started: Instant::now(),
            warned_marks: Mutex::new(HashSet::new()),
        })
    }

    /// Attach the session sync exporter. May be called at most once, after
    /// construction (the exporter needs the `Arc` to this database).
    pub fn set_sync(&self, sync: Arc<SessionSyncService>) {
        let _ = self.sync.set(sync);
    }

    pub fn settings(&self) -> &BibSettings {
        &self.settings
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Milliseconds since this database came up; the clock every stored
    /// timestamp is relative to.
    pub fn uptime_ms(&self) -> u64 {
        self.now_ms()
    }

    fn table(&self, proto: Protocol) -> &Mutex<BibTable> {
        match proto {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
            Protocol::Icmp => &self.icmp,
        }
    }

    /// Drain a finished operation's side effects, outside any table lock.
    fn finish(&self, proto: Protocol, fx: SideEffects) {
        for _ in 0..fx.sessions_created {
            self.metrics.inc_sessions_created(proto);
        }
        if fx.sessions_removed > 0 {
            self.metrics.inc_sessions_removed(proto, fx.sessions_removed);
        }
        for emission in fx.emissions {
            match emission {
                Emission::TcpProbe(session) => {
                    self.sink.send_tcp_probe(&session);
                    self.metrics.inc_probes_sent();
                }
                Emission::IcmpPortUnreachable(pkt) => {
                    self.sink.send_icmp_port_unreachable(pkt);
                    self.metrics.inc_icmp_errors_sent();
                }
            }
        }
        let stats = lock(self.table(proto)).stats();
        self.metrics.set_bib_count(proto, stats.bibs as u64);
        self.metrics.set_session_count(proto, stats.sessions);
        self.metrics.set_stored_pkt_count(proto, stats.stored_pkts as u64);
        // `fx.evicted` drops here, releasing detached subtrees with no lock
        // held.
    }

    fn export(&self, entries: &BibSession) {
        if let (Some(sync), Some(session)) = (self.sync.get(), entries.session.as_ref()) {
            sync.enqueue(session, self.now_ms());
        }
    }

    fn note_exhaustion(&self, result: &Result<BibSession, BibError>) {
        if let Err(BibError::AddressExhausted { mark }) = result {
            self.warn_exhausted(*mark);
        }
    }

    fn warn_exhausted(&self, mark: u32) {
        self.metrics.inc_pool_exhausted(mark);
        let mut warned = self
            .warned_marks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if warned.insert(mark) {
            warn!("running out of pool4 transport addresses for mark {mark}");
        }
    }

    // ── Data plane ────────────────────────────────────────────────

    /// 6-to-4 find-or-insert for UDP, ICMP, and TCP timer refreshes.
    pub fn add6(
        &self,
        tuple6: &FlowTuple6,
        masks: &mut dyn MaskDomain,
        dst4: TransportAddr4,
    ) -> Result<BibSession, BibError> {
        let now = self.now_ms();
        let mut fx = SideEffects::default();
        let result = lock(self.table(tuple6.proto)).add6(
            tuple6,
            Some(masks),
            dst4,
            now,
            &self.settings,
            &mut fx,
        );
        self.finish(tuple6.proto, fx);
        self.note_exhaustion(&result);
        if let Ok(entries) = &result {
            self.export(entries);
        }
        result
    }

    /// 6-to-4 with the full TCP state machine.
    pub fn add_tcp6(
        &self,
        tuple6: &FlowTuple6,
        masks: &mut dyn MaskDomain,
        dst4: TransportAddr4,
        flags: SegmentFlags,
    ) -> Result<Tcp6Verdict, BibError> {
        let now = self.now_ms();
        let mut fx = SideEffects::default();
        let result = lock(&self.tcp).add_tcp6(
            tuple6,
            Some(masks),
            dst4,
            flags,
            now,
            &self.settings,
            &mut fx,
        );
        self.finish(Protocol::Tcp, fx);
        if let Err(BibError::AddressExhausted { mark }) = &result {
            self.warn_exhausted(*mark);
        }
        if let Ok(Tcp6Verdict::Session(entries)) = &result {
            self.export(entries);
        }
        result
    }

    /// 4-to-6 find for UDP and ICMP.
    pub fn add4(
        &self,
        tuple4: &FlowTuple4,
        dst6: TransportAddr6,
    ) -> Result<BibSession, BibError> {
        let now = self.now_ms();
        let mut fx = SideEffects::default();
        let result =
            lock(self.table(tuple4.proto)).add4(tuple4, dst6, now, &self.settings, &mut fx);
        if matches!(result, Err(BibError::Forbidden)) {
            self.metrics.inc_filtering_drops();
        }
        self.finish(tuple4.proto, fx);
        if let Ok(entries) = &result {
            self.export(entries);
        }
        result
    }

    /// 4-to-6 with the full TCP state machine; may take ownership of the
    /// packet (see [`Tcp4Verdict::Stored`]).
    pub fn add_tcp4(
        &self,
        tuple4: &FlowTuple4,
        dst6: TransportAddr6,
        pkt: Packet,
    ) -> Result<Tcp4Verdict, BibError> {
        let now = self.now_ms();
        let mut fx = SideEffects::default();
        let result = lock(&self.tcp).add_tcp4(tuple4, dst6, pkt, now, &self.settings, &mut fx);
        match &result {
            Err(BibError::Forbidden) => self.metrics.inc_filtering_drops(),
            Err(BibError::QueueFull) => self.metrics.inc_storage_rejections(),
            _ => {}
        }
        self.finish(Protocol::Tcp, fx);
        if let Ok(Tcp4Verdict::Session(entries, _)) = &result {
            self.export(entries);
        }
        result
    }

    /// BIB lookup by inside transport address.
    pub fn find6(
        &self,
        proto: Protocol,
        addr: &TransportAddr6,
    ) -> Result<BibSession, BibError> {
        lock(self.table(proto))
            .find_by_src6(addr)
            .map(|bib| BibSession { bib, session: None })
            .ok_or(BibError::NotFound)
    }

    /// BIB lookup by outside transport address.
    pub fn find4(
        &self,
        proto: Protocol,
        addr: &TransportAddr4,
    ) -> Result<BibSession, BibError> {
        lock(self.table(proto))
            .find_by_src4(addr)
            .map(|bib| BibSession { bib, session: None })
            .ok_or(BibError::NotFound)
    }

    // ── Expiration ────────────────────────────────────────────────

    /// Sweep all tables, then emit everything the sweeps decided to send.
    pub fn clean(&self) {
        self.clean_at(self.now_ms());
    }

    pub(crate) fn clean_at(&self, now_ms: u64) {
        for proto in [Protocol::Tcp, Protocol::Udp, Protocol::Icmp] {
            let mut fx = SideEffects::default();
            lock(self.table(proto)).clean(now_ms, &self.settings, &mut fx);
            self.finish(proto, fx);
        }
        let mut warned = self
            .warned_marks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        warned.clear();
    }

    // ── Session sync ──────────────────────────────────────────────

    /// Adopt a session snapshot from a peer instance.
    pub fn import_session(&self, entry: &SessionEntry) -> Result<(), BibError> {
        let mut fx = SideEffects::default();
        let result =
            lock(self.table(entry.proto)).import_session(entry, &self.settings, &mut fx);
        self.finish(entry.proto, fx);
        result
    }

    /// Export every current session into the sync queue, for a newly
    /// joined peer.
    pub fn advertise(&self) -> usize {
        let Some(sync) = self.sync.get() else { return 0 };
        let now = self.now_ms();
        let mut count = 0;
        for proto in [Protocol::Tcp, Protocol::Udp, Protocol::Icmp] {
            let sessions = lock(self.table(proto)).list_sessions(None, usize::MAX, &self.settings);
            for session in &sessions {
                sync.enqueue(session, now);
                count += 1;
            }
        }
        count
    }

    // ── Administration ────────────────────────────────────────────

    pub fn add_static(
        &self,
        proto: Protocol,
        src6: TransportAddr6,
        src4: TransportAddr4,
    ) -> Result<(), BibError> {
        let mut fx = SideEffects::default();
        let result = lock(self.table(proto)).add_static(src6, src4, &self.settings, &mut fx);
        self.finish(proto, fx);
        result
    }

    pub fn remove(&self, entry: &BibEntry) -> Result<(), BibError> {
        let detached = lock(self.table(entry.proto)).remove(entry, &self.settings)?;
        let stats = lock(self.table(entry.proto)).stats();
        self.metrics.set_bib_count(entry.proto, stats.bibs as u64);
        self.metrics.set_session_count(entry.proto, stats.sessions);
        drop(detached);
        Ok(())
    }

    /// Remove every binding inside the prefix and port range. Returns how
    /// many bindings went away.
    pub fn remove_range(&self, proto: Protocol, prefix: Ipv4Prefix, ports: PortRange) -> usize {
        let detached = lock(self.table(proto)).remove_range(prefix, ports, &self.settings);
        let count = detached.len();
        drop(detached);
        count
    }

    pub fn flush(&self, proto: Protocol) -> usize {
        let detached = lock(self.table(proto)).flush(&self.settings);
        let count = detached.len();
        drop(detached);
        count
    }

    pub fn flush_all(&self) -> usize {
        [Protocol::Tcp, Protocol::Udp, Protocol::Icmp]
            .into_iter()
            .map(|proto| self.flush(proto))
            .sum()
    }

    pub fn list_bib(
        &self,
        proto: Protocol,
        offset: Option<TransportAddr4>,
        limit: usize,
    ) -> Vec<BibEntry> {
        lock(self.table(proto)).list_bib(offset, limit)
    }

    pub fn list_sessions(
        &self,
        proto: Protocol,
        offset: Option<(TransportAddr4, TransportAddr4)>,
        limit: usize,
    ) -> Vec<SessionEntry> {
        lock(self.table(proto)).list_sessions(offset, limit, &self.settings)
    }

    pub fn stats(&self, proto: Protocol) -> TableStats {
        lock(self.table(proto)).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::pool4::PoolMaskDomain;
    use ports::test_utils::{NoopMetrics, RecordingSink};
    use std::net::Ipv4Addr;

    fn db() -> (Arc<TranslatorDb>, Arc<RecordingSink>) {
        db_with(BibSettings::default())
    }

    fn db_with(settings: BibSettings) -> (Arc<TranslatorDb>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let db = TranslatorDb::new(settings, sink.clone(), Arc::new(NoopMetrics)).unwrap();
        (Arc::new(db), sink)
    }

    fn pool() -> PoolMaskDomain {
        PoolMaskDomain::new(
            0,
            true,
            vec![(Ipv4Addr::new(192, 0, 2, 1), 1000, 1001)],
        )
    }

    fn taddr6(s: &str, port: u16) -> TransportAddr6 {
        TransportAddr6::new(s.parse().unwrap(), port)
    }

    fn taddr4(s: &str, port: u16) -> TransportAddr4 {
        TransportAddr4::new(s.parse().unwrap(), port)
    }

    fn udp6() -> FlowTuple6 {
        FlowTuple6 {
            src: taddr6("2001:db8::1", 40000),
            dst: taddr6("64:ff9b::cb00:7107", 53),
            proto: Protocol::Udp,
        }
    }

    #[test]
    fn invalid_settings_rejected() {
        let settings = BibSettings {
            udp_timeout_secs: 1,
            ..BibSettings::default()
        };
        let sink = Arc::new(RecordingSink::new());
        assert!(TranslatorDb::new(settings, sink, Arc::new(NoopMetrics)).is_err());
    }

    #[test]
    fn outbound_then_find_roundtrip() {
        let (db, _) = db();
        let mut masks = pool();
        let entries = db
            .add6(&udp6(), &mut masks, taddr4("203.0.113.7", 53))
            .unwrap();

        let found = db.find6(Protocol::Udp, &taddr6("2001:db8::1", 40000)).unwrap();
        assert_eq!(found.bib, entries.bib);
        assert!(found.session.is_none());

        let found = db.find4(Protocol::Udp, &entries.bib.src4).unwrap();
        assert_eq!(found.bib, entries.bib);
        assert!(db.find6(Protocol::Tcp, &taddr6("2001:db8::1", 40000)).is_err());
    }

    #[test]
    fn tables_are_per_protocol() {
        let (db, _) = db();
        let mut masks = pool();
        db.add6(&udp6(), &mut masks, taddr4("203.0.113.7", 53))
            .unwrap();
        assert_eq!(db.stats(Protocol::Udp).sessions, 1);
        assert_eq!(db.stats(Protocol::Tcp).sessions, 0);
        assert_eq!(db.stats(Protocol::Icmp).sessions, 0);
    }

    #[test]
    fn tcp_so_storage_then_expiry_emits_icmp() {
        let (db, sink) = db();
        let tuple4 = FlowTuple4 {
            src: taddr4("203.0.113.7", 1234),
            dst: taddr4("192.0.2.1", 1000),
            proto: Protocol::Tcp,
        };
        let pkt = Packet::new(vec![0u8; 60], SegmentFlags::SYN);
        let verdict = db
            .add_tcp4(&tuple4, taddr6("64:ff9b::cb00:7107", 1234), pkt)
            .unwrap();
        assert!(matches!(verdict, Tcp4Verdict::Stored));
        assert_eq!(db.stats(Protocol::Tcp).stored_pkts, 1);

        // Seven virtual seconds later the stored SYN is answered.
        db.clean_at(db.now_ms() + 7_000);
        assert_eq!(sink.icmp_count(), 1);
        assert_eq!(db.stats(Protocol::Tcp).stored_pkts, 0);
    }

    #[test]
    fn concurrent_outbound_flows_allocate_distinct_masks() {
        let (db, _) = db();
        let threads: Vec<_> = (0..2u16)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    let tuple6 = FlowTuple6 {
                        src: taddr6("2001:db8::1", 41000 + i),
                        dst: taddr6("64:ff9b::cb00:7107", 53),
                        proto: Protocol::Udp,
                    };
                    let mut masks = pool();
                    db.add6(&tuple6, &mut masks, taddr4("203.0.113.7", 53))
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_ne!(results[0].bib.src4, results[1].bib.src4);
        assert_eq!(db.stats(Protocol::Udp).bibs, 2);
    }

    #[test]
    fn admin_flow() {
        let (db, _) = db();
        db.add_static(
            Protocol::Tcp,
            taddr6("2001:db8::1", 40000),
            taddr4("192.0.2.1", 1000),
        )
        .unwrap();
        assert_eq!(db.list_bib(Protocol::Tcp, None, 10).len(), 1);

        let entry = db.list_bib(Protocol::Tcp, None, 10)[0];
        db.remove(&entry).unwrap();
        assert!(db.remove(&entry).is_err());
        assert_eq!(db.stats(Protocol::Tcp).bibs, 0);
    }

    #[test]
    fn flush_all_covers_every_table() {
        let (db, _) = db();
        let mut masks = pool();
        db.add6(&udp6(), &mut masks, taddr4("203.0.113.7", 53))
            .unwrap();
        db.add_static(
            Protocol::Tcp,
            taddr6("2001:db8::1", 40000),
            taddr4("192.0.2.1", 1000),
        )
        .unwrap();
        assert_eq!(db.flush_all(), 2);
        assert_eq!(db.stats(Protocol::Udp).bibs, 0);
        assert_eq!(db.stats(Protocol::Tcp).bibs, 0);
    }

    #[test]
    fn remove_range_reports_count() {
        let (db, _) = db();
        let mut masks = pool();
        db.add6(&udp6(), &mut masks, taddr4("203.0.113.7", 53))
            .unwrap();
        let removed = db.remove_range(
            Protocol::Udp,
            Ipv4Prefix::new("192.0.2.0".parse().unwrap(), 24).unwrap(),
            PortRange::new(1000, 1001),
        );
        assert_eq!(removed, 1);
    }

    #[test]
    fn import_lands_in_right_table() {
        let (db, _) = db();
        let entry = SessionEntry {
            src6: taddr6("2001:db8::7", 50000),
            dst6: taddr6("64:ff9b::cb00:7107", 443),
            src4: taddr4("192.0.2.1", 1001),
            dst4: taddr4("203.0.113.7", 443),
            proto: Protocol::Tcp,
            state: domain::bib::entity::TcpState::Established,
            timer: domain::bib::entity::SessionTimer::Est,
            update_time: 0,
            timeout: 0,
            has_stored: false,
        };
        db.import_session(&entry).unwrap();
        assert_eq!(db.stats(Protocol::Tcp).sessions, 1);
        assert_eq!(db.stats(Protocol::Udp).sessions, 0);
    }
}
