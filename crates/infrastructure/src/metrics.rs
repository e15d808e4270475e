use prometheus_client::encoding::{EncodeLabelSet, text};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use domain::common::entity::Protocol;
use ports::secondary::metrics_port::NatMetrics;

// ── Label types ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProtoLabels {
    pub proto: String,
}

impl ProtoLabels {
    fn from(proto: Protocol) -> Self {
        Self {
            proto: proto.as_str().to_ascii_lowercase(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MarkLabels {
    pub mark: String,
}

// ── Translator metrics registry ─────────────────────────────────────

/// Prometheus metrics for the translator. Families use interior
/// mutability, so recording only needs `&self`; wrap in `Arc` to share.
pub struct TranslatorMetrics {
    registry: Registry,
    pub bib_entries: Family<ProtoLabels, Gauge>,
    pub sessions: Family<ProtoLabels, Gauge>,
    pub stored_packets: Family<ProtoLabels, Gauge>,
    pub sessions_created_total: Family<ProtoLabels, Counter>,
    pub sessions_removed_total: Family<ProtoLabels, Counter>,
    pub filtering_drops_total: Counter,
    pub storage_rejections_total: Counter,
    pub pool_exhausted_total: Family<MarkLabels, Counter>,
    pub probes_sent_total: Counter,
    pub icmp_errors_sent_total: Counter,
    pub sync_frames_total: Counter,
}

impl TranslatorMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("nat64");

        let bib_entries = Family::<ProtoLabels, Gauge>::default();
        registry.register(
            "bib_entries",
            "Current BIB entries per protocol",
            bib_entries.clone(),
        );

        let sessions = Family::<ProtoLabels, Gauge>::default();
        registry.register("sessions", "Current sessions per protocol", sessions.clone());

        let stored_packets = Family::<ProtoLabels, Gauge>::default();
        registry.register(
            "stored_packets",
            "Packets parked awaiting simultaneous-open resolution",
            stored_packets.clone(),
        );

        let sessions_created_total = Family::<ProtoLabels, Counter>::default();
        registry.register(
            "sessions_created",
            "Sessions created since start",
            sessions_created_total.clone(),
        );

        let sessions_removed_total = Family::<ProtoLabels, Counter>::default();
        registry.register(
            "sessions_removed",
            "Sessions expired or removed since start",
            sessions_removed_total.clone(),
        );

        let filtering_drops_total = Counter::default();
        registry.register(
            "filtering_drops",
            "Inbound flows refused by filtering policy",
            filtering_drops_total.clone(),
        );

        let storage_rejections_total = Counter::default();
        registry.register(
            "storage_rejections",
            "Packets refused because storage was full",
            storage_rejections_total.clone(),
        );

        let pool_exhausted_total = Family::<MarkLabels, Counter>::default();
        registry.register(
            "pool_exhausted",
            "Mask allocation failures per pool4 mark",
            pool_exhausted_total.clone(),
        );

        let probes_sent_total = Counter::default();
        registry.register(
            "probes_sent",
            "TCP liveness probes emitted",
            probes_sent_total.clone(),
        );

        let icmp_errors_sent_total = Counter::default();
        registry.register(
            "icmp_errors_sent",
            "ICMP errors emitted for dead stored packets",
            icmp_errors_sent_total.clone(),
        );

        let sync_frames_total = Counter::default();
        registry.register(
            "sync_frames",
            "Session sync frames published",
            sync_frames_total.clone(),
        );

        Self {
            registry,
            bib_entries,
            sessions,
            stored_packets,
            sessions_created_total,
            sessions_removed_total,
            filtering_drops_total,
            storage_rejections_total,
            pool_exhausted_total,
            probes_sent_total,
            icmp_errors_sent_total,
            sync_frames_total,
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        text::encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

impl Default for TranslatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NatMetrics for TranslatorMetrics {
    fn set_bib_count(&self, proto: Protocol, count: u64) {
        self.bib_entries
            .get_or_create(&ProtoLabels::from(proto))
            .set(count as i64);
    }

    fn set_session_count(&self, proto: Protocol, count: u64) {
        self.sessions
            .get_or_create(&ProtoLabels::from(proto))
            .set(count as i64);
    }

    fn set_stored_pkt_count(&self, proto: Protocol, count: u64) {
        self.stored_packets
            .get_or_create(&ProtoLabels::from(proto))
            .set(count as i64);
    }

    fn inc_sessions_created(&self, proto: Protocol) {
        self.sessions_created_total
            .get_or_create(&ProtoLabels::from(proto))
            .inc();
    }

    fn inc_sessions_removed(&self, proto: Protocol, n: u64) {
        self.sessions_removed_total
            .get_or_create(&ProtoLabels::from(proto))
            .inc_by(n);
    }

    fn inc_filtering_drops(&self) {
        self.filtering_drops_total.inc();
    }

    fn inc_storage_rejections(&self) {
        self.storage_rejections_total.inc();
    }

    fn inc_pool_exhausted(&self, mark: u32) {
        self.pool_exhausted_total
            .get_or_create(&MarkLabels {
                mark: mark.to_string(),
            })
            .inc();
    }

    fn inc_probes_sent(&self) {
        self.probes_sent_total.inc();
    }

    fn inc_icmp_errors_sent(&self) {
        self.icmp_errors_sent_total.inc();
    }

    fn inc_sync_frames(&self) {
        self.sync_frames_total.inc();
    }
}
