use domain::common::entity::Protocol;

/// Metrics recorded by the translator database. All methods default to
/// no-ops so tests and minimal deployments can ignore the ones they do not
/// export.
pub trait NatMetrics: Send + Sync {
    fn set_bib_count(&self, proto: Protocol, count: u64) {
        let _ = (proto, count);
    }

    fn set_session_count(&self, proto: Protocol, count: u64) {
        let _ = (proto, count);
    }

    fn set_stored_pkt_count(&self, proto: Protocol, count: u64) {
        let _ = (proto, count);
    }

    fn inc_sessions_created(&self, proto: Protocol) {
        let _ = proto;
    }

    fn inc_sessions_removed(&self, proto: Protocol, n: u64) {
        let _ = (proto, n);
    }

    fn inc_filtering_drops(&self) {}

    fn inc_storage_rejections(&self) {}

    fn inc_pool_exhausted(&self, mark: u32) {
        let _ = mark;
    }

    fn inc_probes_sent(&self) {}

    fn inc_icmp_errors_sent(&self) {}

    fn inc_sync_frames(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_metrics_is_object_safe() {
        struct Noop;
        impl NatMetrics for Noop {}
        let port: &dyn NatMetrics = &Noop;
        port.inc_sessions_created(Protocol::Tcp);
    }
}
