use std::sync::Mutex;

use domain::bib::entity::{Packet, SessionEntry};
use domain::common::error::DomainError;

use crate::secondary::metrics_port::NatMetrics;
use crate::secondary::packet_sink_port::PacketSinkPort;
use crate::secondary::session_sync_port::SessionSyncPort;

/// No-op metrics for tests; every method inherits the default body.
pub struct NoopMetrics;

impl NatMetrics for NoopMetrics {}

/// Packet sink that remembers what it was asked to send.
#[derive(Default)]
pub struct RecordingSink {
    pub probes: Mutex<Vec<SessionEntry>>,
    pub icmp_errors: Mutex<Vec<Packet>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn icmp_count(&self) -> usize {
        self.icmp_errors.lock().map(|v| v.len()).unwrap_or(0)
    }
}

impl PacketSinkPort for RecordingSink {
    fn send_tcp_probe(&self, session: &SessionEntry) {
        if let Ok(mut probes) = self.probes.lock() {
            probes.push(*session);
        }
    }

    fn send_icmp_port_unreachable(&self, pkt: Packet) {
        if let Ok(mut errors) = self.icmp_errors.lock() {
            errors.push(pkt);
        }
    }
}

/// Sync publisher that collects frames instead of transmitting them.
#[derive(Default)]
pub struct RecordingSyncPort {
    pub frames: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSyncPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().map(|v| v.len()).unwrap_or(0)
    }
}

impl SessionSyncPort for RecordingSyncPort {
    fn publish(&self, frame: &[u8]) -> Result<(), DomainError> {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(frame.to_vec());
        }
        Ok(())
    }
}
