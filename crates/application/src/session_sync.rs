//! Cross-instance session synchronization ("active/backup translators").
//!
//! Exports queue session snapshots as they change and ship them in fixed
//! frames; imports decode peer frames and insert the sessions with their
//! own timestamps, which is why the table's import path sorts instead of
//! appending.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use domain::bib::entity::SessionEntry;
use domain::common::error::DomainError;
use domain::sync::record::{self, SyncFrame};
use ports::secondary::metrics_port::NatMetrics;
use ports::secondary::session_sync_port::SessionSyncPort;

use crate::translator_db::TranslatorDb;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Ship a frame as soon as anything is queued, instead of waiting for
    /// the deadline.
    pub flush_asap: bool,
    /// How long a queued snapshot may wait before it is shipped anyway.
    pub deadline: Duration,
    /// Queued snapshots beyond this are dropped oldest-first.
    pub capacity: usize,
    /// Frame payload budget, bytes.
    pub max_payload: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_asap: true,
            deadline: Duration::from_millis(2000),
            capacity: 512,
            max_payload: record::DEFAULT_MAX_PAYLOAD,
        }
    }
}

pub struct SessionSyncService {
    port: Arc<dyn SessionSyncPort>,
    metrics: Arc<dyn NatMetrics>,
    cfg: SyncConfig,
    queue: Mutex<VecDeque<SessionEntry>>,
}

impl SessionSyncService {
    pub fn new(
        port: Arc<dyn SessionSyncPort>,
        metrics: Arc<dyn NatMetrics>,
        cfg: SyncConfig,
    ) -> Self {
        Self {
            port,
            metrics,
            cfg,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue
            .lock()
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Queue one snapshot for the peers. Oldest entries give way when the
    /// queue is full; a stale snapshot is worthless anyway.
    pub fn enqueue(&self, entry: &SessionEntry, now_ms: u64) {
        {
            let Ok(mut queue) = self.queue.lock() else { return };
            if queue.len() >= self.cfg.capacity {
                queue.pop_front();
                debug!("session sync queue full; dropping the oldest snapshot");
            }
            queue.push_back(*entry);
        }
        if self.cfg.flush_asap {
            self.flush(now_ms);
        }
    }

    /// Drain the queue into as many frames as it takes.
    pub fn flush(&self, now_ms: u64) {
        loop {
            let mut frame = SyncFrame::new(self.cfg.max_payload);
            {
                let Ok(mut queue) = self.queue.lock() else { return };
                while !frame.is_full() {
                    let Some(entry) = queue.pop_front() else { break };
                    frame.push(&entry, now_ms);
                }
            }
            if frame.is_empty() {
                return;
            }
            if let Err(e) = self.port.publish(&frame.finish()) {
                warn!("failed to publish a session sync frame: {e}");
                return;
            }
            self.metrics.inc_sync_frames();
        }
    }

    /// Decode a peer's frame and adopt its sessions. Returns how many were
    /// taken; individual conflicts are logged and skipped rather than
    /// aborting the rest of the frame.
    pub fn import(
        &self,
        db: &TranslatorDb,
        frame: &[u8],
        now_ms: u64,
    ) -> Result<usize, DomainError> {
        let entries = record::decode_frame(frame, now_ms)?;
        let mut taken = 0;
        for entry in &entries {
            match db.import_session(entry) {
                Ok(()) => taken += 1,
                Err(e) => warn!("skipping a synced session ({}): {e}", entry),
            }
        }
        Ok(taken)
    }

    /// Flush on the configured deadline until cancelled. Only needed when
    /// `flush_asap` is off (or as a safety net when publishing fails).
    pub async fn run(self: Arc<Self>, db: Arc<TranslatorDb>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.cfg.deadline);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.flush(db.uptime_ms());
                }
            }
        }
    }
}
