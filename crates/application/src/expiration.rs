//! Periodic expiration sweeps.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::translator_db::TranslatorDb;

/// Sweeps never run closer together than this, no matter how aggressive
/// the configured period; anything session timers need is coarser anyway.
pub const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(250);

pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(2);

/// Drives [`TranslatorDb::clean`] on a fixed period until cancelled.
pub struct Sweeper {
    db: Arc<TranslatorDb>,
    period: Duration,
}

impl Sweeper {
    pub fn new(db: Arc<TranslatorDb>, period: Duration) -> Self {
        Self {
            db,
            period: period.max(MIN_SWEEP_PERIOD),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("expiration sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.db.clean();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::bib::entity::BibSettings;
    use ports::test_utils::{NoopMetrics, RecordingSink};

    fn db() -> Arc<TranslatorDb> {
        Arc::new(
            TranslatorDb::new(
                BibSettings::default(),
                Arc::new(RecordingSink::new()),
                Arc::new(NoopMetrics),
            )
            .unwrap(),
        )
    }

    #[test]
    fn period_is_clamped() {
        let sweeper = Sweeper::new(db(), Duration::from_millis(1));
        assert_eq!(sweeper.period(), MIN_SWEEP_PERIOD);
        let sweeper = Sweeper::new(db(), Duration::from_secs(5));
        assert_eq!(sweeper.period(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_cancelled() {
        let sweeper = Sweeper::new(db(), Duration::from_secs(1));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(shutdown.clone()));

        // Let a few ticks elapse on virtual time.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
