use std::time::Duration;

// ── Paths ──────────────────────────────────────────────────────────

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nat64d/config.yaml";

// ── Expiration sweeping ────────────────────────────────────────────

/// Default period of the expiration sweeper.
pub const DEFAULT_SWEEP_PERIOD_MS: u64 = 2_000;

/// Floor for the sweep period; matching the clamp the sweeper applies.
pub const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(250);

// ── Session sync ───────────────────────────────────────────────────

pub const DEFAULT_SYNC_DEADLINE_MS: u64 = 2_000;
pub const DEFAULT_SYNC_CAPACITY: usize = 512;
