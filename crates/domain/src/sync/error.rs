use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("frame too short: {got} bytes, need at least {need}")]
    Truncated { got: usize, need: usize },

    #[error("bad frame magic")]
    BadMagic,

    #[error("unsupported frame version {0}")]
    BadVersion(u8),

    #[error("frame declares {declared} records but carries {carried}")]
    CountMismatch { declared: usize, carried: usize },

    #[error("record {index}: {reason}")]
    BadRecord { index: usize, reason: &'static str },
}
