use thiserror::Error;

use crate::bib::error::BibError;
use crate::sync::error::SyncError;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("session database error: {0}")]
    Bib(#[from] BibError),

    #[error("session sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("engine error: {0}")]
    EngineError(String),
}
