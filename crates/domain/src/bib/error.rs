use thiserror::Error;

use super::entity::BibEntry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BibError {
    /// Lookup miss: no binding (4-to-6), no entry (`find`), or nothing to
    /// remove.
    #[error("no such entry")]
    NotFound,

    /// A static add collided with a different existing mapping.
    #[error("entry already exists: {0}")]
    AlreadyExists(BibEntry),

    /// The mask domain ran out of candidate transport addresses.
    #[error("no transport address available (pool4 mark {mark})")]
    AddressExhausted { mark: u32 },

    /// Refused by address-dependent filtering or the external-TCP policy.
    #[error("filtering policy forbids this flow")]
    Forbidden,

    /// The stored-packet budget is spent.
    #[error("packet storage is full")]
    QueueFull,

    /// A packet for the same flow is already waiting for its peer.
    #[error("a packet for this flow is already stored")]
    AlreadyStored,

    /// A new mapping was required but no mask domain was supplied.
    #[error("a mask domain is required to allocate a new binding")]
    MissingMasks,

    /// The translated address disagrees with the pool6 prefix.
    #[error("translated address does not match the pool6 prefix")]
    PrefixMismatch,

    #[error("unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("invalid settings: {field}: {reason}")]
    InvalidSettings {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render() {
        assert_eq!(format!("{}", BibError::NotFound), "no such entry");
        assert_eq!(
            format!("{}", BibError::AddressExhausted { mark: 7 }),
            "no transport address available (pool4 mark 7)"
        );
        assert_eq!(
            format!("{}", BibError::UnsupportedProtocol(47)),
            "unsupported transport protocol 47"
        );
    }
}
