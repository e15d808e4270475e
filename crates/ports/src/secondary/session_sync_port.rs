use domain::common::error::DomainError;

/// Secondary port for shipping session-sync frames to the peer translator
/// instances (typically one multicast datagram per frame).
pub trait SessionSyncPort: Send + Sync {
    fn publish(&self, frame: &[u8]) -> Result<(), DomainError>;
}
