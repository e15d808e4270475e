use domain::bib::entity::{Packet, SessionEntry};

/// Secondary port for packets the session database originates on its own:
/// liveness probes for idle TCP sessions and ICMP errors answering stored
/// packets whose handshake never completed.
///
/// Implementations do the actual header construction and transmission. The
/// database guarantees it never calls this while holding a table lock.
pub trait PacketSinkPort: Send + Sync {
    /// Send an empty ACK toward `session`'s IPv6 endpoint, spoofed from the
    /// v6 view of its peer (RFC 6146 page 30).
    fn send_tcp_probe(&self, session: &SessionEntry);

    /// Answer `pkt`'s sender with ICMP Port Unreachable.
    fn send_icmp_port_unreachable(&self, pkt: Packet);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_sink_port_is_object_safe() {
        fn _check(port: &dyn PacketSinkPort) {
            let _ = port;
        }
    }
}
