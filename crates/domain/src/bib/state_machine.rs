//! The TCP session state machine of RFC 6146 section 3.5.2, as a pure
//! transition function. The table invokes it under its lock whenever a
//! packet lands on an existing session; expiration fates live here too so
//! every state decision reads from one place.

use super::entity::{Direction, SegmentFlags, SessionTimer, TcpState};
use crate::common::entity::Protocol;

/// What should happen to a session after a packet or a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    /// Refresh on the established list.
    TimerEst,
    /// Refresh on the transitory list.
    TimerTrans,
    /// Send a liveness probe to the IPv6 endpoint, then wait on the
    /// transitory list. Expiration-only.
    ProbeTrans,
    /// Remove the session (cascading into the BIB entry when it goes
    /// sessionless and is not static). A stored packet, if any, is answered
    /// with an ICMP error.
    Rm,
    /// Leave state, timer and timestamp untouched.
    Preserve,
    /// Re-file on the given timer list honoring an externally supplied
    /// timestamp. Used by the session sync import path.
    TimerSlow(SessionTimer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: TcpState,
    pub fate: Fate,
    /// Discard the session's stored packet, if it still has one. Set when
    /// the handshake the packet was waiting for completes.
    pub clear_stored: bool,
}

impl Transition {
    fn new(state: TcpState, fate: Fate) -> Self {
        Self { state, fate, clear_stored: false }
    }

    fn clearing_stored(state: TcpState, fate: Fate) -> Self {
        Self { state, fate, clear_stored: true }
    }
}

/// Advance a live TCP session on packet arrival.
///
/// The CLOSED pseudo-state is not handled here; a packet with no session is
/// the find-or-insert path's business.
pub fn transition(
    state: TcpState,
    dir: Direction,
    flags: SegmentFlags,
    handle_fin_rcv_rst: bool,
) -> Transition {
    use Direction::{FromV4, FromV6};
    use TcpState as S;

    match state {
        S::V6Init => match (dir, flags) {
            (FromV4, f) if f.syn => Transition::new(S::Established, Fate::TimerEst),
            (FromV6, f) if f.syn => Transition::new(S::V6Init, Fate::TimerTrans),
            _ => Transition::new(state, Fate::Preserve),
        },
        S::V4Init => match (dir, flags) {
            // The v6 answer arrived; if a type 2 packet was being held for
            // this handshake it is no longer needed.
            (FromV6, f) if f.syn => {
                Transition::clearing_stored(S::Established, Fate::TimerEst)
            }
            _ => Transition::new(state, Fate::Preserve),
        },
        S::Established => {
            if flags.fin {
                match dir {
                    FromV6 => Transition::new(S::V6FinRcv, Fate::Preserve),
                    FromV4 => Transition::new(S::V4FinRcv, Fate::Preserve),
                }
            } else if flags.rst {
                Transition::new(S::Trans, Fate::TimerTrans)
            } else {
                Transition::new(S::Established, Fate::TimerEst)
            }
        }
        S::V4FinRcv => match (dir, flags) {
            (FromV6, f) if f.fin => {
                Transition::new(S::V4FinV6FinRcv, Fate::TimerTrans)
            }
            (_, f) if f.rst && handle_fin_rcv_rst => {
                Transition::new(S::Trans, Fate::TimerTrans)
            }
            _ => Transition::new(state, Fate::TimerEst),
        },
        S::V6FinRcv => match (dir, flags) {
            (FromV4, f) if f.fin => {
                Transition::new(S::V4FinV6FinRcv, Fate::TimerTrans)
            }
            (_, f) if f.rst && handle_fin_rcv_rst => {
                Transition::new(S::Trans, Fate::TimerTrans)
            }
            _ => Transition::new(state, Fate::TimerEst),
        },
        S::V4FinV6FinRcv => Transition::new(state, Fate::Preserve),
        S::Trans => {
            if flags.rst {
                Transition::new(state, Fate::Preserve)
            } else {
                Transition::new(S::Established, Fate::TimerEst)
            }
        }
    }
}

/// Decide a session's fate when its established timer runs out.
pub fn expire_established(proto: Protocol, state: TcpState) -> Transition {
    match proto {
        // An idle established connection gets one probe before the
        // transitory countdown starts; everything else on the list is
        // already winding down.
        Protocol::Tcp if state == TcpState::Established => {
            Transition::new(TcpState::Trans, Fate::ProbeTrans)
        }
        Protocol::Tcp => Transition::new(TcpState::Trans, Fate::TimerTrans),
        _ => Transition::new(state, Fate::Rm),
    }
}

/// Transitory and SYN-wait expirations always kill the session.
pub fn expire_transitory(state: TcpState) -> Transition {
    Transition::new(state, Fate::Rm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use Direction::{FromV4, FromV6};

    fn t(state: TcpState, dir: Direction, flags: SegmentFlags) -> Transition {
        transition(state, dir, flags, false)
    }

    // ── Handshake ─────────────────────────────────────────────────

    #[test]
    fn v6_init_completes_on_v4_syn() {
        let tr = t(TcpState::V6Init, FromV4, SegmentFlags::SYN);
        assert_eq!(tr.state, TcpState::Established);
        assert_eq!(tr.fate, Fate::TimerEst);
        assert!(!tr.clear_stored);
    }

    #[test]
    fn v6_init_syn_retransmit_refreshes_trans() {
        let tr = t(TcpState::V6Init, FromV6, SegmentFlags::SYN);
        assert_eq!(tr.state, TcpState::V6Init);
        assert_eq!(tr.fate, Fate::TimerTrans);
    }

    #[test]
    fn v6_init_stray_data_preserved() {
        let tr = t(TcpState::V6Init, FromV4, SegmentFlags::NONE);
        assert_eq!(tr.fate, Fate::Preserve);
    }

    #[test]
    fn v4_init_completes_on_v6_syn_and_clears_stored() {
        let tr = t(TcpState::V4Init, FromV6, SegmentFlags::SYN);
        assert_eq!(tr.state, TcpState::Established);
        assert_eq!(tr.fate, Fate::TimerEst);
        assert!(tr.clear_stored);
    }

    #[test]
    fn v4_init_v4_syn_retransmit_preserved() {
        let tr = t(TcpState::V4Init, FromV4, SegmentFlags::SYN);
        assert_eq!(tr.state, TcpState::V4Init);
        assert_eq!(tr.fate, Fate::Preserve);
    }

    // ── Established ───────────────────────────────────────────────

    #[test]
    fn established_data_refreshes_est() {
        let tr = t(TcpState::Established, FromV6, SegmentFlags::NONE);
        assert_eq!(tr.state, TcpState::Established);
        assert_eq!(tr.fate, Fate::TimerEst);
    }

    #[test]
    fn established_fin_starts_teardown() {
        let tr = t(TcpState::Established, FromV6, SegmentFlags::FIN);
        assert_eq!(tr.state, TcpState::V6FinRcv);
        assert_eq!(tr.fate, Fate::Preserve);

        let tr = t(TcpState::Established, FromV4, SegmentFlags::FIN);
        assert_eq!(tr.state, TcpState::V4FinRcv);
    }

    #[test]
    fn established_rst_goes_transitory() {
        let tr = t(TcpState::Established, FromV4, SegmentFlags::RST);
        assert_eq!(tr.state, TcpState::Trans);
        assert_eq!(tr.fate, Fate::TimerTrans);
    }

    // ── Teardown ──────────────────────────────────────────────────

    #[test]
    fn both_fins_go_transitory() {
        let tr = t(TcpState::V4FinRcv, FromV6, SegmentFlags::FIN);
        assert_eq!(tr.state, TcpState::V4FinV6FinRcv);
        assert_eq!(tr.fate, Fate::TimerTrans);

        let tr = t(TcpState::V6FinRcv, FromV4, SegmentFlags::FIN);
        assert_eq!(tr.state, TcpState::V4FinV6FinRcv);
        assert_eq!(tr.fate, Fate::TimerTrans);
    }

    #[test]
    fn half_closed_data_still_refreshes_est() {
        let tr = t(TcpState::V4FinRcv, FromV4, SegmentFlags::NONE);
        assert_eq!(tr.state, TcpState::V4FinRcv);
        assert_eq!(tr.fate, Fate::TimerEst);
    }

    #[test]
    fn fin_rcv_rst_ignored_by_default() {
        let tr = t(TcpState::V4FinRcv, FromV4, SegmentFlags::RST);
        assert_eq!(tr.state, TcpState::V4FinRcv);
        assert_eq!(tr.fate, Fate::TimerEst);
    }

    #[test]
    fn fin_rcv_rst_honored_when_enabled() {
        let tr = transition(TcpState::V6FinRcv, FromV4, SegmentFlags::RST, true);
        assert_eq!(tr.state, TcpState::Trans);
        assert_eq!(tr.fate, Fate::TimerTrans);
    }

    #[test]
    fn fin_fin_state_preserved() {
        let tr = t(TcpState::V4FinV6FinRcv, FromV6, SegmentFlags::NONE);
        assert_eq!(tr.fate, Fate::Preserve);
    }

    // ── Trans ─────────────────────────────────────────────────────

    #[test]
    fn trans_revived_by_data() {
        let tr = t(TcpState::Trans, FromV6, SegmentFlags::NONE);
        assert_eq!(tr.state, TcpState::Established);
        assert_eq!(tr.fate, Fate::TimerEst);
    }

    #[test]
    fn trans_rst_stays_put() {
        let tr = t(TcpState::Trans, FromV4, SegmentFlags::RST);
        assert_eq!(tr.state, TcpState::Trans);
        assert_eq!(tr.fate, Fate::Preserve);
    }

    // ── Expiration fates ──────────────────────────────────────────

    #[test]
    fn tcp_established_expiry_probes() {
        let tr = expire_established(Protocol::Tcp, TcpState::Established);
        assert_eq!(tr.state, TcpState::Trans);
        assert_eq!(tr.fate, Fate::ProbeTrans);
    }

    #[test]
    fn tcp_half_closed_expiry_downgrades_without_probe() {
        let tr = expire_established(Protocol::Tcp, TcpState::V4FinRcv);
        assert_eq!(tr.state, TcpState::Trans);
        assert_eq!(tr.fate, Fate::TimerTrans);
    }

    #[test]
    fn udp_icmp_expiry_removes() {
        assert_eq!(
            expire_established(Protocol::Udp, TcpState::Established).fate,
            Fate::Rm
        );
        assert_eq!(
            expire_established(Protocol::Icmp, TcpState::Established).fate,
            Fate::Rm
        );
    }

    #[test]
    fn transitory_expiry_removes() {
        assert_eq!(expire_transitory(TcpState::Trans).fate, Fate::Rm);
        assert_eq!(expire_transitory(TcpState::V4Init).fate, Fate::Rm);
    }

    // ── Totality ──────────────────────────────────────────────────

    #[test]
    fn transition_is_total() {
        for n in 0..=6 {
            let state = TcpState::from_u8(n).unwrap();
            for dir in [FromV6, FromV4] {
                for syn in [false, true] {
                    for fin in [false, true] {
                        for rst in [false, true] {
                            for cfg in [false, true] {
                                let tr = transition(
                                    state,
                                    dir,
                                    SegmentFlags { syn, fin, rst },
                                    cfg,
                                );
                                // Packet-driven transitions never yield
                                // expiration-only or import-only fates.
                                assert!(!matches!(
                                    tr.fate,
                                    Fate::ProbeTrans | Fate::TimerSlow(_) | Fate::Rm
                                ));
                            }
                        }
                    }
                }
            }
        }
    }
}
