#![no_main]

use libfuzzer_sys::fuzz_target;

use domain::bib::entity::{Direction, SegmentFlags, TcpState};
use domain::bib::state_machine::{expire_established, expire_transitory, transition, Fate};
use domain::common::entity::Protocol;

// Fuzz the TCP state machine: arbitrary state/direction/flag sequences must
// stay total, never yield expiration-only fates from packet input, and the
// reachable state set must stay closed under transitions.
//
// Layout: each byte encodes one step.
//   bits 0-2 = flags (syn/fin/rst), bit 3 = direction, bit 4 = config flag,
//   bits 5-7 = occasionally reseed the state.
fuzz_target!(|data: &[u8]| {
    let mut state = TcpState::V6Init;

    for &byte in data {
        if byte >> 5 == 7 {
            // Reseed so deep states get coverage too.
            state = TcpState::from_u8(byte & 0x07).unwrap_or(TcpState::Established);
            continue;
        }

        let flags = SegmentFlags {
            syn: byte & 0x01 != 0,
            fin: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
        };
        let dir = if byte & 0x08 != 0 {
            Direction::FromV4
        } else {
            Direction::FromV6
        };
        let cfg = byte & 0x10 != 0;

        let tr = transition(state, dir, flags, cfg);
        assert!(
            !matches!(tr.fate, Fate::ProbeTrans | Fate::TimerSlow(_) | Fate::Rm),
            "packet transition produced fate {:?}",
            tr.fate
        );
        // clear_stored only fires when the v4-wait handshake completes.
        if tr.clear_stored {
            assert_eq!(state, TcpState::V4Init);
            assert_eq!(tr.state, TcpState::Established);
        }
        state = tr.state;

        // Expiration fates stay sane from every reachable state.
        for proto in [Protocol::Tcp, Protocol::Udp, Protocol::Icmp] {
            let tr = expire_established(proto, state);
            assert!(matches!(
                tr.fate,
                Fate::Rm | Fate::ProbeTrans | Fate::TimerTrans
            ));
        }
        assert!(matches!(expire_transitory(state).fate, Fate::Rm));
    }
});
