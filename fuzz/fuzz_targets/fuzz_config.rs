#![no_main]

use libfuzzer_sys::fuzz_target;

use domain::bib::entity::BibSettings;
use domain::common::entity::Pool6Prefix;

// Fuzz the settings layer: arbitrary strings through the prefix parser and
// arbitrary numeric combinations through validation.
fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = s.parse::<Pool6Prefix>();
    }

    if data.len() >= 33 {
        let word = |i: usize| {
            u64::from_le_bytes([
                data[i],
                data[i + 1],
                data[i + 2],
                data[i + 3],
                data[i + 4],
                data[i + 5],
                data[i + 6],
                data[i + 7],
            ])
        };
        let settings = BibSettings {
            tcp_est_timeout_secs: word(0),
            tcp_trans_timeout_secs: word(8),
            udp_timeout_secs: word(16),
            icmp_timeout_secs: word(24),
            max_stored_pkts: data[32] as usize,
            ..BibSettings::default()
        };
        if settings.validate().is_ok() {
            // Valid settings must produce nonzero timeouts everywhere.
            use domain::bib::entity::SessionTimer;
            use domain::common::entity::Protocol;
            for proto in [Protocol::Tcp, Protocol::Udp, Protocol::Icmp] {
                for timer in [SessionTimer::Est, SessionTimer::Trans, SessionTimer::Syn4] {
                    assert!(settings.timeout_ms(proto, timer) > 0);
                }
            }
        }
    }
});
