//! Wire format for cross-instance session synchronization.
//!
//! Sessions travel as fixed-size 64-byte records packed into frames. A
//! frame is one datagram; its default capacity is tuned so a full frame
//! fits a typical MTU (1500 minus the worst-case IP header minus UDP).
//!
//! Timestamps do not survive a host boundary, so records carry the
//! session's *age* instead; the importer rebases it onto its own clock.

use crate::bib::entity::{SessionEntry, SessionTimer, TcpState};
use crate::common::entity::{Protocol, TransportAddr4, TransportAddr6};

use super::error::SyncError;

pub const FRAME_MAGIC: [u8; 4] = *b"NS64";
pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;
pub const RECORD_LEN: usize = 64;

/// Default frame payload budget: one typical MTU's worth.
pub const DEFAULT_MAX_PAYLOAD: usize = 1452;

/// How many records fit a frame with the given payload budget.
pub fn records_per_frame(max_payload: usize) -> usize {
    max_payload.saturating_sub(HEADER_LEN) / RECORD_LEN
}

/// Encode one session snapshot at `now_ms` into its 64-byte record.
///
/// Layout (big-endian):
/// ```text
///  0..16   src6 address        16..32  dst6 address
/// 32..36   src4 address        36..40  dst4 address
/// 40..48   src6/dst6/src4/dst4 ports, 2 bytes each
/// 48..52   age (ms)
/// 52       protocol            53      state
/// 54       timer               55      flags (bit 0: stored)
/// 56..64   reserved, zero
/// ```
pub fn encode_record(entry: &SessionEntry, now_ms: u64) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0..16].copy_from_slice(&entry.src6.addr.octets());
    buf[16..32].copy_from_slice(&entry.dst6.addr.octets());
    buf[32..36].copy_from_slice(&entry.src4.addr.octets());
    buf[36..40].copy_from_slice(&entry.dst4.addr.octets());
    buf[40..42].copy_from_slice(&entry.src6.port.to_be_bytes());
    buf[42..44].copy_from_slice(&entry.dst6.port.to_be_bytes());
    buf[44..46].copy_from_slice(&entry.src4.port.to_be_bytes());
    buf[46..48].copy_from_slice(&entry.dst4.port.to_be_bytes());
    let age = u32::try_from(now_ms.saturating_sub(entry.update_time)).unwrap_or(u32::MAX);
    buf[48..52].copy_from_slice(&age.to_be_bytes());
    buf[52] = entry.proto.to_u8();
    buf[53] = entry.state.to_u8();
    buf[54] = entry.timer.to_u8();
    buf[55] = u8::from(entry.has_stored);
    buf
}

/// Decode one record, rebasing its age onto `now_ms`.
pub fn decode_record(
    buf: &[u8],
    now_ms: u64,
    index: usize,
) -> Result<SessionEntry, SyncError> {
    if buf.len() < RECORD_LEN {
        return Err(SyncError::Truncated {
            got: buf.len(),
            need: RECORD_LEN,
        });
    }
    let bad = |reason| SyncError::BadRecord { index, reason };

    let mut addr6 = [0u8; 16];
    addr6.copy_from_slice(&buf[0..16]);
    let src6_addr = std::net::Ipv6Addr::from(addr6);
    addr6.copy_from_slice(&buf[16..32]);
    let dst6_addr = std::net::Ipv6Addr::from(addr6);
    let mut addr4 = [0u8; 4];
    addr4.copy_from_slice(&buf[32..36]);
    let src4_addr = std::net::Ipv4Addr::from(addr4);
    addr4.copy_from_slice(&buf[36..40]);
    let dst4_addr = std::net::Ipv4Addr::from(addr4);

    let port = |range: std::ops::Range<usize>| {
        u16::from_be_bytes([buf[range.start], buf[range.start + 1]])
    };
    let age = u32::from_be_bytes([buf[48], buf[49], buf[50], buf[51]]);

    let proto = Protocol::from_u8(buf[52]).ok_or_else(|| bad("unknown protocol"))?;
    let state = TcpState::from_u8(buf[53]).ok_or_else(|| bad("unknown state"))?;
    let timer = SessionTimer::from_u8(buf[54]).ok_or_else(|| bad("unknown timer"))?;

    Ok(SessionEntry {
        src6: TransportAddr6::new(src6_addr, port(40..42)),
        dst6: TransportAddr6::new(dst6_addr, port(42..44)),
        src4: TransportAddr4::new(src4_addr, port(44..46)),
        dst4: TransportAddr4::new(dst4_addr, port(46..48)),
        proto,
        state,
        timer,
        update_time: now_ms.saturating_sub(u64::from(age)),
        timeout: 0,
        has_stored: buf[55] & 1 != 0,
    })
}

/// Builder for one outgoing frame.
#[derive(Debug)]
pub struct SyncFrame {
    buf: Vec<u8>,
    count: usize,
    capacity: usize,
}

impl SyncFrame {
    pub fn new(max_payload: usize) -> Self {
        // The header's count field is one byte.
        let capacity = records_per_frame(max_payload).min(255);
        let mut buf = Vec::with_capacity(HEADER_LEN + capacity * RECORD_LEN);
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.push(FRAME_VERSION);
        buf.push(0); // record count, patched on finish
        buf.extend_from_slice(&[0u8; 10]);
        Self { buf, count: 0, capacity }
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Append a record; false when the frame has no room left.
    pub fn push(&mut self, entry: &SessionEntry, now_ms: u64) -> bool {
        if self.is_full() {
            return false;
        }
        self.buf.extend_from_slice(&encode_record(entry, now_ms));
        self.count += 1;
        true
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf[5] = self.count as u8;
        self.buf
    }
}

/// Decode a whole frame into session snapshots.
pub fn decode_frame(frame: &[u8], now_ms: u64) -> Result<Vec<SessionEntry>, SyncError> {
    if frame.len() < HEADER_LEN {
        return Err(SyncError::Truncated {
            got: frame.len(),
            need: HEADER_LEN,
        });
    }
    if frame[0..4] != FRAME_MAGIC {
        return Err(SyncError::BadMagic);
    }
    if frame[4] != FRAME_VERSION {
        return Err(SyncError::BadVersion(frame[4]));
    }
    let declared = frame[5] as usize;
    let carried = (frame.len() - HEADER_LEN) / RECORD_LEN;
    if declared != carried || (frame.len() - HEADER_LEN) % RECORD_LEN != 0 {
        return Err(SyncError::CountMismatch { declared, carried });
    }
    (0..declared)
        .map(|i| {
            let start = HEADER_LEN + i * RECORD_LEN;
            decode_record(&frame[start..start + RECORD_LEN], now_ms, i)
        })
        .collect()
}
