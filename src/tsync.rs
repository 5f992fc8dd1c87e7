//! Loose per-peer clock synchronization.
//!
//! The first valid packet from a peer captures a one-shot clock offset.
//! Subsequent packets are accepted only while their adjusted send time is
//! no older than the staleness window; future-dated packets pass, since
//! clocks drift forward between offset capture and message arrival.

use crate::error::SudpError;
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest tolerated offset between the two hosts at first contact.
const OFFSET_TOLERANCE_MS: i64 = 10_000;

/// Oldest adjusted send time still accepted.
const MAX_MESSAGE_DELAY_MS: i64 = 5_000;

/// Wall clock in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Captured clock offset for one peer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeSync {
    offset_ms: i64,
}

impl TimeSync {
    /// Capture the offset from the first packet's timestamp. An offset of
    /// 10 s or more means the peer clock is misconfigured and the peer is
    /// rejected until fixed.
    pub fn new(remote_ms: u64) -> Result<Self, SudpError> {
        Self::at(now_ms(), remote_ms)
    }

    fn at(local_ms: u64, remote_ms: u64) -> Result<Self, SudpError> {
        let offset_ms = local_ms as i64 - remote_ms as i64;
        if offset_ms.abs() >= OFFSET_TOLERANCE_MS {
            return Err(SudpError::PeerOutOfSync);
        }
        Ok(Self { offset_ms })
    }

    /// Whether a packet timestamp falls inside the acceptance window.
    pub fn in_window(&self, msg_ms: u64) -> bool {
        self.in_window_at(now_ms(), msg_ms)
    }

    fn in_window_at(&self, local_ms: u64, msg_ms: u64) -> bool {
        let sent = msg_ms as i64 + self.offset_ms;
        sent >= local_ms as i64 - MAX_MESSAGE_DELAY_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_tolerance_boundary() {
        let now = 1_700_000_000_000u64;
        // 9.999 s skew accepted
        assert!(TimeSync::at(now, now - 9_999).is_ok());
        assert!(TimeSync::at(now, now + 9_999).is_ok());
        // exactly 10 s rejected
        assert!(matches!(
            TimeSync::at(now, now - 10_000),
            Err(SudpError::PeerOutOfSync)
        ));
        assert!(matches!(
            TimeSync::at(now, now + 10_000),
            Err(SudpError::PeerOutOfSync)
        ));
    }

    #[test]
    fn staleness_window() {
        let now = 1_700_000_000_000u64;
        let ts = TimeSync::at(now, now).unwrap();
        // exactly 5 s old is still in window, older is not
        assert!(ts.in_window_at(now, now - 5_000));
        assert!(!ts.in_window_at(now, now - 5_001));
        assert!(!ts.in_window_at(now, now - 6_000));
    }

    #[test]
    fn future_dated_accepted() {
        let now = 1_700_000_000_000u64;
        let ts = TimeSync::at(now, now).unwrap();
        assert!(ts.in_window_at(now, now + 3_000));
    }

    #[test]
    fn window_honors_captured_offset() {
        let now = 1_700_000_000_000u64;
        // peer clock runs 4 s behind
        let ts = TimeSync::at(now, now - 4_000).unwrap();
        // a fresh message from that peer carries a 4 s old timestamp
        assert!(ts.in_window_at(now + 1_000, now - 3_000));
        // but one 6 s older than its own clock is stale
        assert!(!ts.in_window_at(now + 1_000, now - 10_000));
    }
}
