//! Per-session counters and status snapshots.
//!
//! Pumps bump these on the fast path with relaxed atomics; the state
//! machine and registry read them for periodic status snapshots. No
//! per-frame error ever propagates — the counters are the record.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Counters for one session's forwarding pipeline.
#[derive(Default)]
pub struct TunnelStats {
    /// Ethernet frames sent on the data path.
    pub tx_frames: AtomicU64,
    /// Payload bytes sent.
    pub tx_bytes: AtomicU64,
    /// Ethernet frames delivered to the device.
    pub rx_frames: AtomicU64,
    /// Payload bytes delivered.
    pub rx_bytes: AtomicU64,
    /// Outbound frames dropped on transient send errors.
    pub drop_send: AtomicU64,
    /// Inbound datagrams dropped by the framing codec.
    pub drop_rx_bad: AtomicU64,
    /// Inbound frames rejected by the replay window.
    pub drop_replay: AtomicU64,
    /// Inbound frames failing AEAD authentication.
    pub drop_auth: AtomicU64,
    /// Decrypted frames dropped because the device would block.
    pub drop_write: AtomicU64,
    /// Consecutive heartbeat misses.
    pub heartbeat_misses: AtomicU32,
    /// Smoothed round-trip time in nanoseconds (0 = no sample yet).
    pub srtt_ns: AtomicU64,
}

impl TunnelStats {
    /// Fresh zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an RTT sample into the smoothed estimate (7/8 old, 1/8 new).
    pub fn record_rtt_sample(&self, sample_ns: u64) {
        let old = self.srtt_ns.load(Ordering::Relaxed);
        let smoothed = if old == 0 {
            sample_ns
        } else {
            old - old / 8 + sample_ns / 8
        };
        self.srtt_ns.store(smoothed, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            drop_send: self.drop_send.load(Ordering::Relaxed),
            drop_rx_bad: self.drop_rx_bad.load(Ordering::Relaxed),
            drop_replay: self.drop_replay.load(Ordering::Relaxed),
            drop_auth: self.drop_auth.load(Ordering::Relaxed),
            drop_write: self.drop_write.load(Ordering::Relaxed),
            heartbeat_misses: self.heartbeat_misses.load(Ordering::Relaxed),
            srtt_ns: self.srtt_ns.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`TunnelStats`] for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Ethernet frames sent on the data path.
    pub tx_frames: u64,
    /// Payload bytes sent.
    pub tx_bytes: u64,
    /// Ethernet frames delivered to the device.
    pub rx_frames: u64,
    /// Payload bytes delivered.
    pub rx_bytes: u64,
    /// Outbound frames dropped on transient send errors.
    pub drop_send: u64,
    /// Inbound datagrams dropped by the framing codec.
    pub drop_rx_bad: u64,
    /// Inbound frames rejected by the replay window.
    pub drop_replay: u64,
    /// Inbound frames failing AEAD authentication.
    pub drop_auth: u64,
    /// Decrypted frames dropped because the device would block.
    pub drop_write: u64,
    /// Consecutive heartbeat misses.
    pub heartbeat_misses: u32,
    /// Smoothed round-trip time in nanoseconds.
    pub srtt_ns: u64,
}
