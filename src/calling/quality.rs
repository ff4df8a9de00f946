//! Connection quality telemetry.
//!
//! Loss is counted the RFC 3550 way: expected packets are derived from the
//! extended highest sequence number seen, lost = expected - received.

/// One poll of the receive side of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionQualitySample {
    pub packets_lost: u64,
    pub packets_received: u64,
}

impl ConnectionQualitySample {
    /// Fraction of packets lost, 0.0 when nothing was expected yet.
    pub fn loss_ratio(&self) -> f64 {
        let total = self.packets_lost + self.packets_received;
        if total == 0 {
            return 0.0;
        }
        self.packets_lost as f64 / total as f64
    }

    /// Strictly above `threshold` counts as a poor connection.
    pub fn is_poor(&self, threshold: f64) -> bool {
        self.loss_ratio() > threshold
    }

    /// Sum of two samples (e.g. audio and video streams).
    pub fn combine(self, other: Self) -> Self {
        Self {
            packets_lost: self.packets_lost + other.packets_lost,
            packets_received: self.packets_received + other.packets_received,
        }
    }
}

/// Receive counters for one RTP stream (one SSRC).
#[derive(Debug, Clone, Default)]
pub struct LossTracker {
    packets_received: u64,
    base_seq: Option<u64>,
    /// Extended highest sequence number (cycles << 16 | seq).
    highest_seq: u64,
}

impl LossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a received packet with sequence number `seq`.
    pub fn record(&mut self, seq: u16) {
        self.packets_received += 1;

        if self.base_seq.is_none() {
            self.base_seq = Some(seq as u64);
            self.highest_seq = seq as u64;
            return;
        }

        let max = (self.highest_seq & 0xFFFF) as u16;
        let delta = seq.wrapping_sub(max);
        // Forward within half the sequence space; anything else is a
        // duplicate or a late, reordered packet.
        if delta != 0 && delta < 0x8000 {
            let mut cycles = self.highest_seq & !0xFFFF;
            if seq < max {
                cycles += 1 << 16;
            }
            self.highest_seq = cycles | seq as u64;
        }
    }

    pub fn expected(&self) -> u64 {
        match self.base_seq {
            Some(base) => self.highest_seq - base + 1,
            None => 0,
        }
    }

    pub fn sample(&self) -> ConnectionQualitySample {
        ConnectionQualitySample {
            packets_lost: self.expected().saturating_sub(self.packets_received),
            packets_received: self.packets_received,
        }
    }
}
