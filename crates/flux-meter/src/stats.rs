//! Per-block channel statistics and their lock-free publication
//!
//! The producer computes one [`BlockRecord`] per push and publishes it two
//! ways:
//! - into a [`StatsPublisher`], a double-buffered frame flipped by a single
//!   index swap, so the consumer always sees one push's stats for *all*
//!   channels together (never half of one push and half of another);
//! - into a wait-free `rtrb` record queue (owned by the channel), so a
//!   transient that fits entirely between two redraw ticks still registers
//!   its full peak.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::types::MAX_CHANNELS;

/// Linear-domain statistics for one channel of one block.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelStats {
    /// max(|sample|) over the block, post-gain
    pub peak: f32,
    /// sqrt(mean(sample²)) over the block, post-gain
    pub magnitude: f32,
    /// max(|sample|) over the block, pre-gain
    pub input_peak: f32,
}

/// One completed push: stats for every channel plus timing.
#[derive(Debug, Clone, Copy)]
pub struct BlockRecord {
    pub timestamp_ns: u64,
    pub channels: usize,
    pub stats: [ChannelStats; MAX_CHANNELS],
}

impl Default for BlockRecord {
    fn default() -> Self {
        Self {
            timestamp_ns: 0,
            channels: 0,
            stats: [ChannelStats::default(); MAX_CHANNELS],
        }
    }
}

struct FrameCells {
    timestamp_ns: AtomicU64,
    channels: AtomicUsize,
    peak: [AtomicU32; MAX_CHANNELS],
    magnitude: [AtomicU32; MAX_CHANNELS],
    input_peak: [AtomicU32; MAX_CHANNELS],
}

impl FrameCells {
    fn new() -> Self {
        Self {
            timestamp_ns: AtomicU64::new(0),
            channels: AtomicUsize::new(0),
            peak: std::array::from_fn(|_| AtomicU32::new(0)),
            magnitude: std::array::from_fn(|_| AtomicU32::new(0)),
            input_peak: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    fn store(&self, record: &BlockRecord) {
        self.timestamp_ns
            .store(record.timestamp_ns, Ordering::Relaxed);
        self.channels.store(record.channels, Ordering::Relaxed);
        for (ch, stats) in record.stats.iter().enumerate() {
            self.peak[ch].store(stats.peak.to_bits(), Ordering::Relaxed);
            self.magnitude[ch].store(stats.magnitude.to_bits(), Ordering::Relaxed);
            self.input_peak[ch].store(stats.input_peak.to_bits(), Ordering::Relaxed);
        }
    }

    fn load(&self) -> BlockRecord {
        let mut record = BlockRecord {
            timestamp_ns: self.timestamp_ns.load(Ordering::Relaxed),
            channels: self.channels.load(Ordering::Relaxed),
            stats: [ChannelStats::default(); MAX_CHANNELS],
        };
        for (ch, stats) in record.stats.iter_mut().enumerate() {
            stats.peak = f32::from_bits(self.peak[ch].load(Ordering::Relaxed));
            stats.magnitude = f32::from_bits(self.magnitude[ch].load(Ordering::Relaxed));
            stats.input_peak = f32::from_bits(self.input_peak[ch].load(Ordering::Relaxed));
        }
        record
    }
}

/// Double-buffered stats frame published by a single index swap.
///
/// The producer writes the back buffer, then flips `published` with Release
/// ordering; the consumer loads the index with Acquire and reads that frame.
/// If the producer laps the consumer mid-read the copy can tear, but only
/// toward newer values of the same shape, which the consumer tolerates.
pub struct StatsPublisher {
    frames: [FrameCells; 2],
    published: AtomicUsize,
}

impl StatsPublisher {
    pub fn new() -> Self {
        Self {
            frames: [FrameCells::new(), FrameCells::new()],
            published: AtomicUsize::new(0),
        }
    }

    /// Producer side: write the back frame and flip the index.
    pub fn publish(&self, record: &BlockRecord) {
        let back = 1 - self.published.load(Ordering::Relaxed);
        self.frames[back].store(record);
        self.published.store(back, Ordering::Release);
    }

    /// Consumer side: read the most recently published frame.
    pub fn latest(&self) -> BlockRecord {
        let front = self.published.load(Ordering::Acquire);
        self.frames[front].load()
    }

    /// Zero both frames. Only sound while the producer is quiescent.
    pub fn reset(&self) {
        let zero = BlockRecord::default();
        self.frames[0].store(&zero);
        self.frames[1].store(&zero);
        self.published.store(0, Ordering::Release);
    }
}

impl Default for StatsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: u64, channels: usize, peak: f32) -> BlockRecord {
        let mut record = BlockRecord {
            timestamp_ns: ts,
            channels,
            ..Default::default()
        };
        for ch in 0..channels {
            record.stats[ch] = ChannelStats {
                peak,
                magnitude: peak / 2.0,
                input_peak: peak * 2.0,
            };
        }
        record
    }

    #[test]
    fn test_publish_then_latest() {
        let publisher = StatsPublisher::new();
        publisher.publish(&record(42, 2, 0.5));

        let latest = publisher.latest();
        assert_eq!(latest.timestamp_ns, 42);
        assert_eq!(latest.channels, 2);
        assert_eq!(latest.stats[0].peak, 0.5);
        assert_eq!(latest.stats[0].magnitude, 0.25);
        assert_eq!(latest.stats[0].input_peak, 1.0);
        assert_eq!(latest.stats[2].peak, 0.0);
    }

    #[test]
    fn test_publish_alternates_frames() {
        let publisher = StatsPublisher::new();
        publisher.publish(&record(1, 1, 0.1));
        publisher.publish(&record(2, 1, 0.2));
        publisher.publish(&record(3, 1, 0.3));

        let latest = publisher.latest();
        assert_eq!(latest.timestamp_ns, 3);
        assert!((latest.stats[0].peak - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_reset() {
        let publisher = StatsPublisher::new();
        publisher.publish(&record(7, 4, 0.9));
        publisher.reset();

        let latest = publisher.latest();
        assert_eq!(latest.timestamp_ns, 0);
        assert_eq!(latest.channels, 0);
        assert_eq!(latest.stats[3].peak, 0.0);
    }
}
