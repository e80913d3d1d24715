//! Common types and system constants for the metering pipeline

use std::sync::OnceLock;
use std::time::Instant;

/// Audio sample type (32-bit float, nominal range [-1, +1]; clipping is
/// detected, not clamped)
pub type Sample = f32;

/// Maximum audio channels the system will ever instantiate
pub const MAX_CHANNELS: usize = 8;

/// Maximum frames per block delivered by the mixing engine
pub const AUDIO_OUTPUT_FRAMES: usize = 1024;

/// Default FFT window length (samples per spectrum)
pub const DEFAULT_FFT_WINDOW: usize = AUDIO_OUTPUT_FRAMES;

/// Minimum sample-ring capacity regardless of the FFT window
pub const MIN_RING_CAPACITY: usize = 2048;

/// Nanoseconds per second, named so no ns→s conversion hides behind a bare
/// `0.000000001` literal. Conversions go through f64: the 53-bit mantissa
/// keeps them exact to well under a nanosecond for any realistic uptime.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Convert a monotonic-nanosecond delta to seconds.
#[inline]
pub fn ns_to_secs(ns: u64) -> f64 {
    ns as f64 / NANOS_PER_SEC as f64
}

/// Current monotonic time in nanoseconds, from a process-wide epoch.
///
/// Block timestamps and redraw ticks must come from the same monotonic
/// clock; engines without their own clock can use this one.
pub fn monotonic_now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Opaque identifier of an upstream signal source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// How block peaks are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeakMeterKind {
    /// Largest absolute sample value
    #[default]
    SamplePeak,
    /// ITU-style 4x oversampled peak, catching inter-sample overs
    TruePeak,
}

/// One delivery of audio from the mixing engine.
///
/// Planes are non-interleaved: one contiguous float slice per channel. The
/// block only borrows them for the duration of a push; the pipeline copies
/// whatever it wants to retain.
#[derive(Debug, Clone, Copy)]
pub struct AudioBlock<'a> {
    pub timestamp_ns: u64,
    pub frames: usize,
    pub muted: bool,
    channels: usize,
    planes: [Option<&'a [Sample]>; MAX_CHANNELS],
}

impl<'a> AudioBlock<'a> {
    /// Create a block from one slice per channel.
    ///
    /// Panics if more than [`MAX_CHANNELS`] planes are given or a plane is
    /// shorter than `frames`.
    pub fn from_planes(
        timestamp_ns: u64,
        frames: usize,
        muted: bool,
        planes: &[&'a [Sample]],
    ) -> Self {
        assert!(planes.len() <= MAX_CHANNELS, "too many channel planes");
        let mut slots = [None; MAX_CHANNELS];
        for (slot, &plane) in slots.iter_mut().zip(planes) {
            assert!(plane.len() >= frames, "channel plane shorter than frames");
            *slot = Some(plane);
        }
        Self {
            timestamp_ns,
            frames,
            muted,
            channels: planes.len(),
            planes: slots,
        }
    }

    /// Create a block claiming `channels` channels but carrying no planes;
    /// add them with [`with_plane`](Self::with_plane). Channels whose plane
    /// is never supplied read as missing.
    pub fn empty(timestamp_ns: u64, frames: usize, channels: usize, muted: bool) -> Self {
        assert!(channels <= MAX_CHANNELS, "too many channels");
        Self {
            timestamp_ns,
            frames,
            muted,
            channels,
            planes: [None; MAX_CHANNELS],
        }
    }

    /// Attach one channel's plane.
    pub fn with_plane(mut self, channel: usize, samples: &'a [Sample]) -> Self {
        assert!(channel < self.channels, "plane index out of range");
        assert!(samples.len() >= self.frames, "plane shorter than frames");
        self.planes[channel] = Some(samples);
        self
    }

    /// Channel count claimed by this block.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// The plane for `channel`, or `None` if it was not delivered.
    pub fn plane(&self, channel: usize) -> Option<&'a [Sample]> {
        self.planes.get(channel).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_from_planes() {
        let left = [0.1_f32; 64];
        let right = [0.2_f32; 64];
        let block = AudioBlock::from_planes(123, 64, false, &[&left, &right]);

        assert_eq!(block.channels(), 2);
        assert_eq!(block.frames, 64);
        assert_eq!(block.plane(0).unwrap()[0], 0.1);
        assert_eq!(block.plane(1).unwrap()[0], 0.2);
        assert!(block.plane(2).is_none());
    }

    #[test]
    fn test_block_with_missing_plane() {
        let left = [0.5_f32; 32];
        let block = AudioBlock::empty(0, 32, 2, false).with_plane(0, &left);

        assert_eq!(block.channels(), 2);
        assert!(block.plane(0).is_some());
        assert!(block.plane(1).is_none());
    }

    #[test]
    #[should_panic(expected = "shorter than frames")]
    fn test_block_rejects_short_plane() {
        let short = [0.0_f32; 16];
        let _ = AudioBlock::from_planes(0, 32, false, &[&short]);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_ns_to_secs() {
        assert_eq!(ns_to_secs(NANOS_PER_SEC), 1.0);
        assert_eq!(ns_to_secs(500_000_000), 0.5);
    }
}
