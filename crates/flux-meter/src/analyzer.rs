//! Block analyzer - per-block statistics and ring maintenance
//!
//! Runs on the audio thread, once per pushed block:
//! 1. One pass per channel plane: `peak = max(|sample|)` and the sum of
//!    squares, giving `rms = sqrt(sum/frames)`.
//! 2. Stats assembly: `input_peak` is pre-gain, `peak`/`magnitude` post-gain.
//! 3. Append the (post-gain) samples to that channel's sample ring.
//!
//! Never allocates after construction: the one scratch buffer is sized up
//! front and oversized blocks are processed in chunks through it.

use crate::ring::SampleRing;
use crate::stats::{BlockRecord, ChannelStats};
use crate::types::{AudioBlock, PeakMeterKind, Sample, AUDIO_OUTPUT_FRAMES, MAX_CHANNELS};

/// 4x oversampling for inter-sample peak detection (ITU-R BS.1770-4 style)
const OVERSAMPLE_PHASES: usize = 4;
/// FIR taps per polyphase phase
const OVERSAMPLE_TAPS: usize = 12;
/// Total taps of the underlying windowed-sinc interpolation filter
const TOTAL_TAPS: usize = OVERSAMPLE_PHASES * OVERSAMPLE_TAPS;
/// Kaiser window shape for the interpolation filter design
const KAISER_BETA: f64 = 8.0;

/// Design the 4x polyphase interpolation filter: a 48-tap windowed sinc
/// (cutoff pi/4) under a Kaiser window, split into 4 phases of 12 taps,
/// each phase normalized to unity DC gain.
fn design_interpolation_filter() -> [[f32; OVERSAMPLE_TAPS]; OVERSAMPLE_PHASES] {
    let mut coeffs = [[0.0_f32; OVERSAMPLE_TAPS]; OVERSAMPLE_PHASES];
    let center = (TOTAL_TAPS as f64 - 1.0) / 2.0;

    for i in 0..TOTAL_TAPS {
        let n = i as f64 - center;
        let sinc = if n.abs() < 1e-10 {
            1.0
        } else {
            let x = n * std::f64::consts::PI / OVERSAMPLE_PHASES as f64;
            x.sin() / x
        };

        let m = (TOTAL_TAPS - 1) as f64;
        let t = 2.0 * i as f64 / m - 1.0;
        let window = bessel_i0(KAISER_BETA * (1.0 - t * t).max(0.0).sqrt()) / bessel_i0(KAISER_BETA);

        coeffs[i % OVERSAMPLE_PHASES][i / OVERSAMPLE_PHASES] = (sinc * window) as f32;
    }

    for phase in &mut coeffs {
        let sum: f32 = phase.iter().sum();
        if sum.abs() > 1e-10 {
            for tap in phase.iter_mut() {
                *tap /= sum;
            }
        }
    }

    coeffs
}

/// Zeroth-order modified Bessel function of the first kind (power series;
/// converges quickly for Kaiser-design arguments).
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0_f64;
    let mut term = 1.0_f64;
    let half = x / 2.0;
    for k in 1..=25 {
        term *= (half / k as f64) * (half / k as f64);
        sum += term;
        if term < 1e-20 * sum {
            break;
        }
    }
    sum
}

/// Per-channel history for the true-peak interpolator. History carries
/// across blocks so a peak straddling a block boundary is not missed.
#[derive(Debug, Clone)]
struct TruePeakChannel {
    history: [f32; OVERSAMPLE_TAPS],
    write_pos: usize,
}

impl TruePeakChannel {
    fn new() -> Self {
        Self {
            history: [0.0; OVERSAMPLE_TAPS],
            write_pos: 0,
        }
    }

    fn reset(&mut self) {
        self.history = [0.0; OVERSAMPLE_TAPS];
        self.write_pos = 0;
    }

    /// Scan one plane, returning the largest interpolated absolute value.
    fn scan(&mut self, coeffs: &[[f32; OVERSAMPLE_TAPS]; OVERSAMPLE_PHASES], samples: &[Sample]) -> f32 {
        let mut max = 0.0_f32;
        for &sample in samples {
            self.history[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % OVERSAMPLE_TAPS;

            for phase in coeffs {
                let mut acc = 0.0_f32;
                for (tap, &c) in phase.iter().enumerate() {
                    let idx = (self.write_pos + OVERSAMPLE_TAPS - 1 - tap) % OVERSAMPLE_TAPS;
                    acc += c * self.history[idx];
                }
                max = max.max(acc.abs());
            }
        }
        max
    }
}

/// Producer-side analyzer: one per meter channel, owned by the audio path.
pub struct BlockAnalyzer {
    interp_coeffs: [[f32; OVERSAMPLE_TAPS]; OVERSAMPLE_PHASES],
    true_peak: [TruePeakChannel; MAX_CHANNELS],
    /// Pre-sized staging for gain application / muted silence; oversized
    /// blocks run through it in chunks.
    scratch: Vec<Sample>,
}

impl BlockAnalyzer {
    pub fn new() -> Self {
        Self {
            interp_coeffs: design_interpolation_filter(),
            true_peak: std::array::from_fn(|_| TruePeakChannel::new()),
            scratch: vec![0.0; AUDIO_OUTPUT_FRAMES],
        }
    }

    pub fn reset(&mut self) {
        for channel in &mut self.true_peak {
            channel.reset();
        }
    }

    /// Process one block: compute [`ChannelStats`] for every channel slot
    /// and append samples to the per-channel rings.
    ///
    /// Rules, per channel in `0..channels`:
    /// - missing plane: stats stay 0, ring untouched;
    /// - muted block: stats 0, silence appended to the ring;
    /// - otherwise: stats as documented on the module, post-gain samples
    ///   appended.
    /// Slots at or beyond `channels` always read 0.
    pub fn analyze(
        &mut self,
        block: &AudioBlock<'_>,
        channels: usize,
        gain: f32,
        kind: PeakMeterKind,
        rings: &[SampleRing],
    ) -> BlockRecord {
        debug_assert!(channels <= MAX_CHANNELS);
        debug_assert!(block.frames > 0);

        let mut record = BlockRecord {
            timestamp_ns: block.timestamp_ns,
            channels,
            ..Default::default()
        };

        for ch in 0..channels {
            let Some(plane) = block.plane(ch) else {
                self.true_peak[ch].reset();
                continue;
            };
            let plane = &plane[..block.frames];

            if block.muted {
                self.true_peak[ch].reset();
                self.scratch.fill(0.0);
                let mut remaining = plane.len();
                while remaining > 0 {
                    let chunk = remaining.min(self.scratch.len());
                    rings[ch].write(&self.scratch[..chunk]);
                    remaining -= chunk;
                }
                continue;
            }

            let mut sample_peak = 0.0_f32;
            let mut sum_sq = 0.0_f64;
            for &sample in plane {
                sample_peak = sample_peak.max(sample.abs());
                sum_sq += f64::from(sample) * f64::from(sample);
            }
            let rms = (sum_sq / plane.len() as f64).sqrt() as f32;

            let input_peak = match kind {
                PeakMeterKind::SamplePeak => sample_peak,
                // The interpolator can ring slightly below a flat-topped
                // run, so never report less than the sample peak
                PeakMeterKind::TruePeak => self.true_peak[ch]
                    .scan(&self.interp_coeffs, plane)
                    .max(sample_peak),
            };

            record.stats[ch] = ChannelStats {
                peak: input_peak * gain,
                magnitude: rms * gain,
                input_peak,
            };

            if gain == 1.0 {
                rings[ch].write(plane);
            } else {
                for chunk in plane.chunks(self.scratch.len()) {
                    for (slot, &sample) in self.scratch.iter_mut().zip(chunk) {
                        *slot = sample * gain;
                    }
                    rings[ch].write(&self.scratch[..chunk.len()]);
                }
            }
        }

        record
    }
}

impl Default for BlockAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
