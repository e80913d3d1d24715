//! Real-FFT power spectrum
//!
//! Wraps `realfft`'s real-to-complex transform behind a scratch-buffer type
//! owned by the consumer thread. The half-complex packing never leaves this
//! module: callers hand in a windowed sample block and get back `W/2` power
//! bins (DC in bin 0, the highest bin just below Nyquist).

use std::sync::Arc;

use realfft::num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};

use crate::window::Window;

/// Reusable FFT state for one consumer thread.
///
/// `power_spectrum` re-plans lazily when the window length changes, so a
/// single instance can serve meters with different FFT sizes. Planning is
/// cheap after the first call per length (the planner caches plans) and never
/// happens on the audio thread.
pub struct FftScratch {
    planner: RealFftPlanner<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
    len: usize,
    real: Vec<f32>,
    complex: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl FftScratch {
    /// Create scratch for FFT windows of `len` samples (power of two).
    pub fn new(len: usize) -> Self {
        assert!(len.is_power_of_two(), "FFT window must be a power of two");
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(len);
        let complex = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();
        Self {
            planner,
            fft,
            len,
            real: vec![0.0; len],
            complex,
            scratch,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn ensure(&mut self, len: usize) {
        if self.len == len {
            return;
        }
        assert!(len.is_power_of_two(), "FFT window must be a power of two");
        log::debug!("replanning FFT scratch: {} -> {} samples", self.len, len);
        self.fft = self.planner.plan_fft_forward(len);
        self.len = len;
        self.real.resize(len, 0.0);
        self.real.fill(0.0);
        self.complex = self.fft.make_output_vec();
        self.scratch = self.fft.make_scratch_vec();
    }

    /// Compute the power spectrum of one already-windowed block.
    ///
    /// `windowed.len()` must equal the window length; `out.len()` must be
    /// `windowed.len() / 2`. Bin k holds `norm_k · (re² + im²)` with the
    /// normalization carried by `window` (see [`Window::norm_dc`]); bin 0 is
    /// the raw DC power, left for the caller to zero for display.
    pub fn power_spectrum(&mut self, windowed: &[f32], window: &Window, out: &mut [f32]) {
        self.ensure(windowed.len());
        debug_assert_eq!(out.len(), self.len / 2);

        self.real.copy_from_slice(windowed);
        // realfft rejects only length mismatches, which ensure() rules out
        self.fft
            .process_with_scratch(&mut self.real, &mut self.complex, &mut self.scratch)
            .expect("real FFT forward transform");

        let norm_dc = window.norm_dc();
        let norm_bin = window.norm_bin();
        for (k, (slot, bin)) in out.iter_mut().zip(self.complex.iter()).enumerate() {
            let power = bin.re * bin.re + bin.im * bin.im;
            *slot = power * if k == 0 { norm_dc } else { norm_bin };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowKind;

    fn analyze(kind: WindowKind, len: usize, samples: &[f32]) -> Vec<f32> {
        let window = Window::new(kind, len);
        let mut windowed = vec![0.0; len];
        window.apply(samples, &mut windowed);
        let mut out = vec![0.0; len / 2];
        FftScratch::new(len).power_spectrum(&windowed, &window, &mut out);
        out
    }

    #[test]
    fn test_constant_input_is_pure_dc() {
        let len = 1024;
        let samples = vec![0.5_f32; len];
        let power = analyze(WindowKind::BlackmanHarris, len, &samples);

        // DC power equals a² exactly (a = 0.5 -> 0.25)
        assert!((power[0] - 0.25).abs() < 1e-4, "dc = {}", power[0]);
        // Everything past the window's main lobe is negligible
        for (k, &p) in power.iter().enumerate().skip(8) {
            assert!(p < 1e-6, "bin {} = {}", k, p);
        }
    }

    #[test]
    fn test_bin_centered_sine_power() {
        let len = 1024;
        let bin = 64;
        let amplitude = 0.5_f32;
        let samples: Vec<f32> = (0..len)
            .map(|n| {
                amplitude
                    * (std::f32::consts::TAU * bin as f32 * n as f32 / len as f32).sin()
            })
            .collect();
        let power = analyze(WindowKind::Hann, len, &samples);

        // One-sided power of a sine is a²/2 = 0.125
        let peak = power[bin];
        assert!(
            (10.0 * (peak / 0.125).log10()).abs() < 0.1,
            "peak = {}",
            peak
        );
        // Hann main lobe is ±2 bins; outside it the floor is far down
        for (k, &p) in power.iter().enumerate() {
            if (k as i32 - bin as i32).abs() > 3 && k > 0 {
                assert!(p < 1e-5, "bin {} = {}", k, p);
            }
        }
    }

    #[test]
    fn test_off_center_sine_within_scalloping_loss() {
        // 1 kHz at 48 kHz with W = 1024 lands between bins 21 and 22
        let len = 1024;
        let sample_rate = 48_000.0_f32;
        let freq = 1000.0_f32;
        let amplitude = 0.5_f32;
        let samples: Vec<f32> = (0..len)
            .map(|n| amplitude * (std::f32::consts::TAU * freq * n as f32 / sample_rate).sin())
            .collect();
        let power = analyze(WindowKind::BlackmanHarris, len, &samples);

        let expected_bin = (freq * len as f32 / sample_rate).round() as usize;
        assert_eq!(expected_bin, 21);

        let peak_bin = power
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(peak_bin, expected_bin);

        // Within 1 dB of a²/2 (Blackman-Harris scalloping loss < 0.9 dB)
        let db_error = 10.0 * (power[peak_bin] / 0.125).log10();
        assert!(db_error.abs() < 1.0, "error = {} dB", db_error);
    }

    #[test]
    fn test_replan_on_length_change() {
        let mut fft = FftScratch::new(256);
        let window = Window::new(WindowKind::Hann, 512);
        let mut windowed = vec![0.0; 512];
        window.apply(&vec![0.25; 512], &mut windowed);
        let mut out = vec![0.0; 256];
        fft.power_spectrum(&windowed, &window, &mut out);
        assert_eq!(fft.len(), 512);
        assert!((out[0] - 0.0625).abs() < 1e-4);
    }
}
