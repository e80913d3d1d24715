//! Window functions for spectral analysis
//!
//! Tables are generated from the standard cosine-sum formulas with argument
//! `2πn/(W−1)`; the non-cosine kinds (Bartlett, Triangular, Welch, Sine) use
//! their closed forms. Tables are cached process-wide and shared read-only:
//! every consumer of a `(kind, length)` pair gets the same `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// The window function applied before the FFT.
///
/// Blackman-Harris is the default: -92 dB sidelobes make it a safe choice
/// for a general-purpose spectrum display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WindowKind {
    Bartlett,
    Blackman,
    BlackmanExact,
    #[default]
    BlackmanHarris,
    BlackmanNuttall,
    FlatTop,
    Hann,
    Nuttall,
    Sine,
    Triangular,
    Welch,
}

impl WindowKind {
    /// All supported kinds, in name order.
    pub const ALL: [WindowKind; 11] = [
        WindowKind::Bartlett,
        WindowKind::Blackman,
        WindowKind::BlackmanExact,
        WindowKind::BlackmanHarris,
        WindowKind::BlackmanNuttall,
        WindowKind::FlatTop,
        WindowKind::Hann,
        WindowKind::Nuttall,
        WindowKind::Sine,
        WindowKind::Triangular,
        WindowKind::Welch,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WindowKind::Bartlett => "bartlett",
            WindowKind::Blackman => "blackman",
            WindowKind::BlackmanExact => "blackman-exact",
            WindowKind::BlackmanHarris => "blackman-harris",
            WindowKind::BlackmanNuttall => "blackman-nuttall",
            WindowKind::FlatTop => "flat-top",
            WindowKind::Hann => "hann",
            WindowKind::Nuttall => "nuttall",
            WindowKind::Sine => "sine",
            WindowKind::Triangular => "triangular",
            WindowKind::Welch => "welch",
        }
    }

    /// Look up a kind by its canonical name. Returns `None` for anything
    /// unrecognized; callers fall back to the default.
    pub fn from_name(name: &str) -> Option<WindowKind> {
        let name = name.trim().to_ascii_lowercase();
        WindowKind::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Generate the raw coefficient table of length `len`.
    pub fn coefficients(self, len: usize) -> Vec<f32> {
        if len <= 1 {
            return vec![1.0; len];
        }

        match self {
            WindowKind::Hann => cosine_sum(len, &[0.5, -0.5]),
            WindowKind::Blackman => cosine_sum(len, &[0.42, -0.5, 0.08]),
            WindowKind::BlackmanExact => {
                // a0 = 7938/18608, a1 = 9240/18608, a2 = 1430/18608
                cosine_sum(len, &[0.426_590_71, -0.496_560_62, 0.076_848_67])
            }
            WindowKind::BlackmanHarris => {
                cosine_sum(len, &[0.35875, -0.48829, 0.14128, -0.01168])
            }
            WindowKind::BlackmanNuttall => {
                cosine_sum(len, &[0.363_581_9, -0.489_177_5, 0.136_599_5, -0.010_641_1])
            }
            WindowKind::Nuttall => {
                cosine_sum(len, &[0.355_768, -0.487_396, 0.144_232, -0.012_604])
            }
            WindowKind::FlatTop => cosine_sum(
                len,
                &[
                    0.215_578_95,
                    -0.416_631_58,
                    0.277_263_16,
                    -0.083_578_947,
                    0.006_947_368,
                ],
            ),
            WindowKind::Bartlett => {
                let span = (len - 1) as f32;
                (0..len)
                    .map(|n| 1.0 - (2.0 * n as f32 / span - 1.0).abs())
                    .collect()
            }
            WindowKind::Triangular => {
                // Non-zero endpoints: denominator is W rather than W-1
                let half = len as f32 / 2.0;
                let center = (len - 1) as f32 / 2.0;
                (0..len)
                    .map(|n| 1.0 - ((n as f32 - center) / half).abs())
                    .collect()
            }
            WindowKind::Welch => {
                let half = (len - 1) as f32 / 2.0;
                (0..len)
                    .map(|n| {
                        let x = (n as f32 - half) / half;
                        1.0 - x * x
                    })
                    .collect()
            }
            WindowKind::Sine => {
                let span = (len - 1) as f32;
                (0..len)
                    .map(|n| (std::f32::consts::PI * n as f32 / span).sin())
                    .collect()
            }
        }
    }
}

/// w[n] = Σ_k a_k · cos(k · 2πn/(W−1)), signs carried in the coefficients.
fn cosine_sum(len: usize, coeffs: &[f32]) -> Vec<f32> {
    let scale = std::f32::consts::TAU / (len - 1) as f32;
    (0..len)
        .map(|n| {
            let phase = n as f32 * scale;
            coeffs
                .iter()
                .enumerate()
                .map(|(k, &a)| a * (phase * k as f32).cos())
                .sum()
        })
        .collect()
}

struct WindowCache {
    entries: RwLock<HashMap<(WindowKind, usize), Arc<[f32]>>>,
}

impl WindowCache {
    fn global() -> &'static WindowCache {
        static INSTANCE: OnceLock<WindowCache> = OnceLock::new();
        INSTANCE.get_or_init(|| WindowCache {
            entries: RwLock::new(HashMap::new()),
        })
    }

    fn get(&self, kind: WindowKind, len: usize) -> Arc<[f32]> {
        if let Some(existing) = self.entries.read().unwrap().get(&(kind, len)) {
            return Arc::clone(existing);
        }

        let mut entries = self.entries.write().unwrap();
        Arc::clone(
            entries
                .entry((kind, len))
                .or_insert_with(|| Arc::from(kind.coefficients(len))),
        )
    }
}

/// A cached window table paired with its power-spectrum normalization.
///
/// The normalization is coherent-gain based: `1/(Σw)²` for the DC bin and
/// `2/(Σw)²` for interior bins (one-sided spectrum). With a rectangular
/// window (Σw = W) this reduces to the plain `1/W²` / `2/W²` scales.
#[derive(Debug, Clone)]
pub struct Window {
    kind: WindowKind,
    coeffs: Arc<[f32]>,
    norm_dc: f32,
    norm_bin: f32,
}

impl Window {
    /// Fetch (or build) the shared table for `kind` at length `len`.
    pub fn new(kind: WindowKind, len: usize) -> Self {
        let coeffs = WindowCache::global().get(kind, len);
        let sum: f32 = coeffs.iter().sum();
        let sum_sq = (sum * sum).max(f32::MIN_POSITIVE);
        Self {
            kind,
            coeffs,
            norm_dc: 1.0 / sum_sq,
            norm_bin: 2.0 / sum_sq,
        }
    }

    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.coeffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coeffs.is_empty()
    }

    pub fn coefficients(&self) -> &[f32] {
        &self.coeffs
    }

    /// Power normalization for bin 0 (DC).
    pub fn norm_dc(&self) -> f32 {
        self.norm_dc
    }

    /// Power normalization for interior bins (one-sided doubling).
    pub fn norm_bin(&self) -> f32 {
        self.norm_bin
    }

    /// Multiply `input` element-wise by the table into `output`.
    pub fn apply(&self, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), self.coeffs.len());
        debug_assert_eq!(output.len(), self.coeffs.len());
        for ((out, &x), &w) in output.iter_mut().zip(input).zip(self.coeffs.iter()) {
            *out = x * w;
        }
    }
}
