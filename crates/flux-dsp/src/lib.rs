//! Flux DSP - shared signal-analysis support for the metering pipeline
//!
//! This crate holds the stateless/leaf pieces the meter pipeline is built on:
//! - Decibel/multiplier conversion with the `x <= 0 => -inf dB` convention
//! - Fader deflection curves (cubic, IEC 60268-18, logarithmic)
//! - Window-function tables with a process-wide read-only cache
//! - Real-FFT power-spectrum analysis

pub mod db;
pub mod fader;
pub mod spectrum;
pub mod window;

pub use db::{db_to_mul, mul_to_db};
pub use spectrum::FftScratch;
pub use window::{Window, WindowKind};
