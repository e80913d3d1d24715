//! Flux Meter - real-time audio measurement and visualization pipeline
//!
//! Receives audio blocks from an upstream mixing engine on its real-time
//! thread, maintains per-source sliding sample windows, computes per-block
//! peak/RMS/input-peak statistics and windowed FFT power spectra, advances
//! dB-domain ballistics on a ~30 Hz redraw clock, and fans the displayed
//! values out to subscribers.
//!
//! The two clocks never share a lock: the audio thread publishes through a
//! single-writer sample ring, a double-buffered stats frame and a wait-free
//! record queue; the redraw thread drains and renders.

pub mod analyzer;
pub mod ballistics;
pub mod channel;
pub mod error;
pub mod registry;
pub mod ring;
pub mod scheduler;
pub mod stats;
pub mod types;

pub use ballistics::{BallisticsConfig, BallisticsUpdate, ChannelBallistics};
pub use channel::{LevelsFrame, MeterChannel, SubscriptionId, TICK_INTERVAL};
pub use error::{MeterError, MeterResult};
pub use registry::{MeterHandle, Metering};
pub use scheduler::MeterScheduler;
pub use types::*;
