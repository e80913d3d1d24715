//! Metering registry - the host-facing surface
//!
//! Maps source ids to their meter channels and routes audio-engine pushes.
//! Hosts create one [`Metering`] at startup, start the scheduler, and hand
//! `push_block` to the mixing engine:
//!
//! ```no_run
//! use flux_meter::{Metering, SourceId};
//!
//! let metering = Metering::new();
//! metering.start_scheduler().unwrap();
//!
//! let meter = metering.create_meter(SourceId(1), 48_000, 2).unwrap();
//! meter.subscribe(|frame| {
//!     let _ = frame.peak_db;
//! });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use flux_dsp::spectrum::FftScratch;

use crate::channel::MeterChannel;
use crate::error::{MeterError, MeterResult};
use crate::scheduler::MeterScheduler;
use crate::types::{AudioBlock, SourceId};

/// Shared handle to one source's meter channel.
pub type MeterHandle = Arc<MeterChannel>;

/// Process-wide meter registry.
pub struct Metering {
    meters: RwLock<HashMap<SourceId, MeterHandle>>,
    scheduler: Mutex<Option<MeterScheduler>>,
}

impl Metering {
    /// Create an empty registry with no scheduler running.
    pub fn new() -> Self {
        Self {
            meters: RwLock::new(HashMap::new()),
            scheduler: Mutex::new(None),
        }
    }

    /// Start the ~30 Hz ticker thread. Idempotent.
    pub fn start_scheduler(&self) -> Result<(), String> {
        let mut slot = self.scheduler.lock().unwrap();
        if slot.is_none() {
            let scheduler = MeterScheduler::spawn()?;
            for channel in self.meters.read().unwrap().values() {
                scheduler.register(channel);
            }
            *slot = Some(scheduler);
        }
        Ok(())
    }

    /// Stop the ticker thread and join it. Meters stay attached; a later
    /// `start_scheduler` picks them up again.
    pub fn stop_scheduler(&self) {
        if let Some(scheduler) = self.scheduler.lock().unwrap().take() {
            scheduler.shutdown();
        }
    }

    /// Create a meter for `source`. Fails with [`MeterError::AlreadyAttached`]
    /// if the source has one; nothing is mutated in that case.
    pub fn create_meter(
        &self,
        source: SourceId,
        sample_rate: u32,
        channels: usize,
    ) -> MeterResult<MeterHandle> {
        let mut meters = self.meters.write().unwrap();
        if meters.contains_key(&source) {
            return Err(MeterError::AlreadyAttached(source));
        }

        let channel = Arc::new(MeterChannel::new(source, sample_rate, channels));
        meters.insert(source, Arc::clone(&channel));
        drop(meters);

        if let Some(scheduler) = self.scheduler.lock().unwrap().as_ref() {
            scheduler.register(&channel);
        }
        Ok(channel)
    }

    /// Detach and release `source`'s meter.
    pub fn destroy_meter(&self, source: SourceId) -> MeterResult<()> {
        let channel = self
            .meters
            .write()
            .unwrap()
            .remove(&source)
            .ok_or(MeterError::NotAttached(source))?;
        channel.detach();
        Ok(())
    }

    /// Look up a source's meter.
    pub fn meter(&self, source: SourceId) -> Option<MeterHandle> {
        self.meters.read().unwrap().get(&source).cloned()
    }

    /// Deliver one block from the audio engine.
    ///
    /// Real-time safe: if the registry is momentarily write-locked by a
    /// create/destroy, the block is dropped rather than blocking the audio
    /// thread. Blocks for unknown sources are dropped silently.
    pub fn push_block(&self, source: SourceId, block: &AudioBlock<'_>) {
        let Ok(meters) = self.meters.try_read() else {
            return;
        };
        if let Some(channel) = meters.get(&source) {
            channel.on_block(block);
        }
    }

    /// Deterministic tick driver: advance every meter to `t_now_ns` using
    /// the caller's FFT scratch. This is what tests use instead of the
    /// wall-clock scheduler thread.
    pub fn tick_all(&self, t_now_ns: u64, fft: &mut FftScratch) {
        for channel in self.meters.read().unwrap().values() {
            channel.on_tick(t_now_ns, fft);
        }
    }

    /// Number of attached meters.
    pub fn len(&self) -> usize {
        self.meters.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.read().unwrap().is_empty()
    }
}

impl Default for Metering {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Metering {
    fn drop(&mut self) {
        self.stop_scheduler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NANOS_PER_SEC;

    const BLOCK_NS: u64 = 1024 * NANOS_PER_SEC / 48_000;

    #[test]
    fn test_create_is_exclusive_per_source() {
        let metering = Metering::new();
        metering.create_meter(SourceId(1), 48_000, 2).unwrap();

        let err = metering.create_meter(SourceId(1), 44_100, 1).unwrap_err();
        assert!(matches!(err, MeterError::AlreadyAttached(SourceId(1))));

        // The failed call mutated nothing
        assert_eq!(metering.len(), 1);
        assert_eq!(metering.meter(SourceId(1)).unwrap().channels(), 2);
    }

    #[test]
    fn test_destroy_then_recreate() {
        let metering = Metering::new();
        metering.create_meter(SourceId(2), 48_000, 2).unwrap();
        metering.destroy_meter(SourceId(2)).unwrap();
        assert!(metering.is_empty());

        let err = metering.destroy_meter(SourceId(2)).unwrap_err();
        assert!(matches!(err, MeterError::NotAttached(SourceId(2))));

        metering.create_meter(SourceId(2), 48_000, 4).unwrap();
        assert_eq!(metering.meter(SourceId(2)).unwrap().channels(), 4);
    }

    #[test]
    fn test_push_block_routes_to_source() {
        let metering = Metering::new();
        let meter_a = metering.create_meter(SourceId(3), 48_000, 1).unwrap();
        let meter_b = metering.create_meter(SourceId(4), 48_000, 1).unwrap();
        let mut fft = FftScratch::new(meter_a.window_len());

        let samples = vec![0.5_f32; 1024];
        let block = AudioBlock::from_planes(BLOCK_NS, 1024, false, &[&samples]);
        metering.push_block(SourceId(3), &block);
        metering.tick_all(BLOCK_NS, &mut fft);

        assert!(meter_a.ballistics_snapshot(0).unwrap().peak_db.is_finite());
        assert_eq!(
            meter_b.ballistics_snapshot(0).unwrap().peak_db,
            f32::NEG_INFINITY
        );
    }

    #[test]
    fn test_push_block_for_unknown_source_is_dropped() {
        let metering = Metering::new();
        let samples = vec![0.5_f32; 64];
        let block = AudioBlock::from_planes(0, 64, false, &[&samples]);
        metering.push_block(SourceId(99), &block);
    }

    #[test]
    fn test_destroyed_meter_stops_ticking() {
        let metering = Metering::new();
        let meter = metering.create_meter(SourceId(5), 48_000, 1).unwrap();
        let mut fft = FftScratch::new(meter.window_len());

        let samples = vec![0.5_f32; 1024];
        let block = AudioBlock::from_planes(BLOCK_NS, 1024, false, &[&samples]);
        metering.push_block(SourceId(5), &block);
        metering.tick_all(BLOCK_NS, &mut fft);
        assert!(meter.ballistics_snapshot(0).unwrap().peak_db.is_finite());

        metering.destroy_meter(SourceId(5)).unwrap();
        assert!(!meter.is_attached());
    }

    #[test]
    fn test_scheduler_start_stop() {
        let metering = Metering::new();
        metering.create_meter(SourceId(6), 48_000, 1).unwrap();
        metering.start_scheduler().unwrap();
        metering.start_scheduler().unwrap(); // idempotent
        metering.stop_scheduler();
    }
}
