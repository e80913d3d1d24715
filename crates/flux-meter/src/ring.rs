//! Per-channel sample ring
//!
//! Fixed-capacity single-producer circular buffer of recent samples. The
//! audio thread appends; the redraw thread snapshots the most recent window
//! for the FFT path. There is deliberately no read index and no mutual
//! exclusion: the producer publishes a monotonic write index with Release
//! ordering, the consumer loads it once with Acquire and copies. A write
//! that lands mid-snapshot can tear the copy at exactly one seam, which the
//! display tolerates as one frame of stale samples.
//!
//! Cells are `AtomicU32` bit-patterns of `f32` so concurrent access stays
//! within the memory model without any locking.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::types::{Sample, MIN_RING_CAPACITY};

/// Single-writer sample ring with whole-buffer snapshot reads.
pub struct SampleRing {
    cells: Box<[AtomicU32]>,
    mask: usize,
    /// Monotonic total of samples ever written; masked for cell access.
    write_index: AtomicUsize,
}

impl SampleRing {
    /// Create a ring able to back FFT windows of `window_len` samples:
    /// capacity is the smallest power of two >= `window_len`, and at least
    /// [`MIN_RING_CAPACITY`].
    pub fn with_window(window_len: usize) -> Self {
        let capacity = window_len.max(MIN_RING_CAPACITY).next_power_of_two();
        let cells = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        Self {
            cells,
            mask: capacity - 1,
            write_index: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Append samples in FIFO order. Producer-side only.
    ///
    /// If `samples.len()` is at least the capacity, only the trailing
    /// capacity-many samples survive and the ring reads as just filled.
    pub fn write(&self, samples: &[Sample]) {
        let capacity = self.cells.len();
        let w = self.write_index.load(Ordering::Relaxed);

        let skip = samples.len().saturating_sub(capacity);
        for (i, &sample) in samples[skip..].iter().enumerate() {
            let cell = &self.cells[(w + skip + i) & self.mask];
            cell.store(sample.to_bits(), Ordering::Relaxed);
        }

        self.write_index
            .store(w.wrapping_add(samples.len()), Ordering::Release);
    }

    /// Copy the most recent `out.len()` samples in chronological order.
    /// Consumer-side only; `out.len()` must not exceed the capacity.
    ///
    /// Positions not yet written read as silence.
    pub fn snapshot(&self, out: &mut [Sample]) {
        debug_assert!(out.len() <= self.cells.len());
        let w = self.write_index.load(Ordering::Acquire);
        let start = w.wrapping_sub(out.len());

        // Two chunks: from the start offset to the end of the backing
        // array, then the wrapped remainder from the front.
        let offset = start & self.mask;
        let first = out.len().min(self.cells.len() - offset);
        for (i, slot) in out[..first].iter_mut().enumerate() {
            *slot = Sample::from_bits(self.cells[offset + i].load(Ordering::Relaxed));
        }
        for (i, slot) in out[first..].iter_mut().enumerate() {
            *slot = Sample::from_bits(self.cells[i].load(Ordering::Relaxed));
        }
    }

    /// Reset every cell to silence and rewind the write index.
    ///
    /// Only sound while the producer is quiescent (detach/reconfigure).
    pub fn clear(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Ordering::Relaxed);
        }
        self.write_index.store(0, Ordering::Release);
    }
}
