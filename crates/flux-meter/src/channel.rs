//! Meter channel - the per-source façade
//!
//! Wires the audio-thread producer and the redraw-thread consumer together:
//! the producer side (`on_block`) scans the block, appends to the sample
//! rings and publishes stats; the consumer side (`on_tick`) drains completed
//! records, advances ballistics, runs the FFT path for subscribed displays
//! and fans the frame out to subscribers.
//!
//! # Locking discipline
//!
//! The producer mutex is locked by the audio thread (`try_lock`, drop the
//! block on contention) and by teardown paths that must wait out an
//! in-flight block. The consumer mutex is locked by the tick thread and by
//! the configuration surface. The audio thread never touches the consumer
//! mutex, so it can never block on UI work.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use flux_dsp::db::{db_to_mul, mul_to_db};
use flux_dsp::spectrum::FftScratch;
use flux_dsp::window::{Window, WindowKind};

use crate::analyzer::BlockAnalyzer;
use crate::ballistics::{
    BallisticsConfig, BallisticsUpdate, ChannelBallistics, LevelInput, IDLE_TIMEOUT_NS,
};
use crate::error::{MeterError, MeterResult};
use crate::ring::SampleRing;
use crate::stats::{BlockRecord, StatsPublisher};
use crate::types::{
    ns_to_secs, AudioBlock, PeakMeterKind, SourceId, DEFAULT_FFT_WINDOW, MAX_CHANNELS,
    NANOS_PER_SEC,
};

/// Redraw cadence of the process-wide ticker (~30 Hz)
pub const TICK_INTERVAL: Duration = Duration::from_millis(34);

/// Block-stat records buffered between ticks. A tick period holds at most a
/// handful of blocks; the rest is headroom for scheduling hiccups. On
/// overflow the record is dropped - the double-buffered publisher still
/// carries the latest stats.
const RECORD_QUEUE_CAPACITY: usize = 64;

/// At most one layout-mismatch warning per channel per second
const LAYOUT_WARN_INTERVAL_NS: u64 = NANOS_PER_SEC;

const STATE_ATTACHED: u8 = 0;
const STATE_RECONFIGURING: u8 = 1;
const STATE_DETACHING: u8 = 2;
const STATE_UNATTACHED: u8 = 3;

/// Identifies one subscription on one meter channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback invoked at the end of every tick with the displayed values.
/// Runs inline on the redraw thread and must not block.
pub type LevelsCallback = dyn Fn(&LevelsFrame<'_>) + Send + 'static;

struct SubscriberEntry {
    id: SubscriptionId,
    callback: Box<LevelsCallback>,
}

/// One tick's displayed values, borrowed from the channel for the duration
/// of the callback. All per-channel slices have `channels` elements.
pub struct LevelsFrame<'a> {
    pub source: SourceId,
    pub channels: usize,
    pub magnitude_db: &'a [f32],
    pub peak_db: &'a [f32],
    pub peak_hold_db: &'a [f32],
    pub input_peak_db: &'a [f32],
    pub input_peak_hold_db: &'a [f32],
    /// Clip indicator latch state
    pub clipping: &'a [bool],
    /// Square-tick animation phase of the latched indicator
    pub clip_blink: &'a [bool],
    /// Windowed analysis samples, `[channels][window_len]`
    pub window_samples: &'a [Vec<f32>],
    /// Power spectra with DC zeroed for display, `[channels][window_len/2]`
    pub power_spectrum: &'a [Vec<f32>],
}

/// State shared lock-free between the producer and consumer paths.
struct SharedState {
    state: AtomicU8,
    channels: AtomicUsize,
    gain_bits: AtomicU32,
    peak_kind: AtomicU8,
    last_block_ns: AtomicU64,
    last_layout_warn_ns: AtomicU64,
    rings: Vec<SampleRing>,
    publisher: StatsPublisher,
}

struct ProducerHalf {
    analyzer: BlockAnalyzer,
    queue: rtrb::Producer<BlockRecord>,
}

struct ConsumerHalf {
    queue: rtrb::Consumer<BlockRecord>,
    cfg: BallisticsConfig,
    window: Window,
    ballistics: Vec<ChannelBallistics>,
    subscribers: Vec<SubscriberEntry>,
    next_subscription: u64,
    last_tick_ns: u64,
    idle_applied: bool,

    // Per-tick scratch, sized once at construction
    raw_window: Vec<f32>,
    window_samples: Vec<Vec<f32>>,
    spectra: Vec<Vec<f32>>,
    magnitude_db: [f32; MAX_CHANNELS],
    peak_db: [f32; MAX_CHANNELS],
    peak_hold_db: [f32; MAX_CHANNELS],
    input_peak_db: [f32; MAX_CHANNELS],
    input_peak_hold_db: [f32; MAX_CHANNELS],
    clipping: [bool; MAX_CHANNELS],
    clip_blink: [bool; MAX_CHANNELS],
}

/// Per-source meter: owns the sample rings, stats publication, ballistics
/// and subscriber list for one attached signal source.
pub struct MeterChannel {
    source: SourceId,
    sample_rate: u32,
    window_len: usize,
    shared: SharedState,
    producer: Mutex<ProducerHalf>,
    consumer: Mutex<ConsumerHalf>,
}

impl std::fmt::Debug for MeterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeterChannel")
            .field("source", &self.source)
            .field("sample_rate", &self.sample_rate)
            .field("window_len", &self.window_len)
            .finish_non_exhaustive()
    }
}

impl MeterChannel {
    /// Create a meter attached to `source` with the default FFT window.
    pub fn new(source: SourceId, sample_rate: u32, channels: usize) -> Self {
        Self::with_window_len(source, sample_rate, channels, DEFAULT_FFT_WINDOW)
    }

    /// Create a meter with an explicit FFT window length (power of two).
    /// The window length is fixed for the life of the channel.
    pub fn with_window_len(
        source: SourceId,
        sample_rate: u32,
        channels: usize,
        window_len: usize,
    ) -> Self {
        assert!(channels >= 1 && channels <= MAX_CHANNELS, "bad channel count");
        assert!(window_len.is_power_of_two(), "window must be a power of two");

        let (queue_tx, queue_rx) = rtrb::RingBuffer::new(RECORD_QUEUE_CAPACITY);
        let rings = (0..MAX_CHANNELS)
            .map(|_| SampleRing::with_window(window_len))
            .collect();

        Self {
            source,
            sample_rate,
            window_len,
            shared: SharedState {
                state: AtomicU8::new(STATE_ATTACHED),
                channels: AtomicUsize::new(channels),
                gain_bits: AtomicU32::new(1.0_f32.to_bits()),
                peak_kind: AtomicU8::new(0),
                last_block_ns: AtomicU64::new(0),
                last_layout_warn_ns: AtomicU64::new(0),
                rings,
                publisher: StatsPublisher::new(),
            },
            producer: Mutex::new(ProducerHalf {
                analyzer: BlockAnalyzer::new(),
                queue: queue_tx,
            }),
            consumer: Mutex::new(ConsumerHalf {
                queue: queue_rx,
                cfg: BallisticsConfig::default(),
                window: Window::new(WindowKind::default(), window_len),
                ballistics: vec![ChannelBallistics::new(); MAX_CHANNELS],
                subscribers: Vec::new(),
                next_subscription: 0,
                last_tick_ns: 0,
                idle_applied: false,
                raw_window: vec![0.0; window_len],
                window_samples: vec![vec![0.0; window_len]; MAX_CHANNELS],
                spectra: vec![vec![0.0; window_len / 2]; MAX_CHANNELS],
                magnitude_db: [f32::NEG_INFINITY; MAX_CHANNELS],
                peak_db: [f32::NEG_INFINITY; MAX_CHANNELS],
                peak_hold_db: [f32::NEG_INFINITY; MAX_CHANNELS],
                input_peak_db: [f32::NEG_INFINITY; MAX_CHANNELS],
                input_peak_hold_db: [f32::NEG_INFINITY; MAX_CHANNELS],
                clipping: [false; MAX_CHANNELS],
                clip_blink: [false; MAX_CHANNELS],
            }),
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.shared.channels.load(Ordering::Relaxed)
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn is_attached(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_ATTACHED
    }

    // ─── Producer path ──────────────────────────────────────────────────

    /// Deliver one block from the audio thread.
    ///
    /// Real-time safe: no allocation, no blocking. Errors are absorbed here
    /// (a mismatched layout drops the block with a rate-limited warning);
    /// nothing propagates back into the audio engine.
    pub fn on_block(&self, block: &AudioBlock<'_>) {
        if self.shared.state.load(Ordering::Acquire) != STATE_ATTACHED {
            return;
        }
        if block.frames == 0 {
            return;
        }

        let channels = self.shared.channels.load(Ordering::Relaxed);
        if block.channels() != channels {
            self.warn_layout_mismatch(block.timestamp_ns, channels, block.channels());
            return;
        }

        // Contention here means teardown holds the lock; the block is
        // dropped rather than stalling the audio thread.
        let Ok(mut producer) = self.producer.try_lock() else {
            return;
        };

        let gain = f32::from_bits(self.shared.gain_bits.load(Ordering::Relaxed));
        let kind = if self.shared.peak_kind.load(Ordering::Relaxed) == 1 {
            PeakMeterKind::TruePeak
        } else {
            PeakMeterKind::SamplePeak
        };

        let record = producer
            .analyzer
            .analyze(block, channels, gain, kind, &self.shared.rings);
        self.shared.publisher.publish(&record);
        let _ = producer.queue.push(record);
        self.shared
            .last_block_ns
            .store(block.timestamp_ns, Ordering::Release);
    }

    fn warn_layout_mismatch(&self, now_ns: u64, expected: usize, got: usize) {
        let last = self.shared.last_layout_warn_ns.load(Ordering::Relaxed);
        if now_ns.saturating_sub(last) >= LAYOUT_WARN_INTERVAL_NS || last == 0 {
            self.shared
                .last_layout_warn_ns
                .store(now_ns.max(1), Ordering::Relaxed);
            log::warn!(
                "{}: {}",
                self.source,
                MeterError::LayoutMismatch { expected, got }
            );
        }
    }

    // ─── Consumer path ──────────────────────────────────────────────────

    /// Advance ballistics and notify subscribers. Called from the single
    /// redraw thread; `fft` is that thread's scratch set.
    pub fn on_tick(&self, t_now_ns: u64, fft: &mut FftScratch) {
        if self.shared.state.load(Ordering::Acquire) != STATE_ATTACHED {
            return;
        }
        let mut guard = match self.consumer.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let consumer = &mut *guard;

        let dt_s = if consumer.last_tick_ns == 0 {
            0.0
        } else {
            ns_to_secs(t_now_ns.saturating_sub(consumer.last_tick_ns)) as f32
        };
        consumer.last_tick_ns = t_now_ns;

        let channels = self.shared.channels.load(Ordering::Relaxed);

        // Current stats: the latest published frame, widened by any records
        // completed since the previous tick so a short transient between
        // ticks still registers its full peak.
        let latest = self.shared.publisher.latest();
        let mut peak_lin = [0.0_f32; MAX_CHANNELS];
        let mut input_peak_lin = [0.0_f32; MAX_CHANNELS];
        for ch in 0..MAX_CHANNELS {
            peak_lin[ch] = latest.stats[ch].peak;
            input_peak_lin[ch] = latest.stats[ch].input_peak;
        }
        while let Ok(record) = consumer.queue.pop() {
            for ch in 0..MAX_CHANNELS {
                peak_lin[ch] = peak_lin[ch].max(record.stats[ch].peak);
                input_peak_lin[ch] = input_peak_lin[ch].max(record.stats[ch].input_peak);
            }
        }

        // Idle detection: a channel that stopped receiving blocks drops out
        // once, rather than holding its last reading indefinitely.
        let last_block = self.shared.last_block_ns.load(Ordering::Acquire);
        let idle = last_block == 0 || t_now_ns.saturating_sub(last_block) > IDLE_TIMEOUT_NS;
        if idle {
            if !consumer.idle_applied {
                consumer.idle_applied = true;
                for state in consumer.ballistics.iter_mut() {
                    state.reset();
                }
            }
            consumer.input_peak_db = [f32::NEG_INFINITY; MAX_CHANNELS];
        } else {
            consumer.idle_applied = false;
            for ch in 0..channels {
                let input = LevelInput {
                    magnitude_db: mul_to_db(latest.stats[ch].magnitude),
                    peak_db: mul_to_db(peak_lin[ch]),
                    input_peak_db: mul_to_db(input_peak_lin[ch]),
                };
                consumer.input_peak_db[ch] = input.input_peak_db;
                consumer.ballistics[ch].advance(&consumer.cfg, input, t_now_ns, dt_s);
            }
        }
        // Inactive slots always read the floor
        for ch in channels..MAX_CHANNELS {
            consumer.ballistics[ch].reset();
            consumer.input_peak_db[ch] = f32::NEG_INFINITY;
        }

        for ch in 0..MAX_CHANNELS {
            let state = &consumer.ballistics[ch];
            consumer.magnitude_db[ch] = state.magnitude_db;
            consumer.peak_db[ch] = state.peak_db;
            consumer.peak_hold_db[ch] = state.peak_hold_db;
            consumer.input_peak_hold_db[ch] = state.input_peak_hold_db;
            consumer.clipping[ch] = state.clip_active(&consumer.cfg, t_now_ns);
            consumer.clip_blink[ch] = state.clip_blink_on(&consumer.cfg, t_now_ns);
        }

        if consumer.subscribers.is_empty() {
            return;
        }

        // FFT path: lazy - runs per tick, not per block, and only while
        // someone is subscribed.
        let ConsumerHalf {
            window,
            raw_window,
            window_samples,
            spectra,
            subscribers,
            magnitude_db,
            peak_db,
            peak_hold_db,
            input_peak_db,
            input_peak_hold_db,
            clipping,
            clip_blink,
            ..
        } = consumer;

        for ch in 0..channels {
            self.shared.rings[ch].snapshot(raw_window);
            window.apply(raw_window, &mut window_samples[ch]);
            fft.power_spectrum(&window_samples[ch], window, &mut spectra[ch]);
            // DC is computed but zeroed for display
            spectra[ch][0] = 0.0;
        }

        let frame = LevelsFrame {
            source: self.source,
            channels,
            magnitude_db: &magnitude_db[..channels],
            peak_db: &peak_db[..channels],
            peak_hold_db: &peak_hold_db[..channels],
            input_peak_db: &input_peak_db[..channels],
            input_peak_hold_db: &input_peak_hold_db[..channels],
            clipping: &clipping[..channels],
            clip_blink: &clip_blink[..channels],
            window_samples: &window_samples[..channels],
            power_spectrum: &spectra[..channels],
        };
        for entry in subscribers.iter() {
            (entry.callback)(&frame);
        }
    }

    // ─── Configuration surface ──────────────────────────────────────────

    /// Register a subscriber; the callback runs inline at the end of every
    /// tick until unsubscribed.
    pub fn subscribe(
        &self,
        callback: impl Fn(&LevelsFrame<'_>) + Send + 'static,
    ) -> SubscriptionId {
        let mut consumer = self.consumer.lock().unwrap();
        let id = SubscriptionId(consumer.next_subscription);
        consumer.next_subscription += 1;
        consumer.subscribers.push(SubscriberEntry {
            id,
            callback: Box::new(callback),
        });
        id
    }

    /// Remove a subscriber. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut consumer = self.consumer.lock().unwrap();
        let before = consumer.subscribers.len();
        consumer.subscribers.retain(|entry| entry.id != id);
        consumer.subscribers.len() != before
    }

    /// Select the analysis window function.
    pub fn set_window_kind(&self, kind: WindowKind) {
        let mut consumer = self.consumer.lock().unwrap();
        consumer.window = Window::new(kind, self.window_len);
    }

    /// Select the analysis window by name. Unrecognized names fall back to
    /// the default (Blackman-Harris); the error reports what was asked for.
    pub fn set_window_kind_by_name(&self, name: &str) -> MeterResult<WindowKind> {
        match WindowKind::from_name(name) {
            Some(kind) => {
                self.set_window_kind(kind);
                Ok(kind)
            }
            None => {
                let err = MeterError::UnknownWindow(name.to_string());
                log::warn!("{}: {}", self.source, err);
                self.set_window_kind(WindowKind::default());
                Err(err)
            }
        }
    }

    /// Apply a partial ballistics update; invalid fields are rejected
    /// individually with the previous value retained.
    pub fn set_ballistics(&self, update: &BallisticsUpdate) -> MeterResult<()> {
        self.consumer.lock().unwrap().cfg.apply(update)
    }

    pub fn ballistics_config(&self) -> BallisticsConfig {
        self.consumer.lock().unwrap().cfg
    }

    /// Set the post-fader gain applied to peak/magnitude (input peak stays
    /// pre-fader). Takes effect from the next block.
    pub fn set_gain_db(&self, db: f32) {
        self.set_gain_multiplier(db_to_mul(db));
    }

    /// Same as [`set_gain_db`](Self::set_gain_db), as a linear multiplier
    /// (e.g. straight from a fader).
    pub fn set_gain_multiplier(&self, multiplier: f32) {
        let multiplier = if multiplier.is_finite() && multiplier >= 0.0 {
            multiplier
        } else {
            1.0
        };
        self.shared
            .gain_bits
            .store(multiplier.to_bits(), Ordering::Relaxed);
    }

    /// Select sample-peak or oversampled true-peak measurement.
    pub fn set_peak_meter_kind(&self, kind: PeakMeterKind) {
        let value = match kind {
            PeakMeterKind::SamplePeak => 0,
            PeakMeterKind::TruePeak => 1,
        };
        self.shared.peak_kind.store(value, Ordering::Relaxed);
    }

    /// Copy of one channel's current ballistics state, for hosts that poll
    /// instead of subscribing.
    pub fn ballistics_snapshot(&self, channel: usize) -> Option<ChannelBallistics> {
        let consumer = self.consumer.lock().unwrap();
        consumer.ballistics.get(channel).cloned()
    }

    /// Force ballistics back to -inf and clear the sample rings.
    pub fn reset(&self) {
        // Holding the producer lock briefly makes the audio thread drop at
        // most one block instead of racing the clear.
        let _producer = self.producer.lock().unwrap();
        for ring in &self.shared.rings {
            ring.clear();
        }
        self.shared.publisher.reset();
        self.shared.last_block_ns.store(0, Ordering::Release);

        let mut consumer = self.consumer.lock().unwrap();
        while consumer.queue.pop().is_ok() {}
        for state in consumer.ballistics.iter_mut() {
            state.reset();
        }
        consumer.idle_applied = false;
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Change the channel count. Rings and ballistics are reset and
    /// subscribers see one all-floor frame in the new layout before any new
    /// block is delivered.
    pub fn reconfigure(&self, channel_count: usize) {
        assert!(
            channel_count >= 1 && channel_count <= MAX_CHANNELS,
            "bad channel count"
        );

        self.shared
            .state
            .store(STATE_RECONFIGURING, Ordering::Release);

        // Wait out any in-flight block; new ones are refused by the state
        let producer = self.producer.lock().unwrap();
        for ring in &self.shared.rings {
            ring.clear();
        }
        self.shared.publisher.reset();
        self.shared.last_block_ns.store(0, Ordering::Release);
        self.shared.channels.store(channel_count, Ordering::Relaxed);
        drop(producer);

        let mut guard = self.consumer.lock().unwrap();
        let consumer = &mut *guard;
        while consumer.queue.pop().is_ok() {}
        for state in consumer.ballistics.iter_mut() {
            state.reset();
        }
        consumer.idle_applied = false;
        consumer.magnitude_db = [f32::NEG_INFINITY; MAX_CHANNELS];
        consumer.peak_db = [f32::NEG_INFINITY; MAX_CHANNELS];
        consumer.peak_hold_db = [f32::NEG_INFINITY; MAX_CHANNELS];
        consumer.input_peak_db = [f32::NEG_INFINITY; MAX_CHANNELS];
        consumer.input_peak_hold_db = [f32::NEG_INFINITY; MAX_CHANNELS];
        consumer.clipping = [false; MAX_CHANNELS];
        consumer.clip_blink = [false; MAX_CHANNELS];
        for buf in consumer.window_samples.iter_mut() {
            buf.fill(0.0);
        }
        for buf in consumer.spectra.iter_mut() {
            buf.fill(0.0);
        }

        // Announce the new layout before the first new block
        let frame = LevelsFrame {
            source: self.source,
            channels: channel_count,
            magnitude_db: &consumer.magnitude_db[..channel_count],
            peak_db: &consumer.peak_db[..channel_count],
            peak_hold_db: &consumer.peak_hold_db[..channel_count],
            input_peak_db: &consumer.input_peak_db[..channel_count],
            input_peak_hold_db: &consumer.input_peak_hold_db[..channel_count],
            clipping: &consumer.clipping[..channel_count],
            clip_blink: &consumer.clip_blink[..channel_count],
            window_samples: &consumer.window_samples[..channel_count],
            power_spectrum: &consumer.spectra[..channel_count],
        };
        for entry in consumer.subscribers.iter() {
            (entry.callback)(&frame);
        }
        drop(guard);

        self.shared.state.store(STATE_ATTACHED, Ordering::Release);
    }

    /// Cooperative detach: refuse new blocks, wait (bounded by one tick
    /// period) for an in-flight `on_block` to finish, then release state.
    /// The ticker skips the channel as soon as the state flips.
    pub fn detach(&self) {
        self.shared.state.store(STATE_DETACHING, Ordering::Release);

        let deadline = Instant::now() + TICK_INTERVAL;
        loop {
            if let Ok(producer) = self.producer.try_lock() {
                drop(producer);
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("{}: detach timed out waiting for in-flight block", self.source);
                break;
            }
            std::thread::sleep(Duration::from_micros(200));
        }

        for ring in &self.shared.rings {
            ring.clear();
        }
        self.shared.publisher.reset();
        self.shared.last_block_ns.store(0, Ordering::Release);

        if let Ok(mut consumer) = self.consumer.lock() {
            while consumer.queue.pop().is_ok() {}
            for state in consumer.ballistics.iter_mut() {
                state.reset();
            }
            consumer.subscribers.clear();
        }

        self.shared.state.store(STATE_UNATTACHED, Ordering::Release);
    }
}
