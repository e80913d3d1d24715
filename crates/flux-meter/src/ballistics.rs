//! Ballistics engine - how displayed values chase the signal
//!
//! Advances per-channel displayed values from the current block stats and
//! the elapsed wall time, independent of audio block boundaries:
//! - **Magnitude**: VU-style integration toward the input with a 0.3 s time
//!   constant, clamped to `[minimum_level, 0]` dB.
//! - **Peak**: attack-instant, decay-linear in dB (default 11.76 dB/s, about
//!   20 dB in 1.7 s - a medium PPM).
//! - **Peak hold / input-peak hold**: latch at the local maximum, drop after
//!   a configured timeout (20 s / 1 s defaults).
//! - **Clip**: latched while the pre-fader input peak sits above the clip
//!   level, cleared a hold period after the last clipping block, blinking
//!   with a square tick while latched.
//!
//! All state is in dB; `-inf` is the legal "below representable" value.

use crate::error::{MeterError, MeterResult};
use crate::types::NANOS_PER_SEC;

/// Silence-to-reset timeout: a channel with no block for this long drops
/// out to -inf instead of holding its last reading.
pub const IDLE_TIMEOUT_NS: u64 = NANOS_PER_SEC / 2;

/// Fraction of the remaining distance covered per integration-time unit;
/// gives the magnitude meter a 99% step response over the time constant.
const MAGNITUDE_ATTENUATION: f32 = 0.99;

/// Tunable ballistics parameters. Defaults give a medium-PPM peak meter
/// with a VU magnitude needle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BallisticsConfig {
    /// Linear peak decay in dB per second
    pub peak_decay_rate_db_per_s: f32,
    /// Magnitude integration time constant in seconds
    pub magnitude_integration_time_s: f32,
    /// How long a peak-hold reading latches
    pub peak_hold_duration_s: f32,
    /// How long an input-peak-hold reading latches
    pub input_peak_hold_duration_s: f32,
    /// Display floor in dB
    pub minimum_level_db: f32,
    /// Pre-fader input peak at or above this is a clip
    pub clip_level_db: f32,
    /// How long the clip indicator stays latched after the last clip
    pub clip_hold_duration_s: f32,
    /// Square-tick blink period while the clip indicator is latched
    pub clip_animation_duration_s: f32,
}

impl Default for BallisticsConfig {
    fn default() -> Self {
        Self {
            peak_decay_rate_db_per_s: 11.76,
            magnitude_integration_time_s: 0.3,
            peak_hold_duration_s: 20.0,
            input_peak_hold_duration_s: 1.0,
            minimum_level_db: -60.0,
            clip_level_db: -0.5,
            clip_hold_duration_s: 3.0,
            clip_animation_duration_s: 1.0,
        }
    }
}

impl BallisticsConfig {
    pub fn peak_hold_ns(&self) -> u64 {
        secs_to_ns(self.peak_hold_duration_s)
    }

    pub fn input_peak_hold_ns(&self) -> u64 {
        secs_to_ns(self.input_peak_hold_duration_s)
    }

    pub fn clip_hold_ns(&self) -> u64 {
        secs_to_ns(self.clip_hold_duration_s)
    }

    pub fn clip_animation_ns(&self) -> u64 {
        secs_to_ns(self.clip_animation_duration_s)
    }

    /// Merge a partial update. Each field is validated on its own: an
    /// invalid field is rejected and its previous value kept, while the
    /// remaining fields still apply. The first rejection is reported.
    pub fn apply(&mut self, update: &BallisticsUpdate) -> MeterResult<()> {
        let mut rejected: Option<MeterError> = None;
        let mut positive = |field: &'static str, value: f32, slot: &mut f32| {
            if value > 0.0 && value.is_finite() {
                *slot = value;
            } else if rejected.is_none() {
                rejected = Some(MeterError::InvalidConfig { field, value });
            }
        };

        if let Some(v) = update.peak_decay_rate_db_per_s {
            positive("peak_decay_rate_db_per_s", v, &mut self.peak_decay_rate_db_per_s);
        }
        if let Some(v) = update.magnitude_integration_time_s {
            positive(
                "magnitude_integration_time_s",
                v,
                &mut self.magnitude_integration_time_s,
            );
        }
        if let Some(v) = update.peak_hold_duration_s {
            positive("peak_hold_duration_s", v, &mut self.peak_hold_duration_s);
        }
        if let Some(v) = update.input_peak_hold_duration_s {
            positive(
                "input_peak_hold_duration_s",
                v,
                &mut self.input_peak_hold_duration_s,
            );
        }
        if let Some(v) = update.clip_hold_duration_s {
            positive("clip_hold_duration_s", v, &mut self.clip_hold_duration_s);
        }
        if let Some(v) = update.clip_animation_duration_s {
            positive(
                "clip_animation_duration_s",
                v,
                &mut self.clip_animation_duration_s,
            );
        }
        if let Some(v) = update.minimum_level_db {
            self.minimum_level_db = v;
        }
        if let Some(v) = update.clip_level_db {
            self.clip_level_db = v;
        }

        rejected.map_or(Ok(()), Err)
    }
}

fn secs_to_ns(secs: f32) -> u64 {
    (f64::from(secs) * NANOS_PER_SEC as f64) as u64
}

/// Partial ballistics update; `None` fields keep their current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct BallisticsUpdate {
    pub peak_decay_rate_db_per_s: Option<f32>,
    pub magnitude_integration_time_s: Option<f32>,
    pub peak_hold_duration_s: Option<f32>,
    pub input_peak_hold_duration_s: Option<f32>,
    pub minimum_level_db: Option<f32>,
    pub clip_level_db: Option<f32>,
    pub clip_hold_duration_s: Option<f32>,
    pub clip_animation_duration_s: Option<f32>,
}

/// dB-domain inputs for one channel on one tick.
#[derive(Debug, Clone, Copy)]
pub struct LevelInput {
    pub magnitude_db: f32,
    pub peak_db: f32,
    pub input_peak_db: f32,
}

/// Displayed values and hold timestamps for one channel.
#[derive(Debug, Clone)]
pub struct ChannelBallistics {
    pub magnitude_db: f32,
    pub peak_db: f32,
    pub peak_hold_db: f32,
    peak_hold_updated_ns: u64,
    pub input_peak_hold_db: f32,
    input_peak_hold_updated_ns: u64,
    clip_latched_ns: Option<u64>,
}

impl ChannelBallistics {
    pub fn new() -> Self {
        Self {
            magnitude_db: f32::NEG_INFINITY,
            peak_db: f32::NEG_INFINITY,
            peak_hold_db: f32::NEG_INFINITY,
            peak_hold_updated_ns: 0,
            input_peak_hold_db: f32::NEG_INFINITY,
            input_peak_hold_updated_ns: 0,
            clip_latched_ns: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Advance all displayed values by one tick of `dt_s` seconds ending at
    /// `t_now_ns`.
    pub fn advance(
        &mut self,
        cfg: &BallisticsConfig,
        input: LevelInput,
        t_now_ns: u64,
        dt_s: f32,
    ) {
        // Magnitude: VU-style integration
        if !self.magnitude_db.is_finite() {
            self.magnitude_db = input.magnitude_db;
        } else {
            let step = (input.magnitude_db - self.magnitude_db)
                * (dt_s / cfg.magnitude_integration_time_s)
                * MAGNITUDE_ATTENUATION;
            self.magnitude_db = (self.magnitude_db + step).clamp(cfg.minimum_level_db, 0.0);
        }

        // Peak: instant attack, linear decay, 0 dB ceiling
        if !self.peak_db.is_finite() || input.peak_db >= self.peak_db {
            self.peak_db = input.peak_db.min(0.0);
        } else {
            let decayed = self.peak_db - cfg.peak_decay_rate_db_per_s * dt_s;
            self.peak_db = decayed.max(input.peak_db).max(cfg.minimum_level_db);
        }

        // Peak hold: latch with timeout. On expiry the hold falls back to
        // the just-advanced displayed peak, so it never reads below the bar
        // it sits on.
        if !self.peak_hold_db.is_finite() || input.peak_db >= self.peak_hold_db {
            self.peak_hold_db = input.peak_db;
            self.peak_hold_updated_ns = t_now_ns;
        } else if t_now_ns.saturating_sub(self.peak_hold_updated_ns) > cfg.peak_hold_ns() {
            self.peak_hold_db = self.peak_db;
            self.peak_hold_updated_ns = t_now_ns;
        }

        // Input peak hold: same latch on the raw pre-fader peak
        if !self.input_peak_hold_db.is_finite() || input.input_peak_db >= self.input_peak_hold_db
        {
            self.input_peak_hold_db = input.input_peak_db;
            self.input_peak_hold_updated_ns = t_now_ns;
        } else if t_now_ns.saturating_sub(self.input_peak_hold_updated_ns)
            > cfg.input_peak_hold_ns()
        {
            self.input_peak_hold_db = input.input_peak_db;
            self.input_peak_hold_updated_ns = t_now_ns;
        }

        // Clip latch on the pre-fader input peak
        if input.input_peak_db >= cfg.clip_level_db {
            self.clip_latched_ns = Some(t_now_ns);
        }
    }

    /// Whether the clip indicator is latched at `t_now_ns`.
    pub fn clip_active(&self, cfg: &BallisticsConfig, t_now_ns: u64) -> bool {
        match self.clip_latched_ns {
            Some(latched) => t_now_ns.saturating_sub(latched) <= cfg.clip_hold_ns(),
            None => false,
        }
    }

    /// Square-tick animation phase of the latched clip indicator: on for
    /// the first half of each animation period. Always false once the latch
    /// has cleared.
    pub fn clip_blink_on(&self, cfg: &BallisticsConfig, t_now_ns: u64) -> bool {
        if !self.clip_active(cfg, t_now_ns) {
            return false;
        }
        let elapsed = t_now_ns.saturating_sub(self.clip_latched_ns.unwrap_or(0));
        let half_period = (cfg.clip_animation_ns() / 2).max(1);
        (elapsed / half_period) % 2 == 0
    }
}

impl Default for ChannelBallistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK_S: f32 = 1.0 / 30.0;
    const TICK_NS: u64 = NANOS_PER_SEC / 30;

    fn silence() -> LevelInput {
        LevelInput {
            magnitude_db: f32::NEG_INFINITY,
            peak_db: f32::NEG_INFINITY,
            input_peak_db: f32::NEG_INFINITY,
        }
    }

    fn steady(db: f32) -> LevelInput {
        LevelInput {
            magnitude_db: db,
            peak_db: db,
            input_peak_db: db,
        }
    }

    #[test]
    fn test_first_tick_adopts_input() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        state.advance(&cfg, steady(-6.02), TICK_NS, 0.0);

        assert!((state.magnitude_db + 6.02).abs() < 1e-5);
        assert!((state.peak_db + 6.02).abs() < 1e-5);
        assert!((state.peak_hold_db + 6.02).abs() < 1e-5);
    }

    #[test]
    fn test_magnitude_integrates_toward_input() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        state.advance(&cfg, steady(-40.0), 0, 0.0);

        // Step the input up and let the needle settle for 2 seconds
        let mut t = 0;
        for _ in 0..60 {
            t += TICK_NS;
            state.advance(&cfg, steady(-6.0), t, TICK_S);
        }
        assert!(
            (state.magnitude_db + 6.0).abs() < 0.1,
            "settled at {}",
            state.magnitude_db
        );
    }

    #[test]
    fn test_magnitude_clamps_to_floor() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        state.advance(&cfg, steady(-6.0), 0, 0.0);
        state.advance(&cfg, silence(), TICK_NS, TICK_S);
        assert_eq!(state.magnitude_db, cfg.minimum_level_db);
    }

    #[test]
    fn test_reset_plus_silence_stays_at_negative_infinity() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        let mut t = 0;
        for _ in 0..100 {
            t += TICK_NS;
            state.advance(&cfg, silence(), t, TICK_S);
        }
        assert_eq!(state.magnitude_db, f32::NEG_INFINITY);
        assert_eq!(state.peak_db, f32::NEG_INFINITY);
        assert_eq!(state.peak_hold_db, f32::NEG_INFINITY);
        assert_eq!(state.input_peak_hold_db, f32::NEG_INFINITY);
    }

    #[test]
    fn test_peak_decays_linearly() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        state.advance(&cfg, steady(0.0), 0, 0.0);
        assert_eq!(state.peak_db, 0.0);

        let mut t = 0;
        for n in 1..=40 {
            t += TICK_NS;
            state.advance(&cfg, silence(), t, TICK_S);
            let expected = (-cfg.peak_decay_rate_db_per_s * TICK_S * n as f32)
                .max(cfg.minimum_level_db);
            assert!(
                (state.peak_db - expected).abs() < 1e-3,
                "tick {}: {} vs {}",
                n,
                state.peak_db,
                expected
            );
        }
    }

    #[test]
    fn test_peak_decay_stops_at_floor() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        state.advance(&cfg, steady(0.0), 0, 0.0);

        // 60 dB at 11.76 dB/s is ~5.1 s; run 8 s
        let mut t = 0;
        for _ in 0..240 {
            t += TICK_NS;
            state.advance(&cfg, silence(), t, TICK_S);
        }
        assert_eq!(state.peak_db, cfg.minimum_level_db);
    }

    #[test]
    fn test_peak_attack_is_instant_and_ceilinged() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        state.advance(&cfg, steady(-30.0), 0, 0.0);
        state.advance(&cfg, steady(3.5), TICK_NS, TICK_S);

        // Snap up immediately, but the displayed bar tops out at 0 dB
        assert_eq!(state.peak_db, 0.0);
        // The hold latches the real (over) value
        assert!((state.peak_hold_db - 3.5).abs() < 1e-6);
    }

    #[test]
    fn test_peak_hold_expires_to_displayed_peak() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        state.advance(&cfg, steady(0.0), 0, 0.0);

        let hold_ns = cfg.peak_hold_ns();
        let mut t = 0;
        let mut expired_at = None;
        for _ in 0..700 {
            t += TICK_NS;
            state.advance(&cfg, silence(), t, TICK_S);
            if t <= hold_ns {
                assert_eq!(state.peak_hold_db, 0.0, "dropped early at {} ns", t);
            } else {
                expired_at.get_or_insert(t);
            }
        }
        assert!(expired_at.is_some());
        // After expiry the hold tracks the (floored) displayed peak
        assert_eq!(state.peak_hold_db, state.peak_db);
        assert!(state.peak_hold_db >= state.peak_db);
    }

    #[test]
    fn test_hold_invariant_every_tick() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        let mut t = 0;
        state.advance(&cfg, steady(-3.0), t, 0.0);
        for n in 0..800 {
            t += TICK_NS;
            let input = if n < 5 { steady(-3.0) } else { silence() };
            state.advance(&cfg, input, t, TICK_S);
            assert!(
                state.peak_hold_db >= state.peak_db,
                "violated at tick {}: hold {} < peak {}",
                n,
                state.peak_hold_db,
                state.peak_db
            );
        }
    }

    #[test]
    fn test_input_peak_hold_uses_shorter_timeout() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        state.advance(&cfg, steady(-2.0), 0, 0.0);

        let mut t = 0;
        // Still held just before 1 s
        while t + TICK_NS <= cfg.input_peak_hold_ns() {
            t += TICK_NS;
            state.advance(&cfg, silence(), t, TICK_S);
        }
        assert!((state.input_peak_hold_db + 2.0).abs() < 1e-6);

        // Two more ticks pass the timeout; the hold adopts the raw input
        t += 2 * TICK_NS;
        state.advance(&cfg, silence(), t, TICK_S);
        assert_eq!(state.input_peak_hold_db, f32::NEG_INFINITY);
    }

    #[test]
    fn test_clip_latches_and_clears() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();

        // A single clipping block (1.5 amplitude is +3.52 dB)
        state.advance(&cfg, steady(3.52), 0, 0.0);
        assert!(state.clip_active(&cfg, 0));

        let ns = |s: f32| (s as f64 * NANOS_PER_SEC as f64) as u64;
        assert!(state.clip_active(&cfg, ns(2.9)));
        assert!(!state.clip_active(&cfg, ns(3.1)));
        assert!(!state.clip_blink_on(&cfg, ns(3.1)));
    }

    #[test]
    fn test_clip_blink_square_tick() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        state.advance(&cfg, steady(1.0), 0, 0.0);

        let ns = |s: f32| (s as f64 * NANOS_PER_SEC as f64) as u64;
        // 1 s period: on during the first half, off during the second
        assert!(state.clip_blink_on(&cfg, ns(0.1)));
        assert!(!state.clip_blink_on(&cfg, ns(0.6)));
        assert!(state.clip_blink_on(&cfg, ns(1.1)));
        assert!(!state.clip_blink_on(&cfg, ns(1.6)));
    }

    #[test]
    fn test_below_clip_level_does_not_latch() {
        let cfg = BallisticsConfig::default();
        let mut state = ChannelBallistics::new();
        state.advance(&cfg, steady(-0.6), 0, 0.0);
        assert!(!state.clip_active(&cfg, 0));
    }

    #[test]
    fn test_config_rejects_invalid_fields_individually() {
        let mut cfg = BallisticsConfig::default();
        let update = BallisticsUpdate {
            peak_decay_rate_db_per_s: Some(-5.0),
            peak_hold_duration_s: Some(10.0),
            ..Default::default()
        };

        let err = cfg.apply(&update).unwrap_err();
        assert!(matches!(
            err,
            MeterError::InvalidConfig {
                field: "peak_decay_rate_db_per_s",
                ..
            }
        ));
        // The invalid field kept its previous value; the valid one applied
        assert_eq!(cfg.peak_decay_rate_db_per_s, 11.76);
        assert_eq!(cfg.peak_hold_duration_s, 10.0);
    }

    #[test]
    fn test_config_accepts_partial_update() {
        let mut cfg = BallisticsConfig::default();
        let update = BallisticsUpdate {
            minimum_level_db: Some(-90.0),
            ..Default::default()
        };
        cfg.apply(&update).unwrap();
        assert_eq!(cfg.minimum_level_db, -90.0);
        assert_eq!(cfg.clip_level_db, -0.5);
    }
}
