//! C1 — Wavetable Oscillator Bank.
//!
//! 91 precomputed looped waveforms (tonewheels), one per oscillator,
//! tuned either to equal temperament or to an integer gear-ratio model of
//! a synchronous AC motor. Grounded on `quiver::modules::Vco`'s
//! phase/frequency shape, but wavetable-based rather than phase-computed:
//! the source renders harmonic-rich loops once at init and simply walks
//! an integer read position at runtime (spec.md §4.1).

use crate::error::AllocError;

/// Number of tonewheels in a full-size generator.
pub const NUM_OSCILLATORS: usize = 91;

/// Default loop-length search precision (maximum phase error).
pub const DEFAULT_PRECISION: f64 = 1e-3;

/// Contribution floor below which a contribution is dropped entirely
/// (spec.md §3 "Key-contribution graph"), expressed in linear gain.
pub const CONTRIBUTION_FLOOR_DB: f64 = -96.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temperament {
    Equal,
    Gear60,
    Gear50,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqMacro {
    ConstrainedHermite,
    Peak24,
    Peak46,
}

/// A single tonewheel: its precomputed loop buffer, read position, and
/// per-wheel EQ weight. Which wheels are currently active and why (the
/// Active Oscillator Table) is tracked by the tone generator, not here
/// (spec.md §3 "AOT"; see `tonegen::WheelAot`).
#[derive(Debug, Clone)]
pub struct Oscillator {
    pub wave: Vec<f32>,
    pub frequency: f64,
    pub attenuation: f32,
    pub pos: usize,
}

impl Oscillator {
    /// Copy `count` samples starting at the current read position into
    /// `dst`, wrapping around the loop as needed, and advance `pos`.
    /// Mirrors the "split into two instructions that wrap the source
    /// read" behavior of spec.md §4.3.3 step 2 by doing the wrap inline.
    pub fn read_block(&mut self, dst: &mut [f32]) {
        let len = self.wave.len();
        if len == 0 {
            dst.fill(0.0);
            return;
        }
        let mut pos = self.pos;
        for slot in dst.iter_mut() {
            *slot = self.wave[pos];
            pos += 1;
            if pos >= len {
                pos = 0;
            }
        }
        self.pos = pos;
    }
}

/// Configuration for building the oscillator bank (§4.1, §3 "Build
/// phase" inputs that are oscillator-specific).
#[derive(Debug, Clone)]
pub struct OscillatorConfig {
    pub sample_rate: f64,
    pub tuning_hz: f64,
    pub temperament: Temperament,
    /// Wheel index (0-based) treated as the tuning reference for the
    /// equal-temperament formula.
    pub tuning_osc: usize,
    pub precision: f64,
    pub eq_macro: EqMacro,
    pub eq_p1y: f64,
    pub eq_r1y: f64,
    pub eq_p4y: f64,
    pub eq_r4y: f64,
    /// Per-wheel attenuation overrides (`osc.eqv.<oscnum>`), combined
    /// additively as the spec's Open Question in §9 requires: they
    /// *override*, not blend with, the macro value for that index.
    pub eqv_overrides: Vec<(usize, f32)>,
    /// Global per-harmonic amplitudes for partials 1..=12 (index 0 is the
    /// fundamental). Defaults to `{1.0, 0, ...}`.
    pub harmonic_amplitudes: [f64; 12],
    /// Per-wheel, per-harmonic overrides (`osc.harmonic.w<w>.f<h>`),
    /// combined additively with `harmonic_amplitudes` per §4.3, §9.
    pub harmonic_overrides: Vec<(usize, usize, f64)>,
}

impl Default for OscillatorConfig {
    fn default() -> Self {
        let mut amps = [0.0; 12];
        amps[0] = 1.0;
        Self {
            sample_rate: 48000.0,
            tuning_hz: 440.0,
            temperament: Temperament::Gear60,
            tuning_osc: 47,
            precision: DEFAULT_PRECISION,
            eq_macro: EqMacro::ConstrainedHermite,
            eq_p1y: 1.0,
            eq_r1y: 0.0,
            eq_p4y: 1.0,
            eq_r4y: 0.0,
            eqv_overrides: Vec::new(),
            harmonic_amplitudes: amps,
            harmonic_overrides: Vec::new(),
        }
    }
}

/// The full bank of 91 tonewheels.
pub struct OscillatorBank {
    pub oscillators: Vec<Oscillator>,
    pub block_size: usize,
    pub sample_rate: f64,
}

impl OscillatorBank {
    pub fn build(
        config: &OscillatorConfig,
        block_size: usize,
    ) -> Result<Self, AllocError> {
        let n_min = (block_size * 3).max(1);
        let n_max = ((config.sample_rate / 48000.0).ceil() as usize).max(1) * 4096;

        let mut oscillators = Vec::with_capacity(NUM_OSCILLATORS);
        for i in 0..NUM_OSCILLATORS {
            let frequency = wheel_frequency(i, config);
            let len = fit_wave(frequency, config.sample_rate, n_min, n_max, config.precision)
                .ok_or(AllocError {
                    what: "tonewheel loop buffer: no loop length fits precision",
                    requested_bytes: 0,
                })?;

            let mut wave = vec![0.0f32; len];
            if wave.is_empty() {
                return Err(AllocError {
                    what: "tonewheel loop buffer",
                    requested_bytes: 0,
                });
            }

            let attenuation = wheel_attenuation(i, config);
            synthesize_wheel(&mut wave, frequency, config.sample_rate, i, config);

            oscillators.push(Oscillator {
                wave,
                frequency,
                attenuation,
                pos: 0,
            });
        }

        Ok(Self {
            oscillators,
            block_size,
            sample_rate: config.sample_rate,
        })
    }
}

/// Compute a tonewheel's frequency under the configured temperament
/// (spec.md §4.1 "Tuning").
pub fn wheel_frequency(index: usize, config: &OscillatorConfig) -> f64 {
    match config.temperament {
        Temperament::Equal => {
            let a_ref = config.tuning_hz;
            (a_ref / 8.0) * 2f64.powf((index as f64 - config.tuning_osc as f64) / 12.0)
        }
        Temperament::Gear60 => gear_frequency(index, 60, config.tuning_hz),
        Temperament::Gear50 => gear_frequency(index, 50, config.tuning_hz),
    }
}

/// Gear-ratio frequency model for a synchronous AC-motor-driven
/// generator. `f = 20·teeth·a/b` at 60 Hz or `f = 25·teeth·a/b` at 50 Hz,
/// where `teeth = 2^(octave+1)` (192 for the top five wheels) and `(a,b)`
/// is the note class's gear pair, then scaled by `tuning_hz/440`. The
/// `(a,b)` tables are `gears60ratios`/`gears50ratios` from
/// `original_source/src/tonegen.c`, the real 2-stage gearbox ratios of the
/// tonewheel generator — not reduced to lowest terms, since the ratio of
/// numerator to denominator (not either value alone) is what matters.
fn gear_frequency(index: usize, motor_hz: u32, tuning_hz: f64) -> f64 {
    const GEARS_60: [(f64, f64); 12] = [
        (85.0, 104.0),
        (71.0, 82.0),
        (67.0, 73.0),
        (35.0, 36.0),
        (69.0, 67.0),
        (12.0, 11.0),
        (37.0, 32.0),
        (49.0, 40.0),
        (48.0, 37.0),
        (11.0, 8.0),
        (67.0, 46.0),
        (54.0, 35.0),
    ];
    const GEARS_50: [(f64, f64); 12] = [
        (17.0, 26.0),
        (57.0, 82.0),
        (11.0, 15.0),
        (49.0, 63.0),
        (33.0, 40.0),
        (55.0, 63.0),
        (49.0, 53.0),
        (49.0, 50.0),
        (55.0, 53.0),
        (11.0, 10.0),
        (7.0, 6.0),
        (90.0, 73.0),
    ];

    let octave = index / 12;
    let class = index % 12;
    let teeth = if octave >= 6 { 192.0 } else { 2f64.powi(octave as i32 + 1) };
    let (base, a, b) = if motor_hz == 60 {
        let (a, b) = GEARS_60[class];
        (20.0, a, b)
    } else {
        let (a, b) = GEARS_50[class];
        (25.0, a, b)
    };
    let f = base * teeth * a / b;
    f * (tuning_hz / 440.0)
}

/// Loop-length search (§4.1 "Loop-length search"). Returns the smallest
/// `n in [n_min, n_max]` minimizing `|SR·k/f - n|` over integer `k`,
/// stopping early once the error is below `precision`.
pub fn fit_wave(
    freq: f64,
    sample_rate: f64,
    n_min: usize,
    n_max: usize,
    precision: f64,
) -> Option<usize> {
    if freq <= 0.0 || n_min > n_max {
        return None;
    }
    let mut best_n = None;
    let mut best_err = f64::INFINITY;
    for n in n_min..=n_max {
        let k = (freq * n as f64 / sample_rate).round();
        if k < 1.0 {
            continue;
        }
        let ideal = sample_rate * k / freq;
        let err = (ideal - n as f64).abs();
        if err < best_err {
            best_err = err;
            best_n = Some(n);
            if err < precision {
                break;
            }
        }
    }
    best_n
}

/// Additively synthesize up to 12 harmonic partials into `wave`, muting
/// any partial at or above Nyquist, plus one-LSB dither (§4.1 "Harmonic
/// synthesis").
fn synthesize_wheel(
    wave: &mut [f32],
    freq: f64,
    sample_rate: f64,
    wheel_index: usize,
    config: &OscillatorConfig,
) {
    let mut amps = config.harmonic_amplitudes;
    for &(w, h, amp) in &config.harmonic_overrides {
        if w == wheel_index && h < amps.len() {
            amps[h] = amp;
        }
    }

    let nyquist = sample_rate / 2.0;
    let sum_abs: f64 = amps.iter().map(|a| a.abs()).sum::<f64>().max(1e-9);
    let attenuation = wheel_attenuation(wheel_index, config) as f64;
    let n = wave.len() as f64;

    let mut rng = crate::rng::Rng::from_seed(0xA5A5_0000 ^ wheel_index as u64);

    for (i, sample) in wave.iter_mut().enumerate() {
        let mut acc = 0.0f64;
        for (h, &amp) in amps.iter().enumerate() {
            if amp == 0.0 {
                continue;
            }
            let k = (h + 1) as f64;
            let partial_freq = k * freq;
            if partial_freq >= nyquist {
                continue;
            }
            acc += amp * (core::f64::consts::TAU * partial_freq * i as f64 / sample_rate).sin();
        }
        let dither = (rng.next_f32_bipolar() as f64) * (1.0 / 32768.0);
        *sample = ((attenuation / sum_abs) * acc + dither) as f32;
        let _ = n;
    }
}

/// Per-wheel attenuation (EQ weight) under the configured macro curve,
/// with per-wheel overrides applied last (§4.1 "EQ curves").
pub fn wheel_attenuation(index: usize, config: &OscillatorConfig) -> f32 {
    if let Some(&(_, v)) = config.eqv_overrides.iter().find(|&&(i, _)| i == index) {
        return v.clamp(0.0, 1.0);
    }
    let t = index as f64 / (NUM_OSCILLATORS - 1) as f64;
    let value = match config.eq_macro {
        EqMacro::ConstrainedHermite => {
            hermite_spline(t, config.eq_p1y, config.eq_r1y, config.eq_p4y, config.eq_r4y)
        }
        EqMacro::Peak24 => peak_curve(index, 24),
        EqMacro::Peak46 => peak_curve(index, 46),
    };
    value.clamp(0.0, 1.0) as f32
}

/// Cubic Hermite spline between `(0, p1y)` with slope `r1y` and
/// `(1, p4y)` with slope `r4y`.
fn hermite_spline(t: f64, p1y: f64, r1y: f64, p4y: f64, r4y: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    h00 * p1y + h10 * r1y + h01 * p4y + h11 * r4y
}

/// Legacy damper curve peaking near the given wheel index.
fn peak_curve(index: usize, peak_at: usize) -> f64 {
    let distance = (index as f64 - peak_at as f64).abs();
    let span = NUM_OSCILLATORS as f64 / 2.0;
    (1.0 - (distance / span)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_wave_stays_within_precision_when_achievable() {
        // 440 Hz against 48kHz with a generous range should find a near-exact fit.
        let n = fit_wave(440.0, 48000.0, 128, 4096, 1e-2).expect("fit");
        let k = (440.0 * n as f64 / 48000.0).round();
        let err = (48000.0 * k / 440.0 - n as f64).abs();
        assert!(err < 1e-1, "err={err}");
    }

    #[test]
    fn gear60_wheel_matches_the_real_gear_ratio_table() {
        // Wheel 12 is octave 1, note class 0 (C): teeth = 2^2 = 4,
        // gears60ratios[0] = (85, 104), tuning_hz = 440 (no rescale).
        let f = gear_frequency(12, 60, 440.0);
        let expected = 20.0 * 4.0 * 85.0 / 104.0;
        assert!((f - expected).abs() < 1e-9, "f={f} expected={expected}");
    }

    #[test]
    fn bank_builds_all_91_oscillators() {
        let cfg = OscillatorConfig {
            sample_rate: 48000.0,
            ..Default::default()
        };
        let bank = OscillatorBank::build(&cfg, 128).expect("bank builds");
        assert_eq!(bank.oscillators.len(), NUM_OSCILLATORS);
        for osc in &bank.oscillators {
            assert!(!osc.wave.is_empty());
            assert!(osc.frequency > 0.0);
        }
    }

    #[test]
    fn attenuation_overrides_win_over_macro() {
        let mut cfg = OscillatorConfig::default();
        cfg.eqv_overrides.push((10, 0.25));
        assert_eq!(wheel_attenuation(10, &cfg), 0.25);
    }

    #[test]
    fn read_block_wraps_around_loop() {
        let mut osc = Oscillator {
            wave: vec![1.0, 2.0, 3.0],
            frequency: 100.0,
            attenuation: 1.0,
            pos: 2,
        };
        let mut dst = [0.0f32; 4];
        osc.read_block(&mut dst);
        assert_eq!(dst, [3.0, 1.0, 2.0, 3.0]);
        assert_eq!(osc.pos, 2);
    }
}
