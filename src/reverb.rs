//! C5 — Spring reverb.
//!
//! Four parallel feedback combs followed by three series allpasses with
//! a damped feedback path (spec.md §4.5). Grounded on
//! `quiver::simd::RingBuffer`'s single read/write-pointer delay line,
//! used here per comb/allpass stage.

use crate::block::DelayLine;

const NUM_COMBS: usize = 4;
const NUM_ALLPASS: usize = 3;

/// Default delay lengths at 22050 Hz, scaled by `SR/22050` at construction.
const DEFAULT_LENGTHS_22050: [usize; 7] = [2999, 2331, 1893, 1097, 1051, 337, 113];

const INV_SQRT2: f32 = core::f32::consts::FRAC_1_SQRT_2;

#[derive(Debug, Clone)]
pub struct ReverbConfig {
    pub sample_rate: f64,
    pub wet: f32,
    pub dry: f32,
    pub input_gain: f32,
    pub feedback: f32,
    pub comb_gains: [f32; NUM_COMBS],
    pub allpass_gains: [f32; NUM_ALLPASS],
}

impl Default for ReverbConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            wet: 0.3,
            dry: 0.7,
            input_gain: 0.025,
            feedback: -0.015,
            comb_gains: [INV_SQRT2; NUM_COMBS],
            allpass_gains: [INV_SQRT2; NUM_ALLPASS],
        }
    }
}

pub struct Reverb {
    combs: [DelayLine; NUM_COMBS],
    allpasses: [DelayLine; NUM_ALLPASS],
    comb_gains: [f32; NUM_COMBS],
    allpass_gains: [f32; NUM_ALLPASS],
    wet: f32,
    dry: f32,
    input_gain: f32,
    feedback: f32,
    yy1: f32,
    y_1: f32,
}

impl Reverb {
    pub fn new(config: &ReverbConfig) -> Self {
        let scale = config.sample_rate / 22050.0;
        let lengths: Vec<usize> = DEFAULT_LENGTHS_22050
            .iter()
            .map(|&l| ((l as f64 * scale).round() as usize).max(1))
            .collect();

        let combs = core::array::from_fn(|i| DelayLine::new(lengths[i]));
        let allpasses = core::array::from_fn(|i| DelayLine::new(lengths[NUM_COMBS + i]));

        Self {
            combs,
            allpasses,
            comb_gains: config.comb_gains,
            allpass_gains: config.allpass_gains,
            wet: config.wet,
            dry: config.dry,
            input_gain: config.input_gain,
            feedback: config.feedback,
            yy1: 0.0,
            y_1: 0.0,
        }
    }

    pub fn reset(&mut self) {
        for c in &mut self.combs {
            c.clear();
        }
        for a in &mut self.allpasses {
            a.clear();
        }
        self.yy1 = 0.0;
        self.y_1 = 0.0;
    }

    /// Set wet/dry mix while preserving the `wet + dry` invariant (§4.5
    /// `set_mix`).
    pub fn set_mix(&mut self, g: f32) {
        let total = self.wet + self.dry;
        self.wet = g.clamp(0.0, 1.0) * total;
        self.dry = total - self.wet;
    }

    pub fn mix_ratio(&self) -> f32 {
        if self.wet + self.dry == 0.0 {
            0.0
        } else {
            self.wet / (self.wet + self.dry)
        }
    }

    /// Scale both wet and dry proportionally (§4.5 `set_output_gain`).
    pub fn set_output_gain(&mut self, g: f32) {
        self.wet *= g;
        self.dry *= g;
    }

    /// Process one sample (spec.md §4.5). The comb stage folds the
    /// previous sample's damped feedback `y_1` back into the input, per
    /// the source's feedback path.
    pub fn process(&mut self, x: f32) -> f32 {
        let xo = x;
        let xin = self.input_gain * x + self.y_1;

        let mut xa = 0.0f32;
        for i in 0..NUM_COMBS {
            let y = self.combs[i].read();
            self.combs[i].write_advance(xin + self.comb_gains[i] * y);
            xa += y;
        }

        for i in 0..NUM_ALLPASS {
            let y = self.allpasses[i].read();
            self.allpasses[i].write_advance(self.allpass_gains[i] * (xa + y));
            xa = y - xa;
        }

        let y = 0.5 * (xa + self.yy1);
        self.yy1 = y;
        self.y_1 = self.feedback * xa;

        self.wet * y + self.dry * xo + denormal_guard()
    }

    pub fn process_block(&mut self, block: &mut [f32]) {
        for sample in block.iter_mut() {
            *sample = self.process(*sample);
        }
    }
}

#[inline]
fn denormal_guard() -> f32 {
    1e-20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_mix_preserves_wet_plus_dry() {
        let mut r = Reverb::new(&ReverbConfig::default());
        let total_before = r.wet + r.dry;
        r.set_mix(0.8);
        assert!((r.mix_ratio() - 0.8).abs() < 1e-6);
        assert!((r.wet + r.dry - total_before).abs() < 1e-6);
    }

    #[test]
    fn impulse_response_decays_and_stays_finite() {
        let mut r = Reverb::new(&ReverbConfig {
            sample_rate: 48000.0,
            ..Default::default()
        });
        let mut out = vec![];
        out.push(r.process(1.0));
        for _ in 0..(48000 * 3) {
            out.push(r.process(0.0));
        }
        assert!(out.iter().all(|s| s.is_finite()));
        // energy in the tail should have decayed well below the initial
        // transient.
        let early: f32 = out[..512].iter().map(|s| s * s).sum();
        let late: f32 = out[out.len() - 4800..].iter().map(|s| s * s).sum();
        assert!(late < early, "early={early} late={late}");
    }

    #[test]
    fn denormal_freedom_after_long_silence() {
        let mut r = Reverb::new(&ReverbConfig::default());
        r.process(1.0);
        for _ in 0..1_000_000 {
            r.process(0.0);
        }
        let y = r.process(0.0);
        assert!(y == 0.0 || y.abs() > 1e-30);
    }
}
