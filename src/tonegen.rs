//! C3 — Tone generator core.
//!
//! Wires keys to tonewheels through a compiled key-contribution graph,
//! maintains an Active Oscillator Table (AOT) of the wheels currently
//! summed into the output buses, compiles a small per-block core
//! instruction program to render them, and drives a percussion one-shot
//! and a key-compression gain chase on top. Grounded on
//! `quiver::modules::Vco`/`Lfo`'s "build a per-block render plan, then
//! walk it" shape, generalized from one oscillator's per-block
//! frequency ramp to a whole key → oscillator contribution table, and
//! on `original_source/src/tonegen.c` for the taper table, wheel-pair
//! crosstalk table, key-compression table, and percussion decay
//! constant (spec.md §3, §4.3).

use crate::oscillator::{self, OscillatorBank};
use std::collections::HashMap;

pub const NUM_DRAWBARS: usize = 9;
pub const NUM_MANUALS: usize = 3;
pub const KEYS_PER_MANUAL: usize = 61;
pub const NUM_BUSES: usize = NUM_DRAWBARS * NUM_MANUALS;
const KEY_COMP_TABLE_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manual {
    Upper,
    Lower,
    Pedal,
}

impl Manual {
    fn index(self) -> usize {
        match self {
            Manual::Upper => 0,
            Manual::Lower => 1,
            Manual::Pedal => 2,
        }
    }
}

fn global_bus(manual: Manual, bus_local: usize) -> usize {
    manual.index() * NUM_DRAWBARS + bus_local
}

/// The nine harmonic footage ratios a drawbar controls, expressed as a
/// signed semitone offset from the fundamental plus an octave-folding
/// harmonic number (spec.md §4.3.1, matching `tonegen.c`'s `ULoffset`).
const DRAWBAR_HARMONIC: [(i32, u32); NUM_DRAWBARS] = [
    (-12, 1), // sub 16'
    (7, 2),   // sub third 5 1/3'
    (0, 1),   // fundamental 8'
    (12, 2),  // 4'
    (19, 3),  // 2 2/3'
    (24, 4),  // 2'
    (28, 5),  // 1 3/5'
    (31, 6),  // 1 1/3'
    (36, 8),  // 1'
];

/// Foldback boundary variant: how far the top and bottom keys of the
/// keyboard fold back onto already-used wheels rather than running off
/// the end of the 91-wheel set (spec.md §4.1 "Foldback", §4.3.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldbackVariant {
    /// No foldback: clamp to the valid wheel range.
    Tg91Fb00,
    /// Fold back starting 9 semitones from the top.
    Tg82Fb09,
    /// Fold back the top octave entirely (12 semitones).
    Tg91Fb12,
}

impl FoldbackVariant {
    fn fold_margin(self) -> i32 {
        match self {
            FoldbackVariant::Tg91Fb00 => 0,
            FoldbackVariant::Tg82Fb09 => 9,
            FoldbackVariant::Tg91Fb12 => 12,
        }
    }
}

/// Map a (key, drawbar) pair to a tonewheel index, applying foldback at
/// both ends of the 91-wheel range.
pub fn foldback_index(key: usize, drawbar: usize, variant: FoldbackVariant) -> usize {
    let (semitone_offset, _harmonic) = DRAWBAR_HARMONIC[drawbar];
    let raw = key as i32 + semitone_offset;
    let margin = variant.fold_margin();
    let max_index = crate::oscillator::NUM_OSCILLATORS as i32 - 1;

    let folded = if raw < 0 {
        -raw
    } else if raw > max_index {
        if margin > 0 && raw > max_index + margin {
            max_index - ((raw - max_index - margin) % (max_index + 1))
        } else {
            2 * max_index - raw
        }
    } else {
        raw
    };

    folded.clamp(0, max_index) as usize
}

/// Default drawbar taper: position 0 is silent, position 8 is unity
/// gain, with an approximately exponential (musically "audio taper")
/// curve in between. This is the drawbar's own pull-out level, distinct
/// from the per-key/per-bus wiring taper in [`taper_db`].
pub fn drawbar_gain(position: u8) -> f64 {
    let position = position.min(8) as f64;
    if position == 0.0 {
        return 0.0;
    }
    let db = -3.0 * (8.0 - position);
    db_to_gain(db)
}

fn db_to_gain(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Default per-key/per-bus wiring taper, in dB, matching
/// `tonegen.c`'s `taperingModel` switch verbatim (spec.md §4.3.6).
fn taper_db(key: usize, bus_local: usize) -> f64 {
    const M3: f64 = -10.0;
    const M2: f64 = -7.0;
    const M1: f64 = -3.5;
    const REF: f64 = 0.0;
    const P1: f64 = 3.5;
    const P2: f64 = 7.0;

    match bus_local {
        0 => {
            // 16'
            if key < 12 {
                M3
            } else if key < 17 {
                M2
            } else if key < 24 {
                M1
            } else if key < 36 {
                REF
            } else if key < 48 {
                P1
            } else {
                P2
            }
        }
        1 => {
            // 5 1/3'
            if key < 15 {
                M1
            } else if key < 38 {
                REF
            } else if key < 50 {
                P1
            } else {
                P2
            }
        }
        2 => {
            // 8'
            if key < 17 {
                M2
            } else if key < 22 {
                M1
            } else if key < 37 {
                REF
            } else if key < 49 {
                P1
            } else {
                P2
            }
        }
        3 => {
            // 4'
            if key < 17 {
                M1
            } else if key < 39 {
                REF
            } else {
                M1
            }
        }
        4 => {
            // 2 2/3'
            if key < 14 {
                P2
            } else if key < 20 {
                P1
            } else if key < 40 {
                REF
            } else if key < 50 {
                M1
            } else {
                M2
            }
        }
        5 => {
            // 2'
            if key < 12 {
                P2
            } else if key < 15 {
                P1
            } else if key < 41 {
                REF
            } else if key < 54 {
                M1
            } else {
                M2
            }
        }
        6 => {
            // 1 3/5'
            if key < 14 {
                P1
            } else if key < 42 {
                REF
            } else if key < 50 {
                M1
            } else {
                M2
            }
        }
        7 => {
            // 1 1/3'
            if key < 43 {
                REF
            } else if key < 48 {
                M1
            } else {
                M2
            }
        }
        8 => {
            // 1'
            if key < 43 {
                REF
            } else {
                M2
            }
        }
        _ => REF,
    }
}

/// Compartment-crosstalk wheel pairing, 1-indexed exactly as
/// `tonegen.c`'s `wheelPairs[92]` (index 0 unused, 0 means "no pair").
#[rustfmt::skip]
const WHEEL_PAIRS_1INDEXED: [u8; 92] = [
    0,
    49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60,
    61, 62, 63, 64, 65, 66, 67, 68, 69, 70, 71, 72,
    73, 74, 75, 76, 77, 78, 79, 80, 81, 82, 83, 84,
    0,  0,  0,  0,  0,  85, 86, 87, 88, 89, 90, 91,
    1,  2,  3,  4,  5,  6,  7,  8,  9,  10, 11, 12,
    13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
    25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36,
    42, 43, 44, 45, 46, 47, 48,
];

fn wheel_pair(wheel0: usize) -> Option<usize> {
    let entry = *WHEEL_PAIRS_1INDEXED.get(wheel0 + 1)?;
    if entry == 0 {
        None
    } else {
        Some(entry as usize - 1)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DrawbarSet {
    pub positions: [u8; NUM_DRAWBARS],
}

impl Default for DrawbarSet {
    fn default() -> Self {
        Self {
            positions: [0; NUM_DRAWBARS],
        }
    }
}

impl DrawbarSet {
    pub fn set(&mut self, drawbar: usize, position: u8) {
        if drawbar < NUM_DRAWBARS {
            self.positions[drawbar] = position.min(8);
        }
    }
}

/// One compiled entry of the key-contribution graph: this key drives
/// `wheel` onto global `bus` with the given static wiring gain (spec.md
/// §3 "Key-contribution graph").
#[derive(Debug, Clone, Copy)]
struct ContribEntry {
    wheel: usize,
    bus: usize,
    gain: f32,
}

/// Envelope shapes used for contribution fade-in/fade-out at the
/// instant a wheel enters or leaves the active set (spec.md §4.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvelopeShape {
    Cosine,
    Linear,
}

/// Build a normalized `[0, 1]` envelope ramp of `len` samples.
fn build_envelope(shape: EnvelopeShape, len: usize) -> Vec<f32> {
    let len = len.max(1);
    (0..len)
        .map(|i| {
            let t = i as f64 / len as f64;
            let value = match shape {
                EnvelopeShape::Cosine => 0.5 - 0.5 * (core::f64::consts::PI * t).cos(),
                EnvelopeShape::Linear => t,
            };
            value.clamp(0.0, 1.0) as f32
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercussionHarmonic {
    /// Taps the "4'" bus (2nd harmonic above the fundamental).
    Second,
    /// Taps the "2 2/3'" bus (3rd harmonic above the fundamental).
    Third,
}

impl PercussionHarmonic {
    fn trigger_bus_local(self) -> usize {
        match self {
            PercussionHarmonic::Second => 3,
            PercussionHarmonic::Third => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PercussionConfig {
    pub enabled: bool,
    pub fast: bool,
    pub soft: bool,
    pub harmonic: PercussionHarmonic,
    pub gain: f64,
    pub single_trigger: bool,
}

impl Default for PercussionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fast: true,
            soft: true,
            harmonic: PercussionHarmonic::Second,
            gain: 1.0,
            single_trigger: true,
        }
    }
}

/// The percussion "capacitor discharge" one-shot: on trigger the gain
/// jumps to a reset level and decays exponentially toward silence
/// (spec.md §4.3.5). `decay_const` is recomputed per trigger from
/// `exp(log(target/reset) / (SR · seconds))`, exactly
/// `tonegen.c`'s `getPercDecayConst_sec`.
struct PercussionState {
    gain: f32,
    decay_const: f32,
    already_fired_since_release: bool,
    sample_rate: f64,
}

const PERC_TARGET_DB: f64 = -60.0;

impl PercussionState {
    fn new(sample_rate: f64) -> Self {
        Self {
            gain: 0.0,
            decay_const: 1.0,
            already_fired_since_release: false,
            sample_rate,
        }
    }

    fn trigger(&mut self, config: &PercussionConfig) {
        if config.single_trigger && self.already_fired_since_release {
            return;
        }
        let reset = if config.soft { 0.5012 } else { 1.0 };
        let seconds = if config.fast { 1.0 } else { 4.0 };
        let target = db_to_gain(PERC_TARGET_DB);
        let spls = self.sample_rate * seconds;
        self.gain = reset as f32;
        self.decay_const = ((target / reset).ln() / spls).exp() as f32;
        self.already_fired_since_release = true;
    }

    fn release_all(&mut self) {
        self.already_fired_since_release = false;
    }

    /// Emit `n` successive gain samples, advancing the decay.
    fn next_block_curve(&mut self, n: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.gain);
            self.gain *= self.decay_const;
        }
        out
    }
}

#[derive(Clone)]
pub struct ToneGeneratorConfig {
    pub sample_rate: f64,
    pub foldback: FoldbackVariant,
    pub percussion: PercussionConfig,
    /// Wiring crosstalk between adjacent buses of the same key's
    /// terminal (spec.md §4.3.1 "wiring_xtalk").
    pub wiring_xtalk: f64,
    /// Compartment crosstalk fraction bled onto a wheel's paired wheel
    /// (spec.md §4.3.1 "compartment crosstalk").
    pub compartment_alpha: f64,
    /// Whether the upper/lower manual buses are scanned by the vibrato
    /// route, or sent straight to the swell bus (spec.md §4.3.3 step 2:
    /// "always routing pedal to swell"; pedal never appears here since
    /// it is unconditionally swell-routed).
    pub route_upper_vibrato: bool,
    pub route_lower_vibrato: bool,
}

impl Default for ToneGeneratorConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            foldback: FoldbackVariant::Tg91Fb00,
            percussion: PercussionConfig::default(),
            wiring_xtalk: 0.01,
            compartment_alpha: 0.03,
            route_upper_vibrato: true,
            route_lower_vibrato: false,
        }
    }
}

/// Per-wheel active-oscillator-table entry (spec.md §3 "AOT").
#[derive(Clone)]
struct WheelAot {
    bus_level: [f32; NUM_BUSES],
    ref_count: u32,
    render_flag: RenderFlag,
    sum_swell: f32,
    sum_scan: f32,
    sum_perc: f32,
}

impl Default for WheelAot {
    fn default() -> Self {
        Self {
            bus_level: [0.0; NUM_BUSES],
            ref_count: 0,
            render_flag: RenderFlag::Unchanged,
            sum_swell: 0.0,
            sum_scan: 0.0,
            sum_perc: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderFlag {
    Added,
    Removed,
    Modified,
    Unchanged,
}

enum InstrKind {
    Plain,
    Attack,
    Release,
}

/// One core instruction: render a wheel's wavetable for the block,
/// cross-fading between `start_*`/`end_*` bus gains (spec.md §3 "Core
/// instruction").
struct CoreInstruction {
    wheel: usize,
    kind: InstrKind,
    start_swell: f32,
    end_swell: f32,
    start_scan: f32,
    end_scan: f32,
    start_perc: f32,
    end_perc: f32,
}

/// Build the key compression table (spec.md §4.3.4), matching
/// `tonegen.c`'s `initKeyCompTable` hand-tuned entries for 0..10 and a
/// linear dB ramp from -5 to -9 dB for 11..127.
fn build_key_comp_table() -> [f32; KEY_COMP_TABLE_LEN] {
    let mut table = [1.0f32; KEY_COMP_TABLE_LEN];
    table[0] = 1.0;
    table[1] = 1.0;
    const HAND_TUNED: [f64; 9] = [
        -1.1598, -2.0291, -2.4987, -2.9952, -3.5218, -4.0823, -4.6815, -4.9975, -4.9998,
    ];
    for (i, &db) in HAND_TUNED.iter().enumerate() {
        table[i + 2] = db_to_gain(db) as f32;
    }
    let u = -5.0f64;
    let v = -9.0f64;
    let m = 1.0 / (KEY_COMP_TABLE_LEN as f64 - 12.0);
    for i in 11..KEY_COMP_TABLE_LEN {
        let a = (i - 11) as f64;
        table[i] = db_to_gain(u + (v - u) * a * m) as f32;
    }
    table
}

/// The tone generator core: the compiled key-contribution graph, the
/// active-oscillator table, the per-block core instruction program, key
/// compression, and the percussion one-shot.
pub struct ToneGenerator {
    bank: OscillatorBank,
    drawbars: [DrawbarSet; NUM_MANUALS],
    key_down: [[bool; KEYS_PER_MANUAL]; NUM_MANUALS],
    key_contrib: Vec<Vec<Vec<ContribEntry>>>,
    aot: Vec<WheelAot>,
    active_wheels: Vec<usize>,
    instructions: Vec<CoreInstruction>,
    percussion_config: PercussionConfig,
    percussion: PercussionState,
    route_upper_vibrato: bool,
    route_lower_vibrato: bool,
    key_comp_table: [f32; KEY_COMP_TABLE_LEN],
    comp_current: f32,
    sample_rate: f64,
}

impl ToneGenerator {
    pub fn new(bank: OscillatorBank, config: ToneGeneratorConfig) -> Self {
        let key_contrib = compile_key_contrib(
            config.foldback,
            config.wiring_xtalk,
            config.compartment_alpha,
        );
        let aot = vec![WheelAot::default(); bank.oscillators.len()];
        Self {
            bank,
            drawbars: [DrawbarSet::default(); NUM_MANUALS],
            key_down: [[false; KEYS_PER_MANUAL]; NUM_MANUALS],
            key_contrib,
            aot,
            active_wheels: Vec::new(),
            instructions: Vec::new(),
            percussion_config: config.percussion,
            percussion: PercussionState::new(config.sample_rate),
            route_upper_vibrato: config.route_upper_vibrato,
            route_lower_vibrato: config.route_lower_vibrato,
            key_comp_table: build_key_comp_table(),
            comp_current: 1.0,
            sample_rate: config.sample_rate,
        }
    }

    pub fn set_drawbar(&mut self, manual: Manual, drawbar: usize, position: u8) {
        self.drawbars[manual.index()].set(drawbar, position);
    }

    pub fn set_drawbars(&mut self, manual: Manual, set: DrawbarSet) {
        self.drawbars[manual.index()] = set;
    }

    /// Replace the percussion configuration. The decay constant is
    /// recomputed the next time percussion triggers, not here.
    pub fn set_percussion(&mut self, config: PercussionConfig) {
        self.percussion_config = config;
    }

    pub fn key_on(&mut self, manual: Manual, key: usize) {
        if key >= KEYS_PER_MANUAL || self.key_down[manual.index()][key] {
            return;
        }
        let upper_was_silent = !self.key_down[Manual::Upper.index()].iter().any(|&d| d);
        self.key_down[manual.index()][key] = true;

        for entry in &self.key_contrib[manual.index()][key] {
            let wheel = &mut self.aot[entry.wheel];
            let was_inactive = wheel.ref_count == 0;
            wheel.bus_level[entry.bus] += entry.gain;
            wheel.ref_count += 1;
            if was_inactive {
                wheel.render_flag = RenderFlag::Added;
                self.active_wheels.push(entry.wheel);
            } else if wheel.render_flag == RenderFlag::Unchanged {
                wheel.render_flag = RenderFlag::Modified;
            }
        }

        if manual == Manual::Upper && upper_was_silent && self.percussion_config.enabled {
            self.percussion.trigger(&self.percussion_config);
        }
    }

    pub fn key_off(&mut self, manual: Manual, key: usize) {
        if key >= KEYS_PER_MANUAL || !self.key_down[manual.index()][key] {
            return;
        }
        self.key_down[manual.index()][key] = false;

        for entry in &self.key_contrib[manual.index()][key] {
            let wheel = &mut self.aot[entry.wheel];
            wheel.bus_level[entry.bus] -= entry.gain;
            if wheel.bus_level[entry.bus].abs() < 1e-9 {
                wheel.bus_level[entry.bus] = 0.0;
            }
            wheel.ref_count = wheel.ref_count.saturating_sub(1);
            if wheel.ref_count == 0 {
                wheel.render_flag = RenderFlag::Removed;
            } else if wheel.render_flag == RenderFlag::Unchanged {
                wheel.render_flag = RenderFlag::Modified;
            }
        }

        if manual == Manual::Upper && !self.key_down[Manual::Upper.index()].iter().any(|&d| d) {
            self.percussion.release_all();
        }
    }

    fn recompute_sums(&self, wheel_idx: usize) -> (f32, f32, f32) {
        let wheel = &self.aot[wheel_idx];
        let mut sum_upper = 0.0f32;
        let mut sum_lower = 0.0f32;
        let mut sum_pedal = 0.0f32;
        for b in 0..NUM_DRAWBARS {
            sum_upper +=
                wheel.bus_level[global_bus(Manual::Upper, b)] * drawbar_gain(self.drawbars[0].positions[b]) as f32;
            sum_lower +=
                wheel.bus_level[global_bus(Manual::Lower, b)] * drawbar_gain(self.drawbars[1].positions[b]) as f32;
            sum_pedal +=
                wheel.bus_level[global_bus(Manual::Pedal, b)] * drawbar_gain(self.drawbars[2].positions[b]) as f32;
        }
        let sum_perc = if self.percussion_config.enabled {
            wheel.bus_level[global_bus(Manual::Upper, self.percussion_config.harmonic.trigger_bus_local())]
        } else {
            0.0
        };

        let sum_swell = sum_pedal
            + if !self.route_upper_vibrato { sum_upper } else { 0.0 }
            + if !self.route_lower_vibrato { sum_lower } else { 0.0 };
        let sum_scan = if self.route_upper_vibrato { sum_upper } else { 0.0 }
            + if self.route_lower_vibrato { sum_lower } else { 0.0 };

        (sum_swell, sum_scan, sum_perc)
    }

    /// Recompute sums and emit the core instruction program for the
    /// current active list (spec.md §4.3.3 steps 1-3).
    fn compile_program(&mut self) {
        self.instructions.clear();
        let mut removed = Vec::new();
        let active_wheels = self.active_wheels.clone();

        for wheel_idx in active_wheels {
            let flag = self.aot[wheel_idx].render_flag;
            match flag {
                RenderFlag::Added => {
                    let (swell, scan, perc) = self.recompute_sums(wheel_idx);
                    self.instructions.push(CoreInstruction {
                        wheel: wheel_idx,
                        kind: InstrKind::Attack,
                        start_swell: 0.0,
                        end_swell: swell,
                        start_scan: 0.0,
                        end_scan: scan,
                        start_perc: 0.0,
                        end_perc: perc,
                    });
                    let w = &mut self.aot[wheel_idx];
                    w.sum_swell = swell;
                    w.sum_scan = scan;
                    w.sum_perc = perc;
                    w.render_flag = RenderFlag::Unchanged;
                }
                RenderFlag::Modified => {
                    let (swell, scan, perc) = self.recompute_sums(wheel_idx);
                    self.instructions.push(CoreInstruction {
                        wheel: wheel_idx,
                        kind: InstrKind::Plain,
                        start_swell: swell,
                        end_swell: swell,
                        start_scan: scan,
                        end_scan: scan,
                        start_perc: perc,
                        end_perc: perc,
                    });
                    let w = &mut self.aot[wheel_idx];
                    w.sum_swell = swell;
                    w.sum_scan = scan;
                    w.sum_perc = perc;
                    w.render_flag = RenderFlag::Unchanged;
                }
                RenderFlag::Removed => {
                    let w = &self.aot[wheel_idx];
                    self.instructions.push(CoreInstruction {
                        wheel: wheel_idx,
                        kind: InstrKind::Release,
                        start_swell: w.sum_swell,
                        end_swell: 0.0,
                        start_scan: w.sum_scan,
                        end_scan: 0.0,
                        start_perc: w.sum_perc,
                        end_perc: 0.0,
                    });
                    removed.push(wheel_idx);
                }
                RenderFlag::Unchanged => {
                    let w = &self.aot[wheel_idx];
                    self.instructions.push(CoreInstruction {
                        wheel: wheel_idx,
                        kind: InstrKind::Plain,
                        start_swell: w.sum_swell,
                        end_swell: w.sum_swell,
                        start_scan: w.sum_scan,
                        end_scan: w.sum_scan,
                        start_perc: w.sum_perc,
                        end_perc: w.sum_perc,
                    });
                }
            }
        }

        for wheel_idx in removed {
            self.aot[wheel_idx] = WheelAot::default();
            self.active_wheels.retain(|&w| w != wheel_idx);
        }
    }

    /// Render one block (spec.md §4.3.3 steps 2-6). `swell` never passes
    /// through vibrato (pedal always lands here); `scan` is the bus the
    /// caller should route through the vibrato scanner before summing
    /// the two back together (step 5, resolving the always-swell-pedal
    /// rule).
    pub fn render_block(&mut self, swell: &mut [f32], scan: &mut [f32]) {
        let n = swell.len();
        debug_assert_eq!(scan.len(), n);
        swell.fill(0.0);
        scan.fill(0.0);
        let mut perc_buf = vec![0.0f32; n];
        let mut scratch = vec![0.0f32; n];

        self.compile_program();

        for instr in &self.instructions {
            let osc = &mut self.bank.oscillators[instr.wheel];
            osc.read_block(&mut scratch);
            let att = osc.attenuation;

            match instr.kind {
                InstrKind::Plain => {
                    for i in 0..n {
                        let x = scratch[i] * att;
                        swell[i] += x * instr.end_swell;
                        scan[i] += x * instr.end_scan;
                        perc_buf[i] += x * instr.end_perc;
                    }
                }
                InstrKind::Attack | InstrKind::Release => {
                    let shape = match instr.kind {
                        InstrKind::Attack => EnvelopeShape::Cosine,
                        _ => EnvelopeShape::Linear,
                    };
                    let env = build_envelope(shape, n);
                    for i in 0..n {
                        let x = scratch[i] * att;
                        let e = env[i];
                        swell[i] += x * (instr.start_swell + e * (instr.end_swell - instr.start_swell));
                        scan[i] += x * (instr.start_scan + e * (instr.end_scan - instr.start_scan));
                        perc_buf[i] += x * (instr.start_perc + e * (instr.end_perc - instr.start_perc));
                    }
                }
            }
        }

        // Key compression: the per-sample scalar chases comp[key_down_count]
        // linearly over the block (spec.md §4.3.4).
        let key_down_count: usize = self
            .key_down
            .iter()
            .map(|keys| keys.iter().filter(|&&d| d).count())
            .sum();
        let target = self.key_comp_table[key_down_count.min(KEY_COMP_TABLE_LEN - 1)];
        let step = (target - self.comp_current) / n.max(1) as f32;
        for i in 0..n {
            self.comp_current += step;
            swell[i] *= self.comp_current;
            scan[i] *= self.comp_current;
        }

        // Percussion bypasses vibrato entirely (spec.md §4.3.3 step 6:
        // `out = xp + vy + pp·perc_env_gain`): fold it into swell.
        if self.percussion_config.enabled {
            let curve = self.percussion.next_block_curve(n);
            let gain = self.percussion_config.gain as f32;
            for i in 0..n {
                swell[i] += perc_buf[i] * curve[i] * gain;
            }
        }
    }

    pub fn active_oscillator_count(&self) -> usize {
        self.active_wheels.len()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }
}

/// Compile `key_contrib[manual][key]`: the static (wheel, bus, gain)
/// list combining the per-key/per-bus taper, bus-wiring crosstalk, and
/// compartment (wheel-pair) crosstalk, built once at construction
/// (spec.md §4.3.1).
fn compile_key_contrib(
    foldback: FoldbackVariant,
    wiring_xtalk: f64,
    compartment_alpha: f64,
) -> Vec<Vec<Vec<ContribEntry>>> {
    let floor_gain = db_to_gain(oscillator::CONTRIBUTION_FLOOR_DB) as f32;

    (0..NUM_MANUALS)
        .map(|m| {
            let manual = match m {
                0 => Manual::Upper,
                1 => Manual::Lower,
                _ => Manual::Pedal,
            };
            (0..KEYS_PER_MANUAL)
                .map(|key| compile_one_key(manual, key, foldback, wiring_xtalk, compartment_alpha, floor_gain))
                .collect()
        })
        .collect()
}

fn compile_one_key(
    manual: Manual,
    key: usize,
    foldback: FoldbackVariant,
    wiring_xtalk: f64,
    compartment_alpha: f64,
    floor_gain: f32,
) -> Vec<ContribEntry> {
    // (wheel, bus_local) -> accumulated gain, pre-compartment-crosstalk.
    let mut raw: HashMap<(usize, usize), f64> = HashMap::new();

    if manual == Manual::Pedal {
        // Single reference-level taper, no foldback (spec.md §4.3.6).
        for b in 0..NUM_DRAWBARS {
            let wheel = foldback_index(key, b, FoldbackVariant::Tg91Fb00);
            *raw.entry((wheel, b)).or_insert(0.0) += 1.0;
        }
    } else {
        for b in 0..NUM_DRAWBARS {
            let wheel = foldback_index(key, b, foldback);
            let gain = db_to_gain(taper_db(key, b));
            *raw.entry((wheel, b)).or_insert(0.0) += gain;
            for bp in 0..NUM_DRAWBARS {
                if bp == b {
                    continue;
                }
                let xgain = gain * wiring_xtalk / (b as i32 - bp as i32).abs() as f64;
                *raw.entry((wheel, bp)).or_insert(0.0) += xgain;
            }
        }
    }

    // Compartment crosstalk: bleed a fraction of each wheel's
    // contribution onto its paired wheel at the same bus.
    let mut final_entries: HashMap<(usize, usize), f64> = HashMap::new();
    for (&(wheel, bus_local), &gain) in raw.iter() {
        if manual == Manual::Pedal {
            *final_entries.entry((wheel, bus_local)).or_insert(0.0) += gain;
            continue;
        }
        match wheel_pair(wheel) {
            Some(pair) => {
                *final_entries.entry((wheel, bus_local)).or_insert(0.0) += gain * (1.0 - compartment_alpha);
                *final_entries.entry((pair, bus_local)).or_insert(0.0) += gain * compartment_alpha;
            }
            None => {
                *final_entries.entry((wheel, bus_local)).or_insert(0.0) += gain;
            }
        }
    }

    let mut out: Vec<ContribEntry> = final_entries
        .into_iter()
        .filter_map(|((wheel, bus_local), gain)| {
            let gain = gain as f32;
            if gain.abs() < floor_gain {
                None
            } else {
                Some(ContribEntry {
                    wheel,
                    bus: global_bus(manual, bus_local),
                    gain,
                })
            }
        })
        .collect();
    out.sort_by_key(|e| (e.wheel, e.bus));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oscillator::{OscillatorBank, OscillatorConfig};

    fn make_bank() -> OscillatorBank {
        OscillatorBank::build(&OscillatorConfig::default(), 128).expect("bank")
    }

    #[test]
    fn drawbar_zero_is_silent_eight_is_unity() {
        assert_eq!(drawbar_gain(0), 0.0);
        assert!((drawbar_gain(8) - 1.0).abs() < 1e-9);
        assert!(drawbar_gain(4) > 0.0 && drawbar_gain(4) < drawbar_gain(8));
    }

    #[test]
    fn foldback_clamps_into_range() {
        for key in 0..KEYS_PER_MANUAL {
            for d in 0..NUM_DRAWBARS {
                let idx = foldback_index(key, d, FoldbackVariant::Tg91Fb00);
                assert!(idx < crate::oscillator::NUM_OSCILLATORS);
            }
        }
    }

    #[test]
    fn taper_table_matches_key_range_boundaries() {
        // Bus 0 (16'): key 11 is the last "< 12" bucket (-10 dB), key 12
        // crosses into the "< 17" bucket (-7 dB).
        assert!((taper_db(11, 0) - (-10.0)).abs() < 1e-9);
        assert!((taper_db(12, 0) - (-7.0)).abs() < 1e-9);
        // Bus 8 (1'): flat until key 43, then -7 dB.
        assert!((taper_db(42, 8) - 0.0).abs() < 1e-9);
        assert!((taper_db(43, 8) - (-7.0)).abs() < 1e-9);
    }

    #[test]
    fn key_on_populates_active_oscillator_table() {
        let mut tg = ToneGenerator::new(make_bank(), ToneGeneratorConfig::default());
        assert_eq!(tg.active_oscillator_count(), 0);
        tg.set_drawbar(Manual::Upper, 2, 8);
        tg.key_on(Manual::Upper, 30);
        assert!(tg.active_oscillator_count() > 0);
        tg.key_off(Manual::Upper, 30);
        let mut swell = vec![0.0f32; 64];
        let mut scan = vec![0.0f32; 64];
        tg.render_block(&mut swell, &mut scan);
        assert_eq!(tg.active_oscillator_count(), 0);
    }

    #[test]
    fn silence_with_all_drawbars_down() {
        let mut tg = ToneGenerator::new(make_bank(), ToneGeneratorConfig::default());
        tg.key_on(Manual::Upper, 30);
        let mut swell = vec![0.0f32; 64];
        let mut scan = vec![0.0f32; 64];
        tg.render_block(&mut swell, &mut scan);
        assert!(swell.iter().all(|s| *s == 0.0));
        assert!(scan.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn pedal_keys_never_reach_the_scan_bus() {
        let mut tg = ToneGenerator::new(make_bank(), ToneGeneratorConfig::default());
        tg.set_drawbar(Manual::Pedal, 0, 8);
        tg.key_on(Manual::Pedal, 20);
        let mut swell = vec![0.0f32; 256];
        let mut scan = vec![0.0f32; 256];
        tg.render_block(&mut swell, &mut scan);
        assert!(swell.iter().any(|s| s.abs() > 1e-6));
        assert!(scan.iter().all(|s| s.abs() < 1e-9));
    }

    #[test]
    fn percussion_decays_and_peaks_right_after_trigger() {
        let mut cfg = ToneGeneratorConfig::default();
        cfg.percussion.enabled = true;
        cfg.percussion.soft = false;
        let mut tg = ToneGenerator::new(make_bank(), cfg);
        tg.set_drawbar(Manual::Upper, 3, 8); // "4'" bus feeds percussion's 2nd harmonic tap
        tg.key_on(Manual::Upper, 30);

        let mut swell = vec![0.0f32; 32];
        let mut scan = vec![0.0f32; 32];
        tg.render_block(&mut swell, &mut scan);
        let early_peak = swell.iter().fold(0.0f32, |m, s| m.max(s.abs()));

        for _ in 0..200 {
            tg.render_block(&mut swell, &mut scan);
        }
        let late_peak = swell.iter().fold(0.0f32, |m, s| m.max(s.abs()));

        assert!(early_peak > 0.0);
        assert!(late_peak < early_peak);
    }

    #[test]
    fn key_compression_reduces_gain_as_more_keys_are_held() {
        let table = build_key_comp_table();
        assert_eq!(table[0], 1.0);
        assert_eq!(table[1], 1.0);
        assert!(table[10] < table[2]);
        assert!(table[127] < table[10]);
    }
}
