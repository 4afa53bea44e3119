//! C6 — Rotary speaker ("whirl").
//!
//! Two independently rotating acoustic elements (horn, drum) with
//! angular-Doppler FM via per-angle displacement tables, per-angle
//! impulse responses, multi-reflection mixing, and inertial
//! acceleration/brake state machines (spec.md §4.6). The biquad tone
//! shaping is grounded on the Direct-Form-II-transposed RBJ cookbook
//! filter used by `nethercore-zx`'s tracker channel filter
//! (`tracker/channels/filter.rs`); everything else here has no
//! off-the-shelf analogue in the retrieval pack and is built directly
//! from the spec's per-sample pseudocode.

const TABLE_LEN: usize = 128;
const BUF_LEN: usize = 8192;
const INPUT_HISTORY: usize = 5;
const AIR_SPEED_M_S: f64 = 340.0;

// ---------------------------------------------------------------------
// Rotor inertial state machine
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotorSpeed {
    Stop,
    Slow,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccDec {
    Accel,
    None,
    Decel,
}

#[derive(Debug, Clone)]
pub struct RotorConfig {
    pub rpm_slow: f64,
    pub rpm_fast: f64,
    pub accel_seconds: f64,
    pub decel_seconds: f64,
    pub hardstop_rpm: f64,
    pub min_brake_speed_rpm: f64,
}

/// One inertial rotor (horn or drum). `incr` is in cycles/sample.
pub struct Rotor {
    pub angle: f64,
    current_incr: f64,
    target_incr: f64,
    state: AccDec,
    cfg: RotorConfig,
    speed: RotorSpeed,
    brake_pos: f64,
    braking_to_position: bool,
}

impl Rotor {
    pub fn new(cfg: RotorConfig) -> Self {
        Self {
            angle: 0.0,
            current_incr: 0.0,
            target_incr: 0.0,
            state: AccDec::None,
            cfg,
            speed: RotorSpeed::Stop,
            brake_pos: 0.0,
            braking_to_position: false,
        }
    }

    fn rpm_to_incr(&self, rpm: f64, sample_rate: f64) -> f64 {
        rpm / 60.0 / sample_rate
    }

    pub fn set_speed(&mut self, speed: RotorSpeed, sample_rate: f64) {
        self.speed = speed;
        let target = match speed {
            RotorSpeed::Stop => 0.0,
            RotorSpeed::Slow => self.rpm_to_incr(self.cfg.rpm_slow, sample_rate),
            RotorSpeed::Fast => self.rpm_to_incr(self.cfg.rpm_fast, sample_rate),
        };
        self.target_incr = target;
        self.state = if target > self.current_incr {
            AccDec::Accel
        } else if target < self.current_incr {
            AccDec::Decel
        } else {
            AccDec::None
        };
        self.braking_to_position = speed == RotorSpeed::Stop && self.brake_pos > 0.0;
    }

    pub fn set_brake_pos(&mut self, pos: f64) {
        self.brake_pos = pos.rem_euclid(1.0);
        if self.speed == RotorSpeed::Stop {
            self.braking_to_position = self.brake_pos > 0.0;
        }
    }

    /// The angular resting position this rotor seeks when stopped, per
    /// spec.md §4.6.1 "Brake-to-position" (distinct target formulas for
    /// horn vs. drum, matching §8 scenario 4's `1.25 - brake_pos`).
    fn target_pos(&self, is_horn: bool) -> f64 {
        if is_horn {
            (1.25 - self.brake_pos).rem_euclid(1.0)
        } else {
            (self.brake_pos + 0.75).rem_euclid(1.0)
        }
    }

    /// Block-rate smoothing toward `target_incr` (spec.md §4.6.1): once
    /// per block, not once per sample.
    pub fn update_block(&mut self, n: usize, sample_rate: f64, is_horn: bool) {
        let hardstop = self.rpm_to_incr(self.cfg.hardstop_rpm, sample_rate);

        if self.braking_to_position {
            let target_pos = self.target_pos(is_horn);
            let mut diff = target_pos - self.angle;
            diff -= diff.round(); // shortest signed distance on the circle
            // `min_speed` is a per-sample increment; scale by the block
            // length so braking covers a whole block's worth of motion
            // per call, not just one sample's.
            let min_step_per_block = self.rpm_to_incr(self.cfg.min_brake_speed_rpm, sample_rate) * n as f64;
            let step = min_step_per_block.max(diff.abs() * 0.25).min(diff.abs());
            if diff.abs() < 2.0 / TABLE_LEN as f64 {
                self.angle = target_pos;
                self.current_incr = 0.0;
                self.braking_to_position = false;
                self.state = AccDec::None;
            } else {
                self.angle = (self.angle + diff.signum() * step).rem_euclid(1.0);
                self.current_incr = 0.0;
            }
            return;
        }

        if self.state == AccDec::None {
            return;
        }

        let tau = match self.state {
            AccDec::Accel => self.cfg.accel_seconds,
            AccDec::Decel => self.cfg.decel_seconds,
            AccDec::None => return,
        };
        let blocks_per_sec = sample_rate / n as f64;
        let l = (-1.0 / (blocks_per_sec * tau)).exp();
        self.current_incr += (1.0 - l) * (self.target_incr - self.current_incr);

        if (self.target_incr - self.current_incr).abs() < 0.05 / (60.0 * sample_rate) {
            self.current_incr = self.target_incr;
            self.state = AccDec::None;
        }

        if self.speed == RotorSpeed::Stop && self.current_incr.abs() < hardstop && self.brake_pos > 0.0
        {
            self.braking_to_position = true;
            self.current_incr = 0.0;
        }
    }

    #[inline]
    pub fn advance_sample(&mut self) {
        self.angle = (self.angle + self.current_incr).rem_euclid(1.0);
    }

    pub fn incr(&self) -> f64 {
        self.current_incr
    }
}

// ---------------------------------------------------------------------
// Biquad tone shaping
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    LowPass,
    LowShelf,
    HighShelf,
}

#[derive(Debug, Clone, Copy)]
pub struct BiquadConfig {
    pub kind: FilterKind,
    pub hz: f64,
    pub q: f64,
    pub gain_db: f64,
}

/// Direct-Form-II-transposed biquad, grounded on
/// `nethercore-zx`'s `TrackerChannel::apply_filter` / RBJ cookbook.
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    pub fn new(config: BiquadConfig, sample_rate: f64) -> Self {
        let mut bq = Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: 0.0,
            z2: 0.0,
        };
        bq.configure(config, sample_rate);
        bq
    }

    pub fn configure(&mut self, config: BiquadConfig, sample_rate: f64) {
        let freq = config.hz.min(sample_rate / 2.0 - 1.0).max(1.0);
        let omega = core::f64::consts::TAU * freq / sample_rate;
        let sin_w = omega.sin();
        let cos_w = omega.cos();
        let a = 10f64.powf(config.gain_db / 40.0);
        let alpha = sin_w / (2.0 * config.q.max(0.01));

        let (b0, b1, b2, a0, a1, a2) = match config.kind {
            FilterKind::LowPass => (
                (1.0 - cos_w) / 2.0,
                1.0 - cos_w,
                (1.0 - cos_w) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w,
                1.0 - alpha,
            ),
            FilterKind::LowShelf => {
                let sq = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_w + sq),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w),
                    a * ((a + 1.0) - (a - 1.0) * cos_w - sq),
                    (a + 1.0) + (a - 1.0) * cos_w + sq,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w),
                    (a + 1.0) + (a - 1.0) * cos_w - sq,
                )
            }
            FilterKind::HighShelf => {
                let sq = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_w + sq),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w),
                    a * ((a + 1.0) + (a - 1.0) * cos_w - sq),
                    (a + 1.0) - (a - 1.0) * cos_w + sq,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w),
                    (a + 1.0) - (a - 1.0) * cos_w - sq,
                )
            }
        };

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
    }

    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        let out = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * out + self.z2;
        self.z2 = self.b2 * x - self.a2 * out;
        out
    }

    /// NaN/denormal defender: zero state if it has drifted non-finite or
    /// has decayed into denormal range (spec.md §4.6.4).
    pub fn sanitize(&mut self) {
        const DENORMAL_FLOOR: f64 = 1e-30;
        if !self.z1.is_finite() || self.z1.abs() < DENORMAL_FLOOR {
            self.z1 = 0.0;
        }
        if !self.z2.is_finite() || self.z2.abs() < DENORMAL_FLOOR {
            self.z2 = 0.0;
        }
    }
}

// ---------------------------------------------------------------------
// Per-angle tables
// ---------------------------------------------------------------------

/// Build the forward angular-displacement table (in samples) for a rotor
/// of the given radius, at the given air speed; the backward table is
/// its mirror image about the circle (spec.md §4.6.2 "IR construction").
fn build_displacement_tables(radius_samples: f64) -> (Vec<f32>, Vec<f32>) {
    let mut fwd = vec![0.0f32; TABLE_LEN];
    for (i, slot) in fwd.iter_mut().enumerate() {
        let theta = core::f64::consts::TAU * i as f64 / TABLE_LEN as f64;
        *slot = (radius_samples * theta.sin()) as f32;
    }
    let bwd: Vec<f32> = fwd.iter().rev().cloned().collect();
    (fwd, bwd)
}

/// Hand-picked (angle_degrees, value) control points per principal
/// component, linearly interpolated into a 128-bin table. Five
/// components model the horn's directional radiation pattern.
const IR_CONTROL_POINTS: [[(f64, f64); 5]; 5] = [
    [(0.0, 1.0), (90.0, 0.6), (180.0, 0.2), (270.0, 0.6), (360.0, 1.0)],
    [(0.0, 0.5), (90.0, 1.0), (180.0, 0.5), (270.0, 0.0), (360.0, 0.5)],
    [(0.0, 0.2), (90.0, 0.5), (180.0, 1.0), (270.0, 0.5), (360.0, 0.2)],
    [(0.0, 0.3), (90.0, 0.1), (180.0, 0.3), (270.0, 1.0), (360.0, 0.3)],
    [(0.0, 0.1), (90.0, 0.3), (180.0, 0.1), (270.0, 0.3), (360.0, 0.1)],
];

/// Build the normalized 128×5 per-angle impulse-weight table (§4.6.2).
fn build_ir_table() -> Vec<[f32; 5]> {
    let mut table = vec![[0.0f32; 5]; TABLE_LEN];
    for (col, points) in IR_CONTROL_POINTS.iter().enumerate() {
        for i in 0..TABLE_LEN {
            let angle_deg = 360.0 * i as f64 / TABLE_LEN as f64;
            let value = interpolate_control_points(points, angle_deg);
            table[i][col] = value as f32;
        }
    }
    let max_sum = table
        .iter()
        .map(|row| row.iter().map(|v| v.abs()).sum::<f32>())
        .fold(0.0f32, f32::max)
        .max(1e-9);
    for row in table.iter_mut() {
        for v in row.iter_mut() {
            *v /= max_sum;
        }
    }
    table
}

fn interpolate_control_points(points: &[(f64, f64); 5], angle_deg: f64) -> f64 {
    for w in points.windows(2) {
        let (a0, v0) = w[0];
        let (a1, v1) = w[1];
        if angle_deg >= a0 && angle_deg <= a1 {
            let t = if a1 > a0 { (angle_deg - a0) / (a1 - a0) } else { 0.0 };
            return v0 + t * (v1 - v0);
        }
    }
    points.last().unwrap().1
}

const HORN_SPACINGS_22050: [f64; 6] = [12.0, 18.0, 53.0, 50.0, 106.0, 116.0];
const DRUM_SPACINGS_22050: [f64; 6] = [36.0, 39.0, 79.0, 86.0, 123.0, 116.0];

fn phase_offsets() -> [f64; 6] {
    let l = TABLE_LEN as f64;
    [0.0, l / 2.0, l / 3.0, 5.0 * l / 6.0, l / 6.0, 4.0 * l / 6.0]
}

// ---------------------------------------------------------------------
// Whirl engine
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WhirlConfig {
    pub sample_rate: f64,
    pub mic_distance_cm: f64,
    pub horn_radius_cm: f64,
    pub drum_radius_cm: f64,
    pub horn: RotorConfig,
    pub drum: RotorConfig,
    pub horn_filter_a: BiquadConfig,
    pub horn_filter_b: BiquadConfig,
    pub drum_filter: BiquadConfig,
    pub horn_width: f64,
    pub drum_width: f64,
    pub horn_level: f32,
    pub leak_level: f32,
    pub bypass: bool,
}

impl Default for WhirlConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            mic_distance_cm: 42.0,
            horn_radius_cm: 9.5,
            drum_radius_cm: 19.0,
            horn: RotorConfig {
                rpm_slow: 40.0,
                rpm_fast: 400.0,
                accel_seconds: 0.7,
                decel_seconds: 2.4,
                hardstop_rpm: 10.0,
                min_brake_speed_rpm: 3.0,
            },
            drum: RotorConfig {
                rpm_slow: 36.0,
                rpm_fast: 342.0,
                accel_seconds: 4.0,
                decel_seconds: 6.0,
                hardstop_rpm: 8.0,
                min_brake_speed_rpm: 3.0,
            },
            horn_filter_a: BiquadConfig {
                kind: FilterKind::LowPass,
                hz: 5500.0,
                q: 0.7,
                gain_db: 0.0,
            },
            horn_filter_b: BiquadConfig {
                kind: FilterKind::LowShelf,
                hz: 400.0,
                q: 0.7,
                gain_db: -3.0,
            },
            drum_filter: BiquadConfig {
                kind: FilterKind::HighShelf,
                hz: 800.0,
                q: 0.7,
                gain_db: -6.0,
            },
            horn_width: 0.7,
            drum_width: 0.5,
            horn_level: 0.7,
            leak_level: 0.15,
            bypass: false,
        }
    }
}

pub struct Whirl {
    pub horn: Rotor,
    pub drum: Rotor,

    horn_disp_fwd: Vec<f32>,
    horn_disp_bwd: Vec<f32>,
    drum_disp_fwd: Vec<f32>,
    drum_disp_bwd: Vec<f32>,
    ir_table: Vec<[f32; 5]>,

    hl_buf: Vec<f32>,
    hr_buf: Vec<f32>,
    dl_buf: Vec<f32>,
    dr_buf: Vec<f32>,
    outpos: usize,

    horn_a: Biquad,
    horn_a_config: BiquadConfig,
    horn_b: Biquad,
    drum_l: Biquad,
    drum_r: Biquad,

    in_history: [f32; INPUT_HISTORY],

    horn_spacings: [f64; 6],
    drum_spacings: [f64; 6],
    phase: [f64; 6],

    horn_mic: [[f64; 2]; 2],
    drum_mic: [[f64; 2]; 2],

    horn_level: f32,
    leak_level: f32,
    bypass: bool,
    sample_rate: f64,
}

impl Whirl {
    pub fn new(config: &WhirlConfig) -> Self {
        let scale = config.sample_rate / 22050.0;
        let horn_radius_samples = config.horn_radius_cm / 100.0 / AIR_SPEED_M_S * config.sample_rate;
        let drum_radius_samples = config.drum_radius_cm / 100.0 / AIR_SPEED_M_S * config.sample_rate;

        let (horn_disp_fwd, horn_disp_bwd) = build_displacement_tables(horn_radius_samples);
        let (drum_disp_fwd, drum_disp_bwd) = build_displacement_tables(drum_radius_samples);

        let horn_spacings =
            core::array::from_fn(|i| HORN_SPACINGS_22050[i] * scale + horn_radius_samples);
        let drum_spacings =
            core::array::from_fn(|i| DRUM_SPACINGS_22050[i] * scale + drum_radius_samples);

        Self {
            horn: Rotor::new(config.horn.clone()),
            drum: Rotor::new(config.drum.clone()),
            horn_disp_fwd,
            horn_disp_bwd,
            drum_disp_fwd,
            drum_disp_bwd,
            ir_table: build_ir_table(),
            hl_buf: vec![0.0; BUF_LEN],
            hr_buf: vec![0.0; BUF_LEN],
            dl_buf: vec![0.0; BUF_LEN],
            dr_buf: vec![0.0; BUF_LEN],
            outpos: 0,
            horn_a: Biquad::new(config.horn_filter_a, config.sample_rate),
            horn_a_config: config.horn_filter_a,
            horn_b: Biquad::new(config.horn_filter_b, config.sample_rate),
            drum_l: Biquad::new(config.drum_filter, config.sample_rate),
            drum_r: Biquad::new(config.drum_filter, config.sample_rate),
            in_history: [0.0; INPUT_HISTORY],
            horn_spacings,
            drum_spacings,
            phase: phase_offsets(),
            horn_mic: stereo_matrix(config.horn_width),
            drum_mic: stereo_matrix(config.drum_width),
            horn_level: config.horn_level,
            leak_level: config.leak_level,
            bypass: config.bypass,
            sample_rate: config.sample_rate,
        }
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    pub fn set_horn_speed(&mut self, speed: RotorSpeed) {
        self.horn.set_speed(speed, self.sample_rate);
    }

    pub fn set_drum_speed(&mut self, speed: RotorSpeed) {
        self.drum.set_speed(speed, self.sample_rate);
    }

    /// Re-derive the horn's first tone-shaping biquad from a new cutoff
    /// (spec.md §6.1 control `whirl.horn.filter.a.hz`), keeping its other
    /// parameters as last configured.
    pub fn set_horn_filter_a_hz(&mut self, hz: f64) {
        self.horn_a_config.hz = hz;
        self.horn_a.configure(self.horn_a_config, self.sample_rate);
    }

    /// Re-derive the horn's first tone-shaping biquad from a new Q
    /// (spec.md §6.1 control `whirl.horn.filter.a.q`).
    pub fn set_horn_filter_a_q(&mut self, q: f64) {
        self.horn_a_config.q = q;
        self.horn_a.configure(self.horn_a_config, self.sample_rate);
    }

    /// Process one block, mono in, stereo out (spec.md §4.6.2, §6.2
    /// `N <= 8192`).
    pub fn process_block(&mut self, input: &[f32], left: &mut [f32], right: &mut [f32]) {
        assert!(input.len() <= BUF_LEN, "block exceeds whirl buffer capacity");
        let n = input.len();

        self.horn.update_block(n, self.sample_rate, true);
        self.drum.update_block(n, self.sample_rate, false);

        if self.bypass {
            left[..n].copy_from_slice(&input[..n]);
            right[..n].copy_from_slice(&input[..n]);
            return;
        }

        for i in 0..n {
            let (l, r) = self.process_sample(input[i]);
            left[i] = l;
            right[i] = r;
        }

        self.horn_a.sanitize();
        self.horn_b.sanitize();
        self.drum_l.sanitize();
        self.drum_r.sanitize();
    }

    fn push_history(&mut self, x: f32) {
        for i in (1..INPUT_HISTORY).rev() {
            self.in_history[i] = self.in_history[i - 1];
        }
        self.in_history[0] = x;
    }

    fn process_sample(&mut self, x: f32) -> (f32, f32) {
        self.push_history(x);

        let horn_filtered = self.horn_b.process(self.horn_a.process(x as f64)) as f32;
        let leak = horn_filtered * self.leak_level;

        let mut smoothed: Option<f32> = None;
        for p in 0..6 {
            let is_left = p % 2 == 0;
            let disp = if is_left {
                &self.horn_disp_fwd
            } else {
                &self.horn_disp_bwd
            };
            let angle_pos = self.horn.angle * TABLE_LEN as f64 + self.phase[p];
            let hl = angle_pos.floor().rem_euclid(TABLE_LEN as f64) as usize;
            let hh = (hl + 1) % TABLE_LEN;
            let frac = angle_pos - angle_pos.floor();
            let intp = disp[hl] as f64 + frac * (disp[hh] as f64 - disp[hl] as f64);

            let k = angle_pos.round().rem_euclid(TABLE_LEN as f64) as usize;
            let ir_row = self.ir_table[k];

            let mut xa = 0.0f32;
            for c in 0..INPUT_HISTORY.min(5) {
                xa += ir_row[c] * self.in_history[c];
            }

            if let Some(prev) = smoothed {
                xa = 0.4 * prev + 0.4 * xa;
            }
            smoothed = Some(xa);

            let t = self.horn_spacings[p] + intp + self.outpos as f64;
            let t_floor = t.floor();
            let r = t - t_floor;
            let idx0 = (t_floor as i64).rem_euclid(BUF_LEN as i64) as usize;
            let idx1 = (idx0 + 1) % BUF_LEN;

            let buf = if is_left {
                &mut self.hl_buf
            } else {
                &mut self.hr_buf
            };
            buf[idx1] += xa * (1.0 - r);
            buf[idx0] += xa - xa * (1.0 - r);
        }

        for p in 0..6 {
            let is_left = p % 2 == 0;
            let disp = if is_left {
                &self.drum_disp_fwd
            } else {
                &self.drum_disp_bwd
            };
            let angle_pos = self.drum.angle * TABLE_LEN as f64 + self.phase[p];
            let hl = angle_pos.floor().rem_euclid(TABLE_LEN as f64) as usize;
            let amp = (disp[hl].abs() / disp.iter().cloned().fold(1e-6, f32::max)).clamp(0.0, 1.0);
            let xa = amp * self.in_history[0];

            let t = self.drum_spacings[p] + self.outpos as f64;
            let idx0 = (t.floor() as i64).rem_euclid(BUF_LEN as i64) as usize;
            let buf = if is_left {
                &mut self.dl_buf
            } else {
                &mut self.dr_buf
            };
            buf[idx0] += xa;
        }

        let hl_out = self.hl_buf[self.outpos];
        let hr_out = self.hr_buf[self.outpos];
        let dl_out = self.dl_buf[self.outpos];
        let dr_out = self.dr_buf[self.outpos];

        self.hl_buf[self.outpos] = 0.0;
        self.hr_buf[self.outpos] = 0.0;
        self.dl_buf[self.outpos] = 0.0;
        self.dr_buf[self.outpos] = 0.0;

        let drum_l = self.drum_l.process(dl_out as f64) as f32;
        let drum_r = self.drum_r.process(dr_out as f64) as f32;

        let y_l = drum_l + self.horn_level * hl_out + leak;
        let y_r = drum_r + self.horn_level * hr_out + leak;

        self.outpos = (self.outpos + 1) % BUF_LEN;
        self.horn.advance_sample();
        self.drum.advance_sample();

        (y_l, y_r)
    }
}

fn stereo_matrix(width: f64) -> [[f64; 2]; 2] {
    let w_pos = width.max(0.0);
    let w_neg = (-width).max(0.0);
    [
        [(1.0 - w_pos).sqrt(), w_pos.sqrt()],
        [w_neg.sqrt(), (1.0 - w_neg).sqrt()],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angle_stays_in_unit_range() {
        let cfg = WhirlConfig::default();
        let mut w = Whirl::new(&cfg);
        w.set_horn_speed(RotorSpeed::Fast);
        w.set_drum_speed(RotorSpeed::Fast);
        let input = vec![0.3f32; 128];
        let mut l = vec![0.0; 128];
        let mut r = vec![0.0; 128];
        for _ in 0..200 {
            w.process_block(&input, &mut l, &mut r);
            assert!((0.0..1.0).contains(&w.horn.angle));
            assert!((0.0..1.0).contains(&w.drum.angle));
        }
    }

    #[test]
    fn ir_table_is_normalized() {
        let table = build_ir_table();
        for row in &table {
            let sum: f32 = row.iter().map(|v| v.abs()).sum();
            assert!(sum <= 1.0 + 1e-4, "sum={sum}");
        }
    }

    #[test]
    fn bypass_is_exact_passthrough() {
        let mut cfg = WhirlConfig::default();
        cfg.bypass = true;
        let mut w = Whirl::new(&cfg);
        let input: Vec<f32> = (0..64).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut l = vec![0.0; 64];
        let mut r = vec![0.0; 64];
        w.process_block(&input, &mut l, &mut r);
        assert_eq!(l, input);
        assert_eq!(r, input);
    }

    #[test]
    fn horn_brakes_toward_target_position() {
        let cfg = WhirlConfig::default();
        let mut w = Whirl::new(&cfg);
        w.set_horn_speed(RotorSpeed::Fast);
        let input = vec![0.0f32; 128];
        let mut l = vec![0.0; 128];
        let mut r = vec![0.0; 128];
        for _ in 0..200 {
            w.process_block(&input, &mut l, &mut r);
        }
        w.horn.set_brake_pos(0.5);
        w.set_horn_speed(RotorSpeed::Stop);
        // Several decel time constants at 128-sample blocks, 48kHz, plus
        // margin for the brake-to-position glide afterward.
        for _ in 0..6000 {
            w.process_block(&input, &mut l, &mut r);
        }
        assert!(w.horn.incr().abs() < 1e-9);
        let expected = (1.25f64 - 0.5).rem_euclid(1.0);
        let diff = (w.horn.angle - expected).abs().min(1.0 - (w.horn.angle - expected).abs());
        assert!(diff < 2.0 / TABLE_LEN as f64 + 1e-6, "diff={diff}");
    }
}
