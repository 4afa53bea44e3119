//! # tonewheel-engine
//!
//! A software emulation of a tonewheel organ: wavetable generator,
//! vibrato/chorus scanner, tube-style overdrive preamp, spring reverb,
//! and rotary speaker, chained into one fixed signal path.
//!
//! ## Signal path
//!
//! ```text
//!                     ┌──────────┐
//!                ┌───▶│ Vibrato  │───┐
//!                │    │ scanner  │   │
//!                │    └──────────┘   ▼
//! ┌───────────────┐              ┌───────┐   ┌───────────┐   ┌────────┐   ┌───────┐
//! │ Tone generator│── swell ────▶│  sum  │──▶│ Overdrive │──▶│ Reverb │──▶│ Whirl │──▶ stereo out
//! │ (91 wheels)   │── scan  ─────┘       │   │ preamp    │   │        │   │       │
//! └───────────────┘              └───────┘   └───────────┘   └────────┘   └───────┘
//! ```
//!
//! The tone generator splits its output into a *swell* bus (pedal, any
//! manual not routed to vibrato, and percussion) and a *scan* bus
//! (manuals routed through the vibrato scanner). Pedal always lands on
//! swell, so it can never pass through vibrato even when upper/lower are
//! vibrato-routed.
//!
//! Unlike a patchable modular synth, this topology is fixed: there is no
//! runtime graph to compile. Each component is its own struct with a
//! `process_block` method; [`Engine`] just calls them in order.
//!
//! ## Concurrency
//!
//! Control messages (key on/off, drawbar changes, program loads) arrive
//! from a non-realtime thread through a lock-free [`messages::MessageQueue`]
//! and are drained once per block before rendering, so the audio thread
//! never blocks on a mutex (see [`Engine::process_block`]).

pub mod block;
pub mod control;
pub mod error;
pub mod messages;
pub mod oscillator;
pub mod overdrive;
pub mod patch;
pub mod reverb;
pub mod rng;
pub mod tonegen;
pub mod vibrato;
pub mod whirl;

pub mod prelude {
    pub use crate::block::{AudioBlock, DelayLine};
    pub use crate::control::{ControlRegistry, ParamRange, ParamSpec};
    pub use crate::error::{AllocError, ConfigError, ControlError};
    pub use crate::messages::{KeyEvent, MessageQueue};
    pub use crate::oscillator::{OscillatorBank, OscillatorConfig, Temperament};
    pub use crate::overdrive::{Overdrive, OverdriveConfig};
    pub use crate::patch::Program;
    pub use crate::reverb::{Reverb, ReverbConfig};
    pub use crate::tonegen::{Manual, ToneGenerator, ToneGeneratorConfig};
    pub use crate::vibrato::{VibratoConfig, VibratoScanner, VibratoSelect};
    pub use crate::whirl::{RotorSpeed, Whirl, WhirlConfig};
    pub use crate::{Engine, EngineConfig};
}

use control::{ControlRegistry, ParamRange, ParamSpec};
use error::{AllocError, ControlError};
use messages::{KeyEvent, MessageQueue};
use oscillator::{OscillatorBank, OscillatorConfig};
use overdrive::{Overdrive, OverdriveConfig};
use patch::Program;
use reverb::{Reverb, ReverbConfig};
use tonegen::{Manual, ToneGenerator, ToneGeneratorConfig};
use vibrato::{VibratoConfig, VibratoScanner};
use whirl::{RotorSpeed, Whirl, WhirlConfig};

/// Drawbar footage names in drawbar order, matching the traditional
/// Hammond naming (5 1/3' -> "513", 2 2/3' -> "223", 1 3/5' -> "135",
/// 1 1/3' -> "113"), used to build the §6.1 `<manual>.drawbar<footage>`
/// control names.
const DRAWBAR_FOOTAGES: [&str; tonegen::NUM_DRAWBARS] =
    ["16", "513", "8", "4", "223", "2", "135", "113", "1"];

/// Build-time configuration for the whole engine (spec.md §3
/// "Lifecycle" build phase).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: f64,
    pub block_size: usize,
    pub oscillator: OscillatorConfig,
    pub tonegen: ToneGeneratorConfig,
    pub vibrato: VibratoConfig,
    pub overdrive: OverdriveConfig,
    pub reverb: ReverbConfig,
    pub whirl: WhirlConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let sample_rate = 48000.0;
        Self {
            sample_rate,
            block_size: 128,
            oscillator: OscillatorConfig {
                sample_rate,
                ..OscillatorConfig::default()
            },
            tonegen: ToneGeneratorConfig {
                sample_rate,
                ..ToneGeneratorConfig::default()
            },
            vibrato: VibratoConfig {
                sample_rate,
                ..VibratoConfig::default()
            },
            overdrive: OverdriveConfig::default(),
            reverb: ReverbConfig {
                sample_rate,
                ..ReverbConfig::default()
            },
            whirl: WhirlConfig {
                sample_rate,
                ..WhirlConfig::default()
            },
        }
    }
}

/// The whole instrument: tone generator through rotary speaker, plus the
/// control-thread-facing message queue (spec.md §5 "Concurrency &
/// resource model").
pub struct Engine {
    tonegen: ToneGenerator,
    vibrato: VibratoScanner,
    overdrive: Overdrive,
    reverb: Reverb,
    whirl: Whirl,
    queue: MessageQueue,
    registry: ControlRegistry,
    swell_pedal: f64,
    block_size: usize,
    mono_scratch: Vec<f32>,
    scan_scratch: Vec<f32>,
    left_scratch: Vec<f32>,
    right_scratch: Vec<f32>,
}

impl Engine {
    /// Allocate every buffer up front (spec.md §3 "Lifecycle": build
    /// once, never allocate on the audio thread again).
    pub fn build(config: &EngineConfig) -> Result<Self, AllocError> {
        let bank = OscillatorBank::build(&config.oscillator, config.block_size)?;
        let tonegen = ToneGenerator::new(bank, config.tonegen.clone());
        let vibrato = VibratoScanner::new(&config.vibrato);
        let overdrive = Overdrive::new(&config.overdrive);
        let reverb = Reverb::new(&config.reverb);
        let whirl = Whirl::new(&config.whirl);

        log::info!(
            "engine built: sample_rate={} block_size={}",
            config.sample_rate,
            config.block_size
        );

        Ok(Self {
            tonegen,
            vibrato,
            overdrive,
            reverb,
            whirl,
            queue: MessageQueue::new(),
            registry: build_control_registry(),
            swell_pedal: 1.0,
            block_size: config.block_size,
            mono_scratch: vec![0.0; config.block_size],
            scan_scratch: vec![0.0; config.block_size],
            left_scratch: vec![0.0; config.block_size],
            right_scratch: vec![0.0; config.block_size],
        })
    }

    /// A handle that a non-realtime thread can clone-free push key
    /// events through. The queue itself has interior atomics, so this
    /// just exposes the field.
    pub fn message_queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// The named control surface (spec.md §6.1), read-only: inspect
    /// registered specs or last-applied values without going through
    /// [`Engine::dispatch_control`].
    pub fn control_registry(&self) -> &ControlRegistry {
        &self.registry
    }

    /// Apply a 7-bit control-change value to a named control (spec.md
    /// §6.1) and route the resulting mapped value into the component that
    /// owns it.
    pub fn dispatch_control(&mut self, name: &str, value: u8) -> Result<(), ControlError> {
        self.registry.dispatch_u7(name, value)?;
        let mapped = self.registry.get(name).expect("just-dispatched control has a value");

        if name == "swellpedal1" {
            self.swell_pedal = mapped;
        } else if name == "rotary.speed-toggle" {
            let speed = if mapped >= 0.5 { RotorSpeed::Fast } else { RotorSpeed::Slow };
            self.whirl.set_horn_speed(speed);
            self.whirl.set_drum_speed(speed);
        } else if name == "whirl.horn.filter.a.hz" {
            self.whirl.set_horn_filter_a_hz(mapped);
        } else if name == "whirl.horn.filter.a.q" {
            self.whirl.set_horn_filter_a_q(mapped);
        } else if name == "bias" {
            self.overdrive.set_drive(mapped);
        } else if let Some((manual, drawbar)) = parse_drawbar_control(name) {
            self.tonegen.set_drawbar(manual, drawbar, mapped as u8);
        }

        log::debug!("control {name} -> {mapped}");
        Ok(())
    }

    pub fn load_program(&mut self, program: &Program) {
        self.tonegen
            .set_drawbars(Manual::Upper, (&program.upper_drawbars).into());
        self.tonegen
            .set_drawbars(Manual::Lower, (&program.lower_drawbars).into());
        self.tonegen
            .set_drawbars(Manual::Pedal, (&program.pedal_drawbars).into());
        self.tonegen.set_percussion((&program.percussion).into());

        let vibrato_select = program
            .vibrato
            .unwrap_or(patch::VibratoSelection::Vib1);
        self.vibrato.select(vibrato_select.into());

        self.overdrive = Overdrive::new(&(&program.overdrive).into());
        self.reverb.set_mix(program.reverb.mix);
        self.whirl.set_horn_speed(program.rotary_speed.into());
        self.whirl.set_drum_speed(program.rotary_speed.into());
        log::debug!("loaded program \"{}\"", program.name);
    }

    /// Drain pending key events, then render one block through the
    /// whole chain (spec.md §4 component order, §5 concurrency model).
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        debug_assert_eq!(left.len(), self.block_size);
        debug_assert_eq!(right.len(), self.block_size);

        self.queue.drain(|event| match event {
            KeyEvent::On(code) => {
                let (manual, key) = decode_key(code);
                self.tonegen.key_on(manual, key);
            }
            KeyEvent::Off(code) => {
                let (manual, key) = decode_key(code);
                self.tonegen.key_off(manual, key);
            }
        });

        // The tone generator splits its output into a "swell" bus (pedal,
        // plus any manual not routed to vibrato, plus percussion) and a
        // "scan" bus (manuals routed through the vibrato scanner). Pedal
        // always lands in swell and never passes through vibrato (spec.md
        // §4.3.3 step 5, §9 "always routing pedal to swell").
        self.tonegen.render_block(&mut self.mono_scratch, &mut self.scan_scratch);
        self.vibrato.process_block(&mut self.scan_scratch);
        for (swell, scanned) in self.mono_scratch.iter_mut().zip(self.scan_scratch.iter()) {
            *swell += *scanned;
        }

        self.overdrive.process_block(&mut self.mono_scratch);
        self.reverb.process_block(&mut self.mono_scratch);
        self.whirl
            .process_block(&self.mono_scratch, &mut self.left_scratch, &mut self.right_scratch);

        let pedal = self.swell_pedal as f32;
        for (dst, src) in left.iter_mut().zip(self.left_scratch.iter()) {
            *dst = *src * pedal;
        }
        for (dst, src) in right.iter_mut().zip(self.right_scratch.iter()) {
            *dst = *src * pedal;
        }
    }
}

/// Build and populate the §6.1 control surface: swell pedal, all 27
/// drawbars, rotary speed toggle, the horn's first tone filter, and
/// overdrive bias. This is the engine's external control-binding sink;
/// a MIDI CC layer above this crate maps CC numbers onto these names and
/// calls [`Engine::dispatch_control`].
fn build_control_registry() -> ControlRegistry {
    let mut registry = ControlRegistry::new();
    registry.register(ParamSpec {
        name: "swellpedal1",
        range: ParamRange::Continuous { min: 0.0, max: 1.0 },
    });
    registry.register(ParamSpec {
        name: "rotary.speed-toggle",
        range: ParamRange::Toggle,
    });
    registry.register(ParamSpec {
        name: "whirl.horn.filter.a.hz",
        range: ParamRange::Continuous { min: 200.0, max: 8000.0 },
    });
    registry.register(ParamSpec {
        name: "whirl.horn.filter.a.q",
        range: ParamRange::Continuous { min: 0.1, max: 5.0 },
    });
    registry.register(ParamSpec {
        name: "bias",
        range: ParamRange::Continuous { min: 0.0, max: 1.0 },
    });

    for manual in ["upper", "lower", "pedal"] {
        for footage in DRAWBAR_FOOTAGES {
            registry.register(ParamSpec {
                name: drawbar_control_name(manual, footage),
                range: ParamRange::Banded { count: 9 },
            });
        }
    }

    registry
}

/// Leak a `"<manual>.drawbar<footage>"` string into a `&'static str`: the
/// registry is built once at engine construction, so this is a one-time
/// allocation per control, not a per-event cost.
fn drawbar_control_name(manual: &str, footage: &str) -> &'static str {
    Box::leak(format!("{manual}.drawbar{footage}").into_boxed_str())
}

fn parse_drawbar_control(name: &str) -> Option<(Manual, usize)> {
    let (manual_str, rest) = name.split_once('.')?;
    let footage = rest.strip_prefix("drawbar")?;
    let manual = match manual_str {
        "upper" => Manual::Upper,
        "lower" => Manual::Lower,
        "pedal" => Manual::Pedal,
        _ => return None,
    };
    let drawbar = DRAWBAR_FOOTAGES.iter().position(|&f| f == footage)?;
    Some((manual, drawbar))
}

/// Pack a (manual, key) pair into the 12-bit key code the message queue
/// carries, and the inverse. Manual occupies the top 2 bits of the
/// 12-bit field; key the rest.
fn encode_key(manual: Manual, key: usize) -> u16 {
    let manual_bits = match manual {
        Manual::Upper => 0,
        Manual::Lower => 1,
        Manual::Pedal => 2,
    };
    ((manual_bits << 10) | (key as u16 & 0x3FF)) & 0x0FFF
}

fn decode_key(code: u16) -> (Manual, usize) {
    let manual = match (code >> 10) & 0x3 {
        0 => Manual::Upper,
        1 => Manual::Lower,
        _ => Manual::Pedal,
    };
    (manual, (code & 0x3FF) as usize)
}

pub fn key_on_event(manual: Manual, key: usize) -> KeyEvent {
    KeyEvent::On(encode_key(manual, key))
}

pub fn key_off_event(manual: Manual, key: usize) -> KeyEvent {
    KeyEvent::Off(encode_key(manual, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_builds_and_renders_silence_by_default() {
        let config = EngineConfig {
            block_size: 64,
            ..EngineConfig::default()
        };
        let mut engine = Engine::build(&config).expect("engine builds");
        let mut l = vec![0.0; 64];
        let mut r = vec![0.0; 64];
        engine.process_block(&mut l, &mut r);
        // A few components add a denormal-avoidance floor (~1e-20) even
        // with no keys held, so check "silent" rather than exact zero.
        assert!(l.iter().all(|s| s.abs() < 1e-6));
        assert!(r.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn key_events_round_trip_through_encoding() {
        for manual in [Manual::Upper, Manual::Lower, Manual::Pedal] {
            for key in [0usize, 30, 60] {
                let code = encode_key(manual, key);
                assert_eq!(decode_key(code), (manual, key));
            }
        }
    }

    #[test]
    fn queued_key_on_produces_audio() {
        let config = EngineConfig {
            block_size: 256,
            ..EngineConfig::default()
        };
        let mut engine = Engine::build(&config).expect("engine builds");
        engine
            .tonegen
            .set_drawbar(Manual::Upper, 2, 8);
        engine.message_queue().push(key_on_event(Manual::Upper, 30));
        let mut l = vec![0.0; 256];
        let mut r = vec![0.0; 256];
        engine.process_block(&mut l, &mut r);
        assert!(l.iter().any(|s| s.abs() > 1e-4) || r.iter().any(|s| s.abs() > 1e-4));
    }

    #[test]
    fn dispatch_control_drives_drawbar_through_the_named_registry() {
        let config = EngineConfig {
            block_size: 256,
            ..EngineConfig::default()
        };
        let mut engine = Engine::build(&config).expect("engine builds");
        engine.dispatch_control("upper.drawbar8", 127).expect("known control");
        engine.message_queue().push(key_on_event(Manual::Upper, 30));
        let mut l = vec![0.0; 256];
        let mut r = vec![0.0; 256];
        engine.process_block(&mut l, &mut r);
        assert!(l.iter().any(|s| s.abs() > 1e-4) || r.iter().any(|s| s.abs() > 1e-4));
        assert_eq!(engine.control_registry().get("upper.drawbar8"), Some(8.0));
    }

    #[test]
    fn swell_pedal_control_scales_final_output() {
        let config = EngineConfig {
            block_size: 256,
            ..EngineConfig::default()
        };
        let mut engine = Engine::build(&config).expect("engine builds");
        engine.dispatch_control("upper.drawbar8", 127).expect("known control");
        engine.message_queue().push(key_on_event(Manual::Upper, 30));
        let mut l = vec![0.0; 256];
        let mut r = vec![0.0; 256];
        engine.process_block(&mut l, &mut r);
        let loud_peak = l.iter().fold(0.0f32, |m, s| m.max(s.abs()));

        engine.dispatch_control("swellpedal1", 0).expect("known control");
        engine.process_block(&mut l, &mut r);
        let quiet_peak = l.iter().fold(0.0f32, |m, s| m.max(s.abs()));

        assert!(quiet_peak < loud_peak * 0.1);
    }
}
