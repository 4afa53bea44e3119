//! Program/patch data model: the serializable snapshot of everything a
//! player can dial in (drawbars, percussion, vibrato selection, rotary
//! speed, overdrive drive, reverb mix). Grounded on `quiver::serialize`'s
//! serde-derived patch structs, generalized from a node/cable graph
//! snapshot to this engine's fixed set of per-component parameters.

use serde::{Deserialize, Serialize};

use crate::overdrive::OverdriveConfig;
use crate::reverb::ReverbConfig;
use crate::tonegen::{DrawbarSet, PercussionConfig, PercussionHarmonic};
use crate::vibrato::VibratoSelect;
use crate::whirl::RotorSpeed;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VibratoSelection {
    Vib1,
    Vib2,
    Vib3,
    Cho1,
    Cho2,
    Cho3,
}

impl From<VibratoSelection> for VibratoSelect {
    fn from(v: VibratoSelection) -> Self {
        match v {
            VibratoSelection::Vib1 => VibratoSelect::Vib1,
            VibratoSelection::Vib2 => VibratoSelect::Vib2,
            VibratoSelection::Vib3 => VibratoSelect::Vib3,
            VibratoSelection::Cho1 => VibratoSelect::Cho1,
            VibratoSelection::Cho2 => VibratoSelect::Cho2,
            VibratoSelection::Cho3 => VibratoSelect::Cho3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RotarySpeedSetting {
    Stop,
    Slow,
    Fast,
}

impl From<RotarySpeedSetting> for RotorSpeed {
    fn from(v: RotarySpeedSetting) -> Self {
        match v {
            RotarySpeedSetting::Stop => RotorSpeed::Stop,
            RotarySpeedSetting::Slow => RotorSpeed::Slow,
            RotarySpeedSetting::Fast => RotorSpeed::Fast,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercussionPatch {
    pub enabled: bool,
    pub fast: bool,
    pub soft: bool,
    pub third_harmonic: bool,
    pub gain: f64,
}

impl Default for PercussionPatch {
    fn default() -> Self {
        Self {
            enabled: false,
            fast: true,
            soft: true,
            third_harmonic: false,
            gain: 1.0,
        }
    }
}

impl From<&PercussionPatch> for PercussionConfig {
    fn from(p: &PercussionPatch) -> Self {
        PercussionConfig {
            enabled: p.enabled,
            fast: p.fast,
            soft: p.soft,
            harmonic: if p.third_harmonic {
                PercussionHarmonic::Third
            } else {
                PercussionHarmonic::Second
            },
            gain: p.gain,
            single_trigger: true,
        }
    }
}

/// A drawbar set serializes as its raw 0-8 positions; validated on load
/// (spec.md §6.4 "Program format").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DrawbarPatch {
    pub positions: [u8; 9],
}

impl Default for DrawbarPatch {
    fn default() -> Self {
        Self { positions: [0; 9] }
    }
}

impl From<&DrawbarPatch> for DrawbarSet {
    fn from(p: &DrawbarPatch) -> Self {
        let mut set = DrawbarSet::default();
        for (i, &pos) in p.positions.iter().enumerate() {
            set.set(i, pos);
        }
        set
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverdrivePatch {
    pub drive: f64,
    pub clean: bool,
}

impl Default for OverdrivePatch {
    fn default() -> Self {
        Self {
            drive: 0.0,
            clean: true,
        }
    }
}

impl From<&OverdrivePatch> for OverdriveConfig {
    fn from(p: &OverdrivePatch) -> Self {
        OverdriveConfig {
            drive: p.drive.clamp(0.0, 1.0),
            clean: p.clean,
            ..OverdriveConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverbPatch {
    pub mix: f32,
}

impl Default for ReverbPatch {
    fn default() -> Self {
        Self { mix: 0.3 }
    }
}

impl From<&ReverbPatch> for ReverbConfig {
    fn from(p: &ReverbPatch) -> Self {
        ReverbConfig {
            wet: p.mix.clamp(0.0, 1.0),
            dry: 1.0 - p.mix.clamp(0.0, 1.0),
            ..ReverbConfig::default()
        }
    }
}

/// A complete, serializable player-facing program. Deliberately
/// excludes everything the engine computes at build time (tonewheel
/// tables, IR tables): this is user-settable state only (spec.md
/// Non-goals: no plugin ABI or session state persistence beyond this).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Program {
    pub name: String,
    pub upper_drawbars: DrawbarPatch,
    pub lower_drawbars: DrawbarPatch,
    pub pedal_drawbars: DrawbarPatch,
    pub percussion: PercussionPatch,
    pub vibrato: Option<VibratoSelection>,
    pub rotary_speed: RotarySpeedSetting,
    pub overdrive: OverdrivePatch,
    pub reverb: ReverbPatch,
}

impl Default for RotarySpeedSetting {
    fn default() -> Self {
        RotarySpeedSetting::Slow
    }
}

impl Program {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut program = Program::default();
        program.name = "Jazz".to_string();
        program.upper_drawbars.positions = [8, 8, 8, 0, 0, 0, 0, 0, 0];
        let json = program.to_json().expect("serialize");
        let back = Program::from_json(&json).expect("deserialize");
        assert_eq!(back.name, "Jazz");
        assert_eq!(back.upper_drawbars.positions, [8, 8, 8, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn default_program_is_silent() {
        let program = Program::default();
        let set: DrawbarSet = (&program.upper_drawbars).into();
        assert!(set.positions.iter().all(|&p| p == 0));
    }
}
