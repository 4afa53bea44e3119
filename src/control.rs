//! Typed control-surface registry.
//!
//! Replaces the source's `useMIDIControlFunction(name, fn, ctx)` function
//! pointer pattern with a named, typed, introspectable registry — the way
//! `quiver::port::{ParamDef, ParamId}` describe a module's parameter
//! surface instead of exposing raw callbacks. [`crate::Engine::build`]
//! owns one of these and registers every spec.md §6.1 control
//! (`swellpedal1`, the 27 `<manual>.drawbar<footage>` controls,
//! `rotary.speed-toggle`, `whirl.horn.filter.a.hz`/`.q`, `bias`);
//! [`crate::Engine::dispatch_control`] is the sink a MIDI CC layer above
//! this crate would call into. Actual MIDI CC-number-to-name mapping
//! stays out of scope (spec.md §1 Non-goals).

use crate::error::ControlError;
use std::collections::HashMap;

/// The accepted value shape for a control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamRange {
    /// Continuous value in `[min, max]`.
    Continuous { min: f64, max: f64 },
    /// One of `0..count` integer bands (e.g. a 0..127 CC split into
    /// `count` equal bands, such as filter type or rotary selector).
    Banded { count: u32 },
    /// A boolean toggle.
    Toggle,
}

impl ParamRange {
    /// Map a 7-bit MIDI-style value (0..127) into this range's native
    /// representation. Integer-banded controls clamp after dividing the
    /// 0..127 range into `count` equal bands (spec.md §6.1).
    pub fn map_u7(&self, value: u8) -> f64 {
        let v = value.min(127) as f64 / 127.0;
        match *self {
            ParamRange::Continuous { min, max } => min + v * (max - min),
            ParamRange::Banded { count } => {
                let band = ((v * count as f64) as u32).min(count.saturating_sub(1));
                band as f64
            }
            ParamRange::Toggle => {
                if value >= 64 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        match *self {
            ParamRange::Continuous { min, max } => value.clamp(min, max),
            ParamRange::Banded { count } => value.clamp(0.0, (count.saturating_sub(1)) as f64),
            ParamRange::Toggle => {
                if value >= 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Static description of a single named control, analogous to
/// `quiver::port::ParamDef`.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub range: ParamRange,
}

/// A name-keyed registry of control specs plus their last-applied values.
///
/// Owned by whichever side constructs the signal chain; parameter scalars
/// are read at block boundaries (spec.md §5 "Ordering"), so torn reads
/// between `set`/`get` are tolerated — every consumer of a registry value
/// is expected to glide-filter toward it rather than assume sample-exact
/// application.
#[derive(Debug, Default)]
pub struct ControlRegistry {
    specs: HashMap<String, ParamSpec>,
    values: HashMap<String, f64>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ParamSpec) {
        self.values
            .entry(spec.name.to_string())
            .or_insert(match spec.range {
                ParamRange::Continuous { min, .. } => min,
                ParamRange::Banded { .. } => 0.0,
                ParamRange::Toggle => 0.0,
            });
        self.specs.insert(spec.name.to_string(), spec);
    }

    /// Apply a raw 0..127 control-change value by name.
    pub fn dispatch_u7(&mut self, name: &str, value: u8) -> Result<(), ControlError> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| ControlError::UnknownParam(name.to_string()))?
            .clone();
        let mapped = spec.range.map_u7(value);
        self.values.insert(name.to_string(), mapped);
        Ok(())
    }

    /// Apply a value already in the control's native range; out-of-range
    /// values are clamped rather than rejected (spec.md §7 "Runtime
    /// parameter").
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), ControlError> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| ControlError::UnknownParam(name.to_string()))?;
        let clamped = spec.range.clamp(value);
        self.values.insert(name.to_string(), clamped);
        if (clamped - value).abs() > f64::EPSILON {
            return Err(ControlError::OutOfRange {
                param: spec.name,
                value,
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banded_maps_to_whole_count() {
        let range = ParamRange::Banded { count: 3 };
        assert_eq!(range.map_u7(0), 0.0);
        assert_eq!(range.map_u7(127), 2.0);
    }

    #[test]
    fn continuous_clamps_out_of_range() {
        let mut reg = ControlRegistry::new();
        reg.register(ParamSpec {
            name: "bias",
            range: ParamRange::Continuous { min: 0.0, max: 1.0 },
        });
        let err = reg.set("bias", 5.0).unwrap_err();
        assert!(matches!(err, ControlError::OutOfRange { .. }));
        assert_eq!(reg.get("bias"), Some(1.0));
    }

    #[test]
    fn unknown_param_is_an_error() {
        let mut reg = ControlRegistry::new();
        assert!(reg.dispatch_u7("nope", 10).is_err());
    }
}
