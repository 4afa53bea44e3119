//! Error types for configuration, allocation, and runtime-parameter paths.
//!
//! Mirrors the manual `Display` + `std::error::Error` idiom used by
//! `quiver::graph::PatchError` rather than pulling in `thiserror`: the
//! teacher crate doesn't reach for it, so neither do we.

use std::fmt;

/// An init-time configuration value was out of range or otherwise invalid.
///
/// Surfaced to the configuration caller with a line/field context; the
/// component retains its previous (or default) value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl ConfigError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration for `{}`: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Fatal allocation failure at init (e.g. wavetable buffers). The process
/// cannot continue; there is no runtime recovery path.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocError {
    pub what: &'static str,
    pub requested_bytes: usize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to allocate {} ({} bytes)",
            self.what, self.requested_bytes
        )
    }
}

impl std::error::Error for AllocError {}

/// A runtime control update was rejected. Per spec.md §7 this is purely
/// informational — setters clamp or ignore out-of-range input and never
/// propagate a hard failure onto the audio thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlError {
    UnknownParam(String),
    OutOfRange { param: &'static str, value: f64 },
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::UnknownParam(name) => write!(f, "unknown control `{}`", name),
            ControlError::OutOfRange { param, value } => {
                write!(f, "value {} out of range for `{}` (clamped)", value, param)
            }
        }
    }
}

impl std::error::Error for ControlError {}
