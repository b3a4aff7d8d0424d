use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Zoom percentage, always a multiple of [`ZoomLevel::STEP`] within
/// `[ZoomLevel::MIN, ZoomLevel::MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoomLevel(u16);

impl ZoomLevel {
    pub const MIN: u16 = 25;
    pub const MAX: u16 = 200;
    pub const STEP: u16 = 25;
    pub const DEFAULT: ZoomLevel = ZoomLevel(100);

    /// Snaps `value` down to the nearest step.
    pub fn from_percent(value: i64) -> Result<Self, ZoomError> {
        let (min, max, step) = (
            i64::from(Self::MIN),
            i64::from(Self::MAX),
            i64::from(Self::STEP),
        );
        if !(min..=max).contains(&value) {
            return Err(ZoomError::OutOfRange { value });
        }
        let snapped = (value - min) / step * step + min;
        Ok(Self(snapped as u16))
    }

    pub fn percent(self) -> u16 {
        self.0
    }

    pub fn scale(self) -> f32 {
        f32::from(self.0) / 100.0
    }
}

impl Default for ZoomLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ZoomLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZoomError {
    #[error("zoom {value}% is outside 25%..=200%")]
    OutOfRange { value: i64 },
}

/// Saturating zoom control. Stepping never fails; only exact values can be
/// rejected.
#[derive(Debug, Clone, Default)]
pub struct ZoomState {
    level: ZoomLevel,
}

impl ZoomState {
    pub fn new(level: ZoomLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> ZoomLevel {
        self.level
    }

    /// Returns whether the level changed.
    pub fn increment(&mut self) -> bool {
        let next = (self.level.0 + ZoomLevel::STEP).min(ZoomLevel::MAX);
        self.replace(ZoomLevel(next))
    }

    /// Returns whether the level changed.
    pub fn decrement(&mut self) -> bool {
        let next = self
            .level
            .0
            .saturating_sub(ZoomLevel::STEP)
            .max(ZoomLevel::MIN);
        self.replace(ZoomLevel(next))
    }

    pub fn set_exact(&mut self, value: i64) -> Result<ZoomLevel, ZoomError> {
        let level = ZoomLevel::from_percent(value)?;
        self.level = level;
        Ok(level)
    }

    fn replace(&mut self, next: ZoomLevel) -> bool {
        if next == self.level {
            return false;
        }
        self.level = next;
        true
    }
}
