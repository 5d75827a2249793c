// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Default master volume.
pub const DEFAULT_VOLUME: f32 = 0.8;

/// Selects the playback backend.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SoundMode {
    /// Play decoded samples, falling back to clicks when a sample isn't available.
    #[default]
    Samples,
    /// Always synthesize clicks.
    Clicks,
}

impl fmt::Display for SoundMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SoundMode::Samples => "samples",
            SoundMode::Clicks => "clicks",
        })
    }
}

impl FromStr for SoundMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "samples" | "sample" => Ok(SoundMode::Samples),
            "clicks" | "click" => Ok(SoundMode::Clicks),
            other => Err(ConfigError::Invalid(format!("unknown sound mode {}", other))),
        }
    }
}

/// Volume and mode of one engine. Read by every scheduling call, never retroactive.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_volume")]
    volume: f32,
    #[serde(default)]
    mode: SoundMode,
}

fn default_volume() -> f32 {
    DEFAULT_VOLUME
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

impl EngineConfig {
    /// Creates an engine config, clamping the volume into 0.0..=1.0.
    pub fn new(volume: f32, mode: SoundMode) -> EngineConfig {
        EngineConfig {
            volume: clamp_volume(volume),
            mode,
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn mode(&self) -> SoundMode {
        self.mode
    }

    /// Sets the volume and returns the clamped value that was stored.
    pub fn set_volume(&mut self, volume: f32) -> f32 {
        self.volume = clamp_volume(volume);
        self.volume
    }

    pub fn set_mode(&mut self, mode: SoundMode) {
        self.mode = mode;
    }

    /// Re-applies the volume bounds, for values that came from outside.
    pub fn clamped(self) -> EngineConfig {
        EngineConfig::new(self.volume, self.mode)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::new(DEFAULT_VOLUME, SoundMode::Samples)
    }
}
