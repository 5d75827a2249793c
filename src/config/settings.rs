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
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, File};
use serde::Deserialize;

use super::engine::{EngineConfig, SoundMode, DEFAULT_VOLUME};
use super::error::ConfigError;
use super::manifest::check_sample_path;

/// Default location of the sample tree.
pub const DEFAULT_SAMPLE_BASE_PATH: &str = "../samples";

/// The configuration for one sound engine.
#[derive(Deserialize, Clone, Debug)]
pub struct EngineSettings {
    /// Initial master volume, 0.0 to 1.0.
    #[serde(default = "default_volume")]
    volume: f32,

    /// Initial playback mode.
    #[serde(default)]
    mode: SoundMode,

    /// Directory or URL the sample keys are resolved against.
    #[serde(default = "default_sample_base_path")]
    sample_base_path: String,

    /// A local manifest file. When absent, `sample-index.json` is fetched from the base path.
    manifest: Option<PathBuf>,

    /// Explicit sound type to sample path mapping. Replaces the default table entirely.
    sound_types: Option<HashMap<String, String>>,

    /// Whether voices go through the master compressor.
    #[serde(default = "default_limiter")]
    limiter: bool,

    /// How long after a voice's nominal end it is released if no end signal arrives.
    #[serde(default = "default_release_grace_ms")]
    release_grace_ms: u64,

    /// Where volume and mode changes are persisted. Not persisted when absent.
    settings_file: Option<PathBuf>,
}

fn default_volume() -> f32 {
    DEFAULT_VOLUME
}

fn default_sample_base_path() -> String {
    DEFAULT_SAMPLE_BASE_PATH.to_string()
}

fn default_limiter() -> bool {
    true
}

fn default_release_grace_ms() -> u64 {
    100
}

impl EngineSettings {
    /// Parses engine settings from a YAML or JSON file.
    pub fn deserialize(path: &Path) -> Result<EngineSettings, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<EngineSettings>()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.volume.is_finite() {
            return Err(ConfigError::Invalid(format!("volume {}", self.volume)));
        }
        if self.sample_base_path.trim().is_empty() {
            return Err(ConfigError::Invalid("sample_base_path is empty".into()));
        }
        if let Some(sound_types) = &self.sound_types {
            for path in sound_types.values() {
                check_sample_path(path)?;
            }
        }
        Ok(())
    }

    /// The initial engine config, with the volume clamped.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new(self.volume, self.mode)
    }

    pub fn sample_base_path(&self) -> &str {
        &self.sample_base_path
    }

    pub fn manifest(&self) -> Option<&Path> {
        self.manifest.as_deref()
    }

    pub fn sound_types(&self) -> Option<&HashMap<String, String>> {
        self.sound_types.as_ref()
    }

    pub fn limiter(&self) -> bool {
        self.limiter
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }

    pub fn settings_file(&self) -> Option<&Path> {
        self.settings_file.as_deref()
    }
}
