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
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use super::engine::EngineConfig;
use super::error::ConfigError;

/// Persists an engine's volume and mode across sessions.
pub trait SettingsStore: Send + Sync {
    /// Returns the saved config, or `None` if nothing has been saved yet.
    fn load(&self) -> Result<Option<EngineConfig>, ConfigError>;

    fn save(&self, config: &EngineConfig) -> Result<(), ConfigError>;
}

/// Stores settings as a YAML file.
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: &Path) -> FileSettingsStore {
        FileSettingsStore {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> Result<Option<EngineConfig>, ConfigError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let config: EngineConfig = serde_yml::from_str(&fs::read_to_string(&self.path)?)?;
        Ok(Some(config.clamped()))
    }

    fn save(&self, config: &EngineConfig) -> Result<(), ConfigError> {
        let serialized = serde_yml::to_string(config)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        debug!(path = ?self.path, "Engine settings saved");
        Ok(())
    }
}

/// Keeps settings in memory, for engines that should not touch the filesystem.
#[derive(Default)]
pub struct MemorySettingsStore {
    saved: Mutex<Option<EngineConfig>>,
}

impl MemorySettingsStore {
    pub fn new(initial: Option<EngineConfig>) -> MemorySettingsStore {
        MemorySettingsStore {
            saved: Mutex::new(initial),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Option<EngineConfig>, ConfigError> {
        Ok(*self.saved.lock())
    }

    fn save(&self, config: &EngineConfig) -> Result<(), ConfigError> {
        *self.saved.lock() = Some(*config);
        Ok(())
    }
}
