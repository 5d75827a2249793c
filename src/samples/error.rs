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
use crate::config::ConfigError;
use crate::graph::GraphError;

use super::asset::SampleKey;

/// Failures of the fetch-and-decode collaborator. The scheduler treats every variant the same.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("IO error reading {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {location}: {reason}")]
    Decode { location: String, reason: String },

    #[error("Fetching {location} returned status {status}")]
    Status { location: String, status: u16 },

    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed manifest {location}: {source}")]
    Manifest {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Fetch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Engine errors. Everything except the initialization failures is absorbed by the
/// scheduler and turned into a click fallback or a dropped-event notice.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Sample {key} is unavailable: {reason}")]
    AssetUnavailable { key: SampleKey, reason: String },

    #[error("No sample mapping for sound type {0}")]
    UnknownSoundType(String),

    #[error("Graph construction failed: {0}")]
    GraphConstructionFailed(#[from] GraphError),

    #[error("Sample manifest unavailable: {0}")]
    ManifestUnavailable(#[source] FetchError),

    #[error("Invalid sample manifest: {0}")]
    InvalidManifest(#[from] ConfigError),

    #[error("Initialization interrupted: {0}")]
    Initialization(String),
}
