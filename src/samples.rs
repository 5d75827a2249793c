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
//! Percussive sound scheduling against an audio graph.
//!
//! This module provides:
//! - Asynchronous sample loading with at most one fetch in flight per sample
//! - Sound type to sample resolution, including aliases
//! - Sample playback and synthesized click voices that release their own nodes
//! - The scheduler that picks a backend for every event and falls back to clicks

mod asset;
mod cache;
mod click;
mod decode;
mod error;
mod fetch;
mod registry;
mod scheduler;
mod voice;

pub use asset::{AudioAsset, SampleKey};
pub use cache::{AssetCache, LoadProgress, LoadStatus};
pub use click::{click_tone, ClickSynthesizer, ClickTone};
pub use decode::decode_audio;
pub use error::{EngineError, FetchError};
#[cfg(feature = "http")]
pub use fetch::HttpFetcher;
pub use fetch::{AssetFetcher, AssetSource, FetchFuture, FileFetcher};
pub use registry::{default_mapping, mapping_from_paths, SoundTypeRegistry};
pub use scheduler::{
    Backend, FallbackReason, LoadSummary, ManifestSource, PlaybackRequest, ScheduleOutcome,
    SchedulerBuilder, SoundScheduler, MANIFEST_INDEX_FILE,
};
pub use voice::{voice_level, SampleVoice, Voice, VoiceContext, DEFAULT_RELEASE_GRACE};
