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
//! Sample keys and decoded audio assets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A stable identifier for one decoded asset, relative to the sample base path.
///
/// Keys are normalized so that every spelling of the same relative path yields the same key:
/// `percussion/pack/kick.wav`, `./percussion//pack/kick.wav` and the triple
/// (`percussion`, `pack`, `kick.wav`) are all equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleKey(Arc<str>);

impl SampleKey {
    /// Derives the key for a manifest entry.
    pub fn from_parts(category: &str, pack: &str, filename: &str) -> SampleKey {
        SampleKey::from_path(&format!("{}/{}/{}", category, pack, filename))
    }

    /// Derives the key for an explicit relative path.
    pub fn from_path(path: &str) -> SampleKey {
        let normalized = path
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .collect::<Vec<_>>()
            .join("/");
        SampleKey(normalized.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SampleKey {
    fn from(path: &str) -> Self {
        SampleKey::from_path(path)
    }
}

/// Decoded, immutable audio. Samples are interleaved when there is more than one channel.
pub struct AudioAsset {
    samples: Vec<f32>,
    channel_count: u16,
    sample_rate: u32,
    duration: Duration,
}

impl AudioAsset {
    pub fn new(samples: Vec<f32>, channel_count: u16, sample_rate: u32) -> AudioAsset {
        let channel_count = channel_count.max(1);
        let frames = samples.len() / channel_count as usize;
        let duration = if sample_rate > 0 {
            Duration::from_secs_f64(frames as f64 / sample_rate as f64)
        } else {
            Duration::ZERO
        };
        AudioAsset {
            samples,
            channel_count,
            sample_rate,
            duration,
        }
    }

    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> AudioAsset {
        AudioAsset::new(samples, 1, sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channel_count as usize
    }

    /// The average of all channels at the given frame.
    pub fn frame_mono(&self, frame: usize) -> f32 {
        let channels = self.channel_count as usize;
        let start = frame * channels;
        match self.samples.get(start..start + channels) {
            Some(values) => values.iter().sum::<f32>() / channels as f32,
            None => 0.0,
        }
    }

    /// Returns the memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

impl fmt::Debug for AudioAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioAsset")
            .field("channels", &self.channel_count)
            .field("sample_rate", &self.sample_rate)
            .field("duration_ms", &self.duration.as_millis())
            .finish()
    }
}
