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
//! Sound type to sample key resolution.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::asset::SampleKey;
use crate::config::{check_sample_path, SampleManifest};

/// Aliases that always resolve to the same key as their target.
const ALIASES: [(&str, &str); 2] = [("accent", "kick"), ("normal", "hihat_closed")];

/// How a sound type is recognized in a manifest, and where it lives when it isn't.
struct SoundTypeRule {
    sound_type: &'static str,
    tokens: &'static [&'static str],
    excludes: &'static [&'static str],
    fallback: &'static str,
}

const OPEN_TOKENS: &[&str] = &["oh", "openhat", "ohh", "open"];

const RULES: [SoundTypeRule; 6] = [
    SoundTypeRule {
        sound_type: "kick",
        tokens: &["kick", "bd", "bassdrum"],
        excludes: &[],
        fallback: "percussion/DopeDrumsVol5/DD5_Kick_01.wav",
    },
    SoundTypeRule {
        sound_type: "snare",
        tokens: &["snare", "sd", "snr"],
        excludes: &[],
        fallback: "percussion/DopeDrumsVol5/DD5_Snare_01.wav",
    },
    SoundTypeRule {
        sound_type: "hihat_closed",
        tokens: &["ch", "closedhat", "chh", "closed", "hihat", "hh", "hat"],
        excludes: OPEN_TOKENS,
        fallback: "percussion/DopeDrumsVol5/DD5_CH_01.wav",
    },
    SoundTypeRule {
        sound_type: "hihat_open",
        tokens: OPEN_TOKENS,
        excludes: &[],
        fallback: "percussion/DopeDrumsVol5/DD5_OH_01.wav",
    },
    SoundTypeRule {
        sound_type: "perc",
        tokens: &["perc", "percussion"],
        excludes: &[],
        fallback: "percussion/DopeDrumsVol5/DD5_Perc_01.wav",
    },
    SoundTypeRule {
        sound_type: "shaker",
        tokens: &["shk", "shaker", "shake"],
        excludes: &[],
        fallback: "percussion/DopeDrumsVol5/DD5_Shk_01.wav",
    },
];

impl SoundTypeRule {
    fn matches(&self, filename: &str) -> bool {
        let stem = match filename.rfind('.') {
            Some(dot) if dot > 0 => &filename[..dot],
            _ => filename,
        };
        let stem = stem.to_lowercase();
        let tokens = stem
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|token| !token.is_empty())
            .collect::<Vec<_>>();
        tokens.iter().any(|token| self.tokens.contains(token))
            && !tokens.iter().any(|token| self.excludes.contains(token))
    }
}

/// Builds the default mapping for a manifest.
///
/// Each sound type takes the first manifest file whose name carries one of its tokens
/// (`DD5_Kick_01.wav` and `kick.wav` are both kicks). Sound types with no match use the
/// built-in pack paths. The aliases are added last.
pub fn default_mapping(manifest: &SampleManifest) -> HashMap<String, SampleKey> {
    let mut mapping = HashMap::new();
    for rule in RULES.iter() {
        let key = manifest
            .entries()
            .find(|(_, _, filename)| rule.matches(filename))
            .map(|(category, pack, filename)| SampleKey::from_parts(category, pack, filename))
            .unwrap_or_else(|| SampleKey::from_path(rule.fallback));
        mapping.insert(rule.sound_type.to_string(), key);
    }
    for (alias, target) in ALIASES {
        if let Some(key) = mapping.get(target).cloned() {
            mapping.insert(alias.to_string(), key);
        }
    }
    mapping
}

/// Converts an explicit sound type to path mapping. Used verbatim, no aliases are added.
/// Paths that would leave the sample base path are skipped, so those sound types click.
pub fn mapping_from_paths(paths: &HashMap<String, String>) -> HashMap<String, SampleKey> {
    paths
        .iter()
        .filter(|(sound_type, path)| match check_sample_path(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(sound_type = %sound_type, err = %e, "Ignoring sample mapping");
                false
            }
        })
        .map(|(sound_type, path)| (sound_type.clone(), SampleKey::from_path(path)))
        .collect()
}

/// The active sound type table. Readers always see one complete table.
pub struct SoundTypeRegistry {
    table: RwLock<Arc<HashMap<String, SampleKey>>>,
}

impl SoundTypeRegistry {
    pub fn new() -> SoundTypeRegistry {
        SoundTypeRegistry {
            table: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Replaces the whole table.
    pub fn rebuild(&self, mapping: HashMap<String, SampleKey>) {
        let entries = mapping.len();
        let table = Arc::new(mapping);
        *self.table.write() = table;
        info!(entries, "Sound type mapping rebuilt");
    }

    pub fn resolve(&self, sound_type: &str) -> Option<SampleKey> {
        let key = self.table.read().get(sound_type).cloned();
        if key.is_none() {
            debug!(sound_type, "No sample mapped for sound type");
        }
        key
    }

    /// The current table. Later rebuilds do not affect a snapshot already taken.
    pub fn snapshot(&self) -> Arc<HashMap<String, SampleKey>> {
        self.table.read().clone()
    }

    pub fn clear(&self) {
        *self.table.write() = Arc::new(HashMap::new());
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Distinct keys referenced by the table, in key order.
    pub fn keys(&self) -> Vec<SampleKey> {
        self.table
            .read()
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl Default for SoundTypeRegistry {
    fn default() -> Self {
        SoundTypeRegistry::new()
    }
}
