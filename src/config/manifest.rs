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
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use crate::samples::SampleKey;

/// Rejects an explicit sample path that is empty or has a `..` segment, so it stays under the
/// sample base path.
pub fn check_sample_path(path: &str) -> Result<(), ConfigError> {
    let mut segments = path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .peekable();
    if segments.peek().is_none() || segments.any(|segment| segment == "..") {
        return Err(ConfigError::Invalid(format!("invalid sample path: {:?}", path)));
    }
    Ok(())
}

/// The sample index: `category -> pack -> filenames`.
///
/// The shape is checked once by serde when the manifest is parsed; [`SampleManifest::validate`]
/// checks the names themselves.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct SampleManifest {
    categories: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl SampleManifest {
    pub fn new(categories: BTreeMap<String, BTreeMap<String, Vec<String>>>) -> SampleManifest {
        SampleManifest { categories }
    }

    /// Parses a manifest from JSON, the format of `sample-index.json`.
    pub fn from_json(bytes: &[u8]) -> Result<SampleManifest, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Reads a manifest file. `.yaml` and `.yml` files are parsed as YAML, everything else
    /// as JSON.
    pub fn from_file(path: &Path) -> Result<SampleManifest, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        let manifest = if is_yaml {
            serde_yml::from_str(&contents)?
        } else {
            SampleManifest::from_json(contents.as_bytes())?
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Rejects empty names and names that would escape their directory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |kind: &str, name: &str| {
            if name.trim().is_empty()
                || name == "."
                || name == ".."
                || name.contains(['/', '\\'])
            {
                return Err(ConfigError::Invalid(format!(
                    "invalid {} name in sample manifest: {:?}",
                    kind, name
                )));
            }
            Ok(())
        };
        for (category, packs) in &self.categories {
            check("category", category)?;
            for (pack, files) in packs {
                check("pack", pack)?;
                for file in files {
                    check("file", file)?;
                }
            }
        }
        Ok(())
    }

    /// Every `(category, pack, filename)` triple, in category and pack order with files in
    /// listed order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &str)> + '_ {
        self.categories.iter().flat_map(|(category, packs)| {
            packs.iter().flat_map(move |(pack, files)| {
                files
                    .iter()
                    .map(move |file| (category.as_str(), pack.as_str(), file.as_str()))
            })
        })
    }

    /// Each pack with its files.
    pub fn packs(&self) -> impl Iterator<Item = (&str, &str, &[String])> + '_ {
        self.categories.iter().flat_map(|(category, packs)| {
            packs
                .iter()
                .map(move |(pack, files)| (category.as_str(), pack.as_str(), files.as_slice()))
        })
    }

    /// The distinct sample keys of all entries, in entry order.
    pub fn keys(&self) -> Vec<SampleKey> {
        let mut seen = HashSet::new();
        self.entries()
            .map(|(category, pack, file)| SampleKey::from_parts(category, pack, file))
            .filter(|key| seen.insert(key.clone()))
            .collect()
    }

    /// Number of file entries.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_check_sample_path() {
        assert!(check_sample_path("percussion/pack1/kick.wav").is_ok());
        assert!(check_sample_path("./percussion//kick.wav").is_ok());
        for path in ["", "/", "./.", "../kick.wav", "percussion/../../kick.wav", "a\\..\\b.wav"] {
            assert!(
                matches!(check_sample_path(path), Err(ConfigError::Invalid(_))),
                "{:?} was accepted",
                path
            );
        }
    }

    const INDEX: &str = r#"{
        "percussion": {
            "pack2": ["clap.wav"],
            "pack1": ["kick.wav", "snare.wav", "kick.wav"]
        },
        "ambient": {"pads": []}
    }"#;

    #[test]
    fn test_entries_and_keys() {
        let manifest = SampleManifest::from_json(INDEX.as_bytes()).unwrap();
        let entries = manifest.entries().collect::<Vec<_>>();
        assert_eq!(
            entries,
            vec![
                ("percussion", "pack1", "kick.wav"),
                ("percussion", "pack1", "snare.wav"),
                ("percussion", "pack1", "kick.wav"),
                ("percussion", "pack2", "clap.wav"),
            ]
        );
        assert_eq!(manifest.len(), 4);
        assert_eq!(manifest.packs().count(), 3);
        let keys = manifest.keys();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].as_str(), "percussion/pack1/kick.wav");
    }

    #[test]
    fn test_shape_is_checked_at_parse() {
        assert!(SampleManifest::from_json(br#"{"percussion": ["kick.wav"]}"#).is_err());
        assert!(SampleManifest::from_json(br#"{"percussion": {"p": "kick.wav"}}"#).is_err());
        assert!(SampleManifest::from_json(br#"[]"#).is_err());
        assert!(SampleManifest::from_json(br#"{}"#).unwrap().is_empty());
    }

    #[test]
    fn test_validate_names() {
        let bad = SampleManifest::from_json(br#"{"percussion": {"..": ["kick.wav"]}}"#).unwrap();
        assert!(matches!(bad.validate(), Err(ConfigError::Invalid(_))));
        let bad = SampleManifest::from_json(br#"{"p": {"a": ["x/kick.wav"]}}"#).unwrap();
        assert!(bad.validate().is_err());
        let bad = SampleManifest::from_json(br#"{"p": {"a": [" "]}}"#).unwrap();
        assert!(bad.validate().is_err());
        let good = SampleManifest::from_json(INDEX.as_bytes()).unwrap();
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_from_file_yaml_and_json() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let yaml = dir.path().join("index.yaml");
        std::fs::write(&yaml, "percussion:\n  pack1:\n    - kick.wav\n")?;
        let json = dir.path().join("sample-index.json");
        std::fs::write(&json, INDEX)?;

        assert_eq!(SampleManifest::from_file(&yaml)?.len(), 1);
        assert_eq!(SampleManifest::from_file(&json)?.len(), 4);
        assert!(matches!(
            SampleManifest::from_file(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
        Ok(())
    }
}
