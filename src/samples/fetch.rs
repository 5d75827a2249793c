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
//! Fetch-and-decode collaborators.

use std::fs::File;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

use super::asset::{AudioAsset, SampleKey};
use super::decode::decode_audio;
use super::error::FetchError;
use crate::config::SampleManifest;

/// A boxed, sendable fetch operation.
pub type FetchFuture<T> = BoxFuture<'static, Result<T, FetchError>>;

/// Fetches and decodes assets from some transport. Implementations report every kind of
/// failure (missing file, HTTP status, undecodable data) as a [`FetchError`].
pub trait AssetFetcher: Send + Sync {
    /// Fetches and decodes the audio file at `location`.
    fn fetch(&self, location: &str) -> FetchFuture<AudioAsset>;

    /// Fetches and parses the JSON sample manifest at `location`.
    fn fetch_manifest(&self, location: &str) -> FetchFuture<SampleManifest>;
}

/// Reads samples from the local filesystem. Decoding runs on tokio's blocking pool.
#[derive(Debug, Default, Clone)]
pub struct FileFetcher;

impl AssetFetcher for FileFetcher {
    fn fetch(&self, location: &str) -> FetchFuture<AudioAsset> {
        let location = location.to_string();
        async move {
            tokio::task::spawn_blocking(move || {
                let file = File::open(&location).map_err(|source| FetchError::Io {
                    location: location.clone(),
                    source,
                })?;
                decode_audio(Box::new(file), &location)
            })
            .await?
        }
        .boxed()
    }

    fn fetch_manifest(&self, location: &str) -> FetchFuture<SampleManifest> {
        let location = location.to_string();
        async move {
            tokio::task::spawn_blocking(move || {
                let bytes = std::fs::read(&location).map_err(|source| FetchError::Io {
                    location: location.clone(),
                    source,
                })?;
                SampleManifest::from_json(&bytes)
                    .map_err(|source| FetchError::Manifest { location, source })
            })
            .await?
        }
        .boxed()
    }
}

/// Fetches samples over HTTP.
#[cfg(feature = "http")]
#[derive(Debug, Default, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> HttpFetcher {
        HttpFetcher { client }
    }

    async fn get_bytes(client: &reqwest::Client, location: &str) -> Result<Vec<u8>, FetchError> {
        let response = client.get(location).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                location: location.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(feature = "http")]
impl AssetFetcher for HttpFetcher {
    fn fetch(&self, location: &str) -> FetchFuture<AudioAsset> {
        let client = self.client.clone();
        let location = location.to_string();
        async move {
            let bytes = Self::get_bytes(&client, &location).await?;
            tokio::task::spawn_blocking(move || {
                decode_audio(Box::new(std::io::Cursor::new(bytes)), &location)
            })
            .await?
        }
        .boxed()
    }

    fn fetch_manifest(&self, location: &str) -> FetchFuture<SampleManifest> {
        let client = self.client.clone();
        let location = location.to_string();
        async move {
            let bytes = Self::get_bytes(&client, &location).await?;
            SampleManifest::from_json(&bytes)
                .map_err(|source| FetchError::Manifest { location, source })
        }
        .boxed()
    }
}

/// A fetcher bound to a base location. Sample keys are resolved relative to the base.
#[derive(Clone)]
pub struct AssetSource {
    base: String,
    fetcher: Arc<dyn AssetFetcher>,
}

impl AssetSource {
    pub fn new(base: impl Into<String>, fetcher: Arc<dyn AssetFetcher>) -> AssetSource {
        AssetSource {
            base: base.into(),
            fetcher,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Joins a relative path onto the base location.
    pub fn location(&self, relative: &str) -> String {
        if self.base.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.base.trim_end_matches('/'), relative)
        }
    }

    pub fn fetch(&self, key: &SampleKey) -> FetchFuture<AudioAsset> {
        self.fetcher.fetch(&self.location(key.as_str()))
    }

    pub fn fetch_manifest(&self, index_file: &str) -> FetchFuture<SampleManifest> {
        self.fetcher.fetch_manifest(&self.location(index_file))
    }
}

impl std::fmt::Debug for AssetSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetSource")
            .field("base", &self.base)
            .finish()
    }
}
