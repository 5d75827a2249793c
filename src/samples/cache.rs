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
//! The decoded asset cache.
//!
//! Each key moves through `Loading -> Loaded` or `Loading -> Failed`. Concurrent requests for
//! a key share one in-flight fetch. Failed entries are kept so lookups stay cheap, but a later
//! load retries them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use futures_util::stream::{FuturesUnordered, Stream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::asset::{AudioAsset, SampleKey};
use super::error::{EngineError, FetchError};
use super::fetch::AssetSource;

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<AudioAsset>, Arc<FetchError>>>>;

enum LoadState {
    Loading { id: u64, load: SharedLoad },
    Loaded(Arc<AudioAsset>),
    Failed(String),
}

/// The externally visible state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Unrequested,
    Loading,
    Loaded,
    Failed,
}

/// One step of a batch load.
#[derive(Debug, Clone)]
pub struct LoadProgress {
    /// The key that just settled.
    pub key: SampleKey,
    pub succeeded: bool,
    /// Keys settled so far, including this one.
    pub settled: usize,
    pub total: usize,
    /// Keys that loaded successfully so far.
    pub loaded: usize,
}

impl LoadProgress {
    /// Fraction of the batch that has settled, successfully or not.
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.settled as f32 / self.total as f32
        }
    }
}

struct CacheState {
    entries: HashMap<SampleKey, LoadState>,
    next_load_id: u64,
}

/// Maps sample keys to decoded assets.
pub struct AssetCache {
    state: Mutex<CacheState>,
    lookups: AtomicU64,
}

impl AssetCache {
    pub fn new() -> AssetCache {
        AssetCache {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                next_load_id: 0,
            }),
            lookups: AtomicU64::new(0),
        }
    }

    /// Loads the asset for a key, sharing any fetch already in flight.
    pub async fn load(
        &self,
        key: &SampleKey,
        source: &AssetSource,
    ) -> Result<Arc<AudioAsset>, EngineError> {
        let (id, load) = {
            let mut state = self.state.lock();
            let in_flight = match state.entries.get(key) {
                Some(LoadState::Loaded(asset)) => return Ok(asset.clone()),
                Some(LoadState::Loading { id, load }) => Some((*id, load.clone())),
                Some(LoadState::Failed(_)) | None => None,
            };
            match in_flight {
                Some(in_flight) => in_flight,
                None => {
                    state.next_load_id += 1;
                    let id = state.next_load_id;
                    let load = source
                        .fetch(key)
                        .map(|result| result.map(Arc::new).map_err(Arc::new))
                        .boxed()
                        .shared();
                    state.entries.insert(
                        key.clone(),
                        LoadState::Loading {
                            id,
                            load: load.clone(),
                        },
                    );
                    debug!(key = %key, base = source.base(), "Fetching sample");
                    (id, load)
                }
            }
        };

        let result = load.await;
        self.settle(key, id, &result);
        result.map_err(|e| EngineError::AssetUnavailable {
            key: key.clone(),
            reason: e.to_string(),
        })
    }

    /// Records the outcome of a load, unless the entry was cleared or replaced meanwhile.
    fn settle(&self, key: &SampleKey, id: u64, result: &Result<Arc<AudioAsset>, Arc<FetchError>>) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if !matches!(entry, LoadState::Loading { id: current, .. } if *current == id) {
            return;
        }
        *entry = match result {
            Ok(asset) => {
                debug!(
                    key = %key,
                    duration_ms = asset.duration().as_millis(),
                    channels = asset.channel_count(),
                    "Sample loaded"
                );
                LoadState::Loaded(asset.clone())
            }
            Err(e) => {
                warn!(key = %key, err = %e, "Sample failed to load");
                LoadState::Failed(e.to_string())
            }
        };
    }

    /// Loads a batch of keys concurrently, yielding progress as each one settles.
    pub fn load_many<'a>(
        &'a self,
        keys: Vec<SampleKey>,
        source: &'a AssetSource,
    ) -> impl Stream<Item = LoadProgress> + 'a {
        let total = keys.len();
        keys.into_iter()
            .map(move |key| async move {
                let succeeded = self.load(&key, source).await.is_ok();
                (key, succeeded)
            })
            .collect::<FuturesUnordered<_>>()
            .enumerate()
            .scan(0usize, move |loaded, (index, (key, succeeded))| {
                if succeeded {
                    *loaded += 1;
                }
                future::ready(Some(LoadProgress {
                    key,
                    succeeded,
                    settled: index + 1,
                    total,
                    loaded: *loaded,
                }))
            })
    }

    /// Returns the decoded asset if it is loaded. Never blocks on a fetch.
    pub fn get(&self, key: &SampleKey) -> Option<Arc<AudioAsset>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        match self.state.lock().entries.get(key) {
            Some(LoadState::Loaded(asset)) => Some(asset.clone()),
            _ => None,
        }
    }

    pub fn status(&self, key: &SampleKey) -> LoadStatus {
        match self.state.lock().entries.get(key) {
            None => LoadStatus::Unrequested,
            Some(LoadState::Loading { .. }) => LoadStatus::Loading,
            Some(LoadState::Loaded(_)) => LoadStatus::Loaded,
            Some(LoadState::Failed(_)) => LoadStatus::Failed,
        }
    }

    /// The failure message recorded for a key, if its last load failed.
    pub fn failure(&self, key: &SampleKey) -> Option<String> {
        match self.state.lock().entries.get(key) {
            Some(LoadState::Failed(reason)) => Some(reason.clone()),
            _ => None,
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| matches!(entry, LoadState::Loaded(_)))
            .count()
    }

    /// Number of `get` calls made against this cache.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Memory held by loaded assets, in bytes.
    pub fn total_memory_usage(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .map(|entry| match entry {
                LoadState::Loaded(asset) => asset.memory_size(),
                _ => 0,
            })
            .sum()
    }

    /// Drops every entry. Loads still in flight complete for their callers but are not
    /// recorded.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        debug!(dropped, "Asset cache cleared");
    }
}

impl Default for AssetCache {
    fn default() -> Self {
        AssetCache::new()
    }
}
