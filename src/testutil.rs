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
//! Shared helpers for unit tests.

use std::collections::HashMap;
use std::error::Error;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use futures_util::future::FutureExt;
use hound::{SampleFormat, WavSpec, WavWriter};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::SampleManifest;
use crate::samples::{AssetFetcher, AudioAsset, FetchError, FetchFuture};

/// Calculate RMS (Root Mean Square) of a signal
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|&x| x * x).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Wait for the given async predicate to return true or fail.
pub async fn eventually_async<F, Fut>(mut predicate: F, error_msg: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = SystemTime::now();
    let tick = Duration::from_millis(10);
    let timeout = Duration::from_secs(3);

    loop {
        let elapsed = start.elapsed().unwrap_or(Duration::ZERO);
        if elapsed > timeout {
            panic!("{}", error_msg);
        }
        if predicate().await {
            return;
        }
        tokio::time::sleep(tick).await;
    }
}

/// Writes a mono 32-bit float WAV file, creating parent directories as needed.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = WavWriter::create(
        path,
        WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        },
    )?;
    for sample in samples {
        writer.write_sample(*sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Frames in every asset served by [`TestFetcher`], 0.1 s at 44.1 kHz.
pub const TEST_SAMPLE_FRAMES: usize = 4410;

/// An in-memory fetcher. Every location decodes to a constant mono tone unless it has been
/// marked as failing. Fetches can be held open to exercise in-flight behavior.
pub struct TestFetcher {
    manifest: Mutex<Option<SampleManifest>>,
    failing: Mutex<Vec<String>>,
    fetches: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl TestFetcher {
    pub fn new() -> TestFetcher {
        let (gate, _) = watch::channel(true);
        TestFetcher {
            manifest: Mutex::new(None),
            failing: Mutex::new(Vec::new()),
            fetches: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
            gate,
        }
    }

    pub fn with_manifest(self, manifest: SampleManifest) -> TestFetcher {
        *self.manifest.lock() = Some(manifest);
        self
    }

    /// Fails every location ending with the given suffix.
    pub fn fail(&self, suffix: &str) {
        self.failing.lock().push(suffix.to_string());
    }

    /// Holds every fetch until [`TestFetcher::open`] is called.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn fetch_count(&self, location: &str) -> usize {
        self.fetches.lock().get(location).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl AssetFetcher for TestFetcher {
    fn fetch(&self, location: &str) -> FetchFuture<AudioAsset> {
        *self.fetches.lock().entry(location.to_string()).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let location = location.to_string();
        let fails = self
            .failing
            .lock()
            .iter()
            .any(|suffix| location.ends_with(suffix.as_str()));
        let mut gate = self.gate.subscribe();
        async move {
            let _ = gate.wait_for(|open| *open).await;
            if fails {
                return Err(FetchError::Status {
                    location,
                    status: 404,
                });
            }
            Ok(AudioAsset::from_mono(vec![0.5; TEST_SAMPLE_FRAMES], 44100))
        }
        .boxed()
    }

    fn fetch_manifest(&self, location: &str) -> FetchFuture<SampleManifest> {
        let manifest = self.manifest.lock().clone();
        let location = location.to_string();
        async move {
            manifest.ok_or(FetchError::Status {
                location,
                status: 404,
            })
        }
        .boxed()
    }
}
