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
//! The sound scheduler: realizes timed events with samples or clicks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::asset::SampleKey;
use super::cache::{AssetCache, LoadStatus};
use super::click::ClickSynthesizer;
use super::error::EngineError;
use super::fetch::{AssetFetcher, AssetSource};
use super::registry::{default_mapping, mapping_from_paths, SoundTypeRegistry};
use super::voice::{SampleVoice, VoiceContext, DEFAULT_RELEASE_GRACE};
use crate::config::{
    EngineConfig, EngineSettings, FileSettingsStore, SampleManifest, SettingsStore, SoundMode,
    DEFAULT_SAMPLE_BASE_PATH,
};
use crate::graph::{CompressorSettings, NodeId, OutputGraph};

/// The manifest file fetched from the sample base path when no manifest is supplied.
pub const MANIFEST_INDEX_FILE: &str = "sample-index.json";

/// Where the scheduler gets its sample manifest from during initialization.
#[derive(Debug, Clone)]
pub enum ManifestSource {
    /// Fetch the given file relative to the sample base path.
    Fetch(String),
    /// Use an already parsed manifest.
    Provided(SampleManifest),
    /// No manifest. Only mapped samples are loaded.
    Skip,
}

impl Default for ManifestSource {
    fn default() -> Self {
        ManifestSource::Fetch(MANIFEST_INDEX_FILE.to_string())
    }
}

/// The backend that realized an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sample,
    Click,
    /// Both backends failed to build a voice. Nothing will sound.
    Dropped,
}

/// Why an event in sample mode did not play a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The engine has not been initialized.
    Uninitialized,
    /// No sample is mapped to the sound type.
    UnknownSoundType,
    /// The mapped sample is not loaded, either still in flight or failed.
    AssetUnavailable,
    /// The graph rejected a node operation.
    GraphConstructionFailed,
}

/// What `schedule_sound` did with an event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleOutcome {
    pub backend: Backend,
    /// The time the event was scheduled at, after clamping.
    pub time: f64,
    /// Whether the requested time was in the past and moved to now.
    pub time_adjusted: bool,
    /// The velocity after clamping.
    pub velocity: f32,
    pub fallback: Option<FallbackReason>,
}

/// One event to schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackRequest<'a> {
    pub time: f64,
    pub sound_type: &'a str,
    pub velocity: f32,
}

impl<'a> PlaybackRequest<'a> {
    pub fn new(time: f64, sound_type: &'a str, velocity: f32) -> PlaybackRequest<'a> {
        PlaybackRequest {
            time,
            sound_type,
            velocity,
        }
    }

    /// Clamps velocity into 0.0..=1.0 and moves past (or non-finite) times to `now`.
    /// Returns the clamped request and whether the time was moved.
    pub fn clamp(self, now: f64) -> (PlaybackRequest<'a>, bool) {
        let velocity = if self.velocity.is_nan() {
            0.0
        } else {
            self.velocity.clamp(0.0, 1.0)
        };
        let adjusted = !self.time.is_finite() || self.time < now;
        let time = if adjusted { now } else { self.time };
        (
            PlaybackRequest {
                time,
                sound_type: self.sound_type,
                velocity,
            },
            adjusted,
        )
    }
}

/// The result of a batch load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub total: usize,
    pub loaded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Uninitialized,
    Ready,
}

/// Configures and builds a [`SoundScheduler`].
pub struct SchedulerBuilder {
    graph: Arc<dyn OutputGraph>,
    fetcher: Arc<dyn AssetFetcher>,
    config: EngineConfig,
    base_path: String,
    manifest: ManifestSource,
    sound_types: Option<HashMap<String, String>>,
    limiter: bool,
    release_grace: f64,
    store: Option<Arc<dyn SettingsStore>>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sample_base_path(mut self, base_path: &str) -> Self {
        self.base_path = base_path.to_string();
        self
    }

    pub fn manifest(mut self, manifest: ManifestSource) -> Self {
        self.manifest = manifest;
        self
    }

    /// An explicit sound type to path mapping, used instead of the default table.
    pub fn sound_types(mut self, sound_types: HashMap<String, String>) -> Self {
        self.sound_types = Some(sound_types);
        self
    }

    pub fn limiter(mut self, limiter: bool) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn release_grace(mut self, release_grace: Duration) -> Self {
        self.release_grace = release_grace.as_secs_f64();
        self
    }

    /// Persists volume and mode. A config saved in the store overrides [`Self::config`].
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> SoundScheduler {
        let config = match self.store.as_ref().map(|store| store.load()) {
            Some(Ok(Some(saved))) => {
                debug!(volume = saved.volume(), mode = %saved.mode(), "Using saved engine settings");
                saved
            }
            Some(Err(e)) => {
                warn!(err = %e, "Unable to load saved engine settings, using defaults");
                self.config
            }
            _ => self.config,
        };

        SoundScheduler {
            graph: self.graph,
            fetcher: self.fetcher,
            config: RwLock::new(config),
            base_path: RwLock::new(self.base_path),
            manifest: self.manifest,
            sound_types: RwLock::new(self.sound_types),
            cache: AssetCache::new(),
            registry: SoundTypeRegistry::new(),
            state: RwLock::new(EngineState::Uninitialized),
            bus: Mutex::new(None),
            limiter: self.limiter,
            release_grace: self.release_grace,
            progress: AtomicU32::new(0.0f32.to_bits()),
            last_summary: Mutex::new(LoadSummary::default()),
            active_voices: Arc::new(AtomicUsize::new(0)),
            store: self.store,
            epoch: AtomicU64::new(0),
        }
    }
}

/// Schedules percussive events against an output graph.
///
/// Scheduling never fails and never waits: an event plays a sample only if that sample is
/// already cached, and otherwise falls back to a synthesized click.
pub struct SoundScheduler {
    /// The output graph voices are built in.
    graph: Arc<dyn OutputGraph>,
    /// Fetches samples and the manifest.
    fetcher: Arc<dyn AssetFetcher>,
    /// Volume and mode, read by every scheduling call.
    config: RwLock<EngineConfig>,
    /// The location sample keys are resolved against.
    base_path: RwLock<String>,
    manifest: ManifestSource,
    /// Explicit sound type mapping, if any.
    sound_types: RwLock<Option<HashMap<String, String>>>,
    cache: AssetCache,
    registry: SoundTypeRegistry,
    state: RwLock<EngineState>,
    /// The master compressor shared by all voices.
    bus: Mutex<Option<NodeId>>,
    limiter: bool,
    release_grace: f64,
    /// Loading progress as f32 bits.
    progress: AtomicU32,
    last_summary: Mutex<LoadSummary>,
    active_voices: Arc<AtomicUsize>,
    store: Option<Arc<dyn SettingsStore>>,
    /// Bumped whenever the sample source changes, so stale initializations can tell.
    epoch: AtomicU64,
}

impl SoundScheduler {
    pub fn builder(graph: Arc<dyn OutputGraph>, fetcher: Arc<dyn AssetFetcher>) -> SchedulerBuilder {
        SchedulerBuilder {
            graph,
            fetcher,
            config: EngineConfig::default(),
            base_path: DEFAULT_SAMPLE_BASE_PATH.to_string(),
            manifest: ManifestSource::default(),
            sound_types: None,
            limiter: true,
            release_grace: DEFAULT_RELEASE_GRACE,
            store: None,
        }
    }

    /// Builds a scheduler from an engine settings file.
    pub fn from_settings(
        settings: &EngineSettings,
        graph: Arc<dyn OutputGraph>,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Result<SoundScheduler, EngineError> {
        let manifest = match settings.manifest() {
            Some(path) => ManifestSource::Provided(SampleManifest::from_file(path)?),
            None => ManifestSource::default(),
        };
        let mut builder = SoundScheduler::builder(graph, fetcher)
            .config(settings.engine_config())
            .sample_base_path(settings.sample_base_path())
            .manifest(manifest)
            .limiter(settings.limiter())
            .release_grace(settings.release_grace());
        if let Some(sound_types) = settings.sound_types() {
            builder = builder.sound_types(sound_types.clone());
        }
        if let Some(path) = settings.settings_file() {
            builder = builder.settings_store(Arc::new(FileSettingsStore::new(path)));
        }
        Ok(builder.build())
    }

    /// Wires the master bus, resolves the manifest and mapping, and loads every sample.
    ///
    /// Individual sample failures are not errors: those sound types fall back to clicks.
    /// Calling this on a ready engine does nothing.
    pub async fn initialize(&self) -> Result<LoadSummary, EngineError> {
        if self.is_ready() {
            info!("Sound scheduler already initialized");
            return Ok(*self.last_summary.lock());
        }

        let (epoch, source) = {
            let _state = self.state.read();
            (self.epoch.load(Ordering::SeqCst), self.source())
        };
        info!(
            graph = %self.graph,
            base = source.base(),
            mode = %self.mode(),
            "Initializing sound scheduler"
        );

        self.ensure_bus()?;

        let manifest_source = self.manifest.clone();
        let manifest = match manifest_source {
            ManifestSource::Fetch(index_file) => Some(
                source
                    .fetch_manifest(&index_file)
                    .await
                    .map_err(EngineError::ManifestUnavailable)?,
            ),
            ManifestSource::Provided(manifest) => Some(manifest),
            ManifestSource::Skip => None,
        };
        if let Some(manifest) = &manifest {
            manifest.validate()?;
        }

        // The mapping is read and installed under the state lock, so a concurrent base path
        // change or mapping update is either fully before or fully after it.
        let keys = {
            let _state = self.state.write();
            self.check_epoch(epoch)?;
            let mapping = match self.sound_types.read().as_ref() {
                Some(paths) => mapping_from_paths(paths),
                None => default_mapping(manifest.as_ref().unwrap_or(&SampleManifest::default())),
            };

            let mut keys = manifest.map(|manifest| manifest.keys()).unwrap_or_default();
            let mut seen = keys.iter().cloned().collect::<HashSet<_>>();
            let mut mapped = mapping.values().cloned().collect::<Vec<_>>();
            mapped.sort();
            keys.extend(mapped.into_iter().filter(|key| seen.insert(key.clone())));

            self.registry.rebuild(mapping);
            self.store_progress(if keys.is_empty() { 1.0 } else { 0.0 });
            keys
        };

        let summary = self.load_batch(keys, &source, Some(epoch)).await;
        {
            let mut state = self.state.write();
            self.check_epoch(epoch)?;
            *state = EngineState::Ready;
            *self.last_summary.lock() = summary;
        }
        info!(
            total = summary.total,
            loaded = summary.loaded,
            failed = summary.failed,
            memory_bytes = self.cache.total_memory_usage(),
            "Sound scheduler ready"
        );
        Ok(summary)
    }

    /// Loads keys concurrently. With an epoch, progress is published and the batch stops
    /// once the sample source changes.
    async fn load_batch(
        &self,
        keys: Vec<SampleKey>,
        source: &AssetSource,
        epoch: Option<u64>,
    ) -> LoadSummary {
        let mut summary = LoadSummary {
            total: keys.len(),
            ..LoadSummary::default()
        };
        let mut loads = self.cache.load_many(keys, source);
        while let Some(step) = loads.next().await {
            if let Some(epoch) = epoch {
                let _state = self.state.read();
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    debug!("Sample source changed, abandoning batch load");
                    break;
                }
                self.store_progress(step.fraction());
            }
            if step.succeeded {
                summary.loaded += 1;
            } else {
                summary.failed += 1;
            }
            debug!(
                key = %step.key,
                settled = step.settled,
                total = step.total,
                "Sample load settled"
            );
        }
        summary
    }

    /// Fails if the sample source changed since `epoch` was read. Callers hold the state lock.
    fn check_epoch(&self, epoch: u64) -> Result<(), EngineError> {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(EngineError::Initialization(
                "sample base path changed during initialization".into(),
            ));
        }
        Ok(())
    }

    /// Creates the master compressor once per scheduler.
    fn ensure_bus(&self) -> Result<(), EngineError> {
        if !self.limiter {
            return Ok(());
        }
        let mut bus = self.bus.lock();
        if bus.is_some() {
            return Ok(());
        }
        let compressor = self
            .graph
            .create_compressor(CompressorSettings::default())?;
        if let Err(e) = self.graph.connect(compressor, self.graph.destination()) {
            let _ = self.graph.release(compressor);
            return Err(e.into());
        }
        debug!(node = compressor, "Master bus created");
        *bus = Some(compressor);
        Ok(())
    }

    /// The node new voices connect to.
    fn output(&self, ready: bool) -> NodeId {
        match *self.bus.lock() {
            Some(bus) if ready => bus,
            _ => self.graph.destination(),
        }
    }

    fn source(&self) -> AssetSource {
        AssetSource::new(self.base_path.read().clone(), self.fetcher.clone())
    }

    fn store_progress(&self, fraction: f32) {
        self.progress.store(fraction.to_bits(), Ordering::SeqCst);
    }

    /// Schedules one event. Never fails and never blocks on a load: the outcome reports which
    /// backend realized the event and why a sample was not used.
    pub fn schedule_sound(&self, time: f64, sound_type: &str, velocity: f32) -> ScheduleOutcome {
        let now = self.graph.current_time();
        let (request, time_adjusted) = PlaybackRequest::new(time, sound_type, velocity).clamp(now);
        if time_adjusted {
            warn!(requested = time, now, sound_type, "Event time is in the past, playing now");
        }

        let config = *self.config.read();
        let ready = self.is_ready();
        let ctx = VoiceContext {
            graph: &self.graph,
            output: self.output(ready),
            release_grace: self.release_grace,
            active: &self.active_voices,
        };
        let outcome = |backend, fallback| ScheduleOutcome {
            backend,
            time: request.time,
            time_adjusted,
            velocity: request.velocity,
            fallback,
        };

        let fallback = if !ready {
            warn!(sound_type, "Sound scheduler not initialized, using click");
            Some(FallbackReason::Uninitialized)
        } else if config.mode() == SoundMode::Clicks {
            None
        } else {
            match self.play_sample(&ctx, &request, &config) {
                Ok(()) => return outcome(Backend::Sample, None),
                Err(reason) => Some(reason),
            }
        };

        match ClickSynthesizer::synthesize(
            &ctx,
            request.time,
            request.sound_type,
            request.velocity,
            &config,
        ) {
            Ok(_) => outcome(Backend::Click, fallback),
            Err(e) => {
                error!(
                    sound_type,
                    time = request.time,
                    err = %e,
                    "Unable to build click voice, event dropped"
                );
                outcome(
                    Backend::Dropped,
                    fallback.or(Some(FallbackReason::GraphConstructionFailed)),
                )
            }
        }
    }

    /// The sample path of `schedule_sound`. Only touches the cache through `get`.
    fn play_sample(
        &self,
        ctx: &VoiceContext<'_>,
        request: &PlaybackRequest<'_>,
        config: &EngineConfig,
    ) -> Result<(), FallbackReason> {
        let sound_type = request.sound_type;
        let Some(key) = self.registry.resolve(sound_type) else {
            warn!(sound_type, "No sample mapped, using click");
            return Err(FallbackReason::UnknownSoundType);
        };
        let Some(asset) = self.cache.get(&key) else {
            warn!(
                sound_type,
                key = %key,
                status = ?self.cache.status(&key),
                "Sample not loaded, using click"
            );
            return Err(FallbackReason::AssetUnavailable);
        };
        match SampleVoice::play(
            ctx,
            request.time,
            asset,
            request.velocity,
            config,
            key.as_str(),
        ) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(sound_type, key = %key, err = %e, "Unable to build sample voice, using click");
                Err(FallbackReason::GraphConstructionFailed)
            }
        }
    }

    /// Sets the master volume for subsequent events and persists it. Returns the clamped
    /// value.
    pub fn set_volume(&self, volume: f32) -> f32 {
        let config = {
            let mut config = self.config.write();
            config.set_volume(volume);
            *config
        };
        debug!(volume = config.volume(), "Volume changed");
        self.persist(&config);
        config.volume()
    }

    pub fn volume(&self) -> f32 {
        self.config.read().volume()
    }

    /// Sets the playback mode for subsequent events and persists it.
    pub fn set_mode(&self, mode: SoundMode) {
        let config = {
            let mut config = self.config.write();
            config.set_mode(mode);
            *config
        };
        info!(mode = %mode, "Sound mode changed");
        self.persist(&config);
    }

    pub fn mode(&self) -> SoundMode {
        self.config.read().mode()
    }

    pub fn config(&self) -> EngineConfig {
        *self.config.read()
    }

    fn persist(&self, config: &EngineConfig) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(config) {
                warn!(err = %e, "Unable to persist engine settings");
            }
        }
    }

    /// Points the engine at a new sample location. Cached samples and the sound type table
    /// are dropped and the engine needs to be initialized again before samples play. Clicks
    /// keep working in the meantime.
    pub fn set_sample_base_path(&self, base_path: &str) {
        {
            let mut state = self.state.write();
            *self.base_path.write() = base_path.to_string();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            *state = EngineState::Uninitialized;
            self.cache.clear();
            self.registry.clear();
            self.store_progress(0.0);
            *self.last_summary.lock() = LoadSummary::default();
        }
        info!(base = base_path, "Sample base path changed");
    }

    pub fn sample_base_path(&self) -> String {
        self.base_path.read().clone()
    }

    /// Replaces the sound type table with an explicit mapping and loads the samples it
    /// references that are not cached yet.
    pub async fn update_sound_type_mapping(&self, paths: HashMap<String, String>) -> LoadSummary {
        let mapping = mapping_from_paths(&paths);
        let mut missing = mapping
            .values()
            .filter(|key| self.cache.status(key) != LoadStatus::Loaded)
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        missing.sort();
        {
            let _state = self.state.write();
            *self.sound_types.write() = Some(paths);
            self.registry.rebuild(mapping);
        }

        let summary = self.load_batch(missing, &self.source(), None).await;
        info!(
            loaded = summary.loaded,
            failed = summary.failed,
            "Sound type mapping updated"
        );
        summary
    }

    /// A copy of the active sound type table.
    pub fn sound_type_mapping(&self) -> HashMap<String, SampleKey> {
        self.registry.snapshot().as_ref().clone()
    }

    /// Fraction of the initial load that has settled.
    pub fn loading_progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        *self.state.read() == EngineState::Ready
    }

    pub fn loaded_sample_count(&self) -> usize {
        self.cache.loaded_count()
    }

    /// Voices built and not yet released.
    pub fn active_voice_count(&self) -> usize {
        self.active_voices.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }
}

impl Drop for SoundScheduler {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.lock().take() {
            if let Err(e) = self.graph.release(bus) {
                debug!(err = %e, "Unable to release master bus");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::config::MemorySettingsStore;
    use crate::graph::mock::{MockGraph, NodeKind};
    use crate::graph::offline::OfflineGraph;
    use crate::samples::FileFetcher;
    use crate::testutil::{calculate_rms, eventually_async, write_wav, TestFetcher};

    struct Harness {
        mock: Arc<MockGraph>,
        fetcher: Arc<TestFetcher>,
        scheduler: Arc<SoundScheduler>,
    }

    fn scenario_manifest() -> SampleManifest {
        SampleManifest::from_json(br#"{"percussion": {"pack1": ["kick.wav", "snare.wav"]}}"#)
            .unwrap()
    }

    fn harness(
        fetcher: TestFetcher,
        configure: impl FnOnce(SchedulerBuilder) -> SchedulerBuilder,
    ) -> Harness {
        let mock = Arc::new(MockGraph::new("scheduler"));
        let fetcher = Arc::new(fetcher);
        let builder = SoundScheduler::builder(mock.clone(), fetcher.clone())
            .sample_base_path("samples")
            .manifest(ManifestSource::Provided(scenario_manifest()));
        Harness {
            mock,
            fetcher,
            scheduler: Arc::new(configure(builder).build()),
        }
    }

    impl Harness {
        /// Number of sound-producing nodes created so far.
        fn source_count(&self) -> usize {
            self.mock.nodes_of(NodeKind::Oscillator).len()
                + self.mock.nodes_of(NodeKind::BufferSource).len()
        }

        fn last_gain_peak(&self) -> f32 {
            self.mock
                .nodes_of(NodeKind::Gain)
                .last()
                .map(|node| node.gain.peak())
                .unwrap_or(-1.0)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_uninitialized_engine_clicks() {
        let h = harness(TestFetcher::new(), |b| b);
        let outcome = h.scheduler.schedule_sound(0.5, "kick", 1.0);

        assert_eq!(outcome.backend, Backend::Click);
        assert_eq!(outcome.fallback, Some(FallbackReason::Uninitialized));
        assert_eq!(h.scheduler.cache().lookup_count(), 0);
        assert!(!h.scheduler.is_ready());
        assert_eq!(h.scheduler.loading_progress(), 0.0);

        // Before initialization there is no bus, voices go straight to the destination.
        let gains = h.mock.nodes_of(NodeKind::Gain);
        assert_eq!(gains[0].connections, vec![h.mock.destination()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_manifest_scenario() -> Result<(), Box<dyn Error>> {
        let fetcher = TestFetcher::new();
        fetcher.hold();
        let h = harness(fetcher, |b| b);
        let kick = SampleKey::from_path("percussion/pack1/kick.wav");

        let init = {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.initialize().await })
        };
        eventually_async(
            || {
                let scheduler = h.scheduler.clone();
                let kick = kick.clone();
                async move { scheduler.cache().status(&kick) == LoadStatus::Loading }
            },
            "initial load never started",
        )
        .await;

        // Still loading: the event is realized by a click.
        let outcome = h.scheduler.schedule_sound(0.0, "kick", 1.0);
        assert_eq!(outcome.backend, Backend::Click);
        assert!(h.scheduler.loading_progress() < 1.0);

        h.fetcher.open();
        let summary = init.await??;
        assert_eq!(summary.total, 6);
        assert_eq!(summary.loaded, 6);
        assert_eq!(h.scheduler.loading_progress(), 1.0);
        assert!(h.scheduler.is_ready());
        assert_eq!(h.scheduler.sound_type_mapping()["kick"], kick);

        let outcome = h.scheduler.schedule_sound(h.mock.current_time(), "kick", 1.0);
        assert_eq!(outcome.backend, Backend::Sample);
        assert_eq!(outcome.fallback, None);
        let sources = h.mock.nodes_of(NodeKind::BufferSource);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].asset.as_ref().map(|a| a.frames()), Some(4410));

        // Aliases share the target's sample.
        assert_eq!(h.scheduler.schedule_sound(0.0, "accent", 1.0).backend, Backend::Sample);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fallback_chain() -> Result<(), Box<dyn Error>> {
        let fetcher = TestFetcher::new();
        fetcher.fail("snare.wav");
        let h = harness(fetcher, |b| b);
        let summary = h.scheduler.initialize().await?;
        assert_eq!(summary.failed, 1);
        assert_eq!(h.scheduler.loaded_sample_count(), 5);

        let snare = h.scheduler.schedule_sound(0.0, "snare", 1.0);
        assert_eq!(snare.backend, Backend::Click);
        assert_eq!(snare.fallback, Some(FallbackReason::AssetUnavailable));

        let unknown = h.scheduler.schedule_sound(0.0, "cowbell", 1.0);
        assert_eq!(unknown.backend, Backend::Click);
        assert_eq!(unknown.fallback, Some(FallbackReason::UnknownSoundType));

        assert_eq!(h.scheduler.schedule_sound(0.0, "kick", 1.0).backend, Backend::Sample);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_cache_always_clicks() -> Result<(), Box<dyn Error>> {
        let fetcher = TestFetcher::new();
        fetcher.fail(".wav");
        let h = harness(fetcher, |b| b);
        let summary = h.scheduler.initialize().await?;
        assert_eq!(summary.loaded, 0);
        assert!(h.scheduler.is_ready());

        for sound_type in ["kick", "snare", "hihat_closed", "hihat_open", "perc", "shaker"] {
            let outcome = h.scheduler.schedule_sound(0.0, sound_type, 0.7);
            assert_eq!(outcome.backend, Backend::Click);
            assert_eq!(outcome.fallback, Some(FallbackReason::AssetUnavailable));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_every_event_sounds_exactly_once() -> Result<(), Box<dyn Error>> {
        let fetcher = TestFetcher::new();
        fetcher.fail("snare.wav");
        let h = harness(fetcher, |b| b);

        let mut expected = 0;
        for initialized in [false, true] {
            if initialized {
                h.scheduler.initialize().await?;
            }
            for sound_type in ["kick", "snare", "accent", "normal", "cowbell", ""] {
                for velocity in [0.0, 0.5, 1.0] {
                    for time in [0.0, 0.25, 10.0] {
                        let outcome = h.scheduler.schedule_sound(time, sound_type, velocity);
                        expected += 1;
                        assert_ne!(outcome.backend, Backend::Dropped);
                        assert_eq!(h.source_count(), expected);
                    }
                }
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_velocity_is_clamped() -> Result<(), Box<dyn Error>> {
        let h = harness(TestFetcher::new(), |b| b);
        h.scheduler.initialize().await?;

        let loud = h.scheduler.schedule_sound(0.0, "kick", 1.5);
        let loud_peak = h.last_gain_peak();
        let full = h.scheduler.schedule_sound(0.0, "kick", 1.0);
        let full_peak = h.last_gain_peak();
        assert_eq!(loud, full);
        assert_eq!(loud.velocity, 1.0);
        assert_eq!(loud_peak, full_peak);
        assert!((full_peak - 0.8).abs() < 1e-6);

        let negative = h.scheduler.schedule_sound(0.0, "kick", -0.3);
        let negative_peak = h.last_gain_peak();
        let silent = h.scheduler.schedule_sound(0.0, "kick", 0.0);
        assert_eq!(negative, silent);
        assert_eq!(negative.velocity, 0.0);
        assert_eq!(negative_peak, 0.0);

        let nan = h.scheduler.schedule_sound(0.0, "kick", f32::NAN);
        assert_eq!(nan.velocity, 0.0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_past_times_play_now() {
        let h = harness(TestFetcher::new(), |b| b);
        h.mock.set_time(5.0);

        let late = h.scheduler.schedule_sound(1.0, "kick", 1.0);
        assert_eq!(late.time, 5.0);
        assert!(late.time_adjusted);
        let oscillators = h.mock.nodes_of(NodeKind::Oscillator);
        assert_eq!(oscillators.last().and_then(|node| node.started_at), Some(5.0));

        let future = h.scheduler.schedule_sound(6.0, "kick", 1.0);
        assert_eq!(future.time, 6.0);
        assert!(!future.time_adjusted);

        let nan = h.scheduler.schedule_sound(f64::NAN, "kick", 1.0);
        assert_eq!(nan.time, 5.0);
        assert!(nan.time_adjusted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_clicks_mode_skips_cache() -> Result<(), Box<dyn Error>> {
        let h = harness(TestFetcher::new(), |b| b);
        h.scheduler.initialize().await?;
        assert_eq!(h.scheduler.schedule_sound(0.0, "kick", 1.0).backend, Backend::Sample);
        let lookups = h.scheduler.cache().lookup_count();

        h.scheduler.set_mode(SoundMode::Clicks);
        assert_eq!(h.scheduler.mode(), SoundMode::Clicks);
        for _ in 0..3 {
            let outcome = h.scheduler.schedule_sound(0.0, "kick", 1.0);
            assert_eq!(outcome.backend, Backend::Click);
            assert_eq!(outcome.fallback, None);
        }
        assert_eq!(h.scheduler.cache().lookup_count(), lookups);

        h.scheduler.set_mode(SoundMode::Samples);
        assert_eq!(h.scheduler.schedule_sound(0.0, "kick", 1.0).backend, Backend::Sample);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_base_path_change_invalidates() -> Result<(), Box<dyn Error>> {
        let h = harness(TestFetcher::new(), |b| b);
        h.scheduler.initialize().await?;
        assert_eq!(h.scheduler.loaded_sample_count(), 6);

        h.scheduler.set_sample_base_path("other");
        assert_eq!(h.scheduler.sample_base_path(), "other");
        assert_eq!(h.scheduler.loaded_sample_count(), 0);
        assert!(!h.scheduler.is_ready());
        assert_eq!(h.scheduler.loading_progress(), 0.0);
        assert!(h.scheduler.sound_type_mapping().is_empty());

        let outcome = h.scheduler.schedule_sound(0.0, "kick", 1.0);
        assert_eq!(outcome.backend, Backend::Click);
        assert_eq!(outcome.fallback, Some(FallbackReason::Uninitialized));

        h.scheduler.initialize().await?;
        assert!(h.scheduler.is_ready());
        assert_eq!(h.fetcher.fetch_count("other/percussion/pack1/kick.wav"), 1);
        assert_eq!(h.scheduler.schedule_sound(0.0, "kick", 1.0).backend, Backend::Sample);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_base_path_change_during_initialize() -> Result<(), Box<dyn Error>> {
        let fetcher = TestFetcher::new();
        fetcher.hold();
        let h = harness(fetcher, |b| b);
        let kick = SampleKey::from_path("percussion/pack1/kick.wav");

        let init = {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.initialize().await })
        };
        eventually_async(
            || {
                let scheduler = h.scheduler.clone();
                let kick = kick.clone();
                async move { scheduler.cache().status(&kick) == LoadStatus::Loading }
            },
            "initial load never started",
        )
        .await;

        h.scheduler.set_sample_base_path("other");
        h.fetcher.open();
        assert!(matches!(init.await?, Err(EngineError::Initialization(_))));
        assert!(!h.scheduler.is_ready());
        assert_eq!(h.scheduler.loaded_sample_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_base_path_change_racing_initialize() -> Result<(), Box<dyn Error>> {
        for _ in 0..200 {
            let h = harness(TestFetcher::new(), |b| b);
            let init = {
                let scheduler = h.scheduler.clone();
                tokio::spawn(async move { scheduler.initialize().await })
            };
            let change = {
                let scheduler = h.scheduler.clone();
                tokio::task::spawn_blocking(move || scheduler.set_sample_base_path("other"))
            };
            let result = init.await?;
            change.await?;

            // Whatever the interleaving, a ready engine has a table and an abandoned one has none.
            if h.scheduler.is_ready() {
                assert!(result.is_ok());
                assert!(!h.scheduler.sound_type_mapping().is_empty());
            } else {
                assert!(matches!(result, Err(EngineError::Initialization(_)) | Ok(_)));
                assert!(h.scheduler.sound_type_mapping().is_empty());
            }

            h.scheduler.initialize().await?;
            assert!(h.scheduler.is_ready());
            assert_eq!(h.scheduler.sample_base_path(), "other");
            assert_eq!(h.scheduler.loaded_sample_count(), 6);
            assert_eq!(h.scheduler.schedule_sound(0.0, "kick", 1.0).backend, Backend::Sample);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_sound_type_mapping_survives_initialize() -> Result<(), Box<dyn Error>> {
        for _ in 0..100 {
            let h = harness(TestFetcher::new(), |b| b);
            let init = {
                let scheduler = h.scheduler.clone();
                tokio::spawn(async move { scheduler.initialize().await })
            };
            let mapping = HashMap::from([(
                "kick".to_string(),
                "percussion/pack1/snare.wav".to_string(),
            )]);
            h.scheduler.update_sound_type_mapping(mapping).await;
            init.await??;

            // The later mapping update wins over the default table.
            let table = h.scheduler.sound_type_mapping();
            assert_eq!(table.len(), 1);
            assert_eq!(table["kick"], SampleKey::from_path("percussion/pack1/snare.wav"));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_initialize_is_idempotent()-> Result<(), Box<dyn Error>> {
        let h = harness(TestFetcher::new(), |b| b);
        let first = h.scheduler.initialize().await?;
        let fetches = h.fetcher.total_fetches();
        let second = h.scheduler.initialize().await?;
        assert_eq!(first, second);
        assert_eq!(h.fetcher.total_fetches(), fetches);
        assert_eq!(h.mock.nodes_of(NodeKind::Compressor).len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_master_bus() -> Result<(), Box<dyn Error>> {
        let h = harness(TestFetcher::new(), |b| b);
        h.scheduler.initialize().await?;
        let compressors = h.mock.nodes_of(NodeKind::Compressor);
        assert_eq!(compressors.len(), 1);
        assert_eq!(compressors[0].connections, vec![h.mock.destination()]);
        assert_eq!(compressors[0].compressor, Some(CompressorSettings::default()));

        h.scheduler.schedule_sound(0.0, "kick", 1.0);
        let gains = h.mock.nodes_of(NodeKind::Gain);
        assert_eq!(gains[0].connections, vec![compressors[0].id]);

        let bypass = harness(TestFetcher::new(), |b| b.limiter(false));
        bypass.scheduler.initialize().await?;
        assert!(bypass.mock.nodes_of(NodeKind::Compressor).is_empty());
        bypass.scheduler.schedule_sound(0.0, "kick", 1.0);
        let gains = bypass.mock.nodes_of(NodeKind::Gain);
        assert_eq!(gains[0].connections, vec![bypass.mock.destination()]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_graph_failures_degrade() -> Result<(), Box<dyn Error>> {
        let h = harness(TestFetcher::new(), |b| b);
        h.scheduler.initialize().await?;

        h.mock.fail_creating(NodeKind::BufferSource);
        let outcome = h.scheduler.schedule_sound(0.0, "kick", 1.0);
        assert_eq!(outcome.backend, Backend::Click);
        assert_eq!(outcome.fallback, Some(FallbackReason::GraphConstructionFailed));

        h.mock.fail_creating(NodeKind::Oscillator);
        assert_eq!(h.scheduler.schedule_sound(0.0, "kick", 1.0).backend, Backend::Sample);
        let dropped = h.scheduler.schedule_sound(0.0, "cowbell", 1.0);
        assert_eq!(dropped.backend, Backend::Dropped);
        assert_eq!(dropped.fallback, Some(FallbackReason::UnknownSoundType));

        h.scheduler.set_mode(SoundMode::Clicks);
        let dropped = h.scheduler.schedule_sound(0.0, "kick", 1.0);
        assert_eq!(dropped.backend, Backend::Dropped);
        assert_eq!(dropped.fallback, Some(FallbackReason::GraphConstructionFailed));

        // Let every voice run out: only the bus stays alive.
        h.mock.advance_to(10.0);
        assert_eq!(h.scheduler.active_voice_count(), 0);
        assert_eq!(h.mock.live_node_count(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bus_failure_fails_initialize() {
        let h = harness(TestFetcher::new(), |b| b);
        h.mock.fail_creating(NodeKind::Compressor);
        assert!(matches!(
            h.scheduler.initialize().await,
            Err(EngineError::GraphConstructionFailed(_))
        ));
        assert!(!h.scheduler.is_ready());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_manifest_fetch() -> Result<(), Box<dyn Error>> {
        let missing = harness(TestFetcher::new(), |b| b.manifest(ManifestSource::default()));
        assert!(matches!(
            missing.scheduler.initialize().await,
            Err(EngineError::ManifestUnavailable(_))
        ));
        assert!(!missing.scheduler.is_ready());
        assert_eq!(
            missing.scheduler.schedule_sound(0.0, "kick", 1.0).backend,
            Backend::Click
        );

        let fetched = harness(TestFetcher::new().with_manifest(scenario_manifest()), |b| {
            b.manifest(ManifestSource::default())
        });
        let summary = fetched.scheduler.initialize().await?;
        assert_eq!(summary.total, 6);
        assert_eq!(
            fetched.scheduler.sound_type_mapping()["snare"].as_str(),
            "percussion/pack1/snare.wav"
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_manifest_fails_initialize() {
        let bad = SampleManifest::from_json(br#"{"percussion": {"..": ["kick.wav"]}}"#).unwrap();
        let h = harness(TestFetcher::new(), |b| b.manifest(ManifestSource::Provided(bad)));
        assert!(matches!(
            h.scheduler.initialize().await,
            Err(EngineError::InvalidManifest(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_settings_are_persisted() {
        let store = Arc::new(MemorySettingsStore::new(Some(EngineConfig::new(
            0.3,
            SoundMode::Clicks,
        ))));
        let h = harness(TestFetcher::new(), |b| b.settings_store(store.clone()));
        assert_eq!(h.scheduler.mode(), SoundMode::Clicks);
        assert_eq!(h.scheduler.volume(), 0.3);

        assert_eq!(h.scheduler.set_volume(2.0), 1.0);
        assert_eq!(h.scheduler.volume(), 1.0);
        assert_eq!(
            store.load().unwrap(),
            Some(EngineConfig::new(1.0, SoundMode::Clicks))
        );
        h.scheduler.set_mode(SoundMode::Samples);
        assert_eq!(
            store.load().unwrap(),
            Some(EngineConfig::new(1.0, SoundMode::Samples))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_volume_is_not_retroactive() -> Result<(), Box<dyn Error>> {
        let h = harness(TestFetcher::new(), |b| b);
        h.scheduler.initialize().await?;
        h.scheduler.set_volume(0.5);
        h.scheduler.schedule_sound(0.0, "kick", 1.0);
        let first = h.mock.nodes_of(NodeKind::Gain)[0].id;
        h.scheduler.set_volume(1.0);
        h.scheduler.schedule_sound(0.0, "kick", 1.0);

        assert_eq!(h.mock.node(first).map(|node| node.gain.peak()), Some(0.5));
        assert_eq!(h.last_gain_peak(), 1.0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_voices_are_released() -> Result<(), Box<dyn Error>> {
        let h = harness(TestFetcher::new(), |b| b);
        h.scheduler.initialize().await?;
        h.scheduler.schedule_sound(0.0, "kick", 1.0);
        h.scheduler.schedule_sound(0.0, "cowbell", 1.0);
        assert_eq!(h.scheduler.active_voice_count(), 2);

        h.mock.advance_to(1.0);
        assert_eq!(h.scheduler.active_voice_count(), 0);
        assert_eq!(h.mock.live_node_count(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_sound_type_mapping() -> Result<(), Box<dyn Error>> {
        let h = harness(TestFetcher::new(), |b| {
            b.manifest(ManifestSource::Skip)
                .sound_types(HashMap::from([("kick".to_string(), "a/kick.wav".to_string())]))
        });
        let summary = h.scheduler.initialize().await?;
        assert_eq!(summary.total, 1);
        assert_eq!(h.scheduler.sound_type_mapping().len(), 1);
        // Explicit mappings are used verbatim.
        assert_eq!(
            h.scheduler.schedule_sound(0.0, "accent", 1.0).fallback,
            Some(FallbackReason::UnknownSoundType)
        );

        h.fetcher.hold();
        let update = {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .update_sound_type_mapping(HashMap::from([
                        ("kick".to_string(), "a/kick.wav".to_string()),
                        ("clap".to_string(), "b/clap.wav".to_string()),
                    ]))
                    .await
            })
        };
        let clap = SampleKey::from_path("b/clap.wav");
        eventually_async(
            || {
                let scheduler = h.scheduler.clone();
                let clap = clap.clone();
                async move { scheduler.cache().status(&clap) == LoadStatus::Loading }
            },
            "mapping load never started",
        )
        .await;
        assert_eq!(
            h.scheduler.schedule_sound(0.0, "clap", 1.0).fallback,
            Some(FallbackReason::AssetUnavailable)
        );

        h.fetcher.open();
        let summary = update.await?;
        assert_eq!(summary.total, 1);
        assert_eq!(summary.loaded, 1);
        assert_eq!(h.fetcher.fetch_count("samples/a/kick.wav"), 1);
        assert_eq!(h.scheduler.schedule_sound(0.0, "clap", 1.0).backend, Backend::Sample);

        let mut mapping = h.scheduler.sound_type_mapping();
        assert_eq!(mapping.len(), 2);
        mapping.clear();
        assert_eq!(h.scheduler.sound_type_mapping().len(), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_render_from_wav_files() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join(MANIFEST_INDEX_FILE),
            r#"{"percussion": {"pack1": ["kick.wav", "snare.wav"]}}"#,
        )?;
        for file in ["kick.wav", "snare.wav"] {
            write_wav(
                &dir.path().join("percussion/pack1").join(file),
                &[0.5; 4410],
                44100,
            )?;
        }

        // 16 kHz puts the shaker tone above Nyquist.
        let graph = Arc::new(OfflineGraph::new(16000));
        let scheduler = SoundScheduler::builder(graph.clone(), Arc::new(FileFetcher))
            .sample_base_path(&dir.path().to_string_lossy())
            .build();
        let summary = scheduler.initialize().await?;
        assert_eq!(summary.loaded, 2);
        assert!(scheduler.is_ready());

        let kick = scheduler.schedule_sound(0.2, "kick", 1.0);
        assert_eq!(kick.backend, Backend::Sample);
        let shaker = scheduler.schedule_sound(0.6, "shaker", 1.0);
        assert_eq!(shaker.backend, Backend::Click);
        assert_eq!(shaker.fallback, Some(FallbackReason::AssetUnavailable));
        assert_eq!(scheduler.active_voice_count(), 2);

        let output = graph.render(1.0);
        let level = |start: f64, end: f64| {
            calculate_rms(&output[(start * 16000.0) as usize..(end * 16000.0) as usize])
        };
        assert!(level(0.0, 0.19) < 1e-4);
        assert!(level(0.2, 0.3) > 0.01);
        assert!(level(0.45, 0.55) < 1e-4);
        assert!(level(0.6, 0.64) > 1e-3);

        // Every voice released its nodes, only the master bus is left.
        assert_eq!(scheduler.active_voice_count(), 0);
        assert_eq!(graph.node_count(), 1);
        Ok(())
    }

    #[test]
    fn test_playback_request_clamp() {
        let (request, adjusted) = PlaybackRequest::new(1.0, "kick", 3.0).clamp(2.0);
        assert_eq!(request, PlaybackRequest::new(2.0, "kick", 1.0));
        assert!(adjusted);

        let (request, adjusted) = PlaybackRequest::new(2.0, "kick", 0.4).clamp(2.0);
        assert_eq!(request.time, 2.0);
        assert_eq!(request.velocity, 0.4);
        assert!(!adjusted);

        let (request, adjusted) = PlaybackRequest::new(f64::INFINITY, "kick", 0.4).clamp(2.0);
        assert_eq!(request.time, 2.0);
        assert!(adjusted);
    }
}
