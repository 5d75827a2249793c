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
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{crate_version, Parser, Subcommand};
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use soundonika::config::{EngineSettings, SampleManifest};
use soundonika::graph::mock::MockGraph;
use soundonika::graph::offline::OfflineGraph;
use soundonika::graph::OutputGraph;
use soundonika::samples::{
    default_mapping, AssetFetcher, AssetSource, Backend, FileFetcher, ScheduleOutcome,
    SoundScheduler, MANIFEST_INDEX_FILE,
};

/// Rendered audio past the last event, so its tail is not cut off.
const RENDER_TAIL: f64 = 1.0;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A percussive sound scheduler."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Loads and verifies a sample manifest and prints the default sound type mapping.
    Manifest {
        /// The sample base path containing sample-index.json.
        base_path: String,
        /// Read this manifest file instead of the index in the base path.
        #[arg[short, long]]
        file: Option<PathBuf>,
    },
    /// Renders a list of events to a mono WAV file.
    Render {
        /// The path to the engine settings.
        settings: PathBuf,
        /// The WAV file to write.
        output: PathBuf,
        /// The events to render. Should be in the form <TIME>:<SOUND TYPE>[:<VELOCITY>],...
        /// For example, 0:kick,0.5:snare:0.8,1:hihat_closed.
        #[arg[short, long]]
        events: String,
        /// Seconds to render. Defaults to one second past the last event.
        #[arg[short, long]]
        duration: Option<f64>,
        /// The output sample rate.
        #[arg[short = 'r', long, default_value_t = 44100]]
        sample_rate: u32,
    },
    /// Schedules a list of events against a recording graph and prints how each was realized.
    DryRun {
        /// The path to the engine settings.
        settings: PathBuf,
        /// The events to schedule, in the same form as for render.
        #[arg[short, long]]
        events: String,
    },
}

/// One event given on the command line.
#[derive(Debug, PartialEq)]
struct Event {
    time: f64,
    sound_type: String,
    velocity: f32,
}

fn parse_events(events: &str) -> Result<Vec<Event>, Box<dyn Error>> {
    events
        .split(',')
        .map(str::trim)
        .filter(|event| !event.is_empty())
        .map(|event| {
            let parts: Vec<&str> = event.split(':').collect();
            if parts.len() < 2 || parts.len() > 3 {
                return Err(format!("malformed event {}", event).into());
            }
            let time = parts[0]
                .parse::<f64>()
                .map_err(|e| format!("malformed time in event {}: {}", event, e))?;
            let velocity = match parts.get(2) {
                Some(velocity) => velocity
                    .parse::<f32>()
                    .map_err(|e| format!("malformed velocity in event {}: {}", event, e))?,
                None => 1.0,
            };
            Ok(Event {
                time,
                sound_type: parts[1].to_string(),
                velocity,
            })
        })
        .collect()
}

/// Picks the fetcher for a sample base path.
fn fetcher_for(base_path: &str) -> Result<Arc<dyn AssetFetcher>, Box<dyn Error>> {
    if base_path.starts_with("http://") || base_path.starts_with("https://") {
        remote_fetcher(base_path)
    } else {
        Ok(Arc::new(FileFetcher))
    }
}

#[cfg(feature = "http")]
fn remote_fetcher(_base_path: &str) -> Result<Arc<dyn AssetFetcher>, Box<dyn Error>> {
    Ok(Arc::new(soundonika::samples::HttpFetcher::default()))
}

#[cfg(not(feature = "http"))]
fn remote_fetcher(base_path: &str) -> Result<Arc<dyn AssetFetcher>, Box<dyn Error>> {
    Err(format!("{} is remote, rebuild with the http feature", base_path).into())
}

/// Builds and initializes a scheduler. A failed initialization leaves a click-only engine.
async fn start_scheduler(
    settings_path: &Path,
    graph: Arc<dyn OutputGraph>,
) -> Result<SoundScheduler, Box<dyn Error>> {
    let settings = EngineSettings::deserialize(settings_path)?;
    let fetcher = fetcher_for(settings.sample_base_path())?;
    let scheduler = SoundScheduler::from_settings(&settings, graph, fetcher)?;
    match scheduler.initialize().await {
        Ok(summary) => info!(
            loaded = summary.loaded,
            failed = summary.failed,
            "Samples loaded"
        ),
        Err(e) => warn!(err = %e, "Initialization failed, only clicks are available"),
    }
    Ok(scheduler)
}

fn describe(outcome: &ScheduleOutcome) -> String {
    let backend = match outcome.backend {
        Backend::Sample => "sample",
        Backend::Click => "click",
        Backend::Dropped => "dropped",
    };
    let mut description = format!(
        "{} at {:.3}s, velocity {:.2}",
        backend, outcome.time, outcome.velocity
    );
    if outcome.time_adjusted {
        description.push_str(", moved to now");
    }
    if let Some(reason) = outcome.fallback {
        description.push_str(&format!(", fallback: {:?}", reason));
    }
    description
}

fn end_of(events: &[Event]) -> f64 {
    events
        .iter()
        .map(|event| event.time)
        .fold(0.0, f64::max)
        + RENDER_TAIL
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Manifest { base_path, file } => {
            let manifest = match file {
                Some(file) => SampleManifest::from_file(&file)?,
                None => {
                    let source = AssetSource::new(base_path.as_str(), fetcher_for(&base_path)?);
                    let manifest = source.fetch_manifest(MANIFEST_INDEX_FILE).await?;
                    manifest.validate()?;
                    manifest
                }
            };

            if manifest.is_empty() {
                println!("No samples found in {}.", base_path);
            } else {
                println!("Samples (count: {}):", manifest.len());
                for (category, pack, files) in manifest.packs() {
                    println!("- {}/{} ({} files)", category, pack, files.len());
                    for file in files {
                        println!("  - {}", file);
                    }
                }
            }

            let mut mapping: Vec<_> = default_mapping(&manifest).into_iter().collect();
            mapping.sort();
            println!("\nSound types (count: {}):", mapping.len());
            for (sound_type, key) in mapping {
                println!("- {} -> {}", sound_type, key);
            }
        }
        Commands::Render {
            settings,
            output,
            events,
            duration,
            sample_rate,
        } => {
            let events = parse_events(&events)?;
            let graph = Arc::new(OfflineGraph::new(sample_rate));
            let scheduler = start_scheduler(&settings, graph.clone()).await?;
            for event in &events {
                let outcome = scheduler.schedule_sound(event.time, &event.sound_type, event.velocity);
                info!(
                    sound_type = %event.sound_type,
                    outcome = %describe(&outcome),
                    "Scheduled"
                );
            }

            let duration = duration.unwrap_or_else(|| end_of(&events));
            let rendered = graph.render(duration);
            let mut writer = WavWriter::create(
                &output,
                WavSpec {
                    channels: 1,
                    sample_rate,
                    bits_per_sample: 32,
                    sample_format: SampleFormat::Float,
                },
            )?;
            for sample in &rendered {
                writer.write_sample(*sample)?;
            }
            writer.finalize()?;
            println!(
                "Rendered {} events ({:.2}s) to {}.",
                events.len(),
                duration,
                output.display()
            );
        }
        Commands::DryRun { settings, events } => {
            let events = parse_events(&events)?;
            let graph = Arc::new(MockGraph::new("dry-run"));
            let scheduler = start_scheduler(&settings, graph.clone()).await?;
            println!(
                "Engine: {} samples loaded, mode {}, ready: {}",
                scheduler.loaded_sample_count(),
                scheduler.mode(),
                scheduler.is_ready()
            );
            for event in &events {
                let outcome = scheduler.schedule_sound(event.time, &event.sound_type, event.velocity);
                println!("- {} -> {}", event.sound_type, describe(&outcome));
            }

            let scheduled = scheduler.active_voice_count();
            graph.advance_to(end_of(&events));
            println!(
                "Voices: {} scheduled, {} still active after {:.2}s.",
                scheduled,
                scheduler.active_voice_count(),
                graph.current_time()
            );
        }
    }

    Ok(())
}
