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
//! Voices: the transient subgraphs that realize one scheduled event.
//!
//! A voice owns its nodes until it is released. Release is triggered twice, once by the
//! source's end-of-playback signal and once by a deadline timer, and only the first call
//! does anything.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::asset::AudioAsset;
use crate::config::EngineConfig;
use crate::graph::{GainRamp, GraphError, NodeId, OutputGraph};

/// Time after a voice's nominal end at which it is released even without an end signal.
pub const DEFAULT_RELEASE_GRACE: f64 = 0.1;

/// Global voice ID counter.
static NEXT_VOICE_ID: AtomicU64 = AtomicU64::new(1);

/// The gain applied to a voice: `velocity² × volume`.
///
/// Squaring the velocity gives a perceptually linear loudness curve. Samples and clicks both
/// use this curve, so switching modes does not change the dynamics of a pattern.
pub fn voice_level(velocity: f32, volume: f32) -> f32 {
    let velocity = velocity.clamp(0.0, 1.0);
    velocity * velocity * volume.clamp(0.0, 1.0)
}

/// Everything a backend needs to build a voice.
pub struct VoiceContext<'a> {
    pub graph: &'a Arc<dyn OutputGraph>,
    /// The node voices connect to: the master bus input or the destination.
    pub output: NodeId,
    pub release_grace: f64,
    /// Count of voices built and not yet released.
    pub active: &'a Arc<AtomicUsize>,
}

struct VoiceInner {
    id: u64,
    label: String,
    graph: Weak<dyn OutputGraph>,
    nodes: Vec<NodeId>,
    released: AtomicBool,
    active: Arc<AtomicUsize>,
}

/// A handle to one constructed voice. Clones share the same release state.
#[derive(Clone)]
pub struct Voice {
    inner: Arc<VoiceInner>,
}

impl Voice {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The graph nodes owned by this voice.
    pub fn nodes(&self) -> &[NodeId] {
        &self.inner.nodes
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Releases every node of this voice. Returns false if the voice was already released.
    pub fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(graph) = self.inner.graph.upgrade() {
            for node in &self.inner.nodes {
                if let Err(e) = graph.release(*node) {
                    warn!(voice = self.inner.id, node, err = %e, "Failed to release node");
                }
            }
        }
        debug!(voice = self.inner.id, label = %self.inner.label, "Voice released");
        true
    }

    /// Arms both release triggers: the end signal of `ended` and a timer at `deadline`.
    fn arm_release(
        &self,
        graph: &Arc<dyn OutputGraph>,
        ended: NodeId,
        deadline: f64,
    ) -> Result<(), GraphError> {
        let voice = self.clone();
        graph.on_ended(
            ended,
            Box::new(move || {
                voice.release();
            }),
        )?;
        let voice = self.clone();
        graph.schedule_callback(
            deadline,
            Box::new(move || {
                voice.release();
            }),
        );
        Ok(())
    }
}

impl std::fmt::Debug for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Voice")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("nodes", &self.inner.nodes)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Tracks nodes while a voice is being built. If construction bails out early, the nodes
/// created so far are released on drop.
pub(super) struct VoiceBuilder<'a> {
    ctx: &'a VoiceContext<'a>,
    nodes: Vec<NodeId>,
}

impl<'a> VoiceBuilder<'a> {
    pub(super) fn new(ctx: &'a VoiceContext<'a>) -> Self {
        VoiceBuilder {
            ctx,
            nodes: Vec::new(),
        }
    }

    /// Records a freshly created node.
    pub(super) fn track(&mut self, node: Result<NodeId, GraphError>) -> Result<NodeId, GraphError> {
        let node = node?;
        self.nodes.push(node);
        Ok(node)
    }

    /// Hands the nodes to a voice and arms its release triggers.
    pub(super) fn finish(
        mut self,
        label: String,
        ended: NodeId,
        deadline: f64,
    ) -> Result<Voice, GraphError> {
        let voice = Voice {
            inner: Arc::new(VoiceInner {
                id: NEXT_VOICE_ID.fetch_add(1, Ordering::SeqCst),
                label,
                graph: Arc::downgrade(self.ctx.graph),
                nodes: std::mem::take(&mut self.nodes),
                released: AtomicBool::new(false),
                active: self.ctx.active.clone(),
            }),
        };
        self.ctx.active.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = voice.arm_release(self.ctx.graph, ended, deadline) {
            voice.release();
            return Err(e);
        }
        Ok(voice)
    }
}

impl Drop for VoiceBuilder<'_> {
    fn drop(&mut self) {
        for node in self.nodes.drain(..) {
            if let Err(e) = self.ctx.graph.release(node) {
                warn!(node, err = %e, "Failed to release node of abandoned voice");
            }
        }
    }
}

/// Plays a decoded asset once.
pub struct SampleVoice;

impl SampleVoice {
    /// Builds `buffer source -> gain -> output`, starts it at `time` and arms its release.
    pub fn play(
        ctx: &VoiceContext<'_>,
        time: f64,
        asset: Arc<AudioAsset>,
        velocity: f32,
        config: &EngineConfig,
        label: &str,
    ) -> Result<Voice, GraphError> {
        let graph = ctx.graph;
        let duration = asset.duration().as_secs_f64();
        let level = voice_level(velocity, config.volume());

        let mut builder = VoiceBuilder::new(ctx);
        let source = builder.track(graph.create_buffer_source(asset))?;
        let gain = builder.track(graph.create_gain(level))?;
        graph.schedule_gain(gain, GainRamp::SetValue { value: level, at: time })?;
        graph.connect(source, gain)?;
        graph.connect(gain, ctx.output)?;
        graph.start(source, time)?;

        let voice = builder.finish(
            label.to_string(),
            source,
            time + duration + ctx.release_grace,
        )?;
        debug!(
            voice = voice.id(),
            label,
            time,
            level,
            duration_ms = (duration * 1000.0).round() as u64,
            "Sample voice scheduled"
        );
        Ok(voice)
    }
}
