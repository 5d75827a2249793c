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
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    CompressorSettings, GainAutomation, GainRamp, GraphCallback, GraphError, NodeId, OutputGraph,
    Waveform,
};
use crate::samples::AudioAsset;

/// Number of frames rendered between callback checks.
const RENDER_QUANTUM: usize = 128;

/// Floor used when converting silence to decibels.
const MIN_LEVEL: f32 = 1e-6;

const DESTINATION: NodeId = 0;

/// Highest oscillator frequency as a fraction of the sample rate, just under Nyquist.
const MAX_FREQUENCY_RATIO: f32 = 0.49;

enum Processor {
    Destination,
    Oscillator {
        waveform: Waveform,
        frequency: f32,
        phase: f64,
    },
    Gain(GainAutomation),
    BufferSource {
        asset: Arc<AudioAsset>,
        finished: bool,
    },
    Compressor {
        settings: CompressorSettings,
        envelope_db: f32,
    },
}

struct OfflineNode {
    processor: Processor,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    started_at: Option<f64>,
    stopped_at: Option<f64>,
}

impl OfflineNode {
    fn new(processor: Processor) -> Self {
        Self {
            processor,
            inputs: Vec::new(),
            outputs: Vec::new(),
            started_at: None,
            stopped_at: None,
        }
    }

    fn is_playing(&self, t: f64) -> bool {
        self.started_at.is_some_and(|start| t >= start)
            && self.stopped_at.map_or(true, |stop| t < stop)
    }

    fn has_ended(&self, t: f64) -> bool {
        if self.started_at.is_none() {
            return false;
        }
        let stopped = self.stopped_at.is_some_and(|stop| t >= stop);
        match self.processor {
            Processor::Oscillator { .. } => stopped,
            Processor::BufferSource { finished, .. } => finished || stopped,
            _ => false,
        }
    }

    fn process(&mut self, input: f32, t: f64, sample_rate: u32) -> f32 {
        let playing = self.is_playing(t);
        let started_at = self.started_at.unwrap_or(0.0);
        match &mut self.processor {
            Processor::Destination => input,
            Processor::Gain(automation) => input * automation.value_at(t),
            Processor::Oscillator {
                waveform,
                frequency,
                phase,
            } => {
                if !playing {
                    return 0.0;
                }
                let value = waveform.sample(*phase);
                *phase = (*phase + *frequency as f64 / sample_rate as f64).fract();
                value
            }
            Processor::BufferSource { asset, finished } => {
                if !playing || *finished {
                    return 0.0;
                }
                // Linear interpolation covers assets decoded at another sample rate.
                let position = (t - started_at) * asset.sample_rate() as f64;
                let frame = position.floor() as usize;
                if frame >= asset.frames() {
                    *finished = true;
                    return 0.0;
                }
                let frac = position.fract() as f32;
                let current = asset.frame_mono(frame);
                let next = if frame + 1 < asset.frames() {
                    asset.frame_mono(frame + 1)
                } else {
                    current
                };
                current + (next - current) * frac
            }
            Processor::Compressor {
                settings,
                envelope_db,
            } => {
                let level_db = 20.0 * input.abs().max(MIN_LEVEL).log10();
                let target = settings.gain_change_db(level_db);
                let time = if target < *envelope_db {
                    settings.attack
                } else {
                    settings.release
                };
                let coeff = if time > 0.0 {
                    (-1.0 / (time * sample_rate as f32)).exp()
                } else {
                    0.0
                };
                *envelope_db = target + coeff * (*envelope_db - target);
                input * 10f32.powf(*envelope_db / 20.0)
            }
        }
    }
}

struct OfflineState {
    frame: u64,
    next_id: NodeId,
    nodes: HashMap<NodeId, OfflineNode>,
    ended: HashMap<NodeId, Vec<GraphCallback>>,
    timers: Vec<(f64, GraphCallback)>,
}

impl OfflineState {
    /// Orders the nodes feeding the destination so that every node comes after its inputs.
    fn processing_order(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // Iterative post-order walk from the destination back through the inputs.
        let mut stack = vec![(DESTINATION, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            if let Some(node) = self.nodes.get(&id) {
                for input in &node.inputs {
                    if !visited.contains(input) {
                        stack.push((*input, false));
                    }
                }
            }
        }
        order
    }

    fn render_quantum(&mut self, sample_rate: u32, frames: usize, output: &mut Vec<f32>) {
        let order = self.processing_order();
        let slots: HashMap<NodeId, usize> = order
            .iter()
            .enumerate()
            .map(|(slot, id)| (*id, slot))
            .collect();
        let inputs: Vec<Vec<usize>> = order
            .iter()
            .map(|id| {
                self.nodes
                    .get(id)
                    .map(|node| {
                        node.inputs
                            .iter()
                            .filter_map(|input| slots.get(input).copied())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        let mut values = vec![0.0f32; order.len()];
        for _ in 0..frames {
            let t = self.frame as f64 / sample_rate as f64;
            for (slot, id) in order.iter().enumerate() {
                let input: f32 = inputs[slot].iter().map(|&i| values[i]).sum();
                values[slot] = match self.nodes.get_mut(id) {
                    Some(node) => node.process(input, t, sample_rate),
                    None => 0.0,
                };
            }
            output.push(values.last().copied().unwrap_or(0.0));
            self.frame += 1;
        }
    }

    fn take_due(&mut self, now: f64) -> Vec<GraphCallback> {
        let finished: Vec<NodeId> = self
            .ended
            .keys()
            .copied()
            .filter(|id| self.nodes.get(id).is_some_and(|node| node.has_ended(now)))
            .collect();
        let mut due: Vec<GraphCallback> = Vec::new();
        for id in finished {
            if let Some(callbacks) = self.ended.remove(&id) {
                due.extend(callbacks);
            }
        }

        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.timers)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.timers = pending;
        due.extend(ready.into_iter().map(|(_, callback)| callback));
        due
    }
}

/// A graph that renders into memory instead of a sound card.
pub struct OfflineGraph {
    sample_rate: u32,
    state: Mutex<OfflineState>,
}

impl OfflineGraph {
    pub fn new(sample_rate: u32) -> OfflineGraph {
        let mut nodes = HashMap::new();
        nodes.insert(DESTINATION, OfflineNode::new(Processor::Destination));
        OfflineGraph {
            sample_rate,
            state: Mutex::new(OfflineState {
                frame: 0,
                next_id: DESTINATION + 1,
                nodes,
                ended: HashMap::new(),
                timers: Vec::new(),
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of nodes still allocated, excluding the destination.
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len() - 1
    }

    /// Renders `duration` seconds starting at the current clock position and returns mono samples.
    /// End-of-playback signals and deadlines fire between render quanta.
    pub fn render(&self, duration: f64) -> Vec<f32> {
        let total = (duration.max(0.0) * self.sample_rate as f64).round() as usize;
        let mut output = Vec::with_capacity(total);

        while output.len() < total {
            let frames = RENDER_QUANTUM.min(total - output.len());
            let due = {
                let mut state = self.state.lock();
                state.render_quantum(self.sample_rate, frames, &mut output);
                let now = state.frame as f64 / self.sample_rate as f64;
                state.take_due(now)
            };
            for callback in due {
                callback();
            }
        }

        debug!(
            frames = output.len(),
            sample_rate = self.sample_rate,
            "Rendered offline graph"
        );
        output
    }

    fn create(&self, processor: Processor) -> NodeId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.nodes.insert(id, OfflineNode::new(processor));
        id
    }

    fn with_node<T>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut OfflineNode) -> Result<T, GraphError>,
    ) -> Result<T, GraphError> {
        let mut state = self.state.lock();
        let node = state.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        f(node)
    }
}

impl OutputGraph for OfflineGraph {
    fn current_time(&self) -> f64 {
        self.state.lock().frame as f64 / self.sample_rate as f64
    }

    fn destination(&self) -> NodeId {
        DESTINATION
    }

    fn create_oscillator(&self, waveform: Waveform, frequency: f32) -> Result<NodeId, GraphError> {
        if frequency.is_nan() || frequency <= 0.0 {
            return Err(GraphError::InvalidParameter(format!(
                "oscillator frequency {}",
                frequency
            )));
        }
        // Tones above the render rate's Nyquist limit are clamped rather than rejected.
        let max_frequency = self.sample_rate as f32 * MAX_FREQUENCY_RATIO;
        if frequency > max_frequency {
            debug!(frequency, max_frequency, "Clamping oscillator frequency");
        }
        Ok(self.create(Processor::Oscillator {
            waveform,
            frequency: frequency.min(max_frequency),
            phase: 0.0,
        }))
    }

    fn create_gain(&self, gain: f32) -> Result<NodeId, GraphError> {
        Ok(self.create(Processor::Gain(GainAutomation::new(gain))))
    }

    fn create_buffer_source(&self, asset: Arc<AudioAsset>) -> Result<NodeId, GraphError> {
        if asset.frames() == 0 {
            return Err(GraphError::InvalidParameter("empty audio asset".into()));
        }
        Ok(self.create(Processor::BufferSource {
            asset,
            finished: false,
        }))
    }

    fn create_compressor(&self, settings: CompressorSettings) -> Result<NodeId, GraphError> {
        Ok(self.create(Processor::Compressor {
            settings,
            envelope_db: 0.0,
        }))
    }

    fn schedule_gain(&self, node: NodeId, ramp: GainRamp) -> Result<(), GraphError> {
        self.with_node(node, |node| match &mut node.processor {
            Processor::Gain(automation) => {
                automation.push(ramp);
                Ok(())
            }
            _ => Err(GraphError::InvalidParameter(
                "node has no gain parameter".into(),
            )),
        })
    }

    fn connect(&self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&to) {
            return Err(GraphError::UnknownNode(to));
        }
        let source = state.nodes.get_mut(&from).ok_or(GraphError::UnknownNode(from))?;
        source.outputs.push(to);
        if let Some(target) = state.nodes.get_mut(&to) {
            target.inputs.push(from);
        }
        Ok(())
    }

    fn release(&self, node: NodeId) -> Result<(), GraphError> {
        if node == DESTINATION {
            return Err(GraphError::Rejected(
                "the destination cannot be released".into(),
            ));
        }
        let mut state = self.state.lock();
        let removed = state.nodes.remove(&node).ok_or(GraphError::UnknownNode(node))?;
        for output in removed.outputs {
            if let Some(target) = state.nodes.get_mut(&output) {
                target.inputs.retain(|input| *input != node);
            }
        }
        for input in removed.inputs {
            if let Some(source) = state.nodes.get_mut(&input) {
                source.outputs.retain(|output| *output != node);
            }
        }
        state.ended.remove(&node);
        Ok(())
    }

    fn start(&self, node: NodeId, at: f64) -> Result<(), GraphError> {
        self.with_node(node, |entry| {
            if entry.started_at.is_some() {
                return Err(GraphError::AlreadyStarted(node));
            }
            entry.started_at = Some(at);
            Ok(())
        })
    }

    fn stop(&self, node: NodeId, at: f64) -> Result<(), GraphError> {
        self.with_node(node, |entry| {
            entry.stopped_at = Some(at);
            Ok(())
        })
    }

    fn on_ended(&self, node: NodeId, callback: GraphCallback) -> Result<(), GraphError> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&node) {
            return Err(GraphError::UnknownNode(node));
        }
        state.ended.entry(node).or_default().push(callback);
        Ok(())
    }

    fn schedule_callback(&self, at: f64, callback: GraphCallback) {
        self.state.lock().timers.push((at, callback));
    }
}

impl fmt::Display for OfflineGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offline ({} Hz)", self.sample_rate)
    }
}
