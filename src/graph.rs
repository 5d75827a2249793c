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
//! The audio output graph that voices are built against.
//!
//! The scheduler never renders audio itself. It creates nodes, wires them together and
//! schedules them at absolute timestamps on the graph clock; everything else is up to the
//! graph implementation. Two implementations live here:
//! - [`mock::MockGraph`] records every operation and only moves its clock when told to.
//! - [`offline::OfflineGraph`] renders the graph into a mono buffer.

use std::fmt;
use std::sync::Arc;

use crate::samples::AudioAsset;

pub mod mock;
pub mod offline;

/// Identifies a node within one graph.
pub type NodeId = u64;

/// A callback invoked by the graph, either when a node finishes or when a deadline passes.
/// Graphs must invoke callbacks without holding their own internal locks.
pub type GraphCallback = Box<dyn FnOnce() + Send + 'static>;

/// Errors reported by a graph when it rejects a node operation.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Node {0} has already been started")]
    AlreadyStarted(NodeId),

    #[error("Graph rejected operation: {0}")]
    Rejected(String),
}

/// Oscillator waveforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl Waveform {
    /// Evaluates the waveform at the given phase, where one cycle spans 0.0..1.0.
    pub fn sample(&self, phase: f64) -> f32 {
        let phase = phase.rem_euclid(1.0);
        match self {
            Waveform::Sine => (phase * std::f64::consts::TAU).sin() as f32,
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => (2.0 * phase - 1.0) as f32,
            Waveform::Triangle => (1.0 - 4.0 * (phase - 0.5).abs()) as f32,
        }
    }
}

/// A scheduled change to a gain parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainRamp {
    /// Jump to `value` at time `at`.
    SetValue { value: f32, at: f64 },
    /// Ramp linearly from the previous event to `target`, arriving at `end`.
    Linear { target: f32, end: f64 },
    /// Ramp exponentially from the previous event to `target`, arriving at `end`.
    /// Falls back to a linear ramp when either endpoint is not strictly positive.
    Exponential { target: f32, end: f64 },
}

impl GainRamp {
    fn time(&self) -> f64 {
        match *self {
            GainRamp::SetValue { at, .. } => at,
            GainRamp::Linear { end, .. } | GainRamp::Exponential { end, .. } => end,
        }
    }
}

/// The automation timeline of a single gain parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct GainAutomation {
    initial: f32,
    events: Vec<GainRamp>,
}

impl GainAutomation {
    pub fn new(initial: f32) -> Self {
        Self {
            initial,
            events: Vec::new(),
        }
    }

    /// Adds an event, keeping the timeline ordered by event time.
    pub fn push(&mut self, ramp: GainRamp) {
        let index = self
            .events
            .iter()
            .position(|event| event.time() > ramp.time())
            .unwrap_or(self.events.len());
        self.events.insert(index, ramp);
    }

    /// The value before any event applies.
    pub fn initial(&self) -> f32 {
        self.initial
    }

    pub fn events(&self) -> &[GainRamp] {
        &self.events
    }

    /// Evaluates the parameter at time `t`.
    pub fn value_at(&self, t: f64) -> f32 {
        let mut prev_time = f64::NEG_INFINITY;
        let mut prev_value = self.initial;

        for event in &self.events {
            match *event {
                GainRamp::SetValue { value, at } => {
                    if t < at {
                        return prev_value;
                    }
                    prev_time = at;
                    prev_value = value;
                }
                GainRamp::Linear { target, end } => {
                    if t < end {
                        let frac = ramp_fraction(prev_time, end, t);
                        return prev_value + (target - prev_value) * frac;
                    }
                    prev_time = end;
                    prev_value = target;
                }
                GainRamp::Exponential { target, end } => {
                    if t < end {
                        let frac = ramp_fraction(prev_time, end, t);
                        if prev_value <= 0.0 || target <= 0.0 {
                            return prev_value + (target - prev_value) * frac;
                        }
                        return prev_value * (target / prev_value).powf(frac);
                    }
                    prev_time = end;
                    prev_value = target;
                }
            }
        }

        prev_value
    }

    /// Returns the largest value reached by the timeline.
    pub fn peak(&self) -> f32 {
        self.events
            .iter()
            .map(|event| match *event {
                GainRamp::SetValue { value, .. } => value,
                GainRamp::Linear { target, .. } | GainRamp::Exponential { target, .. } => target,
            })
            .fold(self.initial, f32::max)
    }
}

fn ramp_fraction(start: f64, end: f64, t: f64) -> f32 {
    if !start.is_finite() || end <= start {
        return 1.0;
    }
    ((t - start) / (end - start)).clamp(0.0, 1.0) as f32
}

/// Settings for a dynamics compressor node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorSettings {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    /// Attack time in seconds.
    pub attack: f32,
    /// Release time in seconds.
    pub release: f32,
}

impl Default for CompressorSettings {
    /// The master bus limiter.
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            knee_db: 30.0,
            ratio: 12.0,
            attack: 0.003,
            release: 0.25,
        }
    }
}

impl CompressorSettings {
    /// Returns the static gain change in dB for a signal at `level_db`.
    /// The result is zero below the knee and negative above it.
    pub fn gain_change_db(&self, level_db: f32) -> f32 {
        let over = level_db - self.threshold_db;
        let slope = 1.0 / self.ratio.max(1.0) - 1.0;
        if 2.0 * over < -self.knee_db {
            0.0
        } else if self.knee_db > 0.0 && 2.0 * over.abs() <= self.knee_db {
            let x = over + self.knee_db / 2.0;
            slope * x * x / (2.0 * self.knee_db)
        } else {
            slope * over
        }
    }
}

/// The node-level operations a graph must provide.
pub trait OutputGraph: fmt::Display + Send + Sync {
    /// The graph clock in seconds. Monotonically increasing.
    fn current_time(&self) -> f64;

    /// The terminal node. Shared by every voice and never released.
    fn destination(&self) -> NodeId;

    fn create_oscillator(&self, waveform: Waveform, frequency: f32) -> Result<NodeId, GraphError>;

    fn create_gain(&self, gain: f32) -> Result<NodeId, GraphError>;

    /// Creates a one-shot playback node bound to the given asset.
    fn create_buffer_source(&self, asset: Arc<AudioAsset>) -> Result<NodeId, GraphError>;

    fn create_compressor(&self, settings: CompressorSettings) -> Result<NodeId, GraphError>;

    /// Schedules a change on a gain node.
    fn schedule_gain(&self, node: NodeId, ramp: GainRamp) -> Result<(), GraphError>;

    fn connect(&self, from: NodeId, to: NodeId) -> Result<(), GraphError>;

    /// Disconnects the node from everything and frees it.
    fn release(&self, node: NodeId) -> Result<(), GraphError>;

    fn start(&self, node: NodeId, at: f64) -> Result<(), GraphError>;

    fn stop(&self, node: NodeId, at: f64) -> Result<(), GraphError>;

    /// Registers a callback for when a source node finishes playing.
    fn on_ended(&self, node: NodeId, callback: GraphCallback) -> Result<(), GraphError>;

    /// Invokes the callback once the graph clock passes `at`.
    fn schedule_callback(&self, at: f64, callback: GraphCallback);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waveforms() {
        assert!(Waveform::Sine.sample(0.0).abs() < 1e-6);
        assert!((Waveform::Sine.sample(0.25) - 1.0).abs() < 1e-6);
        assert_eq!(Waveform::Square.sample(0.1), 1.0);
        assert_eq!(Waveform::Square.sample(0.6), -1.0);
        assert_eq!(Waveform::Sawtooth.sample(0.0), -1.0);
        assert_eq!(Waveform::Triangle.sample(0.5), 1.0);
        assert_eq!(Waveform::Triangle.sample(0.0), -1.0);
        // Phase wraps.
        assert_eq!(Waveform::Square.sample(1.1), Waveform::Square.sample(0.1));
    }

    #[test]
    fn test_click_envelope_automation() {
        let mut automation = GainAutomation::new(1.0);
        automation.push(GainRamp::SetValue { value: 0.0, at: 1.0 });
        automation.push(GainRamp::Linear {
            target: 0.5,
            end: 1.001,
        });
        automation.push(GainRamp::Exponential {
            target: 0.001,
            end: 1.05,
        });

        // Before the first event the initial value applies.
        assert_eq!(automation.value_at(0.5), 1.0);
        assert_eq!(automation.value_at(1.0), 0.0);
        assert!((automation.value_at(1.0005) - 0.25).abs() < 1e-3);
        assert!((automation.value_at(1.001) - 0.5).abs() < 1e-6);

        // Exponential decay is monotonic and lands on the target.
        let mid = automation.value_at(1.02);
        assert!(mid < 0.5 && mid > 0.001);
        assert!((automation.value_at(1.05) - 0.001).abs() < 1e-6);
        assert!((automation.value_at(2.0) - 0.001).abs() < 1e-6);
        assert_eq!(automation.peak(), 1.0);
    }

    #[test]
    fn test_exponential_ramp_from_zero_is_linear() {
        let mut automation = GainAutomation::new(0.0);
        automation.push(GainRamp::SetValue { value: 0.0, at: 0.0 });
        automation.push(GainRamp::Exponential {
            target: 1.0,
            end: 1.0,
        });
        assert!((automation.value_at(0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_events_are_kept_in_time_order() {
        let mut automation = GainAutomation::new(0.0);
        automation.push(GainRamp::SetValue { value: 2.0, at: 2.0 });
        automation.push(GainRamp::SetValue { value: 1.0, at: 1.0 });
        assert_eq!(automation.value_at(1.5), 1.0);
        assert_eq!(automation.value_at(2.5), 2.0);
    }

    #[test]
    fn test_compressor_curve() {
        let settings = CompressorSettings::default();
        // Well below threshold and knee: untouched.
        assert_eq!(settings.gain_change_db(-60.0), 0.0);
        // Well above: slope of 1/ratio.
        let change = settings.gain_change_db(12.0);
        assert!((change - (1.0 / 12.0 - 1.0) * 36.0).abs() < 1e-4);
        // Inside the knee the reduction is partial.
        let knee = settings.gain_change_db(-24.0);
        assert!(knee < 0.0 && knee > (1.0 / 12.0 - 1.0) * 15.0);
    }
}
