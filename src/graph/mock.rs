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
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    CompressorSettings, GainAutomation, GainRamp, GraphCallback, GraphError, NodeId, OutputGraph,
    Waveform,
};
use crate::samples::AudioAsset;

/// The kinds of node a graph can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Destination,
    Oscillator,
    Gain,
    BufferSource,
    Compressor,
}

/// A snapshot of one node in a mock graph.
#[derive(Debug, Clone)]
pub struct MockNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub waveform: Option<Waveform>,
    pub frequency: Option<f32>,
    pub asset: Option<Arc<AudioAsset>>,
    pub compressor: Option<CompressorSettings>,
    pub gain: GainAutomation,
    pub connections: Vec<NodeId>,
    pub started_at: Option<f64>,
    pub stopped_at: Option<f64>,
    pub released: bool,
}

impl MockNode {
    fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            waveform: None,
            frequency: None,
            asset: None,
            compressor: None,
            gain: GainAutomation::new(1.0),
            connections: Vec::new(),
            started_at: None,
            stopped_at: None,
            released: false,
        }
    }

    /// The time at which this node stops producing sound, if it is a started source.
    fn end_time(&self) -> Option<f64> {
        let started = self.started_at?;
        match self.kind {
            NodeKind::Oscillator => self.stopped_at,
            NodeKind::BufferSource => {
                let natural_end = started + self.asset.as_ref()?.duration().as_secs_f64();
                Some(self.stopped_at.map_or(natural_end, |stop| stop.min(natural_end)))
            }
            _ => None,
        }
    }
}

struct MockState {
    time: f64,
    next_id: NodeId,
    nodes: HashMap<NodeId, MockNode>,
    ended: HashMap<NodeId, Vec<GraphCallback>>,
    timers: Vec<(f64, GraphCallback)>,
    failing: Option<NodeKind>,
    ended_signals: bool,
}

/// A graph that records operations instead of producing sound. Its clock only moves
/// through [`MockGraph::set_time`] and [`MockGraph::advance_to`].
pub struct MockGraph {
    name: String,
    state: Mutex<MockState>,
}

const DESTINATION: NodeId = 0;

impl MockGraph {
    pub fn new(name: &str) -> MockGraph {
        let mut nodes = HashMap::new();
        nodes.insert(DESTINATION, MockNode::new(DESTINATION, NodeKind::Destination));
        MockGraph {
            name: name.to_string(),
            state: Mutex::new(MockState {
                time: 0.0,
                next_id: DESTINATION + 1,
                nodes,
                ended: HashMap::new(),
                timers: Vec::new(),
                failing: None,
                ended_signals: true,
            }),
        }
    }

    /// Moves the clock without firing any callbacks.
    pub fn set_time(&self, time: f64) {
        self.state.lock().time = time;
    }

    /// Moves the clock and fires every end-of-playback signal and deadline that is due.
    /// Returns the number of callbacks fired.
    pub fn advance_to(&self, time: f64) -> usize {
        let due = {
            let mut state = self.state.lock();
            state.time = state.time.max(time);
            let now = state.time;

            let mut due: Vec<GraphCallback> = Vec::new();
            if state.ended_signals {
                let finished: Vec<NodeId> = state
                    .ended
                    .keys()
                    .copied()
                    .filter(|id| {
                        state
                            .nodes
                            .get(id)
                            .and_then(MockNode::end_time)
                            .is_some_and(|end| end <= now)
                    })
                    .collect();
                for id in finished {
                    if let Some(callbacks) = state.ended.remove(&id) {
                        due.extend(callbacks);
                    }
                }
            }

            let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.timers)
                .into_iter()
                .partition(|(at, _)| *at <= now);
            state.timers = pending;
            due.extend(ready.into_iter().map(|(_, callback)| callback));
            due
        };

        let fired = due.len();
        for callback in due {
            callback();
        }
        fired
    }

    /// Makes every subsequent creation of `kind` fail until cleared.
    pub fn fail_creating(&self, kind: NodeKind) {
        self.state.lock().failing = Some(kind);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing = None;
    }

    /// Controls whether sources report that they have ended. Some environments never do.
    pub fn set_ended_signals(&self, enabled: bool) {
        self.state.lock().ended_signals = enabled;
    }

    /// All nodes ever created, in creation order.
    pub fn nodes(&self) -> Vec<MockNode> {
        let state = self.state.lock();
        let mut nodes: Vec<MockNode> = state.nodes.values().cloned().collect();
        nodes.sort_by_key(|node| node.id);
        nodes
    }

    pub fn node(&self, id: NodeId) -> Option<MockNode> {
        self.state.lock().nodes.get(&id).cloned()
    }

    pub fn nodes_of(&self, kind: NodeKind) -> Vec<MockNode> {
        self.nodes()
            .into_iter()
            .filter(|node| node.kind == kind)
            .collect()
    }

    /// Number of nodes that have been created and not yet released, excluding the destination.
    pub fn live_node_count(&self) -> usize {
        self.state
            .lock()
            .nodes
            .values()
            .filter(|node| node.kind != NodeKind::Destination && !node.released)
            .count()
    }

    /// Number of deadline callbacks still waiting for the clock.
    pub fn pending_timer_count(&self) -> usize {
        self.state.lock().timers.len()
    }

    fn create(
        &self,
        kind: NodeKind,
        configure: impl FnOnce(&mut MockNode),
    ) -> Result<NodeId, GraphError> {
        let mut state = self.state.lock();
        if state.failing == Some(kind) {
            return Err(GraphError::Rejected(format!("{:?} creation disabled", kind)));
        }
        let id = state.next_id;
        state.next_id += 1;
        let mut node = MockNode::new(id, kind);
        configure(&mut node);
        state.nodes.insert(id, node);
        Ok(id)
    }

    fn with_node<T>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut MockNode) -> Result<T, GraphError>,
    ) -> Result<T, GraphError> {
        let mut state = self.state.lock();
        let node = state.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        if node.released {
            return Err(GraphError::Rejected(format!("node {} was released", id)));
        }
        f(node)
    }
}

impl OutputGraph for MockGraph {
    fn current_time(&self) -> f64 {
        self.state.lock().time
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
        self.create(NodeKind::Oscillator, |node| {
            node.waveform = Some(waveform);
            node.frequency = Some(frequency);
        })
    }

    fn create_gain(&self, gain: f32) -> Result<NodeId, GraphError> {
        self.create(NodeKind::Gain, |node| node.gain = GainAutomation::new(gain))
    }

    fn create_buffer_source(&self, asset: Arc<AudioAsset>) -> Result<NodeId, GraphError> {
        self.create(NodeKind::BufferSource, |node| node.asset = Some(asset))
    }

    fn create_compressor(&self, settings: CompressorSettings) -> Result<NodeId, GraphError> {
        self.create(NodeKind::Compressor, |node| node.compressor = Some(settings))
    }

    fn schedule_gain(&self, node: NodeId, ramp: GainRamp) -> Result<(), GraphError> {
        self.with_node(node, |node| {
            if node.kind != NodeKind::Gain {
                return Err(GraphError::InvalidParameter(format!(
                    "node {} has no gain parameter",
                    node.id
                )));
            }
            node.gain.push(ramp);
            Ok(())
        })
    }

    fn connect(&self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        {
            let state = self.state.lock();
            match state.nodes.get(&to) {
                Some(node) if !node.released => {}
                _ => return Err(GraphError::UnknownNode(to)),
            }
        }
        self.with_node(from, |node| {
            node.connections.push(to);
            Ok(())
        })
    }

    fn release(&self, node: NodeId) -> Result<(), GraphError> {
        if node == DESTINATION {
            return Err(GraphError::Rejected("the destination cannot be released".into()));
        }
        let mut state = self.state.lock();
        let entry = state
            .nodes
            .get_mut(&node)
            .ok_or(GraphError::UnknownNode(node))?;
        entry.released = true;
        entry.connections.clear();
        state.ended.remove(&node);
        debug!(node, graph = self.name, "Node released");
        Ok(())
    }

    fn start(&self, node: NodeId, at: f64) -> Result<(), GraphError> {
        self.with_node(node, |node| {
            if node.started_at.is_some() {
                return Err(GraphError::AlreadyStarted(node.id));
            }
            node.started_at = Some(at);
            Ok(())
        })
    }

    fn stop(&self, node: NodeId, at: f64) -> Result<(), GraphError> {
        self.with_node(node, |node| {
            node.stopped_at = Some(at);
            Ok(())
        })
    }

    fn on_ended(&self, node: NodeId, callback: GraphCallback) -> Result<(), GraphError> {
        let mut state = self.state.lock();
        if !state.nodes.get(&node).is_some_and(|n| !n.released) {
            return Err(GraphError::UnknownNode(node));
        }
        state.ended.entry(node).or_default().push(callback);
        Ok(())
    }

    fn schedule_callback(&self, at: f64, callback: GraphCallback) {
        self.state.lock().timers.push((at, callback));
    }
}

impl fmt::Display for MockGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_oscillator_lifecycle() {
        let graph = MockGraph::new("mock");
        let osc = graph.create_oscillator(Waveform::Sine, 440.0).unwrap();
        graph.connect(osc, graph.destination()).unwrap();
        graph.start(osc, 1.0).unwrap();
        graph.stop(osc, 1.05).unwrap();

        let ended = Arc::new(AtomicUsize::new(0));
        {
            let ended = ended.clone();
            graph
                .on_ended(
                    osc,
                    Box::new(move || {
                        ended.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }

        assert_eq!(graph.advance_to(1.0), 0);
        assert_eq!(graph.advance_to(1.06), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        // Callbacks fire once.
        assert_eq!(graph.advance_to(2.0), 0);
    }

    #[test]
    fn test_buffer_source_ends_after_asset_duration() {
        let graph = MockGraph::new("mock");
        let asset = Arc::new(AudioAsset::from_mono(vec![0.5; 4410], 44100));
        let source = graph.create_buffer_source(asset).unwrap();
        graph.start(source, 0.5).unwrap();
        graph.on_ended(source, Box::new(|| {})).unwrap();

        assert_eq!(graph.advance_to(0.55), 0);
        assert_eq!(graph.advance_to(0.61), 1);
    }

    #[test]
    fn test_suppressed_end_signals_still_fire_timers() {
        let graph = MockGraph::new("mock");
        graph.set_ended_signals(false);
        let osc = graph.create_oscillator(Waveform::Square, 100.0).unwrap();
        graph.start(osc, 0.0).unwrap();
        graph.stop(osc, 0.1).unwrap();
        graph.on_ended(osc, Box::new(|| {})).unwrap();
        graph.schedule_callback(0.2, Box::new(|| {}));

        assert_eq!(graph.advance_to(0.15), 0);
        assert_eq!(graph.pending_timer_count(), 1);
        assert_eq!(graph.advance_to(0.25), 1);
        assert_eq!(graph.pending_timer_count(), 0);
    }

    #[test]
    fn test_failure_injection_and_release() {
        let graph = MockGraph::new("mock");
        graph.fail_creating(NodeKind::Gain);
        assert!(graph.create_gain(1.0).is_err());
        graph.clear_failures();
        let gain = graph.create_gain(0.5).unwrap();
        assert_eq!(graph.live_node_count(), 1);

        graph.release(gain).unwrap();
        assert_eq!(graph.live_node_count(), 0);
        assert!(graph.node(gain).unwrap().released);
        assert!(graph.start(gain, 0.0).is_err());
        assert!(graph.release(graph.destination()).is_err());
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let graph = MockGraph::new("mock");
        let osc = graph.create_oscillator(Waveform::Sine, 200.0).unwrap();
        graph.start(osc, 0.0).unwrap();
        assert!(matches!(
            graph.start(osc, 0.1),
            Err(GraphError::AlreadyStarted(_))
        ));
    }
}
