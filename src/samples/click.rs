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
//! Synthesized click voices, the always-available fallback.

use tracing::debug;

use super::voice::{voice_level, Voice, VoiceBuilder, VoiceContext};
use crate::config::EngineConfig;
use crate::graph::{GainRamp, GraphError, Waveform};

/// Time from silence to the envelope peak.
const ATTACK: f64 = 0.001;

/// Level the exponential decay ends at.
const DECAY_FLOOR: f32 = 0.001;

/// The synthesis parameters for one sound type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClickTone {
    pub frequency: f32,
    pub waveform: Waveform,
    /// Envelope peak before the velocity curve and volume are applied.
    pub gain: f32,
    /// Seconds from start to stop.
    pub length: f64,
}

impl ClickTone {
    const fn new(frequency: f32, waveform: Waveform, gain: f32, length: f64) -> ClickTone {
        ClickTone {
            frequency,
            waveform,
            gain,
            length,
        }
    }
}

const DEFAULT_TONE: ClickTone = ClickTone::new(800.0, Waveform::Sine, 0.3, 0.05);

/// Looks up the tone for a sound type. Unknown sound types get the default tone.
pub fn click_tone(sound_type: &str) -> ClickTone {
    match sound_type {
        "accent" => ClickTone::new(1000.0, Waveform::Sine, 0.3, 0.05),
        "normal" => DEFAULT_TONE,
        "kick" => ClickTone::new(120.0, Waveform::Sine, 0.5, 0.08),
        "snare" => ClickTone::new(400.0, Waveform::Triangle, 0.35, 0.06),
        "hihat_closed" => ClickTone::new(6000.0, Waveform::Square, 0.12, 0.03),
        "hihat_open" => ClickTone::new(5000.0, Waveform::Square, 0.12, 0.09),
        "perc" => ClickTone::new(600.0, Waveform::Triangle, 0.3, 0.05),
        "shaker" => ClickTone::new(8000.0, Waveform::Square, 0.08, 0.04),
        _ => DEFAULT_TONE,
    }
}

/// Builds `oscillator -> gain -> output` click voices.
pub struct ClickSynthesizer;

impl ClickSynthesizer {
    /// Schedules a click at `time`: a 1 ms linear attack to `gain × velocity² × volume`
    /// followed by an exponential decay until the oscillator stops.
    pub fn synthesize(
        ctx: &VoiceContext<'_>,
        time: f64,
        sound_type: &str,
        velocity: f32,
        config: &EngineConfig,
    ) -> Result<Voice, GraphError> {
        let graph = ctx.graph;
        let tone = click_tone(sound_type);
        let peak = tone.gain * voice_level(velocity, config.volume());
        let end = time + tone.length;

        let mut builder = VoiceBuilder::new(ctx);
        let oscillator = builder.track(graph.create_oscillator(tone.waveform, tone.frequency))?;
        let gain = builder.track(graph.create_gain(0.0))?;
        graph.connect(oscillator, gain)?;
        graph.connect(gain, ctx.output)?;
        graph.schedule_gain(gain, GainRamp::SetValue { value: 0.0, at: time })?;
        graph.schedule_gain(
            gain,
            GainRamp::Linear {
                target: peak,
                end: time + ATTACK,
            },
        )?;
        graph.schedule_gain(
            gain,
            GainRamp::Exponential {
                target: DECAY_FLOOR.min(peak),
                end,
            },
        )?;
        graph.start(oscillator, time)?;
        graph.stop(oscillator, end)?;

        let voice = builder.finish(
            format!("click:{}", sound_type),
            oscillator,
            end + ctx.release_grace,
        )?;
        debug!(
            voice = voice.id(),
            sound_type,
            time,
            frequency = tone.frequency,
            peak,
            "Click voice scheduled"
        );
        Ok(voice)
    }
}
