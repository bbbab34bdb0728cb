use crate::{codec::AudioDecoder, protocol::ListenMode};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

mod energy;
mod model;
#[cfg(feature = "vad_webrtc")]
mod webrtc;

pub use energy::EnergyScorer;
pub use model::{ModelScorer, SpeechModel};
#[cfg(feature = "vad_webrtc")]
pub use webrtc::WebRtcModel;

/// Number of recent frame decisions considered for `has_voice`.
pub const WINDOW_SIZE: usize = 5;
/// Voiced frames in the window needed to report voice.
pub const WINDOW_MAJORITY: usize = 3;

#[derive(Debug, Clone, Serialize, Hash, Eq, PartialEq)]
pub enum VadType {
    #[serde(rename = "energy")]
    Energy,
    #[serde(rename = "webrtc")]
    WebRtc,
    Other(String),
}

impl Default for VadType {
    fn default() -> Self {
        Self::Energy
    }
}

impl std::fmt::Display for VadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VadType::Energy => write!(f, "energy"),
            VadType::WebRtc => write!(f, "webrtc"),
            VadType::Other(provider) => write!(f, "{}", provider),
        }
    }
}

impl<'de> Deserialize<'de> for VadType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "energy" => Ok(VadType::Energy),
            "webrtc" => Ok(VadType::WebRtc),
            _ => Ok(VadType::Other(value)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VadOption {
    pub threshold_high: f32,
    pub threshold_low: f32,
    pub min_silence_duration_ms: u64,
    /// RMS treated as probability 1.0 by the energy scorer.
    pub energy_reference_rms: f32,
    /// WebRTC detector mode, 0 (quality) to 3 (very aggressive).
    pub webrtc_aggressiveness: u8,
    pub frame_duration_ms: u64,
}

impl Default for VadOption {
    fn default() -> Self {
        Self {
            threshold_high: 0.5,
            threshold_low: 0.2,
            min_silence_duration_ms: 1000,
            energy_reference_rms: 3000.0,
            webrtc_aggressiveness: 2,
            frame_duration_ms: 60,
        }
    }
}

/// Per-session detector state. Owned by the session, never shared.
#[derive(Debug, Clone, Default)]
pub struct VadContext {
    pub last_is_voice: bool,
    pub window: VecDeque<bool>,
    pub has_voice: bool,
    pub voice_stopped: bool,
    /// Timestamp of the first voiced frame; `None` until one is seen.
    pub first_activity_time: Option<u64>,
    pub last_activity_time: u64,
    pub last_probability: f32,
    /// Recurrent state carried between model invocations.
    pub model_state: Vec<f32>,
    /// Samples not yet fed to the model because they don't fill a chunk.
    pub pending: Vec<f32>,
}

impl VadContext {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn voiced_in_window(&self) -> usize {
        self.window.iter().filter(|v| **v).count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VadResult {
    /// Majority of the window is voiced.
    pub has_voice: bool,
    /// Emitted once when a voiced segment has been silent long enough.
    pub voice_stopped: bool,
    pub probability: f32,
    /// Hysteresis decision for this frame alone.
    pub is_voice: bool,
}

/// Maps PCM to speech probabilities in `0.0..=1.0`.
pub trait SpeechProbability: Send + Sync {
    /// May return several values (one per model chunk) or none when the frame
    /// only topped up a partial chunk.
    fn probabilities(&self, pcm: &[i16], ctx: &mut VadContext) -> Result<Vec<f32>>;
}

pub struct VadDetector {
    option: VadOption,
    scorer: Box<dyn SpeechProbability>,
}

impl VadDetector {
    pub fn new(option: VadOption, scorer: Box<dyn SpeechProbability>) -> Self {
        Self { option, scorer }
    }

    pub fn energy(option: VadOption) -> Self {
        let scorer = EnergyScorer::new(option.energy_reference_rms);
        Self::new(option, Box::new(scorer))
    }

    pub fn create_energy(option: &VadOption) -> Result<std::sync::Arc<Self>> {
        Ok(std::sync::Arc::new(Self::energy(option.clone())))
    }

    #[cfg(feature = "vad_webrtc")]
    pub fn create_webrtc(option: &VadOption) -> Result<std::sync::Arc<Self>> {
        let model = WebRtcModel::new(option.webrtc_aggressiveness)?;
        let scorer = ModelScorer::new(Box::new(model));
        Ok(std::sync::Arc::new(Self::new(option.clone(), Box::new(scorer))))
    }

    pub fn option(&self) -> &VadOption {
        &self.option
    }

    /// Classify one encoded client frame at time `now` (ms).
    pub fn is_vad(
        &self,
        session_id: &str,
        frame: &[u8],
        decoder: &mut dyn AudioDecoder,
        ctx: &mut VadContext,
        mode: ListenMode,
        now: u64,
    ) -> VadResult {
        if mode == ListenMode::Manual {
            return VadResult {
                has_voice: true,
                voice_stopped: false,
                probability: 1.0,
                is_voice: true,
            };
        }
        match decoder.decode(frame) {
            Ok(pcm) => self.process(session_id, &pcm, ctx, now),
            Err(e) => {
                warn!(session_id, "vad decode failed: {}", e);
                VadResult::default()
            }
        }
    }

    pub fn process(
        &self,
        session_id: &str,
        pcm: &[i16],
        ctx: &mut VadContext,
        now: u64,
    ) -> VadResult {
        let probability = match self.scorer.probabilities(pcm, ctx) {
            Ok(probs) => probs
                .into_iter()
                .reduce(f32::max)
                .unwrap_or(ctx.last_probability),
            Err(e) => {
                warn!(session_id, "vad scoring failed: {}", e);
                return VadResult::default();
            }
        };
        ctx.last_probability = probability;

        let is_voice = if probability >= self.option.threshold_high {
            true
        } else if probability <= self.option.threshold_low {
            false
        } else {
            ctx.last_is_voice
        };
        ctx.last_is_voice = is_voice;

        ctx.window.push_back(is_voice);
        while ctx.window.len() > WINDOW_SIZE {
            ctx.window.pop_front();
        }
        let has_voice = ctx.voiced_in_window() >= WINDOW_MAJORITY;

        if is_voice {
            ctx.first_activity_time.get_or_insert(now);
            ctx.last_activity_time = now;
        }
        if has_voice {
            ctx.has_voice = true;
            ctx.voice_stopped = false;
        }

        let mut voice_stopped = false;
        if ctx.has_voice
            && !has_voice
            && now.saturating_sub(ctx.last_activity_time) >= self.option.min_silence_duration_ms
        {
            voice_stopped = true;
            ctx.has_voice = false;
            ctx.voice_stopped = true;
        }

        VadResult {
            has_voice,
            voice_stopped,
            probability,
            is_voice,
        }
    }
}
