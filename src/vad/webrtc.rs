use super::SpeechModel;
use anyhow::{Result, anyhow};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// 30 ms at 16 kHz, the longest frame the detector accepts.
const CHUNK_SAMPLES: usize = 480;

/// WebRTC's GMM speech detector. It only answers yes or no, so the
/// probabilities it yields are 0.0 or 1.0.
pub struct WebRtcModel {
    aggressiveness: u8,
}

impl WebRtcModel {
    pub fn new(aggressiveness: u8) -> Result<Self> {
        if aggressiveness > 3 {
            return Err(anyhow!(
                "webrtc vad aggressiveness must be 0-3, got {}",
                aggressiveness
            ));
        }
        Ok(Self { aggressiveness })
    }

    fn mode(&self) -> VadMode {
        match self.aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        }
    }
}

impl SpeechModel for WebRtcModel {
    fn chunk_size(&self) -> usize {
        CHUNK_SAMPLES
    }

    fn initial_state(&self) -> Vec<f32> {
        Vec::new()
    }

    fn predict(&self, chunk: &[f32], _state: &mut Vec<f32>) -> Result<f32> {
        let pcm: Vec<i16> = chunk
            .iter()
            .map(|s| (s * i16::MAX as f32) as i16)
            .collect();
        // `Vad` is neither Send nor Sync and cannot live in the shared detector.
        let mut vad = Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, self.mode());
        match vad.is_voice_segment(&pcm) {
            Ok(true) => Ok(1.0),
            Ok(false) => Ok(0.0),
            Err(()) => Err(anyhow!("webrtc vad rejected a {} sample chunk", pcm.len())),
        }
    }
}
