use std::time::{SystemTime, UNIX_EPOCH};

pub mod codec;
pub mod config;
pub mod dialogue;
pub mod intent;
pub mod llm;
pub mod media;
pub mod memory;
pub mod playback;
pub mod protocol;
pub mod registry;
pub mod segmenter;
pub mod server;
pub mod session;
pub mod synthesis;
pub mod transcription;
pub mod vad;
pub mod wire;

pub type Sample = i16;
pub type PcmBuf = Vec<Sample>;
pub type SessionId = String;

/// Sample rate of every audio stream the gateway touches, in both directions.
pub const SAMPLE_RATE: u32 = 16000;
/// Conventional client frame: 60ms of 16kHz mono audio.
pub const FRAME_SAMPLES: usize = 960;

/// Wire encoding of the binary audio channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Opus,
    Pcm,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::Opus
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioFormat::Opus => write!(f, "opus"),
            AudioFormat::Pcm => write!(f, "pcm"),
        }
    }
}

pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn samples_to_bytes(samples: &[Sample]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_samples(data: &[u8]) -> PcmBuf {
    data.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}
