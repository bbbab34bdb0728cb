use crate::PcmBuf;
use anyhow::Result;
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

mod deepgram;
mod doubao;
pub mod frame;

pub use deepgram::DeepgramAsrClient;
pub use doubao::DoubaoAsrClient;

#[derive(Debug, Clone, Serialize, Hash, Eq, PartialEq)]
pub enum TranscriptionType {
    #[serde(rename = "doubao")]
    Doubao,
    #[serde(rename = "deepgram")]
    Deepgram,
    Other(String),
}

impl Default for TranscriptionType {
    fn default() -> Self {
        Self::Doubao
    }
}

impl std::fmt::Display for TranscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscriptionType::Doubao => write!(f, "doubao"),
            TranscriptionType::Deepgram => write!(f, "deepgram"),
            TranscriptionType::Other(provider) => write!(f, "{}", provider),
        }
    }
}

impl<'de> Deserialize<'de> for TranscriptionType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "doubao" => Ok(TranscriptionType::Doubao),
            "deepgram" => Ok(TranscriptionType::Deepgram),
            _ => Ok(TranscriptionType::Other(value)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct TranscriptionOption {
    pub language: Option<String>,
    pub app_id: Option<String>,
    pub secret_key: Option<String>,
    /// Backend cluster (doubao) or model name (deepgram).
    pub model_type: Option<String>,
    pub workflow: Option<String>,
    pub samplerate: Option<u32>,
    pub endpoint: Option<String>,
    /// Seconds to wait for the socket handshake and the init acknowledgement.
    pub connect_timeout: Option<u64>,
    /// Seconds of silence from the backend before the receive path gives up.
    pub read_timeout: Option<u64>,
    pub extra: Option<HashMap<String, String>>,
}

impl TranscriptionOption {
    pub fn check_default(&mut self, provider: &TranscriptionType) -> &Self {
        match provider {
            TranscriptionType::Doubao => {
                if self.app_id.is_none() {
                    self.app_id = std::env::var("DOUBAO_APPID").ok();
                }
                if self.secret_key.is_none() {
                    self.secret_key = std::env::var("DOUBAO_ACCESS_TOKEN").ok();
                }
                if self.endpoint.is_none() {
                    self.endpoint = Some("wss://openspeech.bytedance.com/api/v2/asr".to_string());
                }
            }
            TranscriptionType::Deepgram => {
                if self.secret_key.is_none() {
                    self.secret_key = std::env::var("DEEPGRAM_API_KEY").ok();
                }
                if self.endpoint.is_none() {
                    self.endpoint = Some("wss://api.deepgram.com/v1/listen".to_string());
                }
            }
            _ => {}
        }
        self
    }

    pub fn connect_timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout.unwrap_or(10))
    }

    pub fn read_timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.read_timeout.unwrap_or(15))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionEvent {
    Partial {
        text: String,
    },
    Final {
        text: String,
        speaker: Option<String>,
        language: Option<String>,
    },
}

/// Result of a finished utterance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub speaker: Option<String>,
    pub language: Option<String>,
}

/// A streaming recognizer. One call transcribes one utterance over its own
/// upstream connection; the returned stream ends when the backend is done.
#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    fn provider(&self) -> TranscriptionType;

    async fn transcribe(
        &self,
        session_id: &str,
        audio: Vec<PcmBuf>,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<TranscriptionEvent>>>;
}

/// Drain a transcription stream into the final text. Definite segments are joined
/// in order; if the backend never marks one final the last partial is used.
pub async fn collect_transcript(
    mut stream: BoxStream<'static, Result<TranscriptionEvent>>,
) -> Result<Transcript> {
    let mut transcript = Transcript::default();
    let mut last_partial = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            TranscriptionEvent::Partial { text } => last_partial = text,
            TranscriptionEvent::Final {
                text,
                speaker,
                language,
            } => {
                transcript.text.push_str(&text);
                if speaker.is_some() {
                    transcript.speaker = speaker;
                }
                if language.is_some() {
                    transcript.language = language;
                }
                last_partial.clear();
            }
        }
    }
    if transcript.text.is_empty() {
        transcript.text = last_partial;
    }
    transcript.text = transcript.text.trim().to_string();
    Ok(transcript)
}
