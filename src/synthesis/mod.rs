use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

mod deepgram;
mod doubao;
pub mod frame;

pub use deepgram::DeepgramTtsClient;
pub use doubao::DoubaoTtsClient;

#[derive(Debug, Clone, Serialize, Hash, Eq, PartialEq)]
pub enum SynthesisType {
    #[serde(rename = "doubao")]
    Doubao,
    #[serde(rename = "deepgram")]
    Deepgram,
    Other(String),
}

impl Default for SynthesisType {
    fn default() -> Self {
        Self::Doubao
    }
}

impl std::fmt::Display for SynthesisType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SynthesisType::Doubao => write!(f, "doubao"),
            SynthesisType::Deepgram => write!(f, "deepgram"),
            SynthesisType::Other(provider) => write!(f, "{}", provider),
        }
    }
}

impl<'de> Deserialize<'de> for SynthesisType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "doubao" => Ok(SynthesisType::Doubao),
            "deepgram" => Ok(SynthesisType::Deepgram),
            _ => Ok(SynthesisType::Other(value)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SynthesisOption {
    pub samplerate: Option<u32>,
    pub app_id: Option<String>,
    pub secret_key: Option<String>,
    /// Voice name.
    pub speaker: Option<String>,
    /// Doubao resource id, or deepgram model.
    pub resource_id: Option<String>,
    pub endpoint: Option<String>,
    /// Output encoding requested upstream; only raw pcm is forwarded to clients.
    pub codec: Option<String>,
    pub speed: Option<i32>,
    pub volume: Option<i32>,
    /// Keep the upstream socket open between sentences.
    pub enable_ws_reuse: Option<bool>,
    pub connect_timeout: Option<u64>,
    pub read_timeout: Option<u64>,
    pub extra: Option<HashMap<String, String>>,
}

impl SynthesisOption {
    pub fn check_default(&mut self, provider: &SynthesisType) -> &Self {
        match provider {
            SynthesisType::Doubao => {
                if self.app_id.is_none() {
                    self.app_id = std::env::var("DOUBAO_APPID").ok();
                }
                if self.secret_key.is_none() {
                    self.secret_key = std::env::var("DOUBAO_ACCESS_TOKEN").ok();
                }
                if self.endpoint.is_none() {
                    self.endpoint =
                        Some("wss://openspeech.bytedance.com/api/v3/tts/bidirection".to_string());
                }
                if self.resource_id.is_none() {
                    self.resource_id = Some("volc.service_type.10029".to_string());
                }
            }
            SynthesisType::Deepgram => {
                if self.secret_key.is_none() {
                    self.secret_key = std::env::var("DEEPGRAM_API_KEY").ok();
                }
                if self.endpoint.is_none() {
                    self.endpoint = Some("https://api.deepgram.com/v1/speak".to_string());
                }
            }
            _ => {}
        }
        if self.samplerate.is_none() {
            self.samplerate = Some(crate::SAMPLE_RATE);
        }
        if self.codec.is_none() {
            self.codec = Some("pcm".to_string());
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
pub enum SynthesisEvent {
    /// Raw 16-bit little-endian PCM at the configured sample rate.
    AudioChunk(Vec<u8>),
    Finished,
}

/// A text-to-speech backend. Every call synthesizes one sentence; the stream
/// yields audio in arrival order and ends with `Finished`.
#[async_trait]
pub trait SynthesisClient: Send + Sync {
    fn provider(&self) -> SynthesisType;

    async fn synthesize(
        &self,
        session_id: &str,
        text: &str,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<SynthesisEvent>>>;

    /// Release any pooled upstream connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_default_doubao() {
        let mut option = SynthesisOption::default();
        option.check_default(&SynthesisType::Doubao);
        assert_eq!(option.samplerate, Some(16000));
        assert_eq!(option.codec.as_deref(), Some("pcm"));
        assert_eq!(
            option.resource_id.as_deref(),
            Some("volc.service_type.10029")
        );
    }

    #[test]
    fn test_synthesis_type_roundtrip_names() {
        let t: SynthesisType = serde_json::from_str("\"deepgram\"").unwrap();
        assert_eq!(t, SynthesisType::Deepgram);
        let t: SynthesisType = serde_json::from_str("\"fake\"").unwrap();
        assert_eq!(t.to_string(), "fake");
    }
}
