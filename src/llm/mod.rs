use crate::dialogue::Message;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

mod openai;

pub use openai::{OpenAiClient, SseLine, parse_sse_line};

#[derive(Debug, Clone, Serialize, Hash, Eq, PartialEq)]
pub enum LlmType {
    #[serde(rename = "openai")]
    OpenAi,
    Other(String),
}

impl Default for LlmType {
    fn default() -> Self {
        Self::OpenAi
    }
}

impl std::fmt::Display for LlmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmType::OpenAi => write!(f, "openai"),
            LlmType::Other(provider) => write!(f, "{}", provider),
        }
    }
}

impl<'de> Deserialize<'de> for LlmType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "openai" => Ok(LlmType::OpenAi),
            _ => Ok(LlmType::Other(value)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct LlmOption {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Seconds to wait for the first response bytes.
    pub timeout: Option<u64>,
}

impl LlmOption {
    pub fn check_default(&mut self, provider: &LlmType) -> &Self {
        if let LlmType::OpenAi = provider {
            if self.api_key.is_none() {
                self.api_key = std::env::var("OPENAI_API_KEY").ok();
            }
            if self.base_url.is_none() {
                self.base_url = Some(
                    std::env::var("OPENAI_BASE_URL")
                        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                );
            }
            if self.model.is_none() {
                self.model = Some("gpt-4o-mini".to_string());
            }
        }
        self
    }

    pub fn timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout.unwrap_or(30))
    }
}

/// A chat model streaming content deltas.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> LlmType;

    async fn chat_stream(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<String>>>;
}
