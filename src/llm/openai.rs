use super::{LlmClient, LlmOption, LlmType};
use crate::dialogue::Message;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use std::sync::Arc;
use tokio::{sync::mpsc, time::timeout};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, PartialEq)]
pub enum SseLine {
    Delta(String),
    Done,
    Skip,
}

/// Interpret one line of an OpenAI-style `text/event-stream`.
pub fn parse_sse_line(line: &str) -> Result<SseLine> {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let value: serde_json::Value =
        serde_json::from_str(data).map_err(|e| anyhow!("invalid sse payload: {} - {}", e, data))?;
    if let Some(error) = value.get("error") {
        return Err(anyhow!("llm error: {}", error));
    }
    match value["choices"][0]["delta"]["content"].as_str() {
        Some(delta) if !delta.is_empty() => Ok(SseLine::Delta(delta.to_string())),
        _ => Ok(SseLine::Skip),
    }
}

/// Any OpenAI-compatible `/chat/completions` endpoint with `stream: true`.
pub struct OpenAiClient {
    option: LlmOption,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(option: LlmOption) -> Self {
        Self {
            option,
            client: reqwest::Client::new(),
        }
    }

    pub fn create(option: &LlmOption) -> Result<Arc<dyn LlmClient>> {
        let mut option = option.clone();
        option.check_default(&LlmType::OpenAi);
        Ok(Arc::new(Self::new(option)))
    }

    fn request_body(&self, messages: &[Message]) -> serde_json::Value {
        let mut body = json!({
            "model": self.option.model.as_deref().unwrap_or("gpt-4o-mini"),
            "messages": messages,
            "stream": true,
        });
        if let Some(temperature) = self.option.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = self.option.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> LlmType {
        LlmType::OpenAi
    }

    async fn chat_stream(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let base_url = self
            .option
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow!("No llm base_url configured"))?;
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(self.request_body(&messages).to_string());
        if let Some(api_key) = self.option.api_key.as_deref() {
            request = request.header(AUTHORIZATION, format!("Bearer {}", api_key));
        }
        debug!(session_id, messages = messages.len(), "llm request to {}", url);

        let wait = self.option.timeout_duration();
        let resp = tokio::select! {
            _ = token.cancelled() => return Err(anyhow!("llm request cancelled")),
            resp = timeout(wait, request.send()) => {
                resp.map_err(|_| anyhow!("llm request timed out"))??
            }
        };
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("llm error ({}): {}", status, text));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let mut body = resp.bytes_stream();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let mut pending = Vec::<u8>::new();
            loop {
                let chunk = tokio::select! {
                    _ = token.cancelled() => {
                        debug!(session_id, "llm stream cancelled");
                        return;
                    }
                    chunk = timeout(wait, body.next()) => chunk,
                };
                let bytes = match chunk {
                    Ok(Some(Ok(bytes))) => bytes,
                    Ok(Some(Err(e))) => {
                        let _ = sender.send(Err(anyhow!("llm stream error: {}", e)));
                        return;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        let _ = sender.send(Err(anyhow!("llm stream stalled")));
                        return;
                    }
                };
                pending.extend_from_slice(&bytes);
                // Lines may straddle chunks, and so may multi-byte characters.
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                    match parse_sse_line(&line) {
                        Ok(SseLine::Delta(delta)) => {
                            if sender.send(Ok(delta)).is_err() {
                                return;
                            }
                        }
                        Ok(SseLine::Done) => return,
                        Ok(SseLine::Skip) => {}
                        Err(e) => {
                            warn!(session_id, "{}", e);
                            let _ = sender.send(Err(e));
                            return;
                        }
                    }
                }
            }
        });
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap(),
            SseLine::Delta("Hel".to_string())
        );
        assert_eq!(
            parse_sse_line(r#"data:{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            SseLine::Skip
        );
        assert_eq!(parse_sse_line("data: [DONE]\r").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert!(parse_sse_line(r#"data: {"error":{"message":"quota"}}"#).is_err());
        assert!(parse_sse_line("data: {broken").is_err());
    }

    #[test]
    fn test_request_body() {
        let mut option = LlmOption {
            temperature: Some(0.5),
            ..Default::default()
        };
        option.check_default(&LlmType::OpenAi);
        let client = OpenAiClient::new(option);
        let body = client.request_body(&[Message::user("hi")]);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["temperature"], 0.5);
        assert!(body.get("max_tokens").is_none());
    }
}
