use crate::synthesis::{SynthesisClient, SynthesisEvent, SynthesisOption, SynthesisType};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Deepgram Aura over plain HTTP; the response body is streamed as linear16.
pub struct DeepgramTtsClient {
    option: SynthesisOption,
    client: reqwest::Client,
}

impl DeepgramTtsClient {
    pub fn new(option: SynthesisOption) -> Self {
        Self {
            option,
            client: reqwest::Client::new(),
        }
    }

    pub fn create(option: &SynthesisOption) -> Result<Arc<dyn SynthesisClient>> {
        let mut option = option.clone();
        option.check_default(&SynthesisType::Deepgram);
        Ok(Arc::new(Self::new(option)))
    }

    fn speak_url(&self) -> String {
        let base = self
            .option
            .endpoint
            .as_deref()
            .unwrap_or("https://api.deepgram.com/v1/speak");
        format!(
            "{}?model={}&encoding=linear16&container=none&sample_rate={}",
            base,
            urlencoding::encode(
                self.option
                    .speaker
                    .as_deref()
                    .unwrap_or("aura-asteria-en")
            ),
            self.option.samplerate.unwrap_or(crate::SAMPLE_RATE)
        )
    }
}

#[async_trait]
impl SynthesisClient for DeepgramTtsClient {
    fn provider(&self) -> SynthesisType {
        SynthesisType::Deepgram
    }

    async fn synthesize(
        &self,
        session_id: &str,
        text: &str,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<SynthesisEvent>>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if text.trim().is_empty() {
            let _ = sender.send(Ok(SynthesisEvent::Finished));
            return Ok(UnboundedReceiverStream::new(receiver).boxed());
        }

        let api_key = self
            .option
            .secret_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("No DEEPGRAM_API_KEY provided"))?;

        debug!(session_id, "Synthesizing text with Deepgram: {}", text);
        let request_body = serde_json::json!({ "text": text });
        let resp = timeout(
            self.option.connect_timeout_duration(),
            self.client
                .post(self.speak_url())
                .header(AUTHORIZATION, format!("Token {}", api_key))
                .header(CONTENT_TYPE, "application/json")
                .body(request_body.to_string())
                .send(),
        )
        .await
        .map_err(|_| anyhow!("Deepgram TTS request timed out"))??;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(session_id, "Deepgram TTS error ({}): {}", status, error_text);
            return Err(anyhow!("Deepgram TTS error ({}): {}", status, error_text));
        }

        let read_timeout = self.option.read_timeout_duration();
        let session_id = session_id.to_string();
        let mut body = resp.bytes_stream();
        tokio::spawn(async move {
            let mut total = 0usize;
            // linear16 must stay sample aligned across chunk boundaries.
            let mut carry: Option<u8> = None;
            loop {
                let chunk = tokio::select! {
                    _ = token.cancelled() => return,
                    chunk = timeout(read_timeout, body.next()) => chunk,
                };
                match chunk {
                    Ok(Some(Ok(bytes))) => {
                        let mut data = Vec::with_capacity(bytes.len() + 1);
                        data.extend(carry.take());
                        data.extend_from_slice(&bytes);
                        if data.len() % 2 == 1 {
                            carry = data.pop();
                        }
                        if data.is_empty() {
                            continue;
                        }
                        total += data.len();
                        if sender.send(Ok(SynthesisEvent::AudioChunk(data))).is_err() {
                            return;
                        }
                    }
                    Ok(Some(Err(e))) => {
                        warn!(session_id, "Deepgram TTS stream failed: {}", e);
                        let _ = sender.send(Err(e.into()));
                        return;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        let _ = sender.send(Err(anyhow!("Deepgram TTS body timed out")));
                        return;
                    }
                }
            }
            debug!(session_id, "Deepgram TTS synthesis completed, {} bytes", total);
            let _ = sender.send(Ok(SynthesisEvent::Finished));
        });
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}
