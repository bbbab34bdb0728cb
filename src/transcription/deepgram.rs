use super::{TranscriptionClient, TranscriptionEvent, TranscriptionOption, TranscriptionType};
use crate::{PcmBuf, samples_to_bytes};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    stream::{BoxStream, SplitSink, SplitStream},
};
use http::StatusCode;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DgEvent {
    #[serde(rename = "Results")]
    Results {
        is_final: Option<bool>,
        speech_final: Option<bool>,
        channel: DgChannel,
    },
    #[serde(rename = "Metadata")]
    Metadata { request_id: Option<String> },
    #[serde(rename = "UtteranceEnd")]
    UtteranceEnd,
    #[serde(rename = "Error")]
    Error {
        description: String,
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct DgChannel {
    alternatives: Vec<DgAlternative>,
}

#[derive(Debug, Deserialize)]
struct DgAlternative {
    transcript: String,
    #[serde(default)]
    languages: Option<Vec<String>>,
}

/// Deepgram live transcription: JSON results over a websocket, raw linear16 up.
pub struct DeepgramAsrClient {
    option: TranscriptionOption,
}

impl DeepgramAsrClient {
    pub fn new(option: TranscriptionOption) -> Self {
        Self { option }
    }

    pub fn create(option: &TranscriptionOption) -> Result<Arc<dyn TranscriptionClient>> {
        let mut option = option.clone();
        option.check_default(&TranscriptionType::Deepgram);
        Ok(Arc::new(Self::new(option)))
    }

    fn listen_url(&self) -> String {
        let model = self.option.model_type.as_deref().unwrap_or("nova-2");
        let language = self.option.language.as_deref().unwrap_or("en");
        let base = self
            .option
            .endpoint
            .as_deref()
            .unwrap_or("wss://api.deepgram.com/v1/listen");
        format!(
            "{base}?model={model}&language={language}&encoding=linear16&sample_rate={sr}&channels=1&interim_results=true&punctuate=true&smart_format=true",
            base = base,
            model = urlencoding::encode(model),
            language = urlencoding::encode(language),
            sr = self.option.samplerate.unwrap_or(crate::SAMPLE_RATE),
        )
    }

    async fn connect_websocket(&self, session_id: &str) -> Result<WsStream> {
        let api_key = self
            .option
            .secret_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("No DEEPGRAM_API_KEY provided"))?;

        let ws_url = self.listen_url();
        debug!(session_id, "deepgram url: {}", ws_url);
        let mut request = ws_url.into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", format!("Token {}", api_key).parse()?);

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| anyhow!("Failed to connect to Deepgram WebSocket: {}", e))?;
        match response.status() {
            StatusCode::SWITCHING_PROTOCOLS => Ok(ws_stream),
            status => Err(anyhow!("Failed to connect to Deepgram WebSocket: {}", status)),
        }
    }

    async fn send_audio(
        mut sink: SplitSink<WsStream, Message>,
        audio: Vec<PcmBuf>,
        token: CancellationToken,
    ) -> Result<()> {
        for pcm in audio {
            if token.is_cancelled() {
                return Ok(());
            }
            sink.send(Message::Binary(samples_to_bytes(&pcm).into()))
                .await?;
        }
        let close = serde_json::json!({"type": "CloseStream"});
        sink.send(Message::Text(close.to_string().into())).await?;
        Ok(())
    }

    async fn receive_results(
        session_id: String,
        mut stream: SplitStream<WsStream>,
        event_sender: mpsc::UnboundedSender<Result<TranscriptionEvent>>,
        token: CancellationToken,
        read_timeout: Duration,
    ) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                msg = timeout(read_timeout, stream.next()) => msg,
            };
            let text = match msg {
                Ok(Some(Ok(Message::Text(text)))) => text,
                Ok(Some(Ok(Message::Close(frame)))) => {
                    debug!(session_id, "deepgram closed the stream: {:?}", frame);
                    break;
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(anyhow!("deepgram websocket error: {}", e)),
                Ok(None) => break,
                Err(_) => return Err(anyhow!("deepgram result timed out")),
            };
            match serde_json::from_str::<DgEvent>(&text) {
                Ok(DgEvent::Results {
                    is_final,
                    speech_final,
                    channel,
                }) => {
                    let Some(alternative) = channel.alternatives.into_iter().next() else {
                        continue;
                    };
                    if alternative.transcript.trim().is_empty() {
                        continue;
                    }
                    let event = if is_final.unwrap_or(false) || speech_final.unwrap_or(false) {
                        TranscriptionEvent::Final {
                            text: alternative.transcript,
                            speaker: None,
                            language: alternative.languages.and_then(|l| l.into_iter().next()),
                        }
                    } else {
                        TranscriptionEvent::Partial {
                            text: alternative.transcript,
                        }
                    };
                    if event_sender.send(Ok(event)).is_err() {
                        return Ok(());
                    }
                }
                Ok(DgEvent::Metadata { request_id }) => {
                    debug!(session_id, "deepgram metadata request_id={:?}", request_id);
                }
                Ok(DgEvent::UtteranceEnd) | Ok(DgEvent::Other) => {}
                Ok(DgEvent::Error {
                    description,
                    message,
                }) => {
                    return Err(anyhow!("deepgram error: {} {:?}", description, message));
                }
                Err(e) => {
                    warn!(session_id, "Failed to parse Deepgram message: {} - Raw: {}", e, text);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TranscriptionClient for DeepgramAsrClient {
    fn provider(&self) -> TranscriptionType {
        TranscriptionType::Deepgram
    }

    async fn transcribe(
        &self,
        session_id: &str,
        audio: Vec<PcmBuf>,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<TranscriptionEvent>>> {
        let ws = timeout(
            self.option.connect_timeout_duration(),
            self.connect_websocket(session_id),
        )
        .await
        .map_err(|_| anyhow!("deepgram connect timed out"))??;
        info!(session_id, frames = audio.len(), "deepgram asr session started");

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (sink, stream) = ws.split();
        let read_timeout = self.option.read_timeout_duration();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let (sent, received) = tokio::join!(
                Self::send_audio(sink, audio, token.clone()),
                Self::receive_results(
                    session_id.clone(),
                    stream,
                    event_sender.clone(),
                    token,
                    read_timeout
                ),
            );
            if let Err(e) = sent.and(received) {
                warn!(session_id, "deepgram transcription failed: {}", e);
                let _ = event_sender.send(Err(e));
            }
        });
        Ok(UnboundedReceiverStream::new(event_receiver).boxed())
    }
}
