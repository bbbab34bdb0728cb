use super::{
    SynthesisClient, SynthesisEvent, SynthesisOption, SynthesisType,
    frame::{
        EVENT_CONNECTION_FAILED, EVENT_CONNECTION_STARTED, EVENT_FINISH_SESSION,
        EVENT_SESSION_FAILED, EVENT_SESSION_FINISHED, EVENT_SESSION_STARTED, EVENT_START_SESSION,
        EVENT_TASK_REQUEST, TtsMessage, TtsRequest,
    },
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    stream::{BoxStream, SplitSink, SplitStream},
};
use http::StatusCode;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::Mutex, sync::mpsc, time::timeout};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An upstream socket that has completed `startConnection`.
struct Connection {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

impl Connection {
    async fn send(&mut self, request: TtsRequest) -> Result<()> {
        self.sink
            .send(Message::Binary(request.encode().into()))
            .await
            .map_err(|e| anyhow!("tts send failed: {}", e))
    }

    /// Next decoded binary message, skipping pings and text.
    async fn next_message(&mut self, session_id: &str, wait: Duration) -> Result<TtsMessage> {
        loop {
            let msg = timeout(wait, self.stream.next())
                .await
                .map_err(|_| anyhow!("tts response timed out"))?;
            match msg {
                Some(Ok(Message::Binary(data))) => {
                    return TtsMessage::decode(&data).map_err(|e| {
                        error!(
                            session_id,
                            "malformed tts frame: {} raw={:02x?}",
                            e,
                            &data[..data.len().min(64)]
                        );
                        anyhow!("malformed tts frame: {}", e)
                    });
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(anyhow!("tts socket closed: {:?}", frame));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(anyhow!("tts websocket error: {}", e)),
                None => return Err(anyhow!("tts socket ended")),
            }
        }
    }

    async fn expect_event(&mut self, session_id: &str, wanted: i32, wait: Duration) -> Result<()> {
        loop {
            match self.next_message(session_id, wait).await? {
                TtsMessage::Event { event, .. } if event == wanted => return Ok(()),
                TtsMessage::Event { event, payload, .. }
                    if event == EVENT_CONNECTION_FAILED || event == EVENT_SESSION_FAILED =>
                {
                    return Err(anyhow!(
                        "tts event {} failed: {}",
                        event,
                        String::from_utf8_lossy(&payload)
                    ));
                }
                TtsMessage::Error { code, message } => {
                    return Err(anyhow!("tts error {}: {}", code, message));
                }
                other => debug!(session_id, "tts ignoring {:?} while waiting for {}", other, wanted),
            }
        }
    }
}

/// Doubao bidirectional streaming TTS.
///
/// With `enable_ws_reuse` the started connection is parked after a clean session and
/// handed to the next sentence; each sentence still opens its own upstream session id.
pub struct DoubaoTtsClient {
    option: SynthesisOption,
    pooled: Arc<Mutex<Option<Connection>>>,
}

impl DoubaoTtsClient {
    pub fn new(option: SynthesisOption) -> Self {
        Self {
            option,
            pooled: Arc::new(Mutex::new(None)),
        }
    }

    pub fn create(option: &SynthesisOption) -> Result<Arc<dyn SynthesisClient>> {
        let mut option = option.clone();
        option.check_default(&SynthesisType::Doubao);
        Ok(Arc::new(Self::new(option)))
    }

    fn reuse(&self) -> bool {
        self.option.enable_ws_reuse.unwrap_or(false)
    }

    fn session_payload(&self, event: i32, session_id: &str, text: Option<&str>) -> serde_json::Value {
        let mut req_params = json!({
            "speaker": self.option.speaker.as_deref().unwrap_or("zh_female_wanwanxiaohe_moon_bigtts"),
            "audio_params": {
                "format": self.option.codec.as_deref().unwrap_or("pcm"),
                "sample_rate": self.option.samplerate.unwrap_or(crate::SAMPLE_RATE),
                "speech_rate": self.option.speed.unwrap_or(0),
                "loudness_rate": self.option.volume.unwrap_or(0),
            },
        });
        if let Some(text) = text {
            req_params["text"] = json!(text);
        }
        json!({
            "user": { "uid": session_id },
            "event": event,
            "namespace": "BidirectionalTTS",
            "req_params": req_params,
        })
    }

    async fn connect(&self, session_id: &str) -> Result<Connection> {
        let endpoint = self
            .option
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("No doubao tts endpoint configured"))?;
        let app_id = self
            .option
            .app_id
            .as_deref()
            .ok_or_else(|| anyhow!("No DOUBAO_APPID provided"))?;
        let token = self
            .option
            .secret_key
            .as_deref()
            .ok_or_else(|| anyhow!("No DOUBAO_ACCESS_TOKEN provided"))?;

        let mut request = endpoint.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("X-Api-App-Key", app_id.parse()?);
        headers.insert("X-Api-Access-Key", token.parse()?);
        headers.insert(
            "X-Api-Resource-Id",
            self.option.resource_id.as_deref().unwrap_or_default().parse()?,
        );
        headers.insert("X-Api-Connect-Id", Uuid::new_v4().to_string().parse()?);

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| anyhow!("Failed to connect to doubao tts: {}", e))?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(anyhow!("Failed to connect to doubao tts: {}", response.status()));
        }
        let (sink, stream) = ws_stream.split();
        let mut connection = Connection { sink, stream };
        connection.send(TtsRequest::start_connection()).await?;
        connection
            .expect_event(
                session_id,
                EVENT_CONNECTION_STARTED,
                self.option.connect_timeout_duration(),
            )
            .await?;
        debug!(session_id, "tts connection started");
        Ok(connection)
    }

    async fn acquire(&self, session_id: &str) -> Result<Connection> {
        if self.reuse() {
            if let Some(connection) = self.pooled.lock().await.take() {
                debug!(session_id, "tts reusing pooled connection");
                return Ok(connection);
            }
        }
        timeout(self.option.connect_timeout_duration(), self.connect(session_id))
            .await
            .map_err(|_| anyhow!("tts connect timed out"))?
    }

    async fn send_text(
        sink: &mut SplitSink<WsStream, Message>,
        task: TtsRequest,
        finish: TtsRequest,
    ) -> Result<()> {
        sink.send(Message::Binary(task.encode().into())).await?;
        sink.send(Message::Binary(finish.encode().into())).await?;
        Ok(())
    }

    /// Forward audio until the upstream session finishes. Returns `true` when the
    /// session ended cleanly and the connection may be reused.
    async fn receive_audio(
        session_id: &str,
        stream: &mut SplitStream<WsStream>,
        event_sender: &mpsc::UnboundedSender<Result<SynthesisEvent>>,
        token: &CancellationToken,
        read_timeout: Duration,
    ) -> Result<bool> {
        let mut bytes = 0usize;
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => {
                    debug!(session_id, "tts receive cancelled after {} bytes", bytes);
                    return Ok(false);
                }
                msg = timeout(read_timeout, stream.next()) => msg,
            };
            let data = match msg {
                Ok(Some(Ok(Message::Binary(data)))) => data,
                Ok(Some(Ok(Message::Close(frame)))) => {
                    return Err(anyhow!("tts socket closed mid-session: {:?}", frame));
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(anyhow!("tts websocket error: {}", e)),
                Ok(None) => return Err(anyhow!("tts socket ended mid-session")),
                Err(_) => return Err(anyhow!("tts audio timed out")),
            };
            let message = TtsMessage::decode(&data).map_err(|e| {
                error!(
                    session_id,
                    "malformed tts frame: {} raw={:02x?}",
                    e,
                    &data[..data.len().min(64)]
                );
                anyhow!("malformed tts frame: {}", e)
            })?;
            match message {
                TtsMessage::Audio(audio) => {
                    if audio.is_empty() {
                        continue;
                    }
                    bytes += audio.len();
                    if event_sender.send(Ok(SynthesisEvent::AudioChunk(audio))).is_err() {
                        return Ok(false);
                    }
                }
                TtsMessage::Event {
                    event: EVENT_SESSION_FINISHED,
                    ..
                } => {
                    debug!(session_id, "tts session finished, {} bytes", bytes);
                    return Ok(true);
                }
                TtsMessage::Event {
                    event: EVENT_SESSION_FAILED,
                    payload,
                    ..
                } => {
                    return Err(anyhow!(
                        "tts session failed: {}",
                        String::from_utf8_lossy(&payload)
                    ));
                }
                TtsMessage::Event { event, .. } => {
                    debug!(session_id, "tts event {}", event);
                }
                TtsMessage::Error { code, message } => {
                    return Err(anyhow!("tts error {}: {}", code, message));
                }
            }
        }
    }
}

#[async_trait]
impl SynthesisClient for DoubaoTtsClient {
    fn provider(&self) -> SynthesisType {
        SynthesisType::Doubao
    }

    async fn synthesize(
        &self,
        session_id: &str,
        text: &str,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<SynthesisEvent>>> {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        if text.trim().is_empty() {
            let _ = event_sender.send(Ok(SynthesisEvent::Finished));
            return Ok(UnboundedReceiverStream::new(event_receiver).boxed());
        }

        // Fresh upstream session per sentence, even on a reused socket.
        let tts_session = Uuid::new_v4().to_string();
        let read_timeout = self.option.read_timeout_duration();
        let setup = async {
            let mut connection = self.acquire(session_id).await?;
            connection
                .send(TtsRequest::session(
                    EVENT_START_SESSION,
                    &tts_session,
                    &self.session_payload(EVENT_START_SESSION, session_id, None),
                ))
                .await?;
            connection
                .expect_event(session_id, EVENT_SESSION_STARTED, read_timeout)
                .await?;
            Ok::<_, anyhow::Error>(connection)
        };
        let connection = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(anyhow!("tts cancelled before the session started")),
            connection = setup => connection?,
        };
        info!(session_id, tts_session, "doubao tts session started: {}", text);

        let task = TtsRequest::session(
            EVENT_TASK_REQUEST,
            &tts_session,
            &self.session_payload(EVENT_TASK_REQUEST, session_id, Some(text)),
        );
        let finish = TtsRequest::session(EVENT_FINISH_SESSION, &tts_session, &json!({}));
        let pooled = self.reuse().then(|| self.pooled.clone());
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let Connection {
                mut sink,
                mut stream,
            } = connection;
            let (sent, received) = tokio::join!(
                Self::send_text(&mut sink, task, finish),
                Self::receive_audio(&session_id, &mut stream, &event_sender, &token, read_timeout),
            );
            let clean = match (sent, received) {
                (Ok(()), Ok(clean)) => clean,
                (Err(e), _) | (_, Err(e)) => {
                    warn!(session_id, "tts synthesis failed: {}", e);
                    let _ = event_sender.send(Err(e));
                    false
                }
            };
            let mut connection = Connection { sink, stream };
            match pooled {
                Some(pooled) if clean => {
                    // Parked before `Finished` so the next sentence finds it.
                    *pooled.lock().await = Some(connection);
                    let _ = event_sender.send(Ok(SynthesisEvent::Finished));
                }
                _ => {
                    if clean {
                        let _ = event_sender.send(Ok(SynthesisEvent::Finished));
                        let _ = connection.send(TtsRequest::finish_connection()).await;
                    }
                    let _ = connection.sink.close().await;
                }
            }
        });

        Ok(UnboundedReceiverStream::new(event_receiver).boxed())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut connection) = self.pooled.lock().await.take() {
            connection.send(TtsRequest::finish_connection()).await?;
            connection.sink.close().await?;
        }
        Ok(())
    }
}
