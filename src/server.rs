use crate::{
    config::Config,
    media::StreamEngine,
    session::{Inbound, Outbound, SessionController},
};
use anyhow::Result;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<StreamEngine>,
    pub token: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, engine: StreamEngine, token: CancellationToken) -> Self {
        Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
            token,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let path = state.config.ws_path.clone();
    Router::new()
        .route(&path, get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let device_id = headers
        .get("device-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, device_id))
}

/// Drive one client connection: a reader feeding the controller, the
/// controller itself and a writer draining its outbound channel.
pub async fn handle_socket(socket: WebSocket, state: AppState, device_id: Option<String>) {
    let session_id = Uuid::new_v4().to_string();
    let providers = match state.engine.create_providers(&state.config) {
        Ok(providers) => providers,
        Err(e) => {
            error!(session_id, "create session providers failed: {}", e);
            let mut socket = socket;
            socket.send(Message::Close(None)).await.ok();
            return;
        }
    };
    info!(session_id, device_id = ?device_id, "client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let token = state.token.child_token();

    let mut controller = SessionController::new(
        session_id.clone(),
        state.config.clone(),
        providers,
        outbound_tx,
        token.clone(),
    );
    if let Some(device_id) = device_id {
        controller = controller.with_device_id(device_id);
    }

    let controller_loop = async {
        let result = controller.run(inbound_rx).await;
        token.cancel();
        result
    };

    let send_loop = async {
        while let Some(outbound) = outbound_rx.recv().await {
            let message = match outbound {
                Outbound::Control(frame) => match frame.to_json() {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        warn!(session_id, "encode control frame failed: {}", e);
                        continue;
                    }
                },
                Outbound::Audio(data) => Message::Binary(data.into()),
                Outbound::Close => {
                    ws_sender.send(Message::Close(None)).await.ok();
                    break;
                }
            };
            if let Err(e) = ws_sender.send(message).await {
                warn!(session_id, "websocket send failed: {}", e);
                break;
            }
        }
    };

    let recv_loop = async {
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                message = ws_receiver.next() => message,
            };
            let inbound = match message {
                Some(Ok(Message::Binary(data))) => Inbound::Audio {
                    data: data.to_vec(),
                    timestamp: None,
                },
                Some(Ok(Message::Text(text))) => Inbound::Text(text.as_str().to_string()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(session_id, "websocket receive failed: {}", e);
                    break;
                }
            };
            if inbound_tx.send(inbound).is_err() {
                break;
            }
        }
        inbound_tx.send(Inbound::Closed).ok();
    };

    let (result, _, _) = tokio::join!(controller_loop, send_loop, recv_loop);
    if let Err(e) = result {
        warn!(session_id, "session ended with error: {}", e);
    }
    info!(session_id, "client disconnected");
}

/// Bind `http_addr` and serve until `state.token` is cancelled.
pub async fn serve(state: AppState) -> Result<()> {
    let listener = TcpListener::bind(&state.config.http_addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind {} failed: {}", state.config.http_addr, e))?;
    info!(
        "listening on ws://{}{}",
        listener.local_addr()?,
        state.config.ws_path
    );
    let token = state.token.clone();
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        PcmBuf,
        dialogue::Message as ChatMessage,
        intent::{IntentType, KeywordIntent},
        llm::{LlmClient, LlmOption, LlmType},
        synthesis::{SynthesisClient, SynthesisEvent, SynthesisOption, SynthesisType},
        transcription::{
            TranscriptionClient, TranscriptionEvent, TranscriptionOption, TranscriptionType,
        },
        vad::{VadDetector, VadType},
    };
    use async_trait::async_trait;
    use futures::{StreamExt, stream, stream::BoxStream};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    struct SilentAsr;

    #[async_trait]
    impl TranscriptionClient for SilentAsr {
        fn provider(&self) -> TranscriptionType {
            TranscriptionType::Other("fake".to_string())
        }

        async fn transcribe(
            &self,
            _session_id: &str,
            _audio: Vec<PcmBuf>,
            _token: CancellationToken,
        ) -> Result<BoxStream<'static, Result<TranscriptionEvent>>> {
            Ok(stream::empty().boxed())
        }
    }

    struct JokeLlm;

    #[async_trait]
    impl LlmClient for JokeLlm {
        fn provider(&self) -> LlmType {
            LlmType::Other("fake".to_string())
        }

        async fn chat_stream(
            &self,
            _session_id: &str,
            _messages: Vec<ChatMessage>,
            _token: CancellationToken,
        ) -> Result<BoxStream<'static, Result<String>>> {
            Ok(stream::iter(vec![Ok("Why did the chicken cross the road?".to_string())]).boxed())
        }
    }

    struct ToneTts;

    #[async_trait]
    impl SynthesisClient for ToneTts {
        fn provider(&self) -> SynthesisType {
            SynthesisType::Other("fake".to_string())
        }

        async fn synthesize(
            &self,
            _session_id: &str,
            _text: &str,
            _token: CancellationToken,
        ) -> Result<BoxStream<'static, Result<SynthesisEvent>>> {
            let events = vec![
                Ok(SynthesisEvent::AudioChunk(vec![7u8; 1920])),
                Ok(SynthesisEvent::AudioChunk(vec![7u8; 1920])),
                Ok(SynthesisEvent::Finished),
            ];
            Ok(stream::iter(events).boxed())
        }
    }

    fn fake_engine() -> StreamEngine {
        let fake = "fake".to_string();
        let mut engine = StreamEngine::new();
        engine
            .register_vad(VadType::Energy, Box::new(VadDetector::create_energy))
            .register_asr(
                TranscriptionType::Other(fake.clone()),
                Box::new(|_: &TranscriptionOption| Ok(Arc::new(SilentAsr) as Arc<dyn TranscriptionClient>)),
            )
            .register_llm(
                LlmType::Other(fake.clone()),
                Box::new(|_: &LlmOption| Ok(Arc::new(JokeLlm) as Arc<dyn LlmClient>)),
            )
            .register_tts(
                SynthesisType::Other(fake),
                Box::new(|_: &SynthesisOption| Ok(Arc::new(ToneTts) as Arc<dyn SynthesisClient>)),
            )
            .register_intent(IntentType::Keyword, Box::new(KeywordIntent::create));
        engine
    }

    fn fake_config() -> Config {
        let mut config = Config::default();
        config.http_addr = "127.0.0.1:0".to_string();
        config.selected_module.vad = VadType::Energy;
        config.selected_module.asr = TranscriptionType::Other("fake".to_string());
        config.selected_module.llm = LlmType::Other("fake".to_string());
        config.selected_module.tts = SynthesisType::Other("fake".to_string());
        config.selected_module.intent = IntentType::Keyword;
        config
    }

    #[tokio::test]
    async fn test_text_turn_over_websocket() {
        let token = CancellationToken::new();
        let state = AppState::new(fake_config(), fake_engine(), token.clone());
        let path = state.config.ws_path.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_token = token.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, create_router(state))
                .with_graceful_shutdown(async move { server_token.cancelled().await })
                .await
        });

        let url = format!("ws://{}{}", addr, path);
        let (ws, _) = connect_async(url.as_str()).await.unwrap();
        let (mut tx, mut rx) = ws.split();
        tx.send(WsMessage::Text(
            json!({"type": "hello", "audio_params": {"format": "pcm"}})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

        let mut events: Vec<String> = vec![];
        let mut audio_bytes = 0;
        let exchange = async {
            while let Some(message) = rx.next().await {
                match message.unwrap() {
                    WsMessage::Text(text) => {
                        let value: Value = serde_json::from_str(text.as_str()).unwrap();
                        let kind = value["type"].as_str().unwrap_or_default().to_string();
                        let event = match value["state"].as_str() {
                            Some(state) => format!("{}:{}", kind, state),
                            None => kind,
                        };
                        if event == "hello" {
                            assert_eq!(value["audio_params"]["format"], "pcm");
                            tx.send(WsMessage::Text(
                                json!({"type": "listen", "state": "detect", "text": "tell me a joke"})
                                    .to_string()
                                    .into(),
                            ))
                            .await
                            .unwrap();
                        }
                        let done = event == "tts:stop";
                        events.push(event);
                        if done {
                            break;
                        }
                    }
                    WsMessage::Binary(data) => {
                        if audio_bytes == 0 {
                            events.push("audio".to_string());
                        }
                        audio_bytes += data.len();
                    }
                    _ => {}
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), exchange)
            .await
            .expect("conversation did not finish");

        let position = |name: &str| events.iter().position(|e| e == name).unwrap();
        assert_eq!(events[0], "hello");
        assert!(position("stt") < position("tts:start"));
        assert!(position("tts:start") < position("audio"));
        assert!(position("audio") < position("tts:stop"));
        assert!(events.contains(&"llm".to_string()));
        assert_eq!(audio_bytes, 2 * 1920);

        tx.send(WsMessage::Close(None)).await.ok();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();
    }
}
