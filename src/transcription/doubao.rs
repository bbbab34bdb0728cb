use super::{
    TranscriptionClient, TranscriptionEvent, TranscriptionOption, TranscriptionType,
    frame::{AsrFrame, AsrMessage, FLAG_LAST_PACKET},
};
use crate::{PcmBuf, samples_to_bytes};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    stream::{BoxStream, SplitSink, SplitStream},
};
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUCCESS_CODE: i64 = 1000;
/// The backend heard no speech; not an error.
const NO_SPEECH_CODE: i64 = 1013;
const DEFAULT_WORKFLOW: &str = "audio_in,resample,partition,vad,fe,decode,itn,nlu_punctuate";
const DEFAULT_CLUSTER: &str = "volcengine_streaming_common";

#[derive(Debug, Deserialize)]
struct AsrResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: Option<AsrResults>,
    /// Set from the frame header: the backend sends nothing after this.
    #[serde(skip)]
    last: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AsrResults {
    Many(Vec<AsrResult>),
    One(AsrResult),
}

#[derive(Debug, Default, Deserialize)]
struct AsrResult {
    #[serde(default)]
    text: String,
    #[serde(default)]
    utterances: Vec<AsrUtterance>,
}

#[derive(Debug, Deserialize)]
struct AsrUtterance {
    #[serde(default)]
    text: String,
    #[serde(default)]
    definite: bool,
    #[serde(default)]
    start_time: Option<i64>,
}

pub struct DoubaoAsrClient {
    option: TranscriptionOption,
}

impl DoubaoAsrClient {
    pub fn new(option: TranscriptionOption) -> Self {
        Self { option }
    }

    pub fn create(option: &TranscriptionOption) -> Result<Arc<dyn TranscriptionClient>> {
        let mut option = option.clone();
        option.check_default(&TranscriptionType::Doubao);
        Ok(Arc::new(Self::new(option)))
    }

    fn init_request(&self, session_id: &str) -> Result<serde_json::Value> {
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
        Ok(json!({
            "app": {
                "appid": app_id,
                "cluster": self.option.model_type.as_deref().unwrap_or(DEFAULT_CLUSTER),
                "token": token,
            },
            "user": { "uid": session_id },
            "request": {
                "reqid": Uuid::new_v4().to_string(),
                "workflow": self.option.workflow.as_deref().unwrap_or(DEFAULT_WORKFLOW),
                "show_utterances": true,
                "result_type": "single",
                "sequence": 1,
            },
            "audio": {
                "format": "raw",
                "codec": "raw",
                "rate": self.option.samplerate.unwrap_or(crate::SAMPLE_RATE),
                "bits": 16,
                "channel": 1,
                "language": self.option.language.as_deref().unwrap_or("zh-CN"),
            },
        }))
    }

    async fn connect_websocket(&self, session_id: &str) -> Result<WsStream> {
        let token = self
            .option
            .secret_key
            .as_deref()
            .ok_or_else(|| anyhow!("No DOUBAO_ACCESS_TOKEN provided"))?;
        let endpoint = self
            .option
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("No doubao asr endpoint configured"))?;

        let mut request = endpoint.into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer; {}", token).parse()?);

        let (ws_stream, response) = connect_async(request).await.map_err(|e| {
            error!(session_id, "asr websocket connection failed: {}", e);
            anyhow!("Failed to connect to doubao asr: {}", e)
        })?;
        match response.status() {
            StatusCode::SWITCHING_PROTOCOLS => Ok(ws_stream),
            status => Err(anyhow!("Failed to connect to doubao asr: {}", status)),
        }
    }

    /// Send the init request and wait for the backend to accept it.
    async fn handshake(
        session_id: &str,
        ws: &mut WsStream,
        request: &serde_json::Value,
        wait: Duration,
    ) -> Result<()> {
        let frame = AsrFrame::full_request(request)?;
        ws.send(Message::Binary(frame.encode().into())).await?;

        let ack = timeout(wait, async {
            while let Some(msg) = ws.next().await {
                match msg? {
                    Message::Binary(data) => {
                        let response = decode_response(session_id, &data)?;
                        if response.code == SUCCESS_CODE {
                            return Ok(());
                        }
                        return Err(anyhow!(
                            "asr init rejected: {} {}",
                            response.code,
                            response.message.unwrap_or_default()
                        ));
                    }
                    Message::Close(frame) => {
                        return Err(anyhow!("asr closed during init: {:?}", frame));
                    }
                    _ => {}
                }
            }
            Err(anyhow!("asr stream ended during init"))
        })
        .await;
        ack.map_err(|_| anyhow!("asr init acknowledgement timed out"))?
    }

    async fn send_audio(
        session_id: String,
        mut sink: SplitSink<WsStream, Message>,
        audio: Vec<PcmBuf>,
        token: CancellationToken,
    ) -> Result<()> {
        let mut sent = 0;
        for pcm in audio {
            if token.is_cancelled() {
                debug!(session_id, "asr send cancelled after {} chunks", sent);
                return Ok(());
            }
            let frame = AsrFrame::audio(&samples_to_bytes(&pcm))?;
            sink.send(Message::Binary(frame.encode().into())).await?;
            sent += 1;
        }
        sink.send(Message::Binary(AsrFrame::finish().encode().into()))
            .await?;
        debug!(session_id, "asr sent {} chunks and finish marker", sent);
        Ok(())
    }

    async fn receive_results(
        session_id: String,
        mut stream: SplitStream<WsStream>,
        event_sender: mpsc::UnboundedSender<Result<TranscriptionEvent>>,
        token: CancellationToken,
        read_timeout: Duration,
    ) -> Result<()> {
        let mut emitted = HashSet::new();
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => {
                    debug!(session_id, "asr receive cancelled");
                    return Ok(());
                }
                msg = timeout(read_timeout, stream.next()) => msg,
            };
            let msg = match msg {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(_) if !emitted.is_empty() => {
                    warn!(
                        session_id,
                        "asr went quiet after {} final results, finishing",
                        emitted.len()
                    );
                    break;
                }
                Err(_) => return Err(anyhow!("asr result timed out")),
            };
            match msg {
                Ok(Message::Binary(data)) => {
                    let response = decode_response(&session_id, &data)?;
                    if response.code == NO_SPEECH_CODE {
                        debug!(session_id, "asr reported no speech");
                        continue;
                    }
                    if response.code != SUCCESS_CODE {
                        return Err(anyhow!(
                            "asr error {}: {}",
                            response.code,
                            response.message.unwrap_or_default()
                        ));
                    }
                    let last = response.last;
                    for event in response_events(response, &mut emitted) {
                        if event_sender.send(Ok(event)).is_err() {
                            return Ok(());
                        }
                    }
                    if last {
                        debug!(session_id, "asr last packet received");
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!(session_id, "asr closed by server: {:?}", frame);
                    break;
                }
                Ok(Message::Text(text)) => {
                    warn!(session_id, "asr sent unexpected text message: {}", text);
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow!("asr websocket error: {}", e)),
            }
        }
        Ok(())
    }
}

fn decode_response(session_id: &str, data: &[u8]) -> Result<AsrResponse> {
    match AsrMessage::decode(data) {
        Ok(AsrMessage::Response {
            header, payload, ..
        }) => {
            let mut response: AsrResponse = serde_json::from_slice(&payload).map_err(|e| {
                error!(session_id, "asr payload is not a response: {}", e);
                anyhow!("invalid asr payload: {}", e)
            })?;
            response.last = header.flags & FLAG_LAST_PACKET != 0;
            Ok(response)
        }
        Ok(AsrMessage::Error { code, message }) => {
            if code as i64 == NO_SPEECH_CODE {
                return Ok(AsrResponse {
                    code: NO_SPEECH_CODE,
                    message: Some(message),
                    result: None,
                    last: false,
                });
            }
            Err(anyhow!("asr error frame {}: {}", code, message))
        }
        Err(e) => {
            error!(
                session_id,
                "malformed asr frame: {} raw={:02x?}",
                e,
                &data[..data.len().min(64)]
            );
            Err(e.into())
        }
    }
}

fn response_events(
    response: AsrResponse,
    emitted: &mut HashSet<(Option<i64>, String)>,
) -> Vec<TranscriptionEvent> {
    let results = match response.result {
        Some(AsrResults::Many(results)) => results,
        Some(AsrResults::One(result)) => vec![result],
        None => return vec![],
    };
    let mut events = Vec::new();
    for result in results {
        if result.utterances.is_empty() {
            if !result.text.is_empty() {
                events.push(TranscriptionEvent::Partial { text: result.text });
            }
            continue;
        }
        for utterance in result.utterances {
            if utterance.text.is_empty() {
                continue;
            }
            if utterance.definite {
                if emitted.insert((utterance.start_time, utterance.text.clone())) {
                    events.push(TranscriptionEvent::Final {
                        text: utterance.text,
                        speaker: None,
                        language: None,
                    });
                }
            } else {
                events.push(TranscriptionEvent::Partial {
                    text: utterance.text,
                });
            }
        }
    }
    events
}

#[async_trait]
impl TranscriptionClient for DoubaoAsrClient {
    fn provider(&self) -> TranscriptionType {
        TranscriptionType::Doubao
    }

    async fn transcribe(
        &self,
        session_id: &str,
        audio: Vec<PcmBuf>,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<TranscriptionEvent>>> {
        let request = self.init_request(session_id)?;
        let wait = self.option.connect_timeout_duration();
        let setup = async {
            let mut ws = timeout(wait, self.connect_websocket(session_id))
                .await
                .map_err(|_| anyhow!("asr connect timed out"))??;
            Self::handshake(session_id, &mut ws, &request, wait).await?;
            Ok::<_, anyhow::Error>(ws)
        };
        let ws = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(anyhow!("asr cancelled before the session started")),
            ws = setup => ws?,
        };
        info!(session_id, frames = audio.len(), "doubao asr session started");

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (sink, stream) = ws.split();
        let read_timeout = self.option.read_timeout_duration();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            // Both paths run to completion; dropping the reader early loses trailing results.
            let (sent, received) = tokio::join!(
                Self::send_audio(session_id.clone(), sink, audio, token.clone()),
                Self::receive_results(
                    session_id.clone(),
                    stream,
                    event_sender.clone(),
                    token,
                    read_timeout
                ),
            );
            if let Err(e) = sent {
                warn!(session_id, "asr send path failed: {}", e);
                let _ = event_sender.send(Err(e));
            } else if let Err(e) = received {
                warn!(session_id, "asr receive path failed: {}", e);
                let _ = event_sender.send(Err(e));
            }
        });

        Ok(UnboundedReceiverStream::new(event_receiver).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::frame::{FLAG_NO_SEQUENCE, FLAG_SEQUENCE, FULL_SERVER_RESPONSE};
    use crate::wire::{COMPRESSION_NONE, Header, SERIALIZATION_JSON};
    use tokio::{net::TcpListener, task::JoinHandle};
    use tokio_tungstenite::accept_async;

    fn server_response(value: serde_json::Value, last: bool) -> Message {
        let (flags, sequence) = if last {
            (FLAG_SEQUENCE | FLAG_LAST_PACKET, Some(-2))
        } else {
            (FLAG_NO_SEQUENCE, None)
        };
        let frame = AsrFrame::new(
            Header::new(FULL_SERVER_RESPONSE, flags, SERIALIZATION_JSON, COMPRESSION_NONE),
            sequence,
            serde_json::to_vec(&value).unwrap(),
        );
        Message::Binary(frame.encode().into())
    }

    /// How the fake backend ends a session after its definite result.
    #[derive(Clone, Copy)]
    enum Ending {
        LastPacket,
        Quiet,
        Close,
    }

    struct Upstream {
        init: serde_json::Value,
        audio_frames: usize,
        finished: bool,
    }

    /// A backend that acks the init request, sends a partial plus a no-speech
    /// error mid-stream and one definite result after the finish marker. It
    /// only closes the socket itself with `Ending::Close`.
    async fn fake_upstream(ending: Ending) -> (String, JoinHandle<Upstream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let init = match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => match AsrMessage::decode(&data).unwrap() {
                    AsrMessage::Response { payload, .. } => serde_json::from_slice(&payload).unwrap(),
                    other => panic!("unexpected init {:?}", other),
                },
                other => panic!("unexpected init {:?}", other),
            };
            ws.send(server_response(json!({"code": 1000}), false))
                .await
                .unwrap();

            let mut audio_frames = 0;
            let mut finished = false;
            while let Some(Ok(Message::Binary(data))) = ws.next().await {
                let frame = AsrFrame::decode(&data).unwrap();
                if frame.header.flags & FLAG_LAST_PACKET != 0 {
                    finished = frame.payload.is_empty();
                    break;
                }
                audio_frames += 1;
                if audio_frames == 1 {
                    let partial = json!({"code": 1000, "result": [{"text": "hel", "utterances": []}]});
                    ws.send(server_response(partial, false)).await.unwrap();
                    ws.send(Message::Binary(
                        AsrMessage::encode_error(1013, "no valid speech").into(),
                    ))
                    .await
                    .unwrap();
                }
            }
            let result = json!({"code": 1000, "result": [{"text": "hello world", "utterances": [
                {"text": "hello world", "definite": true, "start_time": 0}
            ]}]});
            ws.send(server_response(result, matches!(ending, Ending::LastPacket)))
                .await
                .unwrap();
            if matches!(ending, Ending::Close) {
                ws.close(None).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
            Upstream {
                init,
                audio_frames,
                finished,
            }
        });
        (endpoint, handle)
    }

    fn client(endpoint: String, read_timeout: u64) -> DoubaoAsrClient {
        DoubaoAsrClient::new(TranscriptionOption {
            app_id: Some("app".to_string()),
            secret_key: Some("token".to_string()),
            endpoint: Some(endpoint),
            connect_timeout: Some(5),
            read_timeout: Some(read_timeout),
            ..Default::default()
        })
    }

    async fn collect(stream: BoxStream<'static, Result<TranscriptionEvent>>) -> Vec<TranscriptionEvent> {
        let events = timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
            .await
            .expect("receive path did not finish");
        events.into_iter().collect::<Result<Vec<_>>>().unwrap()
    }

    #[tokio::test]
    async fn test_session_over_socket_ends_on_last_packet() {
        let (endpoint, upstream) = fake_upstream(Ending::LastPacket).await;
        // A long read timeout: only the last-packet flag can end the session in time.
        let asr = client(endpoint, 60);
        let audio = vec![vec![100i16; 960]; 3];
        let stream = asr
            .transcribe("s1", audio, CancellationToken::new())
            .await
            .unwrap();
        let events = collect(stream).await;
        assert_eq!(
            events,
            vec![
                TranscriptionEvent::Partial {
                    text: "hel".to_string()
                },
                TranscriptionEvent::Final {
                    text: "hello world".to_string(),
                    speaker: None,
                    language: None
                },
            ]
        );

        let upstream = upstream.await.unwrap();
        assert_eq!(upstream.init["app"]["appid"], "app");
        assert_eq!(upstream.init["user"]["uid"], "s1");
        assert_eq!(upstream.audio_frames, 3);
        assert!(upstream.finished, "finish marker must follow the audio");
    }

    #[tokio::test]
    async fn test_quiet_backend_after_final_result_is_not_an_error() {
        let (endpoint, upstream) = fake_upstream(Ending::Quiet).await;
        let asr = client(endpoint, 1);
        let stream = asr
            .transcribe("s1", vec![vec![100i16; 960]; 2], CancellationToken::new())
            .await
            .unwrap();
        let events = collect(stream).await;
        assert!(events.contains(&TranscriptionEvent::Final {
            text: "hello world".to_string(),
            speaker: None,
            language: None
        }));
        assert_eq!(upstream.await.unwrap().audio_frames, 2);
    }

    #[tokio::test]
    async fn test_receive_drains_until_server_closes() {
        let (endpoint, upstream) = fake_upstream(Ending::Close).await;
        let asr = client(endpoint, 60);
        let stream = asr
            .transcribe("s1", vec![vec![100i16; 960]; 4], CancellationToken::new())
            .await
            .unwrap();
        let transcript = timeout(
            Duration::from_secs(5),
            crate::transcription::collect_transcript(stream),
        )
        .await
        .expect("close must end the session")
        .unwrap();
        assert_eq!(transcript.text, "hello world");
        assert_eq!(upstream.await.unwrap().audio_frames, 4);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_unanswered_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
        let asr = client(endpoint, 60);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let result = timeout(Duration::from_secs(3), asr.transcribe("s1", vec![], token))
            .await
            .expect("cancellation must not wait for the init timeout");
        assert!(result.is_err());
    }

    #[test]
    fn test_response_events_dedup_definite() {
        let mut emitted = HashSet::new();
        let response: AsrResponse = serde_json::from_str(
            r#"{"code":1000,"result":[{"text":"hello there","utterances":[
                {"text":"hello","definite":true,"start_time":0},
                {"text":"there","definite":false,"start_time":900}
            ]}]}"#,
        )
        .unwrap();
        let events = response_events(response, &mut emitted);
        assert_eq!(
            events,
            vec![
                TranscriptionEvent::Final {
                    text: "hello".to_string(),
                    speaker: None,
                    language: None
                },
                TranscriptionEvent::Partial {
                    text: "there".to_string()
                },
            ]
        );

        let again: AsrResponse = serde_json::from_str(
            r#"{"code":1000,"result":{"text":"hello","utterances":[{"text":"hello","definite":true,"start_time":0}]}}"#,
        )
        .unwrap();
        assert!(response_events(again, &mut emitted).is_empty());
    }

    #[test]
    fn test_error_frame_with_no_speech_code_is_ignored() {
        let data = AsrMessage::encode_error(1013, "no valid speech");
        let response = decode_response("s1", &data).unwrap();
        assert_eq!(response.code, NO_SPEECH_CODE);
        assert!(!response.last);

        let data = AsrMessage::encode_error(1002, "invalid token");
        assert!(decode_response("s1", &data).is_err());
    }

    #[test]
    fn test_init_request_requires_credentials() {
        let client = DoubaoAsrClient::new(TranscriptionOption::default());
        assert!(client.init_request("s1").is_err());

        let client = DoubaoAsrClient::new(TranscriptionOption {
            app_id: Some("app".to_string()),
            secret_key: Some("token".to_string()),
            ..Default::default()
        });
        let request = client.init_request("s1").unwrap();
        assert_eq!(request["app"]["appid"], "app");
        assert_eq!(request["request"]["workflow"], DEFAULT_WORKFLOW);
        assert_eq!(request["audio"]["rate"], 16000);
    }
}
