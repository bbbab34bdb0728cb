//! JSON control channel between the gateway and its clients.
use crate::{AudioFormat, FRAME_SAMPLES, SAMPLE_RATE};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    SentenceEnd,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    #[serde(default)]
    pub format: AudioFormat,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Milliseconds per frame.
    #[serde(default = "default_frame_duration")]
    pub frame_duration: u32,
}

fn default_sample_rate() -> u32 {
    SAMPLE_RATE
}

fn default_channels() -> u16 {
    1
}

fn default_frame_duration() -> u32 {
    (FRAME_SAMPLES as u64 * 1000 / SAMPLE_RATE as u64) as u32
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_duration: default_frame_duration(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello {
        #[serde(default)]
        audio_params: Option<AudioParams>,
        #[serde(default)]
        device_id: Option<String>,
    },
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
        /// Wake word or typed text when `state` is `detect`.
        #[serde(default)]
        text: Option<String>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl ClientFrame {
    /// Parse one text message from the client. Unknown `type` values are errors.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| anyhow!("invalid client message: {}", e))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello {
        transport: String,
        audio_params: AudioParams,
    },
    Stt {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        speaker: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    Llm {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        emotion: Option<String>,
    },
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Abort,
    Goodbye,
}

impl ServerMessage {
    pub fn tts(state: TtsState, text: Option<&str>) -> Self {
        ServerMessage::Tts {
            state,
            text: text.map(|t| t.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub session_id: String,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerFrame {
    pub fn new(session_id: &str, message: ServerMessage) -> Self {
        Self {
            session_id: session_id.to_string(),
            message,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_listen_detect() {
        let frame = ClientFrame::parse(
            r#"{"type":"listen","session_id":"s1","state":"detect","text":"what's the weather"}"#,
        )
        .unwrap();
        assert_eq!(frame.session_id.as_deref(), Some("s1"));
        assert_eq!(
            frame.message,
            ClientMessage::Listen {
                state: ListenState::Detect,
                mode: None,
                text: Some("what's the weather".to_string())
            }
        );
    }

    #[test]
    fn test_parse_hello_with_audio_params() {
        let frame = ClientFrame::parse(
            r#"{"type":"hello","audio_params":{"format":"pcm","sample_rate":16000}}"#,
        )
        .unwrap();
        match frame.message {
            ClientMessage::Hello { audio_params, .. } => {
                let params = audio_params.unwrap();
                assert_eq!(params.format, AudioFormat::Pcm);
                assert_eq!(params.frame_duration, 60);
                assert_eq!(params.channels, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(ClientFrame::parse(r#"{"type":"iot","session_id":"s1"}"#).is_err());
        assert!(ClientFrame::parse(r#"{"session_id":"s1"}"#).is_err());
        assert!(ClientFrame::parse("not json").is_err());
    }

    #[test]
    fn test_server_frames_serialize_flat() {
        let frame = ServerFrame::new("s1", ServerMessage::tts(TtsState::SentenceStart, Some("Hi.")));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"session_id": "s1", "type": "tts", "state": "sentence_start", "text": "Hi."})
        );

        let frame = ServerFrame::new("s1", ServerMessage::Goodbye);
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"session_id": "s1", "type": "goodbye"}));

        let frame = ServerFrame::new(
            "s1",
            ServerMessage::Stt {
                text: "hello".to_string(),
                speaker: None,
                language: Some("en".to_string()),
            },
        );
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["language"], "en");
        assert!(value.get("speaker").is_none());
    }
}
