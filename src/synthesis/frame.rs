//! Binary envelope of the bidirectional TTS backend.
//!
//! Client requests: `header | event:i32-BE | [session_id:sized] | payload:sized`.
//! Server responses (`0x9`): `header | event:i32-BE | id:sized | payload:sized`, where the id is
//! the connection id for connection-level events and the session id otherwise.
//! Audio-only responses (`0xB`) carry raw audio straight after the header.
//! Errors (`0xF`): `header | code:u32-BE | message:sized`.
use crate::wire::{
    self, COMPRESSION_NONE, FrameError, Header, Reader, SERIALIZATION_JSON, SERIALIZATION_NONE,
};

pub const FULL_CLIENT_REQUEST: u8 = 0x1;
pub const FULL_SERVER_RESPONSE: u8 = 0x9;
pub const AUDIO_ONLY_RESPONSE: u8 = 0xB;
pub const ERROR_RESPONSE: u8 = 0xF;

pub const FLAG_WITH_EVENT: u8 = 0b0100;

pub const EVENT_START_CONNECTION: i32 = 1;
pub const EVENT_FINISH_CONNECTION: i32 = 2;
pub const EVENT_CONNECTION_STARTED: i32 = 50;
pub const EVENT_CONNECTION_FAILED: i32 = 51;
pub const EVENT_CONNECTION_FINISHED: i32 = 52;
pub const EVENT_START_SESSION: i32 = 100;
pub const EVENT_FINISH_SESSION: i32 = 102;
pub const EVENT_SESSION_STARTED: i32 = 150;
pub const EVENT_SESSION_FINISHED: i32 = 152;
pub const EVENT_SESSION_FAILED: i32 = 153;
pub const EVENT_TASK_REQUEST: i32 = 200;
pub const EVENT_TTS_SENTENCE_START: i32 = 350;
pub const EVENT_TTS_SENTENCE_END: i32 = 351;
pub const EVENT_TTS_RESPONSE: i32 = 352;

fn is_connection_event(event: i32) -> bool {
    matches!(
        event,
        EVENT_START_CONNECTION
            | EVENT_FINISH_CONNECTION
            | EVENT_CONNECTION_STARTED
            | EVENT_CONNECTION_FAILED
            | EVENT_CONNECTION_FINISHED
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsRequest {
    pub event: i32,
    pub session_id: Option<String>,
    pub payload: Vec<u8>,
}

impl TtsRequest {
    pub fn start_connection() -> Self {
        Self {
            event: EVENT_START_CONNECTION,
            session_id: None,
            payload: b"{}".to_vec(),
        }
    }

    pub fn finish_connection() -> Self {
        Self {
            event: EVENT_FINISH_CONNECTION,
            session_id: None,
            payload: b"{}".to_vec(),
        }
    }

    pub fn session(event: i32, session_id: &str, payload: &serde_json::Value) -> Self {
        Self {
            event,
            session_id: Some(session_id.to_string()),
            payload: payload.to_string().into_bytes(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.payload.len());
        Header::new(
            FULL_CLIENT_REQUEST,
            FLAG_WITH_EVENT,
            SERIALIZATION_JSON,
            COMPRESSION_NONE,
        )
        .write_to(&mut buf);
        wire::put_i32(&mut buf, self.event);
        if let Some(session_id) = &self.session_id {
            wire::put_sized(&mut buf, session_id.as_bytes());
        }
        wire::put_sized(&mut buf, &self.payload);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let header = Header::parse(data)?;
        if header.message_type != FULL_CLIENT_REQUEST {
            return Err(FrameError::UnexpectedMessageType(header.message_type));
        }
        let mut reader = Reader::new(data, header.len());
        let event = reader.read_i32()?;
        let session_id = if is_connection_event(event) {
            None
        } else {
            Some(read_text(&mut reader, "session id")?)
        };
        let payload = reader.read_sized()?.to_vec();
        Ok(Self {
            event,
            session_id,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsMessage {
    Event {
        event: i32,
        /// Connection id or session id, depending on the event.
        id: String,
        payload: Vec<u8>,
    },
    Audio(Vec<u8>),
    Error {
        code: u32,
        message: String,
    },
}

impl TtsMessage {
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let header = Header::parse(data)?;
        let mut reader = Reader::new(data, header.len());
        match header.message_type {
            AUDIO_ONLY_RESPONSE => Ok(TtsMessage::Audio(reader.rest().to_vec())),
            FULL_SERVER_RESPONSE => {
                let (event, id) = if header.flags & FLAG_WITH_EVENT != 0 {
                    (reader.read_i32()?, read_text(&mut reader, "response id")?)
                } else {
                    (0, String::new())
                };
                let payload = wire::decompress(header.compression, reader.read_sized()?)?;
                Ok(TtsMessage::Event { event, id, payload })
            }
            ERROR_RESPONSE => {
                let code = reader.read_u32()?;
                let message = wire::decompress(header.compression, reader.read_sized()?)?;
                let message = String::from_utf8(message)
                    .map_err(|_| FrameError::InvalidText("error message"))?;
                Ok(TtsMessage::Error { code, message })
            }
            other => Err(FrameError::UnexpectedMessageType(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            TtsMessage::Event { event, id, payload } => {
                Header::new(
                    FULL_SERVER_RESPONSE,
                    FLAG_WITH_EVENT,
                    SERIALIZATION_JSON,
                    COMPRESSION_NONE,
                )
                .write_to(&mut buf);
                wire::put_i32(&mut buf, *event);
                wire::put_sized(&mut buf, id.as_bytes());
                wire::put_sized(&mut buf, payload);
            }
            TtsMessage::Audio(audio) => {
                Header::new(AUDIO_ONLY_RESPONSE, 0, SERIALIZATION_NONE, COMPRESSION_NONE)
                    .write_to(&mut buf);
                buf.extend_from_slice(audio);
            }
            TtsMessage::Error { code, message } => {
                Header::new(ERROR_RESPONSE, 0, SERIALIZATION_JSON, COMPRESSION_NONE)
                    .write_to(&mut buf);
                wire::put_u32(&mut buf, *code);
                wire::put_sized(&mut buf, message.as_bytes());
            }
        }
        buf
    }
}

fn read_text(reader: &mut Reader<'_>, what: &'static str) -> Result<String, FrameError> {
    let raw = reader.read_sized()?;
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidText(what))
}
