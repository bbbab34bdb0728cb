//! Binary envelope of the streaming ASR backend.
//!
//! `header | [sequence:i32-BE] | payload_len:u32-BE | payload`, where the sequence is
//! present only when flag bit0 is set. Error responses (`0xF`) instead carry
//! `code:u32-BE | msg_len:u32-BE | message`.
use crate::wire::{
    self, COMPRESSION_GZIP, COMPRESSION_NONE, FrameError, Header, Reader, SERIALIZATION_JSON,
    SERIALIZATION_NONE,
};
use serde::Serialize;

pub const FULL_CLIENT_REQUEST: u8 = 0x1;
pub const AUDIO_ONLY_REQUEST: u8 = 0x2;
pub const FULL_SERVER_RESPONSE: u8 = 0x9;
pub const SERVER_ACK: u8 = 0xB;
pub const ERROR_RESPONSE: u8 = 0xF;

pub const FLAG_NO_SEQUENCE: u8 = 0b0000;
pub const FLAG_SEQUENCE: u8 = 0b0001;
pub const FLAG_LAST_PACKET: u8 = 0b0010;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsrFrame {
    pub header: Header,
    pub sequence: Option<i32>,
    /// Payload exactly as carried on the wire (still compressed).
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsrMessage {
    Response {
        header: Header,
        sequence: Option<i32>,
        /// Decompressed payload.
        payload: Vec<u8>,
    },
    Error {
        code: u32,
        message: String,
    },
}

impl AsrFrame {
    pub fn new(header: Header, sequence: Option<i32>, payload: Vec<u8>) -> Self {
        Self {
            header,
            sequence,
            payload,
        }
    }

    /// Initial configuration request: gzip-compressed JSON.
    pub fn full_request<T: Serialize>(request: &T) -> anyhow::Result<Self> {
        let json = serde_json::to_vec(request)?;
        Ok(Self::new(
            Header::new(
                FULL_CLIENT_REQUEST,
                FLAG_NO_SEQUENCE,
                SERIALIZATION_JSON,
                COMPRESSION_GZIP,
            ),
            None,
            wire::gzip(&json)?,
        ))
    }

    /// One chunk of PCM audio, gzip-compressed.
    pub fn audio(pcm: &[u8]) -> Result<Self, FrameError> {
        Ok(Self::new(
            Header::new(
                FULL_CLIENT_REQUEST,
                FLAG_NO_SEQUENCE,
                SERIALIZATION_NONE,
                COMPRESSION_GZIP,
            ),
            None,
            wire::gzip(pcm)?,
        ))
    }

    /// Zero-length marker telling the backend no more audio follows.
    pub fn finish() -> Self {
        Self::new(
            Header::new(
                FULL_CLIENT_REQUEST,
                FLAG_LAST_PACKET,
                SERIALIZATION_NONE,
                COMPRESSION_NONE,
            ),
            None,
            Vec::new(),
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header.len() + 8 + self.payload.len());
        self.header.write_to(&mut buf);
        if self.header.flags & FLAG_SEQUENCE != 0 {
            wire::put_i32(&mut buf, self.sequence.unwrap_or_default());
        }
        wire::put_sized(&mut buf, &self.payload);
        buf
    }

    /// Parse without touching the payload; used for requests and tests.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let header = Header::parse(data)?;
        if header.message_type == ERROR_RESPONSE {
            return Err(FrameError::UnexpectedMessageType(ERROR_RESPONSE));
        }
        let mut reader = Reader::new(data, header.len());
        let sequence = if header.flags & FLAG_SEQUENCE != 0 {
            Some(reader.read_i32()?)
        } else {
            None
        };
        let payload = reader.read_sized()?.to_vec();
        Ok(Self {
            header,
            sequence,
            payload,
        })
    }
}

impl AsrMessage {
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let header = Header::parse(data)?;
        match header.message_type {
            ERROR_RESPONSE => {
                let mut reader = Reader::new(data, header.len());
                let code = reader.read_u32()?;
                let raw = reader.read_sized()?;
                let raw = wire::decompress(header.compression, raw)?;
                let message =
                    String::from_utf8(raw).map_err(|_| FrameError::InvalidText("error message"))?;
                Ok(AsrMessage::Error { code, message })
            }
            FULL_SERVER_RESPONSE | SERVER_ACK | FULL_CLIENT_REQUEST => {
                let frame = AsrFrame::decode(data)?;
                let payload = wire::decompress(frame.header.compression, &frame.payload)?;
                Ok(AsrMessage::Response {
                    header: frame.header,
                    sequence: frame.sequence,
                    payload,
                })
            }
            other => Err(FrameError::UnexpectedMessageType(other)),
        }
    }

    /// Build an error frame; the backend sends these, tests craft them.
    pub fn encode_error(code: u32, message: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        Header::new(
            ERROR_RESPONSE,
            FLAG_NO_SEQUENCE,
            SERIALIZATION_JSON,
            COMPRESSION_NONE,
        )
        .write_to(&mut buf);
        wire::put_u32(&mut buf, code);
        wire::put_sized(&mut buf, message.as_bytes());
        buf
    }
}
