//! Shared 4-byte header used by both upstream speech protocols.
//!
//! ```text
//! byte0 = (version << 4) | header_size_words
//! byte1 = (message_type << 4) | message_flags
//! byte2 = (serialization << 4) | compression
//! byte3 = reserved
//! ```
//! `header_size_words * 4` bytes make up the header; anything past the first four
//! bytes is an opaque extension.
use byteorder::{BigEndian, ByteOrder};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = 0b0001;
pub const DEFAULT_HEADER_WORDS: u8 = 0b0001;

pub const SERIALIZATION_NONE: u8 = 0b0000;
pub const SERIALIZATION_JSON: u8 = 0b0001;

pub const COMPRESSION_NONE: u8 = 0b0000;
pub const COMPRESSION_GZIP: u8 = 0b0001;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid header size {0} words")]
    InvalidHeaderSize(u8),
    #[error("unexpected message type {0:#x}")]
    UnexpectedMessageType(u8),
    #[error("unsupported compression {0}")]
    UnsupportedCompression(u8),
    #[error("gzip: {0}")]
    Compression(#[from] std::io::Error),
    #[error("invalid utf-8 in {0}")]
    InvalidText(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub header_words: u8,
    pub message_type: u8,
    pub flags: u8,
    pub serialization: u8,
    pub compression: u8,
    pub reserved: u8,
    pub extension: Vec<u8>,
}

impl Header {
    pub fn new(message_type: u8, flags: u8, serialization: u8, compression: u8) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            header_words: DEFAULT_HEADER_WORDS,
            message_type,
            flags,
            serialization,
            compression,
            reserved: 0,
            extension: Vec::new(),
        }
    }

    /// Total header length on the wire.
    pub fn len(&self) -> usize {
        self.header_words as usize * 4
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push((self.version << 4) | (self.header_words & 0x0f));
        buf.push((self.message_type << 4) | (self.flags & 0x0f));
        buf.push((self.serialization << 4) | (self.compression & 0x0f));
        buf.push(self.reserved);
        let ext_len = self.len().saturating_sub(4);
        let mut ext = self.extension.clone();
        ext.resize(ext_len, 0);
        buf.extend_from_slice(&ext);
    }

    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        ensure_len(data, 4)?;
        let version = data[0] >> 4;
        let header_words = data[0] & 0x0f;
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        if header_words == 0 {
            return Err(FrameError::InvalidHeaderSize(header_words));
        }
        let header_len = header_words as usize * 4;
        ensure_len(data, header_len)?;
        Ok(Self {
            version,
            header_words,
            message_type: data[1] >> 4,
            flags: data[1] & 0x0f,
            serialization: data[2] >> 4,
            compression: data[2] & 0x0f,
            reserved: data[3],
            extension: data[4..header_len].to_vec(),
        })
    }
}

pub fn ensure_len(data: &[u8], needed: usize) -> Result<(), FrameError> {
    if data.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: data.len(),
        });
    }
    Ok(())
}

/// Cursor over a frame body with big-endian readers that fail with `Truncated`.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        ensure_len(self.data, self.pos + 4)?;
        let v = BigEndian::read_u32(&self.data[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32, FrameError> {
        ensure_len(self.data, self.pos + 4)?;
        let v = BigEndian::read_i32(&self.data[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        ensure_len(self.data, self.pos + len)?;
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    /// `u32` length followed by that many bytes.
    pub fn read_sized(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let v = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        v
    }
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, v);
    buf.extend_from_slice(&b);
}

pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    let mut b = [0u8; 4];
    BigEndian::write_i32(&mut b, v);
    buf.extend_from_slice(&b);
}

pub fn put_sized(buf: &mut Vec<u8>, data: &[u8]) {
    put_u32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Undo the compression named in the header.
pub fn decompress(compression: u8, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    match compression {
        COMPRESSION_NONE => Ok(data.to_vec()),
        COMPRESSION_GZIP => gunzip(data),
        other => Err(FrameError::UnsupportedCompression(other)),
    }
}
