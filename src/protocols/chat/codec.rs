//! Payload encodings: JSON or XML, optionally zlib-compressed.

use crate::protocols::chat::message::{ChatError, ChatMessage};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Largest payload accepted after decompression.
pub const MAX_INFLATED: usize = 16 * 1024 * 1024;

/// Text format of a chat payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Json,
    Xml,
}

/// Encodes replies and decodes messages for one chat service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadCodec {
    format: PayloadFormat,
    compressed: bool,
}

impl PayloadCodec {
    pub fn new(format: PayloadFormat, compressed: bool) -> Self {
        Self { format, compressed }
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Serialize `value` in this codec's format.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ChatError> {
        let plain = match self.format {
            PayloadFormat::Json => serde_json::to_vec(value)?,
            PayloadFormat::Xml => quick_xml::se::to_string(value)?.into_bytes(),
        };
        if self.compressed {
            deflate(&plain)
        } else {
            Ok(plain)
        }
    }

    /// Decode one message payload.
    pub fn decode(&self, payload: &[u8]) -> Result<ChatMessage, ChatError> {
        if self.compressed {
            self.decode_plain(&inflate(payload)?)
        } else {
            self.decode_plain(payload)
        }
    }

    fn decode_plain(&self, data: &[u8]) -> Result<ChatMessage, ChatError> {
        match self.format {
            PayloadFormat::Json => ChatMessage::from_json(data),
            PayloadFormat::Xml => ChatMessage::from_xml(data),
        }
    }
}

/// zlib-compress `data` at the best compression level.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>, ChatError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress a zlib stream of at most `MAX_INFLATED` bytes.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, ChatError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_INFLATED as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > MAX_INFLATED {
        return Err(ChatError::TooLarge {
            limit: MAX_INFLATED,
        });
    }
    Ok(out)
}
