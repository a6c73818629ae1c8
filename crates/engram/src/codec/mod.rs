//! Reversible text codec for stored memory payloads
//!
//! Payloads are text-safe (base64) so they can live in JSON records. Each
//! payload carries a small header with the original byte length, which lets
//! `decode` reject truncated or foreign data instead of returning a prefix.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;

/// Header magic for payloads produced by [`DeflateCodec`]
const MAGIC: &[u8; 3] = b"EG1";

/// Magic plus a big-endian u32 with the original byte length
const HEADER_LEN: usize = MAGIC.len() + 4;

/// Codec-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The payload was not produced by this codec, or was damaged
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    /// Encoding failed (compressor I/O)
    #[error("Encode failed: {0}")]
    Encode(String),
}

/// Capability interface for payload codecs.
///
/// Implementations must be lossless (`decode(encode(x)) == x`) and
/// deterministic so compression metrics are reproducible.
pub trait Codec: Send + Sync {
    /// Encode text into an opaque, text-safe payload
    fn encode(&self, text: &str) -> Result<String, CodecError>;

    /// Decode a payload produced by `encode`
    fn decode(&self, payload: &str) -> Result<String, CodecError>;

    /// Codec name for logging
    fn name(&self) -> &'static str;
}

/// zlib (deflate) compression wrapped in base64
#[derive(Debug, Clone, Copy)]
pub struct DeflateCodec {
    level: u32,
}

impl DeflateCodec {
    /// Create a codec with the given compression level (clamped to 0-9)
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self::new(6)
    }
}

impl Codec for DeflateCodec {
    fn encode(&self, text: &str) -> Result<String, CodecError> {
        let raw = text.as_bytes();
        let len = u32::try_from(raw.len())
            .map_err(|_| CodecError::Encode(format!("text too large: {} bytes", raw.len())))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + raw.len() / 2);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&len.to_be_bytes());

        let mut encoder = ZlibEncoder::new(buf, Compression::new(self.level));
        encoder
            .write_all(raw)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        let framed = encoder
            .finish()
            .map_err(|e| CodecError::Encode(e.to_string()))?;

        Ok(STANDARD.encode(framed))
    }

    fn decode(&self, payload: &str) -> Result<String, CodecError> {
        let framed = STANDARD
            .decode(payload.as_bytes())
            .map_err(|e| CodecError::CorruptPayload(format!("invalid base64: {e}")))?;

        if framed.len() < HEADER_LEN || &framed[..MAGIC.len()] != MAGIC {
            return Err(CodecError::CorruptPayload("missing header".to_string()));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&framed[MAGIC.len()..HEADER_LEN]);
        let expected = u32::from_be_bytes(len_bytes) as usize;

        let mut raw = Vec::with_capacity(expected);
        ZlibDecoder::new(&framed[HEADER_LEN..])
            .read_to_end(&mut raw)
            .map_err(|e| CodecError::CorruptPayload(format!("inflate failed: {e}")))?;

        if raw.len() != expected {
            return Err(CodecError::CorruptPayload(format!(
                "length mismatch: header says {expected} bytes, got {}",
                raw.len()
            )));
        }

        String::from_utf8(raw)
            .map_err(|e| CodecError::CorruptPayload(format!("invalid utf-8: {e}")))
    }

    fn name(&self) -> &'static str {
        "deflate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(text: &str) -> String {
        let codec = DeflateCodec::default();
        let payload = codec.encode(text).unwrap();
        codec.decode(&payload).unwrap()
    }

    #[test]
    fn test_round_trip_empty() {
        assert_eq!(round_trip(""), "");
    }

    #[test]
    fn test_round_trip_unicode() {
        let text = "Ünïcödé ✓ 日本語のテキスト 🦀 — mixed\nlines\ttabs";
        assert_eq!(round_trip(text), text);
    }

    #[test]
    fn test_round_trip_repeated_substrings() {
        let text = "the quick brown fox ".repeat(500);
        assert_eq!(round_trip(&text), text);
    }

    #[test]
    fn test_repetitive_text_compresses() {
        let codec = DeflateCodec::default();
        let text = "memory ".repeat(1000);
        let payload = codec.encode(&text).unwrap();
        assert!(payload.len() < text.len() / 10);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let codec = DeflateCodec::new(9);
        let text = "The quick brown fox jumps over the lazy dog.";
        assert_eq!(codec.encode(text).unwrap(), codec.encode(text).unwrap());
    }

    #[test]
    fn test_level_is_clamped() {
        assert_eq!(DeflateCodec::new(42).level(), 9);
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        let codec = DeflateCodec::default();
        let err = codec.decode("not base64 at all!!").unwrap_err();
        assert!(matches!(err, CodecError::CorruptPayload(_)));
    }

    #[test]
    fn test_decode_rejects_foreign_payload() {
        let codec = DeflateCodec::default();
        let payload = STANDARD.encode(b"hello world, definitely not ours");
        let err = codec.decode(&payload).unwrap_err();
        assert!(matches!(err, CodecError::CorruptPayload(_)));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let codec = DeflateCodec::default();
        let text = "some reasonably long text that will span a few deflate symbols ".repeat(20);
        let payload = codec.encode(&text).unwrap();
        let mut framed = STANDARD.decode(payload).unwrap();
        framed.truncate(framed.len() / 2);
        let err = codec.decode(&STANDARD.encode(framed)).unwrap_err();
        assert!(matches!(err, CodecError::CorruptPayload(_)));
    }

    #[test]
    fn test_decode_rejects_tampered_length() {
        let codec = DeflateCodec::default();
        let payload = codec.encode("short text").unwrap();
        let mut framed = STANDARD.decode(payload).unwrap();
        framed[HEADER_LEN - 1] = framed[HEADER_LEN - 1].wrapping_add(1);
        let err = codec.decode(&STANDARD.encode(framed)).unwrap_err();
        assert!(matches!(err, CodecError::CorruptPayload(_)));
    }
}
