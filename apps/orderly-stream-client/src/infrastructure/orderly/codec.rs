//! Stream Codec Module
//!
//! Decodes raw frames from Orderly streams into JSON values and encodes
//! outbound frames.
//!
//! - **Text frames**: UTF-8 JSON objects
//! - **Binary frames**: gzip-compressed JSON, inflated before parsing
//!
//! A frame that fails to inflate or parse is a dropped frame, never a
//! connection failure; callers log it and keep reading.

use std::io::Read;

use flate2::read::GzDecoder;
use serde_json::Value;

use crate::application::ports::RawFrame;
use crate::domain::frame::OutboundFrame;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary frame could not be decompressed.
    #[error("gzip decode error: {0}")]
    Decompress(#[from] std::io::Error),

    /// Frame kind carries no payload to decode.
    #[error("cannot decode {0} frame")]
    Unsupported(&'static str),
}

/// JSON codec with gzip support for binary frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a raw frame into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if decompression or JSON parsing fails, or the
    /// frame is a close frame.
    pub fn decode(&self, frame: &RawFrame) -> Result<Value, CodecError> {
        match frame {
            RawFrame::Text(text) => Ok(serde_json::from_str(text)?),
            RawFrame::Binary(bytes) => {
                let text = Self::inflate(bytes)?;
                Ok(serde_json::from_str(&text)?)
            }
            RawFrame::Close(_) => Err(CodecError::Unsupported("close")),
        }
    }

    fn inflate(bytes: &[u8]) -> Result<String, CodecError> {
        let mut text = String::new();
        GzDecoder::new(bytes).read_to_string(&mut text)?;
        Ok(text)
    }

    /// Encode an outbound frame as JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, frame: &OutboundFrame) -> Result<String, CodecError> {
        Ok(serde_json::to_string(frame)?)
    }

    /// Encode an outbound frame as a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_raw(&self, frame: &OutboundFrame) -> Result<RawFrame, CodecError> {
        self.encode(frame).map(RawFrame::Text)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use serde_json::json;

    use super::*;

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decode_text_frame() {
        let codec = FrameCodec::new();
        let value = codec
            .decode(&RawFrame::Text(r#"{"topic":"bbos","data":{"price":1}}"#.to_owned()))
            .unwrap();
        assert_eq!(value, json!({"topic": "bbos", "data": {"price": 1}}));
    }

    #[test]
    fn decode_gzip_binary_frame() {
        let codec = FrameCodec::new();
        let bytes = gzip(r#"{"event":"ping","ts":1}"#);
        let value = codec.decode(&RawFrame::Binary(bytes)).unwrap();
        assert_eq!(value, json!({"event": "ping", "ts": 1}));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let codec = FrameCodec::new();
        let err = codec
            .decode(&RawFrame::Text("{not json".to_owned()))
            .unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn binary_that_is_not_gzip_is_an_error() {
        let codec = FrameCodec::new();
        let err = codec
            .decode(&RawFrame::Binary(b"plain bytes".to_vec()))
            .unwrap_err();
        assert!(matches!(err, CodecError::Decompress(_)));
    }

    #[test]
    fn close_frame_is_unsupported() {
        let codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&RawFrame::Close(None)),
            Err(CodecError::Unsupported("close"))
        ));
    }

    #[test]
    fn encode_pong() {
        let codec = FrameCodec::new();
        assert_eq!(
            codec.encode_raw(&OutboundFrame::Pong).unwrap(),
            RawFrame::Text(r#"{"event":"pong"}"#.to_owned())
        );
    }
}
