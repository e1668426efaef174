//! Frame Codec
//!
//! Stateless JSON encoding of client frames and decoding of server frames.
//! Decoding inspects the `type` discriminator first so unknown frame types
//! are reported distinctly from malformed known ones.

use super::messages::{ClientFrame, ServerFrame};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame has a `type` this client does not understand.
    #[error("unknown frame type: {0}")]
    UnknownFrameType(String),

    /// The frame is not a JSON object with a string `type`.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for `graphql-ws` frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode a client frame to a JSON text message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, frame: &ClientFrame) -> Result<String, CodecError> {
        Ok(serde_json::to_string(frame)?)
    }

    /// Decode a JSON text message into a server frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object, its `type` is
    /// missing or unknown, or the fields do not match the frame type.
    pub fn decode(&self, text: &str) -> Result<ServerFrame, CodecError> {
        let value: serde_json::Value = serde_json::from_str(text.trim())?;

        if !value.is_object() {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                truncate(text, 50)
            )));
        }

        let frame_type = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CodecError::InvalidFormat("missing \"type\" field".to_string()))?;

        if !ServerFrame::KNOWN_TYPES.contains(&frame_type) {
            return Err(CodecError::UnknownFrameType(frame_type.to_string()));
        }

        Ok(serde_json::from_value(value)?)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
