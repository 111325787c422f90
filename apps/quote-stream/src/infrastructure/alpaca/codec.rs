//! Stream Codec Module
//!
//! JSON encoding and decoding for the quote stream's text frames.
//!
//! The feed sends either a batch frame (a JSON array of message objects)
//! or a singleton frame (one bare object), and may mix control messages
//! and quotes in one batch:
//!
//! ```json
//! [{"T":"subscription","quotes":["ACA"]},{"T":"q","S":"ACA","bp":75.46,"ap":65.0}]
//! ```

use serde_json::Value;

use crate::domain::streaming::{QUOTE_MESSAGE_TYPE, Quote};
use crate::infrastructure::alpaca::messages::{
    ErrorMessage, FeedMessage, SubscriptionMessage, SuccessMessage,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary frame was not valid UTF-8.
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the quote stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame into its messages, in wire order.
    ///
    /// An empty array decodes to no messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, is neither an array nor
    /// an object, contains a non-object element, or contains a malformed
    /// control message or quote.
    pub fn decode(&self, text: &str) -> Result<Vec<FeedMessage>, CodecError> {
        let trimmed = text.trim();

        match serde_json::from_str::<Value>(trimmed)? {
            Value::Array(values) => values.into_iter().map(decode_value).collect(),
            value @ Value::Object(_) => Ok(vec![decode_value(value)?]),
            _ => Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {}",
                preview(trimmed)
            ))),
        }
    }

    /// Decode a binary frame carrying UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not UTF-8 or fail [`Self::decode`].
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<Vec<FeedMessage>, CodecError> {
        self.decode(std::str::from_utf8(bytes)?)
    }

    /// Encode a value to JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}

fn decode_value(value: Value) -> Result<FeedMessage, CodecError> {
    if !value.is_object() {
        return Err(CodecError::InvalidFormat(format!(
            "expected message object, got: {}",
            preview(&value.to_string())
        )));
    }

    let msg_type = value.get("T").and_then(Value::as_str).map(str::to_owned);

    let message = match msg_type.as_deref() {
        Some("success") => FeedMessage::Success(serde_json::from_value::<SuccessMessage>(value)?),
        Some("error") => FeedMessage::Error(serde_json::from_value::<ErrorMessage>(value)?),
        Some("subscription") => {
            FeedMessage::Subscription(serde_json::from_value::<SubscriptionMessage>(value)?)
        }
        Some(QUOTE_MESSAGE_TYPE) => FeedMessage::Quote(serde_json::from_value::<Quote>(value)?),
        // Untyped objects that name a symbol are quotes from peers that
        // leave the type blank.
        Some("") | None if value.get("S").is_some() => {
            FeedMessage::Quote(serde_json::from_value::<Quote>(value)?)
        }
        Some(other) => FeedMessage::Ignored(other.to_string()),
        None => {
            return Err(CodecError::InvalidFormat(
                "message object has neither \"T\" nor \"S\"".to_string(),
            ));
        }
    };

    Ok(message)
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}
