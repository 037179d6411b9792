//! Typed messages carried inside one frame's payload
//!
//! Structured payloads are JSON records tagged by a `type` field; anything
//! that fails structured decoding is treated as legacy plain text, never
//! as an error. The field names are the wire contract and must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

fn default_username() -> String {
    "anonymous".to_string()
}

/// The display name and avatar a session attaches to itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub avatar: Option<String>,
}

/// One decoded message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Announces or updates a session's identity; never broadcast verbatim
    #[serde(rename = "user_info")]
    Identity {
        #[serde(default = "default_username")]
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
    },

    /// Identity-carrying chat message
    #[serde(rename = "text")]
    ChatText {
        #[serde(default = "default_username")]
        username: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Image transfer; `data` is the base64 text form of the image bytes
    #[serde(rename = "image")]
    ChatImage {
        #[serde(default = "default_username")]
        username: String,
        filename: String,
        size: u64,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Server-generated notice (join/leave/errors/command replies)
    #[serde(rename = "system")]
    System {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Legacy untagged message; raw UTF-8 on the wire, no JSON record
    #[serde(skip)]
    PlainText { body: String },
}

impl Envelope {
    /// Build a timestamped system notice
    pub fn system(message: impl Into<String>) -> Self {
        Envelope::System {
            message: message.into(),
            timestamp: Some(Utc::now()),
        }
    }

    /// Decode one frame payload.
    ///
    /// Structured decoding is attempted first; on failure the bytes become
    /// a `PlainText` body. The fallback is a compatibility contract with
    /// bare senders, not error recovery.
    pub fn parse(bytes: &[u8]) -> Envelope {
        match serde_json::from_slice(bytes) {
            Ok(envelope) => envelope,
            Err(_) => Envelope::PlainText {
                body: String::from_utf8_lossy(bytes).into_owned(),
            },
        }
    }

    /// Encode into one frame payload; the inverse of `parse` for every
    /// non-fallback kind
    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            Envelope::PlainText { body } => Ok(body.clone().into_bytes()),
            other => serde_json::to_vec(other).map_err(|e| RelayError::Serialize(e.to_string())),
        }
    }

    /// Wire discriminator used for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Identity { .. } => "user_info",
            Envelope::ChatText { .. } => "text",
            Envelope::ChatImage { .. } => "image",
            Envelope::System { .. } => "system",
            Envelope::PlainText { .. } => "plain",
        }
    }
}
