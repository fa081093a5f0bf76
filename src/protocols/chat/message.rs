//! Chat message payload.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire format for timestamps: `2024-03-01 12:00:00.123456`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed message: {0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("bad compressed payload: {0}")]
    Compression(#[from] std::io::Error),
    #[error("payload inflates past {limit} bytes")]
    TooLarge { limit: usize },
    #[error("username must not be empty")]
    EmptyUsername,
}

/// One chat message. XML documents use `message` as the root element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "message")]
pub struct ChatMessage {
    pub username: String,
    pub text: String,
    /// Absent until stamped by the sender or the server.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp")]
    pub timestamp: Option<NaiveDateTime>,
}

impl ChatMessage {
    pub fn new(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            text: text.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn to_json(&self) -> Result<String, ChatError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ChatError> {
        serde_json::from_slice::<ChatMessage>(data)?.validated()
    }

    /// `<message><username>..</username><text>..</text><timestamp>..</timestamp></message>`
    pub fn to_xml(&self) -> Result<String, ChatError> {
        Ok(quick_xml::se::to_string(self)?)
    }

    pub fn from_xml(data: &[u8]) -> Result<Self, ChatError> {
        quick_xml::de::from_reader::<_, ChatMessage>(data)?.validated()
    }

    fn validated(self) -> Result<Self, ChatError> {
        if self.username.is_empty() {
            return Err(ChatError::EmptyUsername);
        }
        Ok(self)
    }
}

mod timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT)
                .map(Some)
                .map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}
