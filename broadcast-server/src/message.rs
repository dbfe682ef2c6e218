use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A chat message as it travels between server and clients.
///
/// Fields are private so a message cannot change after it was built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    sender: String,
    content: String,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Stamps a new message with the current time.
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::at(sender, content, Utc::now())
    }

    pub fn at(
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            timestamp,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Decodes every message packed into one frame.
    ///
    /// The outbound pump may join several queued messages with `\n`, so each
    /// non-blank line is an independent JSON document.
    pub fn decode_frame(frame: &str) -> impl Iterator<Item = serde_json::Result<Self>> + '_ {
        frame
            .split('\n')
            .map(|line| line.trim_end_matches(LINE_ENDINGS))
            .filter(|line| !line.trim().is_empty())
            .map(Self::decode)
    }
}
