use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerMessage {
    pub topic: String,
    #[serde(default)]
    pub key: Option<String>,
    pub value: String,
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
    #[serde(default)]
    pub partition: Option<i32>,
    /// Milliseconds since epoch, as a decimal string.
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ProducerMessage {
    pub fn new(topic: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
            headers: Vec::new(),
            partition: None,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSendResult {
    pub success: bool,
    pub success_count: usize,
    pub failure_count: usize,
    pub results: Vec<SendResult>,
}

/// Normalized record pushed to session listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: String,
    pub key: Option<String>,
    pub value: String,
    pub headers: Vec<MessageHeader>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeOptions {
    pub topic: String,
    #[serde(default)]
    pub partitions: Option<Vec<i32>>,
    #[serde(default)]
    pub from_beginning: bool,
    /// Explicit start offset applied to every consumed partition.
    #[serde(default)]
    pub from_offset: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,
}

fn default_auto_commit() -> bool {
    true
}

impl ConsumeOptions {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            auto_commit: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Stopped,
}

/// Read projection of a consumer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSession {
    pub id: String,
    pub connection_id: String,
    pub topic: String,
    pub group_id: String,
    pub status: SessionStatus,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Push channel payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ConsumerEvent {
    #[serde(rename = "consumer:message", rename_all = "camelCase")]
    Message {
        session_id: String,
        message: ConsumerMessage,
    },
    #[serde(rename = "consumer:status", rename_all = "camelCase")]
    Status {
        session_id: String,
        status: SessionStatus,
    },
}

impl ConsumerEvent {
    pub fn session_id(&self) -> &str {
        match self {
            ConsumerEvent::Message { session_id, .. } => session_id,
            ConsumerEvent::Status { session_id, .. } => session_id,
        }
    }
}
