use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ConsumedRecord, ConsumerClient};
use crate::models::{ConsumeOptions, ConsumerMessage, ConsumerSession, MessageHeader, SessionStatus};

/// Live state of one consumption session.
pub struct SessionHandle {
    pub id: String,
    pub connection_id: String,
    pub group_id: String,
    pub options: ConsumeOptions,
    pub created_at: DateTime<Utc>,
    pub(crate) consumer: Arc<dyn ConsumerClient>,
    pub(crate) cancel: CancellationToken,
    /// Serializes pause/resume/seek against the delivery loop's paused-record rewind
    pub(crate) control: tokio::sync::Mutex<()>,
    pub(crate) task: Mutex<Option<JoinHandle<()>>>,
    status: Mutex<SessionStatus>,
    message_count: AtomicU64,
}

impl SessionHandle {
    pub(crate) fn new(
        id: String,
        connection_id: String,
        group_id: String,
        options: ConsumeOptions,
        consumer: Arc<dyn ConsumerClient>,
    ) -> Self {
        Self {
            id,
            connection_id,
            group_id,
            options,
            created_at: Utc::now(),
            consumer,
            cancel: CancellationToken::new(),
            control: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
            status: Mutex::new(SessionStatus::Running),
            message_count: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Sets the new status; returns the previous one. `Stopped` is terminal.
    pub(crate) fn set_status(&self, status: SessionStatus) -> SessionStatus {
        let mut current = self.status.lock();
        let previous = *current;
        if previous != SessionStatus::Stopped {
            *current = status;
        }
        previous
    }

    /// Like `set_status`, but `notify` runs under the status lock and only if
    /// the session was not stopped, so no notification can trail the stop.
    pub(crate) fn transition(&self, status: SessionStatus, notify: impl FnOnce()) -> SessionStatus {
        let mut current = self.status.lock();
        let previous = *current;
        if previous != SessionStatus::Stopped {
            *current = status;
            notify();
        }
        previous
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    pub(crate) fn record_delivered(&self) -> u64 {
        self.message_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn snapshot(&self) -> ConsumerSession {
        ConsumerSession {
            id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            topic: self.options.topic.clone(),
            group_id: self.group_id.clone(),
            status: self.status(),
            message_count: self.message_count(),
            created_at: self.created_at,
        }
    }
}

pub(crate) fn to_consumer_message(record: ConsumedRecord) -> ConsumerMessage {
    ConsumerMessage {
        topic: record.topic,
        partition: record.partition,
        offset: record.offset.to_string(),
        key: record.key.map(|k| String::from_utf8_lossy(&k).into_owned()),
        value: record
            .value
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default(),
        headers: record
            .headers
            .into_iter()
            .map(|(key, value)| MessageHeader {
                key,
                value: String::from_utf8_lossy(&value).into_owned(),
            })
            .collect(),
        timestamp: record.timestamp_ms.to_string(),
    }
}
