//! Consumer Session Manager
//!
//! Structure:
//! - SessionManager: registry of sessions keyed by session id.
//! - SessionHandle (1 per session): status, counter, consumer, cancel token.
//! - Delivery task (1 per session): pulls records and publishes them on the
//!   event channel until cancelled or the consumer fails.
//!
//! Status machine: running <-> paused, running|paused -> stopped (terminal).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cluster::{ConsumerSettings, StartPosition, Subscription, TopicPartitionOffset};
use crate::config::ConsumerConfig;
use crate::error::{KafdeskError, Result};
use crate::managers::connection::ConnectionManager;
use crate::managers::consumer::session::{to_consumer_message, SessionHandle};
use crate::models::{ConsumeOptions, ConsumerEvent, ConsumerSession, SessionStatus};

const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionHandle>>,
    connections: Arc<ConnectionManager>,
    events: broadcast::Sender<ConsumerEvent>,
    config: ConsumerConfig,
}

impl SessionManager {
    pub fn new(connections: Arc<ConnectionManager>, config: ConsumerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            sessions: DashMap::new(),
            connections,
            events,
            config,
        }
    }

    /// Push channel carrying `consumer:message` and `consumer:status` events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    // ==========================================
    // LIFECYCLE
    // ==========================================

    /// Returns once the subscription is in place. On failure nothing is registered.
    pub async fn create_session(&self, connection_id: &str, options: ConsumeOptions) -> Result<ConsumerSession> {
        let start = start_position(&options)?;
        if options.topic.trim().is_empty() {
            return Err(KafdeskError::Validation("Topic must not be empty".to_string()));
        }
        if matches!(&options.partitions, Some(p) if p.is_empty()) {
            return Err(KafdeskError::Validation("Partition list must not be empty".to_string()));
        }

        let handle = self.connections.acquire(connection_id)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let group_id = options
            .group_id
            .clone()
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| format!("kafdesk-{}", session_id));

        let consumer = handle
            .client()
            .consumer(ConsumerSettings {
                group_id: group_id.clone(),
                client_id: String::new(),
                session_timeout_ms: self.config.session_timeout_ms,
                heartbeat_interval_ms: self.config.heartbeat_interval_ms,
            })
            .await?;

        let subscription = Subscription {
            topic: options.topic.clone(),
            partitions: options.partitions.clone(),
            start,
        };
        if let Err(e) = consumer.subscribe(subscription).await {
            if let Err(disconnect_err) = consumer.disconnect().await {
                debug!("[SessionManager] Cleanup after failed subscribe: {}", disconnect_err);
            }
            return Err(e);
        }

        let session = Arc::new(SessionHandle::new(
            session_id.clone(),
            connection_id.to_string(),
            group_id,
            options,
            consumer,
        ));
        self.sessions.insert(session_id.clone(), session.clone());

        let task = tokio::spawn(run_delivery(session.clone(), self.events.clone()));
        *session.task.lock() = Some(task);

        info!(
            "[SessionManager] Session {} consuming '{}' as group '{}'",
            session_id, session.options.topic, session.group_id
        );
        Ok(session.snapshot())
    }

    pub async fn pause_session(&self, session_id: &str) -> Result<()> {
        let session = self.get_handle(session_id)?;
        let _control = session.control.lock().await;
        require_status(&session, SessionStatus::Running, "pause")?;

        session.consumer.pause(&session.options.topic).await?;
        let previous = session.transition(SessionStatus::Paused, || {
            self.publish_status(&session, SessionStatus::Paused)
        });
        if previous == SessionStatus::Stopped {
            return Err(KafdeskError::State(format!("Session {} was stopped", session_id)));
        }
        info!("[SessionManager] Session {} paused", session_id);
        Ok(())
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        let session = self.get_handle(session_id)?;
        let _control = session.control.lock().await;
        require_status(&session, SessionStatus::Paused, "resume")?;

        session.consumer.resume(&session.options.topic).await?;
        let previous = session.transition(SessionStatus::Running, || {
            self.publish_status(&session, SessionStatus::Running)
        });
        if previous == SessionStatus::Stopped {
            return Err(KafdeskError::State(format!("Session {} was stopped", session_id)));
        }
        info!("[SessionManager] Session {} resumed", session_id);
        Ok(())
    }

    /// No-op for unknown ids. The session leaves the registry even when the
    /// disconnect fails; the disconnect error is still returned.
    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let Some(session) = self.sessions.get(session_id).map(|s| s.value().clone()) else {
            return Ok(());
        };

        let previous = session.set_status(SessionStatus::Stopped);
        session.cancel.cancel();

        // Let an in-flight delivery finish before the consumer goes away
        let task = session.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("[SessionManager] Delivery task of {} did not stop in time; aborting", session_id);
                task.abort();
            }
        }

        let disconnected = session.consumer.disconnect().await;
        self.sessions.remove(session_id);

        if previous != SessionStatus::Stopped {
            self.publish_status(&session, SessionStatus::Stopped);
        }
        match &disconnected {
            Ok(()) => info!("[SessionManager] Session {} stopped", session_id),
            Err(e) => warn!("[SessionManager] Session {} stopped; disconnect failed: {}", session_id, e),
        }
        disconnected
    }

    pub async fn stop_all_sessions(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        self.stop_many(ids).await;
    }

    /// Stops every session bound to `connection_id`.
    pub async fn stop_sessions_for_connection(&self, connection_id: &str) {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().connection_id == connection_id)
            .map(|e| e.key().clone())
            .collect();
        self.stop_many(ids).await;
    }

    async fn stop_many(&self, ids: Vec<String>) {
        let results = join_all(ids.iter().map(|id| self.stop_session(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("[SessionManager] Stopping session {} reported: {}", id, e);
            }
        }
    }

    /// Repositions one partition. Allowed while running or paused; status is unchanged.
    pub async fn seek_to_offset(&self, session_id: &str, partition: i32, offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(KafdeskError::Validation(format!("Offset must be >= 0 (got {})", offset)));
        }
        let session = self.get_handle(session_id)?;
        let _control = session.control.lock().await;
        if session.status() == SessionStatus::Stopped {
            return Err(KafdeskError::State(format!("Session {} is stopped", session_id)));
        }
        if let Some(partitions) = &session.options.partitions {
            if !partitions.contains(&partition) {
                return Err(KafdeskError::Validation(format!(
                    "Session {} does not consume partition {}",
                    session_id, partition
                )));
            }
        }

        session.consumer.seek(&session.options.topic, partition, offset).await?;
        info!(
            "[SessionManager] Session {} seeked partition {} to offset {}",
            session_id, partition, offset
        );
        Ok(())
    }

    // ==========================================
    // QUERIES
    // ==========================================

    pub fn get_session(&self, session_id: &str) -> Option<ConsumerSession> {
        self.sessions.get(session_id).map(|s| s.snapshot())
    }

    /// Oldest first.
    pub fn get_all_sessions(&self) -> Vec<ConsumerSession> {
        let mut sessions: Vec<ConsumerSession> = self.sessions.iter().map(|s| s.snapshot()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn get_handle(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| KafdeskError::not_found("Session", session_id))
    }

    fn publish_status(&self, session: &SessionHandle, status: SessionStatus) {
        let _ = self.events.send(ConsumerEvent::Status {
            session_id: session.id.clone(),
            status,
        });
    }
}

fn start_position(options: &ConsumeOptions) -> Result<StartPosition> {
    match options.from_offset.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => {
            let offset: i64 = raw
                .parse()
                .map_err(|_| KafdeskError::Validation(format!("fromOffset '{}' is not a number", raw)))?;
            if offset < 0 {
                return Err(KafdeskError::Validation(format!("fromOffset must be >= 0 (got {})", offset)));
            }
            Ok(StartPosition::Offset(offset))
        }
        None => Ok(StartPosition::Committed {
            from_beginning: options.from_beginning,
        }),
    }
}

fn require_status(session: &SessionHandle, expected: SessionStatus, action: &str) -> Result<()> {
    let current = session.status();
    if current == expected {
        Ok(())
    } else {
        Err(KafdeskError::State(format!(
            "Cannot {} session {}: it is {:?}",
            action,
            session.id,
            current
        )))
    }
}

// ==========================================
// DELIVERY LOOP
// ==========================================

async fn run_delivery(session: Arc<SessionHandle>, events: broadcast::Sender<ConsumerEvent>) {
    loop {
        let received = tokio::select! {
            _ = session.cancel.cancelled() => break,
            received = session.consumer.recv() => received,
        };

        let record = match received {
            Ok(record) => record,
            Err(e) => {
                if session.status() == SessionStatus::Stopped {
                    break;
                }
                error!("[SessionManager] Session {} failed: {}", session.id, e);
                session.set_status(SessionStatus::Stopped);
                session.cancel.cancel();
                let _ = events.send(ConsumerEvent::Status {
                    session_id: session.id.clone(),
                    status: SessionStatus::Stopped,
                });
                if let Err(e) = session.consumer.disconnect().await {
                    debug!("[SessionManager] Disconnect after failure of {}: {}", session.id, e);
                }
                break;
            }
        };

        // Held through delivery: no message follows an acknowledged pause
        let control = session.control.lock().await;
        match session.status() {
            SessionStatus::Stopped => break,
            SessionStatus::Paused => {
                // Rewind so this record is the first one after resume
                if let Err(e) = session.consumer.pause(&record.topic).await {
                    warn!("[SessionManager] Pausing consumer of {} failed: {}", session.id, e);
                }
                if let Err(e) = session
                    .consumer
                    .seek(&record.topic, record.partition, record.offset)
                    .await
                {
                    warn!("[SessionManager] Rewind of {} failed: {}", session.id, e);
                }
                continue;
            }
            SessionStatus::Running => {}
        }

        if session.options.auto_commit {
            let offsets = [TopicPartitionOffset {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset + 1,
            }];
            if let Err(e) = session.consumer.commit(&offsets).await {
                warn!("[SessionManager] Commit for {} failed: {}", session.id, e);
            }
        }

        session.record_delivered();
        let _ = events.send(ConsumerEvent::Message {
            session_id: session.id.clone(),
            message: to_consumer_message(record),
        });
        drop(control);

        tokio::task::yield_now().await;
    }
    debug!("[SessionManager] Delivery loop of {} exited", session.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_position_from_options() {
        let mut options = ConsumeOptions::topic("t");
        assert_eq!(
            start_position(&options).unwrap(),
            StartPosition::Committed { from_beginning: false }
        );

        options.from_beginning = true;
        assert_eq!(
            start_position(&options).unwrap(),
            StartPosition::Committed { from_beginning: true }
        );

        options.from_offset = Some("42".to_string());
        assert_eq!(start_position(&options).unwrap(), StartPosition::Offset(42));

        options.from_offset = Some("-1".to_string());
        assert!(start_position(&options).is_err());

        options.from_offset = Some("abc".to_string());
        assert_eq!(start_position(&options).unwrap_err().kind(), "VALIDATION");
    }
}
