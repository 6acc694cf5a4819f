//! Producer Manager: one long-lived producer per connection.
//!
//! Sends never return an error. Failures are reported inside `SendResult` /
//! `BatchSendResult` so a batch can partially succeed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cluster::{OutgoingRecord, ProducerClient};
use crate::error::{KafdeskError, Result};
use crate::managers::connection::ConnectionManager;
use crate::models::{BatchSendResult, ProducerMessage, SendResult};

type ProducerSlot = Arc<OnceCell<Arc<dyn ProducerClient>>>;

pub struct ProducerManager {
    connections: Arc<ConnectionManager>,
    producers: DashMap<String, ProducerSlot>,
}

impl ProducerManager {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            producers: DashMap::new(),
        }
    }

    /// Cached producer for the connection, created and connected on first use.
    /// Concurrent first calls share one construction. A producer whose slot was
    /// closed while it was connecting is closed by its builder and never handed out.
    pub async fn get_producer(&self, connection_id: &str) -> Result<Arc<dyn ProducerClient>> {
        let slot = self
            .producers
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let built_here = AtomicBool::new(false);
        let producer = slot
            .get_or_try_init(|| async {
                let handle = self.connections.acquire(connection_id)?;
                let producer = handle.client().producer().await?;
                built_here.store(true, Ordering::Relaxed);
                info!("[ProducerManager] Producer connected for {}", connection_id);
                Ok::<_, KafdeskError>(producer)
            })
            .await?
            .clone();

        let attached = self
            .producers
            .get(connection_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), &slot));
        if !attached {
            if built_here.load(Ordering::Relaxed) {
                close_slot(connection_id, slot).await;
            }
            return Err(KafdeskError::State(format!(
                "Producer for {} was closed while connecting",
                connection_id
            )));
        }
        Ok(producer)
    }

    pub fn has_producer(&self, connection_id: &str) -> bool {
        self.producers
            .get(connection_id)
            .map(|slot| slot.initialized())
            .unwrap_or(false)
    }

    pub async fn send_message(&self, connection_id: &str, message: ProducerMessage) -> SendResult {
        match self.try_send(connection_id, message).await {
            Ok(result) => result,
            Err(e) => {
                warn!("[ProducerManager] Send on {} failed: {}", connection_id, e);
                SendResult::failed(e.to_string())
            }
        }
    }

    async fn try_send(&self, connection_id: &str, message: ProducerMessage) -> Result<SendResult> {
        let topic = message.topic.clone();
        let record = to_record(message)?;
        let producer = self.get_producer(connection_id).await?;
        let metadata = producer.send(&topic, vec![record]).await?;
        let first = metadata
            .into_iter()
            .next()
            .ok_or_else(|| KafdeskError::Unknown("Broker returned no delivery report".to_string()))?;
        Ok(SendResult {
            success: true,
            partition: Some(first.partition),
            offset: Some(first.offset.to_string()),
            timestamp: Some(first.timestamp_ms.to_string()),
            error: None,
        })
    }

    /// Sends grouped by topic. A failing topic fails all of its messages with
    /// the shared error; the other topics are unaffected. Results keep input order.
    pub async fn send_batch_messages(&self, connection_id: &str, messages: Vec<ProducerMessage>) -> BatchSendResult {
        if messages.is_empty() {
            return BatchSendResult {
                success: true,
                ..Default::default()
            };
        }

        let total = messages.len();
        let producer = match self.get_producer(connection_id).await {
            Ok(producer) => producer,
            Err(e) => {
                warn!("[ProducerManager] No producer for {}: {}", connection_id, e);
                let error = e.to_string();
                return BatchSendResult {
                    success: false,
                    success_count: 0,
                    failure_count: total,
                    results: (0..total).map(|_| SendResult::failed(error.clone())).collect(),
                };
            }
        };

        // topic -> (input index, message), in order of first appearance
        let mut groups: Vec<(String, Vec<(usize, ProducerMessage)>)> = Vec::new();
        for (index, message) in messages.into_iter().enumerate() {
            match groups.iter_mut().find(|(topic, _)| *topic == message.topic) {
                Some((_, batch)) => batch.push((index, message)),
                None => groups.push((message.topic.clone(), vec![(index, message)])),
            }
        }

        let outcomes = join_all(groups.into_iter().map(|(topic, batch)| {
            let producer = producer.clone();
            async move {
                let indices: Vec<usize> = batch.iter().map(|(i, _)| *i).collect();
                let outcome = send_topic(producer.as_ref(), &topic, batch).await;
                if let Err(e) = &outcome {
                    warn!("[ProducerManager] Batch to '{}' failed: {}", topic, e);
                }
                (indices, outcome)
            }
        }))
        .await;

        let mut results: Vec<SendResult> = vec![SendResult::default(); total];
        for (indices, outcome) in outcomes {
            match outcome {
                Ok(metadata) => {
                    for (index, meta) in indices.into_iter().zip(metadata) {
                        results[index] = SendResult {
                            success: true,
                            partition: Some(meta.partition),
                            offset: Some(meta.offset.to_string()),
                            timestamp: Some(meta.timestamp_ms.to_string()),
                            error: None,
                        };
                    }
                }
                Err(e) => {
                    let error = e.to_string();
                    for index in indices {
                        results[index] = SendResult::failed(error.clone());
                    }
                }
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = total - success_count;
        debug!(
            "[ProducerManager] Batch on {}: {} ok, {} failed",
            connection_id, success_count, failure_count
        );
        BatchSendResult {
            success: failure_count == 0,
            success_count,
            failure_count,
            results,
        }
    }

    pub async fn close_producer(&self, connection_id: &str) {
        if let Some((_, slot)) = self.producers.remove(connection_id) {
            close_slot(connection_id, slot).await;
        }
    }

    pub async fn close_all_producers(&self) {
        let ids: Vec<String> = self.producers.iter().map(|e| e.key().clone()).collect();
        let slots: Vec<(String, ProducerSlot)> = ids
            .into_iter()
            .filter_map(|id| self.producers.remove(&id))
            .collect();
        join_all(slots.into_iter().map(|(id, slot)| async move { close_slot(&id, slot).await })).await;
    }
}

async fn close_slot(connection_id: &str, slot: ProducerSlot) {
    if let Some(producer) = slot.get() {
        match producer.close().await {
            Ok(()) => info!("[ProducerManager] Producer closed for {}", connection_id),
            Err(e) => warn!("[ProducerManager] Error closing producer for {}: {}", connection_id, e),
        }
    }
}

async fn send_topic(
    producer: &dyn ProducerClient,
    topic: &str,
    batch: Vec<(usize, ProducerMessage)>,
) -> Result<Vec<crate::cluster::RecordMetadata>> {
    let records = batch
        .into_iter()
        .map(|(_, message)| to_record(message))
        .collect::<Result<Vec<_>>>()?;
    let count = records.len();
    let metadata = producer.send(topic, records).await?;
    if metadata.len() != count {
        return Err(KafdeskError::Unknown(format!(
            "Expected {} delivery reports, got {}",
            count,
            metadata.len()
        )));
    }
    Ok(metadata)
}

fn to_record(message: ProducerMessage) -> Result<OutgoingRecord> {
    if message.topic.trim().is_empty() {
        return Err(KafdeskError::Validation("Message topic must not be empty".to_string()));
    }
    let timestamp_ms = match message.timestamp.as_deref() {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| KafdeskError::Validation(format!("Invalid message timestamp '{}'", raw)))?,
        ),
        None => None,
    };

    Ok(OutgoingRecord {
        key: message.key.map(Bytes::from),
        value: Bytes::from(message.value),
        headers: message
            .headers
            .into_iter()
            .map(|h| (h.key, Bytes::from(h.value)))
            .collect(),
        partition: message.partition,
        timestamp_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Notify;

    use crate::cluster::{AdminClient, ClientFactory, ClusterClient, ConsumerClient, ConsumerSettings, RecordMetadata};
    use crate::config::ConnectionsConfig;
    use crate::models::{ConnectionConfig, ConnectionDraft, MessageHeader};
    use crate::storage::{ConnectionRegistry, CredentialVault};

    /// Producer construction blocks until the gate opens.
    struct GatedClient {
        gate: Arc<Notify>,
        closed: Arc<AtomicBool>,
    }

    struct FlagProducer {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProducerClient for FlagProducer {
        async fn send(&self, _topic: &str, _records: Vec<OutgoingRecord>) -> Result<Vec<RecordMetadata>> {
            Err(KafdeskError::Unknown("not wired".to_string()))
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ClusterClient for GatedClient {
        async fn admin(&self) -> Result<Box<dyn AdminClient>> {
            Err(KafdeskError::Unknown("not wired".to_string()))
        }

        async fn producer(&self) -> Result<Arc<dyn ProducerClient>> {
            self.gate.notified().await;
            Ok(Arc::new(FlagProducer { closed: self.closed.clone() }))
        }

        async fn consumer(&self, _settings: ConsumerSettings) -> Result<Arc<dyn ConsumerClient>> {
            Err(KafdeskError::Unknown("not wired".to_string()))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct GatedFactory(Arc<GatedClient>);

    impl ClientFactory for GatedFactory {
        fn create(&self, _config: &ConnectionConfig) -> Result<Arc<dyn ClusterClient>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_producer_closed_while_connecting_is_not_leaked() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ConnectionRegistry::open(&dir.path().join("connections.db")).unwrap());
        let vault = Arc::new(CredentialVault::open(&dir.path().join("secure.db"), &dir.path().join("vault.key")).unwrap());
        let config = ConnectionDraft {
            name: "gated".to_string(),
            brokers: vec!["localhost:9092".to_string()],
            ..Default::default()
        }
        .into_config("c1".to_string(), Utc::now());
        registry.add(&config).unwrap();

        let gate = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let client = Arc::new(GatedClient { gate: gate.clone(), closed: closed.clone() });
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(GatedFactory(client)),
            registry,
            vault,
            ConnectionsConfig::default(),
        ));
        let manager = Arc::new(ProducerManager::new(connections));

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_producer("c1").await.map(|_| ()) }
        });
        while !manager.producers.contains_key("c1") {
            tokio::task::yield_now().await;
        }

        manager.close_producer("c1").await;
        gate.notify_one();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "STATE");
        assert!(closed.load(Ordering::SeqCst), "the late producer must be closed");
        assert!(!manager.has_producer("c1"));
    }

    #[test]
    fn test_record_conversion() {
        let mut message = ProducerMessage::new("orders", "payload");
        message.key = Some("k".to_string());
        message.headers.push(MessageHeader { key: "trace".to_string(), value: "abc".to_string() });
        message.timestamp = Some("1700000000000".to_string());

        let record = to_record(message).unwrap();
        assert_eq!(record.key.as_deref(), Some(&b"k"[..]));
        assert_eq!(record.headers[0].0, "trace");
        assert_eq!(record.timestamp_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let mut message = ProducerMessage::new("orders", "payload");
        message.timestamp = Some("yesterday".to_string());
        assert_eq!(to_record(message).unwrap_err().kind(), "VALIDATION");
    }
}
