//! librdkafka-backed cluster client.
//!
//! librdkafka's metadata, watermark and group calls block the calling thread,
//! so they run on the blocking pool. Produce and consume use the native async
//! `FutureProducer` / `StreamConsumer`.
//!
//! The controller id is not exposed by librdkafka's metadata API and is always
//! reported as `None`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use rdkafka::admin::{
    AdminClient as RdAdminClient, AdminOptions, AlterConfig, NewPartitions, NewTopic as RdNewTopic, ResourceSpecifier,
    TopicReplication,
};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, warn};

use crate::cluster::{
    AdminClient, ClientFactory, ClusterClient, CommittedOffset, ConsumedRecord, ConsumerClient, ConsumerSettings,
    GroupDescription, GroupListing, GroupMemberDescription, NewTopic, OutgoingRecord, PartitionMetadata,
    ProducerClient, RecordMetadata, StartPosition, Subscription, TopicMetadata, TopicPartitionOffset, Watermarks,
};
use crate::error::{KafdeskError, Result};
use crate::models::{is_internal_topic, Broker, ClusterInfo, ConfigEntry, ConnectionConfig};

const FALLBACK_CONNECTION_TIMEOUT_MS: u64 = 10_000;
const FALLBACK_REQUEST_TIMEOUT_MS: u64 = 30_000;
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ==========================================
// ERROR MAPPING
// ==========================================

fn from_code(code: RDKafkaErrorCode, message: String) -> KafdeskError {
    match code {
        RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::GroupIdNotFound => {
            KafdeskError::NotFound(message)
        }
        RDKafkaErrorCode::SaslAuthenticationFailed
        | RDKafkaErrorCode::Authentication
        | RDKafkaErrorCode::TopicAuthorizationFailed
        | RDKafkaErrorCode::GroupAuthorizationFailed => KafdeskError::Authentication(message),
        RDKafkaErrorCode::BrokerTransportFailure | RDKafkaErrorCode::AllBrokersDown => {
            KafdeskError::Connection(message)
        }
        RDKafkaErrorCode::RequestTimedOut | RDKafkaErrorCode::OperationTimedOut => KafdeskError::Timeout(message),
        RDKafkaErrorCode::TopicAlreadyExists
        | RDKafkaErrorCode::InvalidReplicationFactor
        | RDKafkaErrorCode::InvalidPartitions
        | RDKafkaErrorCode::InvalidConfig => KafdeskError::Validation(message),
        // The group has live members: delete or standalone commit refused
        RDKafkaErrorCode::NonEmptyGroup
        | RDKafkaErrorCode::UnknownMemberId
        | RDKafkaErrorCode::IllegalGeneration
        | RDKafkaErrorCode::RebalanceInProgress => KafdeskError::State(message),
        _ => KafdeskError::classify(message),
    }
}

fn map_err(error: KafkaError) -> KafdeskError {
    let message = error.to_string();
    match error.rdkafka_error_code() {
        Some(code) => from_code(code, message),
        None => KafdeskError::classify(message),
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KafdeskError::Unknown(format!("Blocking task failed: {}", e)))?
}

// ==========================================
// CLIENT CONFIG
// ==========================================

fn client_config(config: &ConnectionConfig) -> ClientConfig {
    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", config.brokers.join(","))
        .set("client.id", config.client_id_or_default())
        .set(
            "socket.connection.setup.timeout.ms",
            config.connection_timeout.unwrap_or(FALLBACK_CONNECTION_TIMEOUT_MS).to_string(),
        )
        .set(
            "socket.timeout.ms",
            config.request_timeout.unwrap_or(FALLBACK_REQUEST_TIMEOUT_MS).to_string(),
        );

    let protocol = match (config.sasl.is_some(), config.tls_enabled()) {
        (true, true) => "SASL_SSL",
        (true, false) => "SASL_PLAINTEXT",
        (false, true) => "SSL",
        (false, false) => "PLAINTEXT",
    };
    cfg.set("security.protocol", protocol);

    if let Some(sasl) = &config.sasl {
        cfg.set("sasl.mechanisms", sasl.mechanism.as_config_str())
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }

    if let Some(tls) = config.ssl.as_ref().filter(|t| t.enabled) {
        if let Some(ca) = &tls.ca {
            cfg.set("ssl.ca.pem", ca);
        }
        if let Some(cert) = &tls.cert {
            cfg.set("ssl.certificate.pem", cert);
        }
        if let Some(key) = &tls.key {
            cfg.set("ssl.key.pem", key);
        }
        cfg.set("enable.ssl.certificate.verification", tls.reject_unauthorized.to_string());
    }

    cfg
}

/// Forces a metadata round trip so connection and auth failures surface now.
async fn probe(config: ClientConfig, timeout: Duration) -> Result<()> {
    blocking(move || {
        let consumer: BaseConsumer = config.create().map_err(map_err)?;
        consumer.fetch_metadata(None, timeout).map_err(map_err)?;
        Ok(())
    })
    .await
}

pub struct RdKafkaFactory;

impl ClientFactory for RdKafkaFactory {
    fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn ClusterClient>> {
        Ok(Arc::new(RdKafkaClient {
            config: client_config(config),
            timeout: Duration::from_millis(config.request_timeout.unwrap_or(FALLBACK_REQUEST_TIMEOUT_MS)),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct RdKafkaClient {
    config: ClientConfig,
    timeout: Duration,
    closed: AtomicBool,
}

impl RdKafkaClient {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KafdeskError::Connection("Client has been closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for RdKafkaClient {
    async fn admin(&self) -> Result<Box<dyn AdminClient>> {
        self.ensure_open()?;
        probe(self.config.clone(), self.timeout).await?;
        let admin: RdAdminClient<DefaultClientContext> = self.config.create().map_err(map_err)?;
        Ok(Box::new(RdKafkaAdmin {
            admin: Arc::new(admin),
            config: self.config.clone(),
            timeout: self.timeout,
        }))
    }

    async fn producer(&self) -> Result<Arc<dyn ProducerClient>> {
        self.ensure_open()?;
        let producer: FutureProducer = self
            .config
            .clone()
            .set("message.timeout.ms", self.timeout.as_millis().to_string())
            .create()
            .map_err(map_err)?;

        let probe_handle = producer.clone();
        let timeout = self.timeout;
        blocking(move || {
            use rdkafka::producer::Producer;
            probe_handle.client().fetch_metadata(None, timeout).map_err(map_err)?;
            Ok(())
        })
        .await?;

        Ok(Arc::new(RdKafkaProducer {
            producer,
            timeout: self.timeout,
        }))
    }

    async fn consumer(&self, settings: ConsumerSettings) -> Result<Arc<dyn ConsumerClient>> {
        self.ensure_open()?;
        let mut config = self.config.clone();
        config
            .set("group.id", &settings.group_id)
            .set("session.timeout.ms", settings.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", settings.heartbeat_interval_ms.to_string())
            .set("enable.auto.commit", "false")
            .set("allow.auto.create.topics", "false");
        if !settings.client_id.is_empty() {
            config.set("client.id", &settings.client_id);
        }

        probe(config.clone(), self.timeout).await?;
        Ok(Arc::new(RdKafkaConsumer {
            config,
            timeout: self.timeout,
            consumer: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<()> {
        // librdkafka handles shut down when the last reference drops
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ==========================================
// ADMIN
// ==========================================

pub struct RdKafkaAdmin {
    admin: Arc<RdAdminClient<DefaultClientContext>>,
    config: ClientConfig,
    timeout: Duration,
}

impl RdKafkaAdmin {
    fn options(&self) -> AdminOptions {
        AdminOptions::new()
            .operation_timeout(Some(self.timeout))
            .request_timeout(Some(self.timeout))
    }

    async fn metadata(&self, topic: Option<String>) -> Result<Vec<TopicMetadata>> {
        let admin = self.admin.clone();
        let timeout = self.timeout;
        blocking(move || {
            let metadata = admin
                .inner()
                .fetch_metadata(topic.as_deref(), timeout)
                .map_err(map_err)?;
            Ok(metadata
                .topics()
                .iter()
                .filter(|t| t.error().is_none())
                .map(|t| TopicMetadata {
                    name: t.name().to_string(),
                    partitions: t
                        .partitions()
                        .iter()
                        .map(|p| PartitionMetadata {
                            id: p.id(),
                            leader: p.leader(),
                            replicas: p.replicas().to_vec(),
                            isr: p.isr().to_vec(),
                            offline_replicas: p
                                .replicas()
                                .iter()
                                .filter(|r| !p.isr().contains(r))
                                .copied()
                                .collect(),
                        })
                        .collect(),
                })
                .collect())
        })
        .await
    }

    /// The create ack arrives before leader election; poll metadata until
    /// every partition has a leader or the admin timeout runs out.
    async fn await_leaders(&self, topic: &str, num_partitions: i32) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.metadata(Some(topic.to_string())).await {
                Ok(topics) => {
                    let ready = topics.iter().find(|t| t.name == topic).is_some_and(|t| {
                        t.partitions.len() as i32 >= num_partitions && t.partitions.iter().all(|p| p.leader >= 0)
                    });
                    if ready {
                        return Ok(());
                    }
                }
                Err(KafdeskError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(KafdeskError::Timeout(format!(
                    "Topic '{}' was created but its partition leaders were not elected within {}ms",
                    topic,
                    self.timeout.as_millis()
                )));
            }
            debug!("[RdKafka] Waiting for leaders of '{}'", topic);
            tokio::time::sleep(LEADER_POLL_INTERVAL).await;
        }
    }

    fn group_consumer(&self, group_id: &str) -> Result<BaseConsumer> {
        self.config
            .clone()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(map_err)
    }
}

#[async_trait]
impl AdminClient for RdKafkaAdmin {
    async fn describe_cluster(&self) -> Result<ClusterInfo> {
        let admin = self.admin.clone();
        let timeout = self.timeout;
        blocking(move || {
            let metadata = admin.inner().fetch_metadata(None, timeout).map_err(map_err)?;
            let brokers = metadata
                .brokers()
                .iter()
                .map(|b| Broker {
                    node_id: b.id(),
                    host: b.host().to_string(),
                    port: u16::try_from(b.port()).unwrap_or(0),
                    rack: None,
                })
                .collect();
            Ok(ClusterInfo {
                brokers,
                controller_id: None,
                cluster_id: admin.inner().fetch_cluster_id(timeout),
            })
        })
        .await
    }

    async fn list_topics(&self) -> Result<Vec<TopicMetadata>> {
        self.metadata(None).await
    }

    async fn topic_metadata(&self, topic: &str) -> Result<Option<TopicMetadata>> {
        match self.metadata(Some(topic.to_string())).await {
            Ok(topics) => Ok(topics.into_iter().find(|t| t.name == topic)),
            Err(KafdeskError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn describe_topic_configs(&self, topic: &str) -> Result<Vec<ConfigEntry>> {
        let results = self
            .admin
            .describe_configs(&[ResourceSpecifier::Topic(topic)], &self.options())
            .await
            .map_err(map_err)?;

        let mut entries = Vec::new();
        for result in results {
            let resource = result.map_err(|code| from_code(code, format!("Describe configs of '{}': {}", topic, code)))?;
            entries.extend(resource.entries.into_iter().map(|e| ConfigEntry {
                name: e.name,
                value: e.value,
                source: format!("{:?}", e.source),
                is_sensitive: e.is_sensitive,
                is_read_only: e.is_read_only,
            }));
        }
        Ok(entries)
    }

    async fn create_topic(&self, topic: NewTopic) -> Result<()> {
        let mut new_topic = RdNewTopic::new(
            &topic.name,
            topic.num_partitions,
            TopicReplication::Fixed(topic.replication_factor),
        );
        for (key, value) in &topic.configs {
            new_topic = new_topic.set(key, value);
        }

        let results = self
            .admin
            .create_topics(&[new_topic], &self.options())
            .await
            .map_err(map_err)?;
        for result in results {
            result.map_err(|(name, code)| from_code(code, format!("Create topic '{}': {}", name, code)))?;
        }
        self.await_leaders(&topic.name, topic.num_partitions).await
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        let results = self
            .admin
            .delete_topics(&[topic], &self.options())
            .await
            .map_err(map_err)?;
        for result in results {
            result.map_err(|(name, code)| from_code(code, format!("Delete topic '{}': {}", name, code)))?;
        }
        Ok(())
    }

    async fn alter_topic_config(&self, topic: &str, entries: Vec<(String, String)>) -> Result<()> {
        let mut alter = AlterConfig::new(ResourceSpecifier::Topic(topic));
        for (key, value) in &entries {
            alter = alter.set(key, value);
        }

        let results = self
            .admin
            .alter_configs(&[alter], &self.options())
            .await
            .map_err(map_err)?;
        for result in results {
            result.map_err(|(_, code)| from_code(code, format!("Alter config of '{}': {}", topic, code)))?;
        }
        Ok(())
    }

    async fn create_partitions(&self, topic: &str, total_count: i32) -> Result<()> {
        let total = usize::try_from(total_count)
            .map_err(|_| KafdeskError::Validation(format!("Invalid partition count {}", total_count)))?;
        let results = self
            .admin
            .create_partitions(&[NewPartitions::new(topic, total)], &self.options())
            .await
            .map_err(map_err)?;
        for result in results {
            result.map_err(|(name, code)| from_code(code, format!("Create partitions on '{}': {}", name, code)))?;
        }
        Ok(())
    }

    async fn watermarks(&self, topic: &str) -> Result<Vec<Watermarks>> {
        let partitions: Vec<i32> = self
            .topic_metadata(topic)
            .await?
            .ok_or_else(|| KafdeskError::not_found("Topic", topic))?
            .partitions
            .iter()
            .map(|p| p.id)
            .collect();

        let admin = self.admin.clone();
        let timeout = self.timeout;
        let topic = topic.to_string();
        blocking(move || {
            partitions
                .into_iter()
                .map(|partition| {
                    let (low, high) = admin
                        .inner()
                        .fetch_watermarks(&topic, partition, timeout)
                        .map_err(map_err)?;
                    Ok(Watermarks { partition, low, high })
                })
                .collect()
        })
        .await
    }

    async fn offsets_for_times(&self, topic: &str, partitions: &[i32], timestamp_ms: i64) -> Result<Vec<(i32, Option<i64>)>> {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition_offset(topic, *partition, Offset::Offset(timestamp_ms))
                .map_err(map_err)?;
        }

        let consumer = self.group_consumer("kafdesk-offset-lookup")?;
        let timeout = self.timeout;
        blocking(move || {
            let resolved = consumer.offsets_for_times(tpl, timeout).map_err(map_err)?;
            Ok(resolved
                .elements()
                .iter()
                .map(|e| match e.offset() {
                    Offset::Offset(offset) if offset >= 0 => (e.partition(), Some(offset)),
                    _ => (e.partition(), None),
                })
                .collect())
        })
        .await
    }

    async fn list_groups(&self) -> Result<Vec<GroupListing>> {
        let admin = self.admin.clone();
        let timeout = self.timeout;
        blocking(move || {
            let groups = admin.inner().fetch_group_list(None, timeout).map_err(map_err)?;
            Ok(groups
                .groups()
                .iter()
                .map(|g| GroupListing {
                    group_id: g.name().to_string(),
                    state: g.state().to_string(),
                    protocol_type: g.protocol_type().to_string(),
                })
                .collect())
        })
        .await
    }

    async fn describe_group(&self, group_id: &str) -> Result<Option<GroupDescription>> {
        let admin = self.admin.clone();
        let timeout = self.timeout;
        let group_id = group_id.to_string();
        blocking(move || {
            let groups = admin
                .inner()
                .fetch_group_list(Some(&group_id), timeout)
                .map_err(map_err)?;
            let Some(group) = groups.groups().iter().find(|g| g.name() == group_id) else {
                return Ok(None);
            };
            if group.state() == "Dead" && group.members().is_empty() {
                return Ok(None);
            }

            Ok(Some(GroupDescription {
                group_id: group.name().to_string(),
                state: group.state().to_string(),
                protocol: group.protocol().to_string(),
                protocol_type: group.protocol_type().to_string(),
                members: group
                    .members()
                    .iter()
                    .map(|m| GroupMemberDescription {
                        member_id: m.id().to_string(),
                        client_id: m.client_id().to_string(),
                        client_host: m.client_host().to_string(),
                        assignment: m.assignment().map(Bytes::copy_from_slice).unwrap_or_default(),
                    })
                    .collect(),
            }))
        })
        .await
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        let results = self
            .admin
            .delete_groups(&[group_id], &self.options())
            .await
            .map_err(map_err)?;
        for result in results {
            result.map_err(|(name, code)| from_code(code, format!("Delete group '{}': {}", name, code)))?;
        }
        Ok(())
    }

    async fn committed_offsets(&self, group_id: &str, topic: Option<&str>) -> Result<Vec<CommittedOffset>> {
        let topics = match topic {
            Some(topic) => self.metadata(Some(topic.to_string())).await?,
            None => self
                .metadata(None)
                .await?
                .into_iter()
                .filter(|t| !is_internal_topic(&t.name))
                .collect(),
        };

        let mut tpl = TopicPartitionList::new();
        for t in &topics {
            for p in &t.partitions {
                tpl.add_partition(&t.name, p.id);
            }
        }
        if tpl.count() == 0 {
            return Ok(Vec::new());
        }

        let consumer = self.group_consumer(group_id)?;
        let timeout = self.timeout;
        blocking(move || {
            let committed = consumer.committed_offsets(tpl, timeout).map_err(map_err)?;
            Ok(committed
                .elements()
                .iter()
                .filter_map(|e| match e.offset() {
                    Offset::Offset(offset) if offset >= 0 => Some(CommittedOffset {
                        topic: e.topic().to_string(),
                        partition: e.partition(),
                        offset,
                        committed_at: None,
                    }),
                    _ => None,
                })
                .collect())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ==========================================
// PRODUCER
// ==========================================

pub struct RdKafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

#[async_trait]
impl ProducerClient for RdKafkaProducer {
    async fn send(&self, topic: &str, records: Vec<OutgoingRecord>) -> Result<Vec<RecordMetadata>> {
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let mut headers = OwnedHeaders::new();
            for (key, value) in &record.headers {
                headers = headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_ref()),
                });
            }

            let timestamp_ms = record.timestamp_ms.unwrap_or_else(|| Utc::now().timestamp_millis());
            let mut future_record = FutureRecord::to(topic)
                .payload(record.value.as_ref())
                .headers(headers)
                .timestamp(timestamp_ms);
            if let Some(key) = &record.key {
                future_record = future_record.key(key.as_ref());
            }
            if let Some(partition) = record.partition {
                future_record = future_record.partition(partition);
            }

            let (partition, offset) = self
                .producer
                .send(future_record, self.timeout)
                .await
                .map_err(|(e, _)| map_err(e))?;
            out.push(RecordMetadata {
                partition,
                offset,
                timestamp_ms,
            });
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        use rdkafka::producer::Producer;
        let producer = self.producer.clone();
        let timeout = self.timeout;
        blocking(move || producer.flush(timeout).map_err(map_err)).await
    }
}

// ==========================================
// CONSUMER
// ==========================================

pub struct RdKafkaConsumer {
    config: ClientConfig,
    timeout: Duration,
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
}

impl RdKafkaConsumer {
    fn current(&self) -> Result<Arc<StreamConsumer>> {
        self.consumer
            .lock()
            .clone()
            .ok_or_else(|| KafdeskError::State("Consumer is not subscribed".to_string()))
    }

    /// Builds the underlying consumer on first use. The reset policy is only
    /// known once the subscription arrives.
    fn get_or_create(&self, offset_reset: &str) -> Result<Arc<StreamConsumer>> {
        let mut slot = self.consumer.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        let consumer: StreamConsumer = self
            .config
            .clone()
            .set("auto.offset.reset", offset_reset)
            .create()
            .map_err(map_err)?;
        let consumer = Arc::new(consumer);
        *slot = Some(consumer.clone());
        Ok(consumer)
    }

    fn topic_assignment(&self, consumer: &StreamConsumer, topic: &str) -> Result<TopicPartitionList> {
        let assignment = consumer.assignment().map_err(map_err)?;
        let mut tpl = TopicPartitionList::new();
        for element in assignment.elements_for_topic(topic) {
            tpl.add_partition(topic, element.partition());
        }
        Ok(tpl)
    }
}

#[async_trait]
impl ConsumerClient for RdKafkaConsumer {
    async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        let from_beginning = matches!(subscription.start, StartPosition::Committed { from_beginning: true });
        let consumer = self.get_or_create(if from_beginning { "earliest" } else { "latest" })?;

        let partitions = match (&subscription.partitions, subscription.start) {
            (Some(partitions), _) => Some(partitions.clone()),
            // Explicit offsets need every partition assigned up front
            (None, StartPosition::Offset(_)) => {
                let probe = consumer.clone();
                let topic = subscription.topic.clone();
                let timeout = self.timeout;
                let ids = blocking(move || {
                    let metadata = probe.fetch_metadata(Some(&topic), timeout).map_err(map_err)?;
                    let found = metadata
                        .topics()
                        .iter()
                        .find(|t| t.name() == topic && t.error().is_none())
                        .ok_or_else(|| KafdeskError::not_found("Topic", &topic))?;
                    Ok(found.partitions().iter().map(|p| p.id()).collect::<Vec<i32>>())
                })
                .await?;
                Some(ids)
            }
            (None, StartPosition::Committed { .. }) => None,
        };

        match partitions {
            Some(partitions) => {
                let offset = match subscription.start {
                    StartPosition::Offset(offset) => Offset::Offset(offset),
                    StartPosition::Committed { .. } => Offset::Stored,
                };
                let mut tpl = TopicPartitionList::new();
                for partition in partitions {
                    tpl.add_partition_offset(&subscription.topic, partition, offset)
                        .map_err(map_err)?;
                }
                consumer.assign(&tpl).map_err(map_err)?;
            }
            None => consumer.subscribe(&[subscription.topic.as_str()]).map_err(map_err)?,
        }
        debug!("[RdKafka] Subscribed to {}", subscription.topic);
        Ok(())
    }

    async fn recv(&self) -> Result<ConsumedRecord> {
        let consumer = self.current()?;
        loop {
            match consumer.recv().await {
                Ok(message) => {
                    let headers = message
                        .headers()
                        .map(|h| {
                            h.iter()
                                .map(|header| {
                                    (
                                        header.key.to_string(),
                                        header.value.map(Bytes::copy_from_slice).unwrap_or_default(),
                                    )
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    return Ok(ConsumedRecord {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().map(Bytes::copy_from_slice),
                        value: message.payload().map(Bytes::copy_from_slice),
                        headers,
                        timestamp_ms: message.timestamp().to_millis().unwrap_or(0),
                    });
                }
                Err(KafkaError::PartitionEOF(_)) => continue,
                Err(e) => match e.rdkafka_error_code() {
                    Some(RDKafkaErrorCode::BrokerTransportFailure) => {
                        // librdkafka reconnects on its own
                        warn!("[RdKafka] Transient transport failure: {}", e);
                        continue;
                    }
                    _ => return Err(map_err(e)),
                },
            }
        }
    }

    async fn pause(&self, topic: &str) -> Result<()> {
        let consumer = self.current()?;
        let tpl = self.topic_assignment(&consumer, topic)?;
        consumer.pause(&tpl).map_err(map_err)
    }

    async fn resume(&self, topic: &str) -> Result<()> {
        let consumer = self.current()?;
        let tpl = self.topic_assignment(&consumer, topic)?;
        consumer.resume(&tpl).map_err(map_err)
    }

    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let consumer = self.current()?;
        let topic = topic.to_string();
        let timeout = self.timeout;
        blocking(move || {
            consumer
                .seek(&topic, partition, Offset::Offset(offset), timeout)
                .map_err(map_err)
        })
        .await
    }

    async fn commit(&self, offsets: &[TopicPartitionOffset]) -> Result<()> {
        let consumer = self.get_or_create("latest")?;
        let mut tpl = TopicPartitionList::new();
        for o in offsets {
            tpl.add_partition_offset(&o.topic, o.partition, Offset::Offset(o.offset))
                .map_err(map_err)?;
        }
        blocking(move || consumer.commit(&tpl, CommitMode::Sync).map_err(map_err)).await
    }

    async fn disconnect(&self) -> Result<()> {
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            consumer.unsubscribe();
        }
        Ok(())
    }
}
