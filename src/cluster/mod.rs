//! Broker capability seam.
//!
//! Everything above this module talks to a cluster through these traits. A
//! `ClientFactory` turns a fully-resolved `ConnectionConfig` into a
//! `ClusterClient` without touching the network; sub-clients (admin, producer,
//! consumer) open their own connections when requested.

pub mod assignment;
pub mod memory;
#[cfg(feature = "kafka")]
pub mod kafka;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::BackendKind;
use crate::error::Result;
use crate::models::{ClusterInfo, ConfigEntry, ConnectionConfig};

pub use memory::MemoryCluster;

// ==========================================
// WIRE-LEVEL TYPES
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub offline_replicas: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i32,
    pub configs: Vec<(String, String)>,
}

/// Low/high watermark of one partition. `high` is the log-end offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub partition: i32,
    pub low: i64,
    pub high: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupListing {
    pub group_id: String,
    pub state: String,
    pub protocol_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMemberDescription {
    pub member_id: String,
    pub client_id: String,
    pub client_host: String,
    /// Raw consumer protocol assignment, see `assignment::decode_assignment`
    pub assignment: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescription {
    pub group_id: String,
    pub state: String,
    pub protocol: String,
    pub protocol_type: String,
    pub members: Vec<GroupMemberDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub committed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<(String, Bytes)>,
    pub partition: Option<i32>,
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Bytes)>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub client_id: String,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Committed group offset; otherwise earliest or latest per `from_beginning`.
    Committed { from_beginning: bool },
    /// Explicit offset applied to every consumed partition.
    Offset(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    /// `Some` pins the consumer to exactly these partitions.
    pub partitions: Option<Vec<i32>>,
    pub start: StartPosition,
}

// ==========================================
// CAPABILITIES
// ==========================================

pub trait ClientFactory: Send + Sync {
    /// Builds a client for `config`. Must not perform network I/O.
    fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn ClusterClient>>;
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Opens an admin sub-connection.
    async fn admin(&self) -> Result<Box<dyn AdminClient>>;
    /// Creates and connects a producer.
    async fn producer(&self) -> Result<Arc<dyn ProducerClient>>;
    /// Creates and connects a consumer bound to `settings.group_id`.
    async fn consumer(&self, settings: ConsumerSettings) -> Result<Arc<dyn ConsumerClient>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn describe_cluster(&self) -> Result<ClusterInfo>;
    async fn list_topics(&self) -> Result<Vec<TopicMetadata>>;
    async fn topic_metadata(&self, topic: &str) -> Result<Option<TopicMetadata>>;
    async fn describe_topic_configs(&self, topic: &str) -> Result<Vec<ConfigEntry>>;
    /// Returns once every partition has an elected leader.
    async fn create_topic(&self, topic: NewTopic) -> Result<()>;
    async fn delete_topic(&self, topic: &str) -> Result<()>;
    async fn alter_topic_config(&self, topic: &str, entries: Vec<(String, String)>) -> Result<()>;
    async fn create_partitions(&self, topic: &str, total_count: i32) -> Result<()>;
    async fn watermarks(&self, topic: &str) -> Result<Vec<Watermarks>>;
    /// First offset per partition whose timestamp is >= `timestamp_ms`, `None` if no such record.
    async fn offsets_for_times(&self, topic: &str, partitions: &[i32], timestamp_ms: i64) -> Result<Vec<(i32, Option<i64>)>>;
    async fn list_groups(&self) -> Result<Vec<GroupListing>>;
    async fn describe_group(&self, group_id: &str) -> Result<Option<GroupDescription>>;
    async fn delete_group(&self, group_id: &str) -> Result<()>;
    /// Committed offsets of a group, optionally restricted to one topic.
    async fn committed_offsets(&self, group_id: &str, topic: Option<&str>) -> Result<Vec<CommittedOffset>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// Sends all records to one topic. Fails as a whole.
    async fn send(&self, topic: &str, records: Vec<OutgoingRecord>) -> Result<Vec<RecordMetadata>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ConsumerClient: Send + Sync {
    async fn subscribe(&self, subscription: Subscription) -> Result<()>;
    /// Waits for the next record from any unpaused partition.
    async fn recv(&self) -> Result<ConsumedRecord>;
    async fn pause(&self, topic: &str) -> Result<()>;
    async fn resume(&self, topic: &str) -> Result<()>;
    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
    async fn commit(&self, offsets: &[TopicPartitionOffset]) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

/// Factory for the backend named in the configuration.
pub fn factory_for(kind: BackendKind) -> Result<Arc<dyn ClientFactory>> {
    match kind {
        BackendKind::Memory => Ok(Arc::new(MemoryCluster::new(&["localhost:9092"]))),
        #[cfg(feature = "kafka")]
        BackendKind::Kafka => Ok(Arc::new(kafka::RdKafkaFactory)),
        #[cfg(not(feature = "kafka"))]
        BackendKind::Kafka => Err(crate::error::KafdeskError::Validation(
            "Kafka backend requested but this build lacks the `kafka` feature".to_string(),
        )),
    }
}
