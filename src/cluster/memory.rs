//! In-process cluster.
//!
//! Holds topics, partition logs, consumer groups and committed offsets behind a
//! single lock. Consumers park on a shared `Notify` and re-check their
//! partitions whenever anything in the cluster changes. Reachability,
//! credentials and per-topic produce failures can be controlled from outside,
//! which is how the rest of the crate is exercised without a real broker.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use crate::cluster::assignment::encode_assignment;
use crate::cluster::{
    AdminClient, ClientFactory, ClusterClient, CommittedOffset, ConsumedRecord, ConsumerClient, ConsumerSettings,
    GroupDescription, GroupListing, GroupMemberDescription, NewTopic, OutgoingRecord, PartitionMetadata,
    ProducerClient, RecordMetadata, StartPosition, Subscription, TopicMetadata, TopicPartitionOffset, Watermarks,
};
use crate::error::{KafdeskError, Result};
use crate::models::{Broker, ClusterInfo, ConfigEntry, ConnectionConfig, SaslConfig, TopicAssignment};

const OFFSETS_TOPIC: &str = "__consumer_offsets";
const OFFSETS_TOPIC_PARTITIONS: usize = 3;
const CLIENT_HOST: &str = "/127.0.0.1";

const DEFAULT_TOPIC_CONFIGS: &[(&str, &str)] = &[
    ("cleanup.policy", "delete"),
    ("retention.ms", "604800000"),
    ("segment.bytes", "1073741824"),
    ("min.insync.replicas", "1"),
    ("max.message.bytes", "1048588"),
];

// ==========================================
// CLUSTER STATE
// ==========================================

struct StoredRecord {
    key: Option<Bytes>,
    value: Bytes,
    headers: Vec<(String, Bytes)>,
    timestamp_ms: i64,
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<StoredRecord>,
}

struct TopicLog {
    partitions: Vec<PartitionLog>,
    replication_factor: i32,
    configs: BTreeMap<String, String>,
    next_partition: usize,
}

impl TopicLog {
    fn new(num_partitions: usize, replication_factor: i32) -> Self {
        Self {
            partitions: (0..num_partitions).map(|_| PartitionLog::default()).collect(),
            replication_factor,
            configs: BTreeMap::new(),
            next_partition: 0,
        }
    }

    fn log_end(&self, partition: i32) -> i64 {
        self.partitions
            .get(partition as usize)
            .map(|p| p.records.len() as i64)
            .unwrap_or(0)
    }
}

struct MemberState {
    client_id: String,
    topic: String,
    /// Explicit partitions; such members are left out of rebalancing.
    fixed: Option<Vec<i32>>,
    assigned: Vec<i32>,
}

struct Commit {
    offset: i64,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct GroupState {
    members: BTreeMap<String, MemberState>,
    committed: BTreeMap<(String, i32), Commit>,
}

impl GroupState {
    fn state_name(&self) -> &'static str {
        if !self.members.is_empty() {
            "Stable"
        } else if !self.committed.is_empty() {
            "Empty"
        } else {
            "Dead"
        }
    }
}

struct ClusterState {
    reachable: bool,
    credentials: Option<(String, String)>,
    topics: BTreeMap<String, TopicLog>,
    groups: HashMap<String, GroupState>,
    failing_topics: HashMap<String, String>,
    next_member_seq: u64,
}

impl ClusterState {
    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(KafdeskError::Connection("Connection to broker lost".to_string()))
        }
    }

    fn topic(&self, name: &str) -> Result<&TopicLog> {
        self.topics.get(name).ok_or_else(|| unknown_topic(name))
    }

    fn rebalance(&mut self, group_id: &str) {
        let partition_counts: HashMap<String, usize> = self
            .topics
            .iter()
            .map(|(name, log)| (name.clone(), log.partitions.len()))
            .collect();

        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };

        let mut by_topic: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (member_id, member) in group.members.iter_mut() {
            match &member.fixed {
                Some(fixed) => member.assigned = fixed.clone(),
                None => {
                    member.assigned.clear();
                    by_topic.entry(member.topic.clone()).or_default().push(member_id.clone());
                }
            }
        }

        for (topic, members) in by_topic {
            let count = partition_counts.get(&topic).copied().unwrap_or(0);
            for partition in 0..count {
                let owner = &members[partition % members.len()];
                if let Some(member) = group.members.get_mut(owner) {
                    member.assigned.push(partition as i32);
                }
            }
        }
    }

    fn rebalance_topic(&mut self, topic: &str) {
        let affected: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, g)| g.members.values().any(|m| m.topic == topic))
            .map(|(id, _)| id.clone())
            .collect();
        for group_id in affected {
            self.rebalance(&group_id);
        }
    }

    fn assigned_partitions(&self, group_id: &str, member_id: &str) -> Vec<i32> {
        self.groups
            .get(group_id)
            .and_then(|g| g.members.get(member_id))
            .map(|m| m.assigned.clone())
            .unwrap_or_default()
    }

    fn start_offset(&self, group_id: &str, topic: &str, partition: i32, start: StartPosition) -> i64 {
        let log_end = self.topics.get(topic).map(|t| t.log_end(partition)).unwrap_or(0);
        match start {
            StartPosition::Offset(offset) => offset.clamp(0, log_end),
            StartPosition::Committed { from_beginning } => {
                let committed = self
                    .groups
                    .get(group_id)
                    .and_then(|g| g.committed.get(&(topic.to_string(), partition)))
                    .map(|c| c.offset);
                match committed {
                    Some(offset) => offset.clamp(0, log_end),
                    None if from_beginning => 0,
                    None => log_end,
                }
            }
        }
    }
}

struct ClusterInner {
    cluster_id: String,
    bootstrap: Vec<String>,
    brokers: Vec<Broker>,
    state: Mutex<ClusterState>,
    changed: Notify,
    handshakes: AtomicU64,
}

/// Shared handle to one in-process cluster. Cloning is cheap.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    /// A cluster advertising one broker per bootstrap address.
    pub fn new(bootstrap: &[&str]) -> Self {
        let brokers = bootstrap
            .iter()
            .enumerate()
            .map(|(i, &addr)| {
                let (host, port) = addr.rsplit_once(':').unwrap_or((addr, "9092"));
                Broker {
                    node_id: i as i32 + 1,
                    host: host.to_string(),
                    port: port.parse().unwrap_or(9092),
                    rack: None,
                }
            })
            .collect();

        let mut topics = BTreeMap::new();
        topics.insert(OFFSETS_TOPIC.to_string(), TopicLog::new(OFFSETS_TOPIC_PARTITIONS, 1));

        Self {
            inner: Arc::new(ClusterInner {
                cluster_id: format!("mem-{}", uuid::Uuid::new_v4().simple()),
                bootstrap: bootstrap.iter().map(|s| s.to_string()).collect(),
                brokers,
                state: Mutex::new(ClusterState {
                    reachable: true,
                    credentials: None,
                    topics,
                    groups: HashMap::new(),
                    failing_topics: HashMap::new(),
                    next_member_seq: 0,
                }),
                changed: Notify::new(),
                handshakes: AtomicU64::new(0),
            }),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.inner.cluster_id
    }

    /// Requires SASL with exactly these credentials from now on.
    pub fn require_credentials(&self, username: &str, password: &str) {
        self.inner.state.lock().credentials = Some((username.to_string(), password.to_string()));
    }

    /// Simulates a network partition. Blocked consumers wake up and fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.state.lock().reachable = reachable;
        self.inner.changed.notify_waiters();
    }

    /// Every produce to `topic` fails with `message` until cleared.
    pub fn fail_topic(&self, topic: &str, message: &str) {
        self.inner
            .state
            .lock()
            .failing_topics
            .insert(topic.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, topic: &str) {
        self.inner.state.lock().failing_topics.remove(topic);
    }

    /// Creates a topic directly, bypassing any client.
    pub fn seed_topic(&self, name: &str, partitions: usize) {
        self.inner
            .state
            .lock()
            .topics
            .entry(name.to_string())
            .or_insert_with(|| TopicLog::new(partitions, 1));
    }

    /// Number of successful or failed connection attempts so far.
    pub fn handshakes(&self) -> u64 {
        self.inner.handshakes.load(Ordering::SeqCst)
    }

    pub fn group_member_count(&self, group_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .groups
            .get(group_id)
            .map(|g| g.members.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.inner.state.lock()
    }

    fn wake(&self) {
        self.inner.changed.notify_waiters();
    }

    fn handshake(&self, brokers: &[String], sasl: Option<&SaslConfig>) -> Result<()> {
        self.inner.handshakes.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();

        let routable = brokers.iter().any(|b| self.inner.bootstrap.contains(b));
        if !state.reachable || !routable {
            return Err(KafdeskError::Connection(format!(
                "Failed to connect to any broker in [{}]",
                brokers.join(", ")
            )));
        }

        if let Some((username, password)) = &state.credentials {
            match sasl {
                Some(s) if &s.username == username && &s.password == password => {}
                Some(s) => {
                    return Err(KafdeskError::Authentication(format!(
                        "SASL authentication failed for user '{}': invalid credentials",
                        s.username
                    )))
                }
                None => {
                    return Err(KafdeskError::Authentication(
                        "SASL authentication required by broker".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    fn partition_metadata(&self, partition: i32, replication_factor: i32) -> PartitionMetadata {
        let brokers = &self.inner.brokers;
        let n = brokers.len().max(1);
        let replicas: Vec<i32> = (0..replication_factor.max(1) as usize)
            .filter_map(|i| brokers.get((partition as usize + i) % n).map(|b| b.node_id))
            .collect();
        PartitionMetadata {
            id: partition,
            leader: replicas.first().copied().unwrap_or(-1),
            isr: replicas.clone(),
            replicas,
            offline_replicas: Vec::new(),
        }
    }

    fn topic_metadata_of(&self, name: &str, log: &TopicLog) -> TopicMetadata {
        TopicMetadata {
            name: name.to_string(),
            partitions: (0..log.partitions.len() as i32)
                .map(|p| self.partition_metadata(p, log.replication_factor))
                .collect(),
        }
    }
}

impl ClientFactory for MemoryCluster {
    fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn ClusterClient>> {
        Ok(Arc::new(MemoryClient {
            cluster: self.clone(),
            brokers: config.brokers.clone(),
            sasl: config.sasl.clone(),
            client_id: config.client_id_or_default(),
            closed: AtomicBool::new(false),
        }))
    }
}

fn unknown_topic(topic: &str) -> KafdeskError {
    KafdeskError::NotFound(format!("This server does not host this topic-partition: '{}'", topic))
}

fn key_partition(key: &[u8], count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % count as u64) as usize
}

// ==========================================
// CLIENT
// ==========================================

pub struct MemoryClient {
    cluster: MemoryCluster,
    brokers: Vec<String>,
    sasl: Option<SaslConfig>,
    client_id: String,
    closed: AtomicBool,
}

impl MemoryClient {
    fn connect(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KafdeskError::Connection("Client has been closed".to_string()));
        }
        self.cluster.handshake(&self.brokers, self.sasl.as_ref())
    }
}

#[async_trait]
impl ClusterClient for MemoryClient {
    async fn admin(&self) -> Result<Box<dyn AdminClient>> {
        self.connect()?;
        Ok(Box::new(MemoryAdmin {
            cluster: self.cluster.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn producer(&self) -> Result<Arc<dyn ProducerClient>> {
        self.connect()?;
        Ok(Arc::new(MemoryProducer {
            cluster: self.cluster.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consumer(&self, settings: ConsumerSettings) -> Result<Arc<dyn ConsumerClient>> {
        self.connect()?;
        let member_seq = {
            let mut state = self.cluster.lock();
            state.next_member_seq += 1;
            state.next_member_seq
        };
        let client_id = if settings.client_id.is_empty() {
            self.client_id.clone()
        } else {
            settings.client_id
        };
        Ok(Arc::new(MemoryConsumer {
            cluster: self.cluster.clone(),
            member_id: format!("{}-{}", client_id, member_seq),
            group_id: settings.group_id,
            client_id,
            inner: Mutex::new(ConsumerInner::default()),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ==========================================
// ADMIN
// ==========================================

pub struct MemoryAdmin {
    cluster: MemoryCluster,
    closed: AtomicBool,
}

impl MemoryAdmin {
    fn state(&self) -> Result<MutexGuard<'_, ClusterState>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KafdeskError::Connection("Admin client has been closed".to_string()));
        }
        let state = self.cluster.lock();
        state.ensure_reachable()?;
        Ok(state)
    }
}

#[async_trait]
impl AdminClient for MemoryAdmin {
    async fn describe_cluster(&self) -> Result<ClusterInfo> {
        let _state = self.state()?;
        let brokers = self.cluster.inner.brokers.clone();
        Ok(ClusterInfo {
            controller_id: brokers.first().map(|b| b.node_id),
            cluster_id: Some(self.cluster.inner.cluster_id.clone()),
            brokers,
        })
    }

    async fn list_topics(&self) -> Result<Vec<TopicMetadata>> {
        let state = self.state()?;
        Ok(state
            .topics
            .iter()
            .map(|(name, log)| self.cluster.topic_metadata_of(name, log))
            .collect())
    }

    async fn topic_metadata(&self, topic: &str) -> Result<Option<TopicMetadata>> {
        let state = self.state()?;
        Ok(state.topics.get(topic).map(|log| self.cluster.topic_metadata_of(topic, log)))
    }

    async fn describe_topic_configs(&self, topic: &str) -> Result<Vec<ConfigEntry>> {
        let state = self.state()?;
        let log = state.topic(topic)?;

        let mut entries: Vec<ConfigEntry> = DEFAULT_TOPIC_CONFIGS
            .iter()
            .map(|(name, default)| match log.configs.get(*name) {
                Some(value) => ConfigEntry {
                    name: name.to_string(),
                    value: Some(value.clone()),
                    source: "DYNAMIC_TOPIC_CONFIG".to_string(),
                    is_sensitive: false,
                    is_read_only: false,
                },
                None => ConfigEntry {
                    name: name.to_string(),
                    value: Some(default.to_string()),
                    source: "DEFAULT_CONFIG".to_string(),
                    is_sensitive: false,
                    is_read_only: false,
                },
            })
            .collect();

        for (name, value) in &log.configs {
            if !DEFAULT_TOPIC_CONFIGS.iter().any(|(d, _)| d == name) {
                entries.push(ConfigEntry {
                    name: name.clone(),
                    value: Some(value.clone()),
                    source: "DYNAMIC_TOPIC_CONFIG".to_string(),
                    is_sensitive: false,
                    is_read_only: false,
                });
            }
        }
        Ok(entries)
    }

    async fn create_topic(&self, topic: NewTopic) -> Result<()> {
        let mut state = self.state()?;
        if state.topics.contains_key(&topic.name) {
            return Err(KafdeskError::Validation(format!("Topic '{}' already exists", topic.name)));
        }
        if topic.num_partitions < 1 {
            return Err(KafdeskError::Validation("Number of partitions must be at least 1".to_string()));
        }
        let available = self.cluster.inner.brokers.len() as i32;
        if topic.replication_factor < 1 || topic.replication_factor > available {
            return Err(KafdeskError::Validation(format!(
                "Replication factor: {} larger than available brokers: {}",
                topic.replication_factor, available
            )));
        }

        let mut log = TopicLog::new(topic.num_partitions as usize, topic.replication_factor);
        log.configs.extend(topic.configs);
        state.topics.insert(topic.name, log);
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        {
            let mut state = self.state()?;
            if state.topics.remove(topic).is_none() {
                return Err(unknown_topic(topic));
            }
        }
        self.cluster.wake();
        Ok(())
    }

    async fn alter_topic_config(&self, topic: &str, entries: Vec<(String, String)>) -> Result<()> {
        let mut state = self.state()?;
        let log = state.topics.get_mut(topic).ok_or_else(|| unknown_topic(topic))?;
        for (name, value) in entries {
            if name.trim().is_empty() {
                return Err(KafdeskError::Validation("Config name must not be empty".to_string()));
            }
            log.configs.insert(name, value);
        }
        Ok(())
    }

    async fn create_partitions(&self, topic: &str, total_count: i32) -> Result<()> {
        {
            let mut state = self.state()?;
            let log = state.topics.get_mut(topic).ok_or_else(|| unknown_topic(topic))?;
            let current = log.partitions.len() as i32;
            if total_count <= current {
                return Err(KafdeskError::Validation(format!(
                    "Topic currently has {} partitions, which is higher than or equal to the requested {}",
                    current, total_count
                )));
            }
            for _ in current..total_count {
                log.partitions.push(PartitionLog::default());
            }
            state.rebalance_topic(topic);
        }
        self.cluster.wake();
        Ok(())
    }

    async fn watermarks(&self, topic: &str) -> Result<Vec<Watermarks>> {
        let state = self.state()?;
        let log = state.topic(topic)?;
        Ok((0..log.partitions.len() as i32)
            .map(|p| Watermarks {
                partition: p,
                low: 0,
                high: log.log_end(p),
            })
            .collect())
    }

    async fn offsets_for_times(&self, topic: &str, partitions: &[i32], timestamp_ms: i64) -> Result<Vec<(i32, Option<i64>)>> {
        let state = self.state()?;
        let log = state.topic(topic)?;
        partitions
            .iter()
            .map(|&p| {
                let partition = log
                    .partitions
                    .get(p as usize)
                    .ok_or_else(|| KafdeskError::NotFound(format!("Partition {} of '{}' does not exist", p, topic)))?;
                let found = partition
                    .records
                    .iter()
                    .position(|r| r.timestamp_ms >= timestamp_ms)
                    .map(|idx| idx as i64);
                Ok((p, found))
            })
            .collect()
    }

    async fn list_groups(&self) -> Result<Vec<GroupListing>> {
        let state = self.state()?;
        let mut groups: Vec<GroupListing> = state
            .groups
            .iter()
            .filter(|(_, g)| !g.members.is_empty() || !g.committed.is_empty())
            .map(|(id, g)| GroupListing {
                group_id: id.clone(),
                state: g.state_name().to_string(),
                protocol_type: "consumer".to_string(),
            })
            .collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        Ok(groups)
    }

    async fn describe_group(&self, group_id: &str) -> Result<Option<GroupDescription>> {
        let state = self.state()?;
        let Some(group) = state.groups.get(group_id) else {
            return Ok(None);
        };

        let members = group
            .members
            .iter()
            .map(|(member_id, m)| GroupMemberDescription {
                member_id: member_id.clone(),
                client_id: m.client_id.clone(),
                client_host: CLIENT_HOST.to_string(),
                assignment: encode_assignment(&[TopicAssignment {
                    topic: m.topic.clone(),
                    partitions: m.assigned.clone(),
                }]),
            })
            .collect();

        Ok(Some(GroupDescription {
            group_id: group_id.to_string(),
            state: group.state_name().to_string(),
            protocol: if group.members.is_empty() { String::new() } else { "RoundRobinAssigner".to_string() },
            protocol_type: "consumer".to_string(),
            members,
        }))
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        let mut state = self.state()?;
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| KafdeskError::not_found("Consumer group", group_id))?;
        if !group.members.is_empty() {
            return Err(KafdeskError::State(format!("The group '{}' is not empty", group_id)));
        }
        state.groups.remove(group_id);
        Ok(())
    }

    async fn committed_offsets(&self, group_id: &str, topic: Option<&str>) -> Result<Vec<CommittedOffset>> {
        let state = self.state()?;
        let Some(group) = state.groups.get(group_id) else {
            return Ok(Vec::new());
        };
        Ok(group
            .committed
            .iter()
            .filter(|((t, _), _)| topic.map_or(true, |wanted| wanted == t))
            .map(|((t, p), commit)| CommittedOffset {
                topic: t.clone(),
                partition: *p,
                offset: commit.offset,
                committed_at: Some(commit.at),
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ==========================================
// PRODUCER
// ==========================================

pub struct MemoryProducer {
    cluster: MemoryCluster,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerClient for MemoryProducer {
    async fn send(&self, topic: &str, records: Vec<OutgoingRecord>) -> Result<Vec<RecordMetadata>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KafdeskError::Connection("Producer has been closed".to_string()));
        }

        let metadata = {
            let mut state = self.cluster.lock();
            state.ensure_reachable()?;
            if let Some(message) = state.failing_topics.get(topic) {
                return Err(KafdeskError::classify(message.clone()));
            }

            let log = state.topics.get_mut(topic).ok_or_else(|| unknown_topic(topic))?;
            let count = log.partitions.len();
            if let Some(bad) = records
                .iter()
                .filter_map(|r| r.partition)
                .find(|p| *p < 0 || *p as usize >= count)
            {
                return Err(KafdeskError::Validation(format!("Invalid partition {} for topic '{}'", bad, topic)));
            }

            let now = Utc::now().timestamp_millis();
            let mut metadata = Vec::with_capacity(records.len());
            for record in records {
                let partition = match (record.partition, &record.key) {
                    (Some(p), _) => p as usize,
                    (None, Some(key)) => key_partition(key, count),
                    (None, None) => {
                        let p = log.next_partition % count;
                        log.next_partition = log.next_partition.wrapping_add(1);
                        p
                    }
                };
                let timestamp_ms = record.timestamp_ms.unwrap_or(now);
                let partition_log = &mut log.partitions[partition].records;
                let offset = partition_log.len() as i64;
                partition_log.push(StoredRecord {
                    key: record.key,
                    value: record.value,
                    headers: record.headers,
                    timestamp_ms,
                });
                metadata.push(RecordMetadata {
                    partition: partition as i32,
                    offset,
                    timestamp_ms,
                });
            }
            metadata
        };

        self.cluster.wake();
        Ok(metadata)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ==========================================
// CONSUMER
// ==========================================

#[derive(Default)]
struct ConsumerInner {
    subscription: Option<Subscription>,
    positions: HashMap<i32, i64>,
    paused: HashSet<String>,
    cursor: usize,
    disconnected: bool,
}

pub struct MemoryConsumer {
    cluster: MemoryCluster,
    group_id: String,
    member_id: String,
    client_id: String,
    inner: Mutex<ConsumerInner>,
}

impl MemoryConsumer {
    fn poll_record(&self) -> Result<Option<ConsumedRecord>> {
        let state = self.cluster.lock();
        let mut inner = self.inner.lock();

        if inner.disconnected {
            return Err(KafdeskError::State("Consumer is disconnected".to_string()));
        }
        state.ensure_reachable()?;

        let Some(subscription) = inner.subscription.clone() else {
            return Ok(None);
        };
        let log = state.topic(&subscription.topic)?;
        if inner.paused.contains(&subscription.topic) {
            return Ok(None);
        }

        let assigned = state.assigned_partitions(&self.group_id, &self.member_id);
        if assigned.is_empty() {
            return Ok(None);
        }

        let start = inner.cursor % assigned.len();
        for partition in assigned.iter().cycle().skip(start).take(assigned.len()).copied() {
            let position = match inner.positions.get(&partition) {
                Some(position) => *position,
                None => {
                    let position =
                        state.start_offset(&self.group_id, &subscription.topic, partition, subscription.start);
                    inner.positions.insert(partition, position);
                    position
                }
            };

            let Some(stored) = log
                .partitions
                .get(partition as usize)
                .and_then(|p| p.records.get(position as usize))
            else {
                continue;
            };

            inner.positions.insert(partition, position + 1);
            inner.cursor = inner.cursor.wrapping_add(1);
            return Ok(Some(ConsumedRecord {
                topic: subscription.topic.clone(),
                partition,
                offset: position,
                key: stored.key.clone(),
                value: Some(stored.value.clone()),
                headers: stored.headers.clone(),
                timestamp_ms: stored.timestamp_ms,
            }));
        }
        Ok(None)
    }
}

#[async_trait]
impl ConsumerClient for MemoryConsumer {
    async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        let mut state = self.cluster.lock();
        state.ensure_reachable()?;

        let count = state.topic(&subscription.topic)?.partitions.len() as i32;
        if let Some(partitions) = &subscription.partitions {
            if partitions.is_empty() {
                return Err(KafdeskError::Validation("At least one partition must be given".to_string()));
            }
            if let Some(bad) = partitions.iter().find(|p| **p < 0 || **p >= count) {
                return Err(KafdeskError::Validation(format!(
                    "Partition {} does not exist on topic '{}' ({} partitions)",
                    bad, subscription.topic, count
                )));
            }
        }

        let mut inner = self.inner.lock();
        if inner.disconnected {
            return Err(KafdeskError::State("Consumer is disconnected".to_string()));
        }

        state.groups.entry(self.group_id.clone()).or_default().members.insert(
            self.member_id.clone(),
            MemberState {
                client_id: self.client_id.clone(),
                topic: subscription.topic.clone(),
                fixed: subscription.partitions.clone(),
                assigned: Vec::new(),
            },
        );
        state.rebalance(&self.group_id);

        // Positions are fixed now so that a live subscription starts at the
        // log end as of this call
        inner.positions.clear();
        for partition in state.assigned_partitions(&self.group_id, &self.member_id) {
            let position = state.start_offset(&self.group_id, &subscription.topic, partition, subscription.start);
            inner.positions.insert(partition, position);
        }
        debug!(
            "[MemoryCluster] {} joined group {} on {}",
            self.member_id, self.group_id, subscription.topic
        );
        inner.subscription = Some(subscription);
        Ok(())
    }

    async fn recv(&self) -> Result<ConsumedRecord> {
        loop {
            let notified = self.cluster.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.poll_record()? {
                return Ok(record);
            }
            notified.await;
        }
    }

    async fn pause(&self, topic: &str) -> Result<()> {
        self.inner.lock().paused.insert(topic.to_string());
        Ok(())
    }

    async fn resume(&self, topic: &str) -> Result<()> {
        self.inner.lock().paused.remove(topic);
        self.cluster.wake();
        Ok(())
    }

    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.disconnected {
                return Err(KafdeskError::State("Consumer is disconnected".to_string()));
            }
            match &inner.subscription {
                Some(sub) if sub.topic == topic => {}
                _ => return Err(KafdeskError::State(format!("Consumer is not subscribed to '{}'", topic))),
            }
            inner.positions.insert(partition, offset.max(0));
        }
        self.cluster.wake();
        Ok(())
    }

    async fn commit(&self, offsets: &[TopicPartitionOffset]) -> Result<()> {
        let mut state = self.cluster.lock();
        state.ensure_reachable()?;

        let group = state.groups.entry(self.group_id.clone()).or_default();
        if !group.members.is_empty() && !group.members.contains_key(&self.member_id) {
            return Err(KafdeskError::State(format!(
                "The consumer group '{}' has active members",
                self.group_id
            )));
        }

        let now = Utc::now();
        for offset in offsets {
            group.committed.insert(
                (offset.topic.clone(), offset.partition),
                Commit {
                    offset: offset.offset,
                    at: now,
                },
            );
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.cluster.lock();
            let mut inner = self.inner.lock();
            if inner.disconnected {
                return Ok(());
            }
            inner.disconnected = true;

            let removed = state
                .groups
                .get_mut(&self.group_id)
                .map(|g| g.members.remove(&self.member_id).is_some())
                .unwrap_or(false);
            if removed {
                state.rebalance(&self.group_id);
            }
        }
        self.cluster.wake();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(group: &str) -> ConsumerSettings {
        ConsumerSettings {
            group_id: group.to_string(),
            client_id: String::new(),
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 3_000,
        }
    }

    fn config() -> ConnectionConfig {
        crate::models::ConnectionDraft {
            name: "mem".to_string(),
            brokers: vec!["localhost:9092".to_string()],
            ..Default::default()
        }
        .into_config("c1".to_string(), Utc::now())
    }

    fn record(value: &str) -> OutgoingRecord {
        OutgoingRecord {
            key: None,
            value: Bytes::from(value.to_string()),
            headers: Vec::new(),
            partition: Some(0),
            timestamp_ms: None,
        }
    }

    #[tokio::test]
    async fn test_rebalance_splits_partitions() {
        let cluster = MemoryCluster::new(&["localhost:9092"]);
        cluster.seed_topic("orders", 4);
        let client = cluster.create(&config()).unwrap();

        let a = client.consumer(settings("g")).await.unwrap();
        let b = client.consumer(settings("g")).await.unwrap();
        for consumer in [&a, &b] {
            consumer
                .subscribe(Subscription {
                    topic: "orders".to_string(),
                    partitions: None,
                    start: StartPosition::Committed { from_beginning: true },
                })
                .await
                .unwrap();
        }

        let admin = client.admin().await.unwrap();
        let group = admin.describe_group("g").await.unwrap().unwrap();
        let mut all: Vec<i32> = group
            .members
            .iter()
            .flat_map(|m| crate::cluster::assignment::decode_assignment(&m.assignment).unwrap())
            .flat_map(|a| a.partitions)
            .collect();
        all.sort();
        assert_eq!(all, vec![0, 1, 2, 3]);
        assert_eq!(group.members.len(), 2);
    }

    #[tokio::test]
    async fn test_commit_rejected_while_group_has_other_members() {
        let cluster = MemoryCluster::new(&["localhost:9092"]);
        cluster.seed_topic("orders", 1);
        let client = cluster.create(&config()).unwrap();

        let member = client.consumer(settings("g")).await.unwrap();
        member
            .subscribe(Subscription {
                topic: "orders".to_string(),
                partitions: None,
                start: StartPosition::Committed { from_beginning: false },
            })
            .await
            .unwrap();

        let outsider = client.consumer(settings("g")).await.unwrap();
        let offsets = [TopicPartitionOffset { topic: "orders".to_string(), partition: 0, offset: 0 }];
        assert_eq!(outsider.commit(&offsets).await.unwrap_err().kind(), "STATE");

        member.disconnect().await.unwrap();
        outsider.commit(&offsets).await.unwrap();
    }

    #[tokio::test]
    async fn test_offsets_for_times_finds_first_at_or_after() {
        let cluster = MemoryCluster::new(&["localhost:9092"]);
        cluster.seed_topic("t", 1);
        let client = cluster.create(&config()).unwrap();
        let producer = client.producer().await.unwrap();

        let mut records = Vec::new();
        for ts in [100, 200, 300] {
            let mut r = record("v");
            r.timestamp_ms = Some(ts);
            records.push(r);
        }
        producer.send("t", records).await.unwrap();

        let admin = client.admin().await.unwrap();
        assert_eq!(admin.offsets_for_times("t", &[0], 150).await.unwrap(), vec![(0, Some(1))]);
        assert_eq!(admin.offsets_for_times("t", &[0], 999).await.unwrap(), vec![(0, None)]);
    }

    #[tokio::test]
    async fn test_created_topic_has_leaders_on_return() {
        let cluster = MemoryCluster::new(&["localhost:9092", "localhost:9093"]);
        let client = cluster.create(&config()).unwrap();
        let admin = client.admin().await.unwrap();

        admin
            .create_topic(NewTopic {
                name: "fresh".to_string(),
                num_partitions: 3,
                replication_factor: 2,
                configs: Default::default(),
            })
            .await
            .unwrap();

        let metadata = admin.topic_metadata("fresh").await.unwrap().unwrap();
        assert_eq!(metadata.partitions.len(), 3);
        assert!(metadata.partitions.iter().all(|p| p.leader >= 0));
        assert!(metadata.partitions.iter().all(|p| p.replicas.len() == 2));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_fails_handshake() {
        let cluster = MemoryCluster::new(&["localhost:9092"]);
        cluster.set_reachable(false);
        let client = cluster.create(&config()).unwrap();
        let err = client.admin().await.err().unwrap();
        assert_eq!(err.kind(), "CONNECTION");
    }
}
