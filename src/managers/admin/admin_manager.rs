//! Topic, partition, config and cluster operations.
//!
//! Every call opens its own admin sub-connection on the shared handle and
//! closes it before returning, whatever the outcome.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use tokio::time;
use tracing::{debug, info};

use crate::cluster::{AdminClient, NewTopic};
use crate::config::AdminConfig;
use crate::error::{KafdeskError, Result};
use crate::managers::connection::ConnectionManager;
use crate::models::{
    is_internal_topic, Broker, ClusterInfo, CreateTopicRequest, PartitionDetail, Topic, TopicDetail,
};

const MAX_TOPIC_NAME_LEN: usize = 249;

pub struct AdminManager {
    connections: Arc<ConnectionManager>,
    config: AdminConfig,
}

impl AdminManager {
    pub fn new(connections: Arc<ConnectionManager>, config: AdminConfig) -> Self {
        Self { connections, config }
    }

    async fn open(&self, connection_id: &str) -> Result<Box<dyn AdminClient>> {
        let handle = self.connections.acquire(connection_id)?;
        handle.client().admin().await
    }

    async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.operation_timeout();
        match time::timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => Err(KafdeskError::Timeout(format!(
                "Admin operation did not complete within {} ms",
                limit.as_millis()
            ))),
        }
    }

    // ==========================================
    // TOPICS
    // ==========================================

    pub async fn list_topics(&self, connection_id: &str) -> Result<Vec<Topic>> {
        let admin = self.open(connection_id).await?;
        let result = self.bounded(admin.list_topics()).await;
        release(admin).await;

        let mut topics: Vec<Topic> = result?
            .into_iter()
            .map(|t| Topic {
                internal: is_internal_topic(&t.name),
                partitions: t.partitions.len(),
                replication_factor: t.partitions.first().map(|p| p.replicas.len()).unwrap_or(0),
                name: t.name,
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    pub async fn get_topic_detail(&self, connection_id: &str, topic: &str) -> Result<TopicDetail> {
        let admin = self.open(connection_id).await?;
        let result = self
            .bounded(async {
                let metadata = admin
                    .topic_metadata(topic)
                    .await?
                    .ok_or_else(|| KafdeskError::not_found("Topic", topic))?;
                let configs = admin.describe_topic_configs(topic).await?;
                let watermarks = admin.watermarks(topic).await?;
                Ok((metadata, configs, watermarks))
            })
            .await;
        release(admin).await;
        let (metadata, configs, watermarks) = result?;

        let offsets: HashMap<i32, (i64, i64)> = watermarks
            .into_iter()
            .map(|w| (w.partition, (w.low, w.high)))
            .collect();

        let mut partition_details: Vec<PartitionDetail> = metadata
            .partitions
            .iter()
            .map(|p| {
                let (low, high) = offsets.get(&p.id).copied().unwrap_or((0, 0));
                PartitionDetail {
                    partition_id: p.id,
                    leader: p.leader,
                    replicas: p.replicas.clone(),
                    isr: p.isr.clone(),
                    offline_replicas: p.offline_replicas.clone(),
                    earliest_offset: low.to_string(),
                    latest_offset: high.to_string(),
                }
            })
            .collect();
        partition_details.sort_by_key(|p| p.partition_id);

        Ok(TopicDetail {
            internal: is_internal_topic(&metadata.name),
            partitions: metadata.partitions.len(),
            replication_factor: metadata.partitions.first().map(|p| p.replicas.len()).unwrap_or(0),
            name: metadata.name,
            partition_details,
            configs,
        })
    }

    pub async fn create_topic(&self, connection_id: &str, request: CreateTopicRequest) -> Result<()> {
        validate_topic_name(&request.topic)?;
        if request.num_partitions < 1 {
            return Err(KafdeskError::Validation("numPartitions must be at least 1".to_string()));
        }
        if request.replication_factor < 1 {
            return Err(KafdeskError::Validation("replicationFactor must be at least 1".to_string()));
        }

        let new_topic = NewTopic {
            name: request.topic.clone(),
            num_partitions: request.num_partitions,
            replication_factor: request.replication_factor,
            configs: request
                .config_entries
                .into_iter()
                .map(|e| (e.name, e.value))
                .collect(),
        };

        let admin = self.open(connection_id).await?;
        let result = self.bounded(admin.create_topic(new_topic)).await;
        release(admin).await;
        result?;

        info!(
            "[AdminManager] Created topic '{}' ({} partitions, rf {})",
            request.topic, request.num_partitions, request.replication_factor
        );
        Ok(())
    }

    pub async fn delete_topic(&self, connection_id: &str, topic: &str) -> Result<()> {
        let admin = self.open(connection_id).await?;
        let result = self.bounded(admin.delete_topic(topic)).await;
        release(admin).await;
        result?;

        info!("[AdminManager] Deleted topic '{}'", topic);
        Ok(())
    }

    pub async fn update_topic_config(
        &self,
        connection_id: &str,
        topic: &str,
        entries: BTreeMap<String, String>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Err(KafdeskError::Validation("No config entries given".to_string()));
        }

        let admin = self.open(connection_id).await?;
        let result = self
            .bounded(admin.alter_topic_config(topic, entries.into_iter().collect()))
            .await;
        release(admin).await;
        result
    }

    /// Grows `topic` to `total_count` partitions. Shrinking is not possible.
    pub async fn add_partitions(&self, connection_id: &str, topic: &str, total_count: i32) -> Result<()> {
        let admin = self.open(connection_id).await?;
        let result = self
            .bounded(async {
                let metadata = admin
                    .topic_metadata(topic)
                    .await?
                    .ok_or_else(|| KafdeskError::not_found("Topic", topic))?;
                let current = metadata.partitions.len() as i32;
                if total_count <= current {
                    return Err(KafdeskError::Validation(format!(
                        "New partition count {} must exceed the current count {}",
                        total_count, current
                    )));
                }
                admin.create_partitions(topic, total_count).await
            })
            .await;
        release(admin).await;
        result?;

        info!("[AdminManager] Topic '{}' now has {} partitions", topic, total_count);
        Ok(())
    }

    // ==========================================
    // CLUSTER
    // ==========================================

    pub async fn get_cluster_info(&self, connection_id: &str) -> Result<ClusterInfo> {
        let admin = self.open(connection_id).await?;
        let result = self.bounded(admin.describe_cluster()).await;
        release(admin).await;
        result
    }

    pub async fn list_brokers(&self, connection_id: &str) -> Result<Vec<Broker>> {
        Ok(self.get_cluster_info(connection_id).await?.brokers)
    }
}

async fn release(admin: Box<dyn AdminClient>) {
    if let Err(e) = admin.close().await {
        debug!("[AdminManager] Closing admin client failed: {}", e);
    }
}

fn validate_topic_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(KafdeskError::Validation("Topic name must not be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(KafdeskError::Validation(format!("Topic name '{}' is not allowed", name)));
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return Err(KafdeskError::Validation(format!(
            "Topic name is longer than {} characters",
            MAX_TOPIC_NAME_LEN
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(KafdeskError::Validation(format!(
            "Topic name '{}' may only contain letters, digits, '.', '_' and '-'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert!(validate_topic_name("orders.v1_raw-events").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("..").is_err());
        assert!(validate_topic_name("has space").is_err());
        assert!(validate_topic_name(&"x".repeat(250)).is_err());
    }
}
