//! Consumer group inspection, lag and offset reset.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::cluster::{
    assignment::decode_assignment, AdminClient, ConsumerSettings, GroupDescription, TopicPartitionOffset,
};
use crate::config::ConsumerConfig;
use crate::error::{KafdeskError, Result};
use crate::managers::connection::ConnectionManager;
use crate::models::{
    partition_lag, ConsumerGroup, ConsumerGroupDetail, ConsumerGroupMember, ConsumerGroupState,
    OffsetResetRequest, OffsetResetStrategy, PartitionConsumerDetail, TopicAssignment,
};

pub struct GroupManager {
    connections: Arc<ConnectionManager>,
    consumer_config: ConsumerConfig,
}

impl GroupManager {
    pub fn new(connections: Arc<ConnectionManager>, consumer_config: ConsumerConfig) -> Self {
        Self {
            connections,
            consumer_config,
        }
    }

    async fn open(&self, connection_id: &str) -> Result<Box<dyn AdminClient>> {
        let handle = self.connections.acquire(connection_id)?;
        handle.client().admin().await
    }

    /// Listing only: members are not described here.
    pub async fn list_consumer_groups(&self, connection_id: &str) -> Result<Vec<ConsumerGroup>> {
        let admin = self.open(connection_id).await?;
        let result = admin.list_groups().await;
        release(admin).await;

        let mut groups: Vec<ConsumerGroup> = result?
            .into_iter()
            .map(|g| ConsumerGroup {
                state: ConsumerGroupState::from_broker(&g.state),
                group_id: g.group_id,
                protocol: String::new(),
                protocol_type: g.protocol_type,
                members: Vec::new(),
            })
            .collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        Ok(groups)
    }

    /// `None` when the broker does not know the group.
    pub async fn get_consumer_group_detail(
        &self,
        connection_id: &str,
        group_id: &str,
    ) -> Result<Option<ConsumerGroupDetail>> {
        let admin = self.open(connection_id).await?;
        let result = collect_detail(admin.as_ref(), group_id).await;
        release(admin).await;
        result
    }

    pub async fn delete_consumer_group(&self, connection_id: &str, group_id: &str) -> Result<()> {
        let admin = self.open(connection_id).await?;
        let result = admin.delete_group(group_id).await;
        release(admin).await;
        result?;

        info!("[GroupManager] Deleted consumer group '{}'", group_id);
        Ok(())
    }

    /// Commits new positions for `group_id` on `topic`. Returns the offsets written.
    /// Groups with live members reject the commit.
    pub async fn reset_offset(
        &self,
        connection_id: &str,
        request: OffsetResetRequest,
    ) -> Result<Vec<TopicPartitionOffset>> {
        if request.group_id.trim().is_empty() {
            return Err(KafdeskError::Validation("groupId must not be empty".to_string()));
        }
        if let OffsetResetStrategy::Offset { offset } = request.strategy {
            if offset < 0 {
                return Err(KafdeskError::Validation(format!("Offset must be >= 0 (got {})", offset)));
            }
        }

        let admin = self.open(connection_id).await?;
        let targets = resolve_targets(admin.as_ref(), &request).await;
        release(admin).await;
        let targets = targets?;

        if targets.is_empty() {
            info!(
                "[GroupManager] Reset of '{}' on '{}' had nothing to commit",
                request.group_id, request.topic
            );
            return Ok(targets);
        }

        let handle = self.connections.acquire(connection_id)?;
        let consumer = handle
            .client()
            .consumer(ConsumerSettings {
                group_id: request.group_id.clone(),
                client_id: String::new(),
                session_timeout_ms: self.consumer_config.session_timeout_ms,
                heartbeat_interval_ms: self.consumer_config.heartbeat_interval_ms,
            })
            .await?;
        // Commits under the group id without a join; refused while the group has live members
        let committed = consumer.commit(&targets).await;
        if let Err(e) = consumer.disconnect().await {
            debug!("[GroupManager] Disconnecting reset consumer failed: {}", e);
        }
        committed?;

        info!(
            "[GroupManager] Reset '{}' on '{}' ({:?}) across {} partition(s)",
            request.group_id,
            request.topic,
            request.strategy,
            targets.len()
        );
        Ok(targets)
    }
}

async fn release(admin: Box<dyn AdminClient>) {
    if let Err(e) = admin.close().await {
        debug!("[GroupManager] Closing admin client failed: {}", e);
    }
}

// ==========================================
// DETAIL
// ==========================================

async fn collect_detail(admin: &dyn AdminClient, group_id: &str) -> Result<Option<ConsumerGroupDetail>> {
    let Some(description) = admin.describe_group(group_id).await? else {
        return Ok(None);
    };
    let committed = admin.committed_offsets(group_id, None).await?;

    let members = describe_members(&description);

    // (topic, partition) -> owning member
    let mut owners: HashMap<(String, i32), String> = HashMap::new();
    for member in &members {
        for assignment in &member.member_assignment {
            for &partition in &assignment.partitions {
                owners.insert((assignment.topic.clone(), partition), member.member_id.clone());
            }
        }
    }

    let mut by_topic: BTreeMap<String, Vec<_>> = BTreeMap::new();
    for offset in committed {
        by_topic.entry(offset.topic.clone()).or_default().push(offset);
    }

    let watermarks = join_all(by_topic.keys().map(|topic| async move {
        (topic.clone(), admin.watermarks(topic).await)
    }))
    .await;
    let log_ends: HashMap<String, HashMap<i32, i64>> = watermarks
        .into_iter()
        .filter_map(|(topic, result)| match result {
            Ok(marks) => Some((topic, marks.into_iter().map(|w| (w.partition, w.high)).collect())),
            Err(e) => {
                warn!(
                    "[GroupManager] No watermarks for '{}' in group '{}': {}",
                    topic, group_id, e
                );
                None
            }
        })
        .collect();

    let mut partition_details = Vec::new();
    for (topic, offsets) in by_topic {
        let ends = log_ends.get(&topic);
        for offset in offsets {
            // Unknown log end: report the committed offset as the end and no lag
            let log_end = ends
                .and_then(|e| e.get(&offset.partition).copied())
                .unwrap_or(offset.offset);
            partition_details.push(PartitionConsumerDetail {
                member_id: owners.get(&(topic.clone(), offset.partition)).cloned(),
                topic: topic.clone(),
                partition: offset.partition,
                current_offset: offset.offset.to_string(),
                log_end_offset: log_end.to_string(),
                lag: partition_lag(log_end, offset.offset),
                last_committed_at: offset.committed_at,
            });
        }
    }
    partition_details.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.partition.cmp(&b.partition)));
    let total_lag = partition_details.iter().map(|d| d.lag).sum();

    Ok(Some(ConsumerGroupDetail {
        group_id: description.group_id,
        state: ConsumerGroupState::from_broker(&description.state),
        protocol: description.protocol,
        protocol_type: description.protocol_type,
        members,
        partition_details,
        total_lag,
    }))
}

fn describe_members(description: &GroupDescription) -> Vec<ConsumerGroupMember> {
    description
        .members
        .iter()
        .map(|m| {
            let member_assignment: Vec<TopicAssignment> = match decode_assignment(&m.assignment) {
                Ok(assignment) => assignment,
                Err(e) => {
                    warn!(
                        "[GroupManager] Member {} of '{}' has an unreadable assignment: {}",
                        m.member_id, description.group_id, e
                    );
                    Vec::new()
                }
            };
            ConsumerGroupMember {
                member_id: m.member_id.clone(),
                client_id: m.client_id.clone(),
                client_host: m.client_host.clone(),
                member_assignment,
            }
        })
        .collect()
}

// ==========================================
// RESET
// ==========================================

async fn resolve_targets(admin: &dyn AdminClient, request: &OffsetResetRequest) -> Result<Vec<TopicPartitionOffset>> {
    let metadata = admin
        .topic_metadata(&request.topic)
        .await?
        .ok_or_else(|| KafdeskError::not_found("Topic", &request.topic))?;
    let known: Vec<i32> = metadata.partitions.iter().map(|p| p.id).collect();

    let partitions: Vec<i32> = match &request.partitions {
        Some(requested) => {
            if requested.is_empty() {
                return Err(KafdeskError::Validation("Partition list must not be empty".to_string()));
            }
            if let Some(bad) = requested.iter().find(|p| !known.contains(p)) {
                return Err(KafdeskError::Validation(format!(
                    "Topic '{}' has no partition {}",
                    request.topic, bad
                )));
            }
            let mut requested = requested.clone();
            requested.sort_unstable();
            requested.dedup();
            requested
        }
        None => {
            let mut all = known;
            all.sort_unstable();
            all
        }
    };

    let high: HashMap<i32, i64> = admin
        .watermarks(&request.topic)
        .await?
        .into_iter()
        .map(|w| (w.partition, w.high))
        .collect();
    let log_end = |p: i32| high.get(&p).copied().unwrap_or(0);

    let offsets: Vec<(i32, i64)> = match request.strategy {
        OffsetResetStrategy::Earliest => partitions.iter().map(|&p| (p, 0)).collect(),
        OffsetResetStrategy::Latest => partitions.iter().map(|&p| (p, log_end(p))).collect(),
        OffsetResetStrategy::Offset { offset } => partitions.iter().map(|&p| (p, offset)).collect(),
        OffsetResetStrategy::Timestamp { timestamp } => admin
            .offsets_for_times(&request.topic, &partitions, timestamp)
            .await?
            .into_iter()
            // Nothing at or after the timestamp: park at the log end
            .map(|(p, found)| (p, found.unwrap_or_else(|| log_end(p))))
            .collect(),
        OffsetResetStrategy::Shift { shift } => {
            let committed: HashMap<i32, i64> = admin
                .committed_offsets(&request.group_id, Some(&request.topic))
                .await?
                .into_iter()
                .map(|c| (c.partition, c.offset))
                .collect();
            partitions
                .iter()
                .filter_map(|&p| match committed.get(&p) {
                    Some(&current) => Some((p, current.saturating_add(shift).max(0))),
                    None => {
                        debug!(
                            "[GroupManager] Partition {} of '{}' has no commit for '{}'; not shifted",
                            p, request.topic, request.group_id
                        );
                        None
                    }
                })
                .collect()
        }
    };

    Ok(offsets
        .into_iter()
        .map(|(partition, offset)| TopicPartitionOffset {
            topic: request.topic.clone(),
            partition,
            offset,
        })
        .collect())
}
