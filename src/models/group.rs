use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerGroupState {
    Stable,
    Dead,
    Empty,
    PreparingRebalance,
    CompletingRebalance,
    Unknown,
}

impl ConsumerGroupState {
    /// Maps the broker's state string ("Stable", "PreparingRebalance", ...).
    pub fn from_broker(state: &str) -> Self {
        let normalized: String = state
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "stable" => ConsumerGroupState::Stable,
            "dead" => ConsumerGroupState::Dead,
            "empty" => ConsumerGroupState::Empty,
            "preparingrebalance" => ConsumerGroupState::PreparingRebalance,
            "completingrebalance" | "awaitingsync" => ConsumerGroupState::CompletingRebalance,
            _ => ConsumerGroupState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicAssignment {
    pub topic: String,
    pub partitions: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerGroupMember {
    pub member_id: String,
    pub client_id: String,
    pub client_host: String,
    pub member_assignment: Vec<TopicAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerGroup {
    pub group_id: String,
    pub state: ConsumerGroupState,
    pub protocol: String,
    pub protocol_type: String,
    pub members: Vec<ConsumerGroupMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionConsumerDetail {
    pub topic: String,
    pub partition: i32,
    pub current_offset: String,
    pub log_end_offset: String,
    pub lag: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_committed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerGroupDetail {
    pub group_id: String,
    pub state: ConsumerGroupState,
    pub protocol: String,
    pub protocol_type: String,
    pub members: Vec<ConsumerGroupMember>,
    pub partition_details: Vec<PartitionConsumerDetail>,
    pub total_lag: i64,
}

/// Reset target. Only the payload relevant to each strategy exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum OffsetResetStrategy {
    Earliest,
    Latest,
    /// Milliseconds since epoch
    Timestamp { timestamp: i64 },
    Offset { offset: i64 },
    /// Signed delta applied to the committed offset
    Shift { shift: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetResetRequest {
    pub group_id: String,
    pub topic: String,
    #[serde(default)]
    pub partitions: Option<Vec<i32>>,
    #[serde(flatten)]
    pub strategy: OffsetResetStrategy,
}

/// lag = max(0, logEnd - current)
pub fn partition_lag(log_end_offset: i64, current_offset: i64) -> i64 {
    (log_end_offset - current_offset).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lag_never_negative() {
        assert_eq!(partition_lag(1500, 1000), 500);
        assert_eq!(partition_lag(1000, 1500), 0);
        assert_eq!(partition_lag(0, 0), 0);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(ConsumerGroupState::from_broker("Stable"), ConsumerGroupState::Stable);
        assert_eq!(
            ConsumerGroupState::from_broker("PreparingRebalance"),
            ConsumerGroupState::PreparingRebalance
        );
        assert_eq!(
            ConsumerGroupState::from_broker("COMPLETING_REBALANCE"),
            ConsumerGroupState::CompletingRebalance
        );
        assert_eq!(ConsumerGroupState::from_broker("Empty"), ConsumerGroupState::Empty);
        assert_eq!(ConsumerGroupState::from_broker("bogus"), ConsumerGroupState::Unknown);
    }

    #[test]
    fn test_reset_request_wire_shape() {
        let req: OffsetResetRequest = serde_json::from_str(
            r#"{"groupId":"g","topic":"t","strategy":"shift","shift":-20}"#,
        )
        .unwrap();
        assert_eq!(req.strategy, OffsetResetStrategy::Shift { shift: -20 });
        assert!(req.partitions.is_none());

        let latest: OffsetResetRequest =
            serde_json::from_str(r#"{"groupId":"g","topic":"t","partitions":[0,2],"strategy":"latest"}"#).unwrap();
        assert_eq!(latest.strategy, OffsetResetStrategy::Latest);
        assert_eq!(latest.partitions, Some(vec![0, 2]));
    }
}
