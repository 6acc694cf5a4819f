//! Command Router: maps command names to engine operations.
//! Arguments arrive as a JSON object and are decoded per command.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{KafdeskError, Result};
use crate::models::{
    ConnectionDraft, ConnectionPatch, ConsumeOptions, CreateTopicRequest, OffsetResetRequest,
    ProducerMessage,
};
use crate::KafdeskEngine;

// ========================================
// ARGUMENTS
// ========================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionArgs {
    connection_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateConnectionArgs {
    connection_id: String,
    #[serde(flatten)]
    patch: ConnectionPatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicArgs {
    connection_id: String,
    topic: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTopicArgs {
    connection_id: String,
    #[serde(flatten)]
    request: CreateTopicRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicConfigArgs {
    connection_id: String,
    topic: String,
    configs: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddPartitionsArgs {
    connection_id: String,
    topic: String,
    total_count: i32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendArgs {
    connection_id: String,
    message: ProducerMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBatchArgs {
    connection_id: String,
    messages: Vec<ProducerMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionArgs {
    connection_id: String,
    options: ConsumeOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionArgs {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeekArgs {
    session_id: String,
    partition: i32,
    /// Decimal string or number
    offset: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupArgs {
    connection_id: String,
    group_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetOffsetArgs {
    connection_id: String,
    #[serde(flatten)]
    request: OffsetResetRequest,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SessionFilterArgs {
    #[serde(default)]
    connection_id: Option<String>,
}

fn parse<T: DeserializeOwned>(command: &str, args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|e| KafdeskError::Validation(format!("Invalid arguments for '{}': {}", command, e)))
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| KafdeskError::Unknown(e.to_string()))
}

fn parse_offset(raw: &Value) -> Result<i64> {
    let parsed = match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| KafdeskError::Validation(format!("Offset {} is not an integer", raw)))
}

// ========================================
// ROUTING
// ========================================

pub async fn route(command: &str, args: Value, engine: &KafdeskEngine) -> Result<Value> {
    match command {
        // CONNECTIONS
        "connection:list" => to_value(engine.list_connections()?),
        "connection:create" => {
            let draft: ConnectionDraft = parse(command, args)?;
            let id = engine.create_connection(draft)?;
            Ok(json!({ "id": id }))
        }
        "connection:update" => {
            let a: UpdateConnectionArgs = parse(command, args)?;
            engine.update_connection(&a.connection_id, a.patch).await?;
            Ok(Value::Null)
        }
        "connection:delete" => {
            let a: ConnectionArgs = parse(command, args)?;
            engine.delete_connection(&a.connection_id).await?;
            Ok(Value::Null)
        }
        "connection:test" => {
            let draft: ConnectionDraft = parse(command, args)?;
            to_value(engine.test_connection(draft).await)
        }
        "connection:connect" => {
            let a: ConnectionArgs = parse(command, args)?;
            to_value(engine.connect(&a.connection_id)?)
        }
        "connection:disconnect" => {
            let a: ConnectionArgs = parse(command, args)?;
            engine.disconnect(&a.connection_id).await?;
            Ok(Value::Null)
        }
        "connection:active" => to_value(engine.get_active_connection()?),

        // TOPICS
        "topic:list" => {
            let a: ConnectionArgs = parse(command, args)?;
            to_value(engine.admin.list_topics(&a.connection_id).await?)
        }
        "topic:detail" => {
            let a: TopicArgs = parse(command, args)?;
            to_value(engine.admin.get_topic_detail(&a.connection_id, &a.topic).await?)
        }
        "topic:create" => {
            let a: CreateTopicArgs = parse(command, args)?;
            engine.admin.create_topic(&a.connection_id, a.request).await?;
            Ok(Value::Null)
        }
        "topic:delete" => {
            let a: TopicArgs = parse(command, args)?;
            engine.admin.delete_topic(&a.connection_id, &a.topic).await?;
            Ok(Value::Null)
        }
        "topic:config:update" => {
            let a: TopicConfigArgs = parse(command, args)?;
            engine
                .admin
                .update_topic_config(&a.connection_id, &a.topic, a.configs)
                .await?;
            Ok(Value::Null)
        }
        "topic:partition:add" => {
            let a: AddPartitionsArgs = parse(command, args)?;
            engine
                .admin
                .add_partitions(&a.connection_id, &a.topic, a.total_count)
                .await?;
            Ok(Value::Null)
        }
        "cluster:info" => {
            let a: ConnectionArgs = parse(command, args)?;
            to_value(engine.admin.get_cluster_info(&a.connection_id).await?)
        }
        "cluster:brokers" => {
            let a: ConnectionArgs = parse(command, args)?;
            to_value(engine.admin.list_brokers(&a.connection_id).await?)
        }

        // PRODUCER
        "producer:send" => {
            let a: SendArgs = parse(command, args)?;
            to_value(engine.producers.send_message(&a.connection_id, a.message).await)
        }
        "producer:send-batch" => {
            let a: SendBatchArgs = parse(command, args)?;
            to_value(engine.producers.send_batch_messages(&a.connection_id, a.messages).await)
        }

        // CONSUMER SESSIONS
        "consumer:start" => {
            let a: StartSessionArgs = parse(command, args)?;
            to_value(engine.sessions.create_session(&a.connection_id, a.options).await?)
        }
        "consumer:pause" => {
            let a: SessionArgs = parse(command, args)?;
            engine.sessions.pause_session(&a.session_id).await?;
            Ok(Value::Null)
        }
        "consumer:resume" => {
            let a: SessionArgs = parse(command, args)?;
            engine.sessions.resume_session(&a.session_id).await?;
            Ok(Value::Null)
        }
        "consumer:stop" => {
            let a: SessionArgs = parse(command, args)?;
            engine.sessions.stop_session(&a.session_id).await?;
            Ok(Value::Null)
        }
        "consumer:seek" => {
            let a: SeekArgs = parse(command, args)?;
            let offset = parse_offset(&a.offset)?;
            engine.sessions.seek_to_offset(&a.session_id, a.partition, offset).await?;
            Ok(Value::Null)
        }
        "consumer:sessions" => {
            let a: SessionFilterArgs = parse(command, args)?;
            let sessions: Vec<_> = engine
                .sessions
                .get_all_sessions()
                .into_iter()
                .filter(|s| a.connection_id.as_ref().map_or(true, |c| *c == s.connection_id))
                .collect();
            to_value(sessions)
        }

        // CONSUMER GROUPS
        "consumer-group:list" => {
            let a: ConnectionArgs = parse(command, args)?;
            to_value(engine.groups.list_consumer_groups(&a.connection_id).await?)
        }
        "consumer-group:detail" => {
            let a: GroupArgs = parse(command, args)?;
            to_value(
                engine
                    .groups
                    .get_consumer_group_detail(&a.connection_id, &a.group_id)
                    .await?,
            )
        }
        "consumer-group:reset-offset" => {
            let a: ResetOffsetArgs = parse(command, args)?;
            let written = engine.groups.reset_offset(&a.connection_id, a.request).await?;
            Ok(json!({
                "partitions": written
                    .iter()
                    .map(|o| json!({ "partition": o.partition, "offset": o.offset.to_string() }))
                    .collect::<Vec<_>>()
            }))
        }
        "consumer-group:delete" => {
            let a: GroupArgs = parse(command, args)?;
            engine
                .groups
                .delete_consumer_group(&a.connection_id, &a.group_id)
                .await?;
            Ok(Value::Null)
        }

        other => Err(KafdeskError::Validation(format!("Unknown command '{}'", other))),
    }
}
