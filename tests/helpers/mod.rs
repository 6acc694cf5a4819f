#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kafdesk::cluster::MemoryCluster;
use kafdesk::config::{Config, StorageConfig};
use kafdesk::models::{
    ConnectionDraft, ConsumerEvent, ConsumerMessage, CreateTopicRequest, ProducerMessage, SaslConfig,
    SaslMechanism, SessionStatus,
};
use kafdesk::KafdeskEngine;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const BROKER: &str = "localhost:9092";
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn setup_engine() -> (KafdeskEngine, MemoryCluster, TempDir) {
    setup_engine_with(|_| {}).await
}

/// Engine over a fresh in-memory cluster and a throwaway data directory.
pub async fn setup_engine_with(tweak: impl FnOnce(&mut Config)) -> (KafdeskEngine, MemoryCluster, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage = StorageConfig::at(temp_dir.path());
    tweak(&mut config);

    let cluster = MemoryCluster::new(&[BROKER]);
    let engine = KafdeskEngine::new(&config, Arc::new(cluster.clone())).unwrap();
    (engine, cluster, temp_dir)
}

pub fn reopen_engine(dir: &TempDir, cluster: &MemoryCluster) -> KafdeskEngine {
    let mut config = Config::default();
    config.storage = StorageConfig::at(dir.path());
    KafdeskEngine::new(&config, Arc::new(cluster.clone())).unwrap()
}

pub fn draft(name: &str) -> ConnectionDraft {
    ConnectionDraft {
        name: name.to_string(),
        brokers: vec![BROKER.to_string()],
        ..Default::default()
    }
}

pub fn sasl_draft(name: &str, username: &str, password: &str) -> ConnectionDraft {
    ConnectionDraft {
        sasl: Some(SaslConfig {
            mechanism: SaslMechanism::ScramSha256,
            username: username.to_string(),
            password: password.to_string(),
        }),
        ..draft(name)
    }
}

/// Stored connection named `local`.
pub fn create_connection(engine: &KafdeskEngine) -> String {
    engine.create_connection(draft("local")).unwrap()
}

pub async fn create_topic(engine: &KafdeskEngine, connection_id: &str, topic: &str, partitions: i32) {
    engine
        .admin
        .create_topic(
            connection_id,
            CreateTopicRequest {
                topic: topic.to_string(),
                num_partitions: partitions,
                replication_factor: 1,
                config_entries: Vec::new(),
            },
        )
        .await
        .unwrap();
}

pub async fn produce(engine: &KafdeskEngine, connection_id: &str, topic: &str, values: &[&str]) {
    for value in values {
        let result = engine
            .producers
            .send_message(connection_id, ProducerMessage::new(topic, *value))
            .await;
        assert!(result.success, "produce failed: {:?}", result.error);
    }
}

/// Next message event of `session_id`, skipping everything else.
pub async fn next_message(rx: &mut broadcast::Receiver<ConsumerEvent>, session_id: &str) -> ConsumerMessage {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await.unwrap() {
                ConsumerEvent::Message { session_id: id, message } if id == session_id => return message,
                _ => continue,
            }
        }
    })
    .await
    .expect("no message event in time")
}

pub async fn next_status(rx: &mut broadcast::Receiver<ConsumerEvent>, session_id: &str) -> SessionStatus {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await.unwrap() {
                ConsumerEvent::Status { session_id: id, status } if id == session_id => return status,
                _ => continue,
            }
        }
    })
    .await
    .expect("no status event in time")
}

/// Asserts that no message event for `session_id` arrives within `wait`.
pub async fn assert_no_message(rx: &mut broadcast::Receiver<ConsumerEvent>, session_id: &str, wait: Duration) {
    let got = tokio::time::timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(ConsumerEvent::Message { session_id: id, message }) if id == session_id => return message,
                Ok(_) => continue,
                Err(_) => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(got.is_err(), "unexpected message: {:?}", got);
}

pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
