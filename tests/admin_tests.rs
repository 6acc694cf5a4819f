use std::collections::BTreeMap;

use kafdesk::models::{CreateTopicRequest, TopicConfigEntry};

mod helpers;
use helpers::*;

#[cfg(test)]
mod admin_tests {
    use super::*;

    fn request(topic: &str, partitions: i32, replication_factor: i32) -> CreateTopicRequest {
        CreateTopicRequest {
            topic: topic.to_string(),
            num_partitions: partitions,
            replication_factor,
            config_entries: Vec::new(),
        }
    }

    mod features {
        use super::*;

        #[tokio::test]
        async fn test_topics_are_listed_sorted_with_internal_flag() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "zeta", 1).await;
            create_topic(&engine, &id, "alpha", 3).await;

            let topics = engine.admin.list_topics(&id).await.unwrap();
            let names: Vec<&str> = topics.iter().map(|t| t.name.as_str()).collect();
            assert_eq!(names, vec!["__consumer_offsets", "alpha", "zeta"]);
            assert!(topics[0].internal);
            assert!(!topics[1].internal);
            assert_eq!(topics[1].partitions, 3);
            assert_eq!(topics[1].replication_factor, 1);
        }

        #[tokio::test]
        async fn test_topic_detail_has_real_offsets_and_configs() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            let mut create = request("events", 2, 1);
            create.config_entries.push(TopicConfigEntry {
                name: "retention.ms".to_string(),
                value: "60000".to_string(),
            });
            engine.admin.create_topic(&id, create).await.unwrap();
            produce(&engine, &id, "events", &["a", "b", "c", "d"]).await;

            let detail = engine.admin.get_topic_detail(&id, "events").await.unwrap();
            assert_eq!(detail.partitions, 2);
            assert_eq!(detail.partition_details.len(), 2);
            assert_eq!(detail.partition_details[0].partition_id, 0);
            assert_eq!(detail.partition_details[0].earliest_offset, "0");
            let total: i64 = detail
                .partition_details
                .iter()
                .map(|p| p.latest_offset.parse::<i64>().unwrap())
                .sum();
            assert_eq!(total, 4);

            let retention = detail.configs.iter().find(|c| c.name == "retention.ms").unwrap();
            assert_eq!(retention.value.as_deref(), Some("60000"));
            assert_eq!(retention.source, "DYNAMIC_TOPIC_CONFIG");
        }

        #[tokio::test]
        async fn test_create_topic_validation() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "dup", 1).await;

            let cases = [
                request("dup", 1, 1),
                request("bad name", 1, 1),
                request("zero", 0, 1),
                request("rf", 1, 3),
            ];
            for case in cases {
                let topic = case.topic.clone();
                let err = engine.admin.create_topic(&id, case).await.unwrap_err();
                assert_eq!(err.kind(), "VALIDATION", "topic {}", topic);
            }
        }

        #[tokio::test]
        async fn test_update_topic_config() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;

            let mut entries = BTreeMap::new();
            entries.insert("cleanup.policy".to_string(), "compact".to_string());
            engine.admin.update_topic_config(&id, "t", entries).await.unwrap();

            let detail = engine.admin.get_topic_detail(&id, "t").await.unwrap();
            let policy = detail.configs.iter().find(|c| c.name == "cleanup.policy").unwrap();
            assert_eq!(policy.value.as_deref(), Some("compact"));

            let err = engine.admin.update_topic_config(&id, "t", BTreeMap::new()).await.unwrap_err();
            assert_eq!(err.kind(), "VALIDATION");
        }

        #[tokio::test]
        async fn test_partitions_only_grow() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 2).await;

            engine.admin.add_partitions(&id, "t", 5).await.unwrap();
            assert_eq!(engine.admin.get_topic_detail(&id, "t").await.unwrap().partitions, 5);

            let err = engine.admin.add_partitions(&id, "t", 3).await.unwrap_err();
            assert_eq!(err.kind(), "VALIDATION");
            let err = engine.admin.add_partitions(&id, "missing", 3).await.unwrap_err();
            assert_eq!(err.kind(), "NOT_FOUND");
        }

        #[tokio::test]
        async fn test_delete_topic() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;

            engine.admin.delete_topic(&id, "t").await.unwrap();
            let err = engine.admin.get_topic_detail(&id, "t").await.unwrap_err();
            assert_eq!(err.kind(), "NOT_FOUND");
        }

        #[tokio::test]
        async fn test_cluster_info() {
            let (engine, cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);

            let info = engine.admin.get_cluster_info(&id).await.unwrap();
            assert_eq!(info.brokers.len(), 1);
            assert_eq!(info.brokers[0].host, "localhost");
            assert_eq!(info.brokers[0].port, 9092);
            assert_eq!(info.cluster_id.as_deref(), Some(cluster.cluster_id()));

            let brokers = engine.admin.list_brokers(&id).await.unwrap();
            assert_eq!(brokers.len(), 1);
            assert_eq!(brokers[0].node_id, info.brokers[0].node_id);
        }

        #[tokio::test]
        async fn test_unreachable_cluster_is_a_connection_error() {
            let (engine, cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            cluster.set_reachable(false);

            let err = engine.admin.list_topics(&id).await.unwrap_err();
            assert_eq!(err.kind(), "CONNECTION");
        }

        #[tokio::test]
        async fn test_rejected_credentials_are_an_authentication_error() {
            let (engine, cluster, _tmp) = setup_engine().await;
            cluster.require_credentials("alice", "s3cret");
            let id = engine.create_connection(sasl_draft("prod", "alice", "nope")).unwrap();

            let err = engine.admin.list_topics(&id).await.unwrap_err();
            assert_eq!(err.kind(), "AUTHENTICATION");
        }
    }
}
