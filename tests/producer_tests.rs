use std::sync::Arc;

use kafdesk::models::{MessageHeader, ProducerMessage};

mod helpers;
use helpers::*;

#[cfg(test)]
mod producer_tests {
    use super::*;

    mod features {
        use super::*;

        #[tokio::test]
        async fn test_send_reports_position() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "orders", 1).await;

            let mut message = ProducerMessage::new("orders", "first");
            message.key = Some("order-1".to_string());
            message.headers.push(MessageHeader {
                key: "source".to_string(),
                value: "test".to_string(),
            });
            message.timestamp = Some("1700000000000".to_string());

            let first = engine.producers.send_message(&id, message).await;
            assert!(first.success, "{:?}", first.error);
            assert_eq!(first.partition, Some(0));
            assert_eq!(first.offset.as_deref(), Some("0"));
            assert_eq!(first.timestamp.as_deref(), Some("1700000000000"));

            let second = engine
                .producers
                .send_message(&id, ProducerMessage::new("orders", "second"))
                .await;
            assert_eq!(second.offset.as_deref(), Some("1"));
        }

        #[tokio::test]
        async fn test_send_failures_are_reported_not_raised() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);

            let missing_topic = engine
                .producers
                .send_message(&id, ProducerMessage::new("nowhere", "x"))
                .await;
            assert!(!missing_topic.success);
            assert!(missing_topic.error.unwrap().contains("does not host"));

            let unknown_connection = engine
                .producers
                .send_message("nope", ProducerMessage::new("nowhere", "x"))
                .await;
            assert!(!unknown_connection.success);
            assert!(unknown_connection.offset.is_none());
        }

        #[tokio::test]
        async fn test_explicit_partition_is_honoured() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "wide", 4).await;

            let mut message = ProducerMessage::new("wide", "x");
            message.partition = Some(3);
            let result = engine.producers.send_message(&id, message).await;
            assert_eq!(result.partition, Some(3));

            let mut out_of_range = ProducerMessage::new("wide", "x");
            out_of_range.partition = Some(9);
            assert!(!engine.producers.send_message(&id, out_of_range).await.success);
        }

        #[tokio::test]
        async fn test_batch_fails_per_topic() {
            let (engine, cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "good", 1).await;
            create_topic(&engine, &id, "bad", 1).await;
            cluster.fail_topic("bad", "Broker: Not enough in-sync replicas");

            let batch = vec![
                ProducerMessage::new("good", "g0"),
                ProducerMessage::new("bad", "b0"),
                ProducerMessage::new("good", "g1"),
                ProducerMessage::new("bad", "b1"),
            ];
            let result = engine.producers.send_batch_messages(&id, batch).await;

            assert!(!result.success);
            assert_eq!(result.success_count, 2);
            assert_eq!(result.failure_count, 2);
            let outcome: Vec<bool> = result.results.iter().map(|r| r.success).collect();
            assert_eq!(outcome, vec![true, false, true, false]);

            // Input order is kept and good offsets are consecutive
            assert_eq!(result.results[0].offset.as_deref(), Some("0"));
            assert_eq!(result.results[2].offset.as_deref(), Some("1"));
            assert_eq!(result.results[1].error, result.results[3].error);
            assert!(result.results[1].error.as_ref().unwrap().contains("in-sync replicas"));
        }

        #[tokio::test]
        async fn test_batch_without_producer_fails_every_message() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let batch = vec![ProducerMessage::new("a", "1"), ProducerMessage::new("b", "2")];

            let result = engine.producers.send_batch_messages("nope", batch).await;
            assert!(!result.success);
            assert_eq!(result.failure_count, 2);
            assert!(result.results.iter().all(|r| r.error.as_deref().unwrap().contains("nope")));
        }

        #[tokio::test]
        async fn test_empty_batch_succeeds() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let result = engine.producers.send_batch_messages("nope", Vec::new()).await;
            assert!(result.success);
            assert!(result.results.is_empty());
        }

        #[tokio::test]
        async fn test_producer_is_built_once_per_connection() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            assert!(!engine.producers.has_producer(&id));

            let (a, b) = tokio::join!(engine.producers.get_producer(&id), engine.producers.get_producer(&id));
            assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
            assert!(engine.producers.has_producer(&id));

            engine.producers.close_producer(&id).await;
            assert!(!engine.producers.has_producer(&id));
        }
    }
}
