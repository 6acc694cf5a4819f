use std::time::Duration;

use kafdesk::models::{ConsumeOptions, SessionStatus};

mod helpers;
use helpers::*;

#[cfg(test)]
mod session_tests {
    use super::*;

    mod features {
        use super::*;

        #[tokio::test]
        async fn test_produce_then_consume_round_trip() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "greetings", 1).await;

            let sent = engine
                .producers
                .send_message(&id, kafdesk::models::ProducerMessage::new("greetings", "hello"))
                .await;
            assert!(sent.success);
            assert_eq!(sent.offset.as_deref(), Some("0"));

            let mut events = engine.sessions.subscribe_events();
            let options = ConsumeOptions {
                from_beginning: true,
                ..ConsumeOptions::topic("greetings")
            };
            let session = engine.sessions.create_session(&id, options).await.unwrap();
            assert_eq!(session.status, SessionStatus::Running);
            assert_eq!(session.group_id, format!("kafdesk-{}", session.id));

            let message = next_message(&mut events, &session.id).await;
            assert_eq!(message.value, "hello");
            assert_eq!(message.offset, "0");
            assert_eq!(message.partition, 0);
            assert!(message.timestamp.parse::<i64>().is_ok());

            wait_for(|| engine.sessions.get_session(&session.id).unwrap().message_count == 1).await;
            engine.sessions.stop_session(&session.id).await.unwrap();
        }

        #[tokio::test]
        async fn test_live_session_skips_history() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;
            produce(&engine, &id, "t", &["old"]).await;

            let mut events = engine.sessions.subscribe_events();
            let session = engine
                .sessions
                .create_session(&id, ConsumeOptions::topic("t"))
                .await
                .unwrap();
            produce(&engine, &id, "t", &["new"]).await;

            let message = next_message(&mut events, &session.id).await;
            assert_eq!(message.value, "new");
            assert_eq!(message.offset, "1");
            engine.sessions.stop_session(&session.id).await.unwrap();
        }

        #[tokio::test]
        async fn test_explicit_start_offset() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;
            produce(&engine, &id, "t", &["a", "b", "c"]).await;

            let mut events = engine.sessions.subscribe_events();
            let options = ConsumeOptions {
                from_offset: Some("2".to_string()),
                ..ConsumeOptions::topic("t")
            };
            let session = engine.sessions.create_session(&id, options).await.unwrap();

            assert_eq!(next_message(&mut events, &session.id).await.value, "c");
            engine.sessions.stop_session(&session.id).await.unwrap();
        }

        #[tokio::test]
        async fn test_session_state_machine() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;
            let session = engine
                .sessions
                .create_session(&id, ConsumeOptions::topic("t"))
                .await
                .unwrap();
            let sid = session.id.as_str();

            assert_eq!(engine.sessions.resume_session(sid).await.unwrap_err().kind(), "STATE");

            engine.sessions.pause_session(sid).await.unwrap();
            assert_eq!(engine.sessions.get_session(sid).unwrap().status, SessionStatus::Paused);
            assert_eq!(engine.sessions.pause_session(sid).await.unwrap_err().kind(), "STATE");

            // Seeking is allowed while paused and keeps the status
            engine.sessions.seek_to_offset(sid, 0, 0).await.unwrap();
            assert_eq!(engine.sessions.get_session(sid).unwrap().status, SessionStatus::Paused);

            engine.sessions.resume_session(sid).await.unwrap();
            assert_eq!(engine.sessions.get_session(sid).unwrap().status, SessionStatus::Running);

            engine.sessions.stop_session(sid).await.unwrap();
            assert!(engine.sessions.get_session(sid).is_none());
            assert_eq!(engine.sessions.pause_session(sid).await.unwrap_err().kind(), "NOT_FOUND");
            assert_eq!(engine.sessions.seek_to_offset(sid, 0, 0).await.unwrap_err().kind(), "NOT_FOUND");

            // Stopping twice or stopping an unknown id is a no-op
            assert!(engine.sessions.stop_session(sid).await.is_ok());
            assert!(engine.sessions.stop_session("nope").await.is_ok());
        }

        #[tokio::test]
        async fn test_paused_session_delivers_nothing_until_resumed() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;

            let mut events = engine.sessions.subscribe_events();
            let session = engine
                .sessions
                .create_session(&id, ConsumeOptions::topic("t"))
                .await
                .unwrap();
            engine.sessions.pause_session(&session.id).await.unwrap();
            assert_eq!(next_status(&mut events, &session.id).await, SessionStatus::Paused);

            produce(&engine, &id, "t", &["m0", "m1", "m2"]).await;
            assert_no_message(&mut events, &session.id, Duration::from_millis(150)).await;
            assert_eq!(engine.sessions.get_session(&session.id).unwrap().message_count, 0);

            engine.sessions.resume_session(&session.id).await.unwrap();
            for expected in ["0", "1", "2"] {
                assert_eq!(next_message(&mut events, &session.id).await.offset, expected);
            }
            engine.sessions.stop_session(&session.id).await.unwrap();
        }

        #[tokio::test]
        async fn test_seek_replays_partition() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;
            produce(&engine, &id, "t", &["a", "b", "c"]).await;

            let mut events = engine.sessions.subscribe_events();
            let options = ConsumeOptions {
                from_beginning: true,
                ..ConsumeOptions::topic("t")
            };
            let session = engine.sessions.create_session(&id, options).await.unwrap();
            for _ in 0..3 {
                next_message(&mut events, &session.id).await;
            }

            engine.sessions.seek_to_offset(&session.id, 0, 1).await.unwrap();
            assert_eq!(next_message(&mut events, &session.id).await.value, "b");
            assert_eq!(next_message(&mut events, &session.id).await.value, "c");

            let err = engine.sessions.seek_to_offset(&session.id, 0, -5).await.unwrap_err();
            assert_eq!(err.kind(), "VALIDATION");
            engine.sessions.stop_session(&session.id).await.unwrap();
        }

        #[tokio::test]
        async fn test_auto_commit_records_next_offset() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;
            produce(&engine, &id, "t", &["a", "b"]).await;

            let mut events = engine.sessions.subscribe_events();
            let options = ConsumeOptions {
                from_beginning: true,
                group_id: Some("auditors".to_string()),
                ..ConsumeOptions::topic("t")
            };
            let session = engine.sessions.create_session(&id, options).await.unwrap();
            assert_eq!(session.group_id, "auditors");
            next_message(&mut events, &session.id).await;
            next_message(&mut events, &session.id).await;
            wait_for(|| engine.sessions.get_session(&session.id).unwrap().message_count == 2).await;
            engine.sessions.stop_session(&session.id).await.unwrap();

            let detail = engine
                .groups
                .get_consumer_group_detail(&id, "auditors")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(detail.partition_details.len(), 1);
            assert_eq!(detail.partition_details[0].current_offset, "2");
            assert_eq!(detail.total_lag, 0);
        }

        #[tokio::test]
        async fn test_manual_commit_leaves_group_offsets_alone() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;
            produce(&engine, &id, "t", &["a"]).await;

            let mut events = engine.sessions.subscribe_events();
            let options = ConsumeOptions {
                from_beginning: true,
                group_id: Some("readers".to_string()),
                auto_commit: false,
                ..ConsumeOptions::topic("t")
            };
            let session = engine.sessions.create_session(&id, options).await.unwrap();
            next_message(&mut events, &session.id).await;
            engine.sessions.stop_session(&session.id).await.unwrap();

            let detail = engine.groups.get_consumer_group_detail(&id, "readers").await.unwrap();
            assert!(detail.map_or(true, |d| d.partition_details.is_empty()));
        }

        #[tokio::test]
        async fn test_broker_failure_stops_session() {
            let (engine, cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;

            let mut events = engine.sessions.subscribe_events();
            let session = engine
                .sessions
                .create_session(&id, ConsumeOptions::topic("t"))
                .await
                .unwrap();

            cluster.set_reachable(false);
            assert_eq!(next_status(&mut events, &session.id).await, SessionStatus::Stopped);

            // Stays registered as stopped until reaped
            let snapshot = engine.sessions.get_session(&session.id).unwrap();
            assert_eq!(snapshot.status, SessionStatus::Stopped);
            assert_eq!(engine.sessions.pause_session(&session.id).await.unwrap_err().kind(), "STATE");
            assert_eq!(engine.sessions.seek_to_offset(&session.id, 0, 0).await.unwrap_err().kind(), "STATE");

            cluster.set_reachable(true);
            engine.sessions.stop_session(&session.id).await.unwrap();
            assert!(engine.sessions.get_all_sessions().is_empty());
        }

        #[tokio::test]
        async fn test_invalid_sessions_are_not_registered() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 2).await;

            let bad_offset = ConsumeOptions {
                from_offset: Some("abc".to_string()),
                ..ConsumeOptions::topic("t")
            };
            assert_eq!(
                engine.sessions.create_session(&id, bad_offset).await.unwrap_err().kind(),
                "VALIDATION"
            );

            let missing = engine
                .sessions
                .create_session(&id, ConsumeOptions::topic("missing"))
                .await
                .unwrap_err();
            assert_eq!(missing.kind(), "NOT_FOUND");

            let bad_partition = ConsumeOptions {
                partitions: Some(vec![7]),
                ..ConsumeOptions::topic("t")
            };
            assert!(engine.sessions.create_session(&id, bad_partition).await.is_err());

            let unknown_connection = engine
                .sessions
                .create_session("nope", ConsumeOptions::topic("t"))
                .await
                .unwrap_err();
            assert_eq!(unknown_connection.kind(), "NOT_FOUND");

            assert!(engine.sessions.get_all_sessions().is_empty());
        }

        #[tokio::test]
        async fn test_sessions_are_independent() {
            let (engine, _cluster, _tmp) = setup_engine().await;
            let id = create_connection(&engine);
            create_topic(&engine, &id, "t", 1).await;

            let mut events = engine.sessions.subscribe_events();
            let paused = engine
                .sessions
                .create_session(&id, ConsumeOptions::topic("t"))
                .await
                .unwrap();
            let running = engine
                .sessions
                .create_session(&id, ConsumeOptions::topic("t"))
                .await
                .unwrap();
            engine.sessions.pause_session(&paused.id).await.unwrap();

            produce(&engine, &id, "t", &["x"]).await;
            assert_eq!(next_message(&mut events, &running.id).await.value, "x");

            let all = engine.sessions.get_all_sessions();
            assert_eq!(all.len(), 2);
            assert_eq!(engine.sessions.session_count(), 2);
            assert_eq!(all[0].id, paused.id, "sessions are listed oldest first");

            engine.sessions.stop_all_sessions().await;
            assert!(engine.sessions.get_all_sessions().is_empty());
            assert_eq!(engine.sessions.session_count(), 0);
        }
    }
}
