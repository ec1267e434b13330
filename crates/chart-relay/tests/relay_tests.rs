//! End-to-end tests for the relay core

use chart_relay::{
    ChartAction, EventKind, Frame, LogConfig, MemoryKv, RelayConfig, RelayService, SessionKey,
    StreamSession,
};
use futures::StreamExt;
use std::time::Duration;

fn relay() -> RelayService<MemoryKv> {
    RelayService::new(MemoryKv::new(), RelayConfig::default())
}

fn s(name: &str) -> SessionKey {
    SessionKey::Named(name.to_string())
}

/// Drain the connection ack and all history frames, returning the replayed
/// events
async fn drain_history(stream: &mut StreamSession) -> Vec<chart_relay::Event> {
    match stream.next().await {
        Some(Frame::Connected { .. }) => {}
        other => panic!("expected connection ack first, got {:?}", other),
    }
    let mut history = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(100), stream.next()).await {
            Ok(Some(Frame::Event { event, is_history })) if is_history => history.push(event),
            Ok(Some(other)) => panic!("unexpected frame during replay: {:?}", other),
            // No more frames ready: replay is over
            Err(_) => break,
            Ok(None) => panic!("stream closed during replay"),
        }
    }
    history
}

async fn next_live(stream: &mut StreamSession) -> chart_relay::Event {
    match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
        Ok(Some(Frame::Event { event, is_history })) => {
            assert!(!is_history, "expected a live frame");
            event
        }
        other => panic!("expected live frame, got {:?}", other),
    }
}

#[tokio::test]
async fn session_isolation_is_exact() {
    let relay = relay();
    let mut a = relay.connect(s("a")).await;
    let mut b = relay.connect(s("b")).await;
    let mut global = relay.connect(SessionKey::Global).await;

    drain_history(&mut a).await;
    drain_history(&mut b).await;
    drain_history(&mut global).await;

    let to_a = relay.publish_message("for a", s("a")).unwrap();
    assert_eq!(next_live(&mut a).await.id, to_a.id);

    // Neither the other session nor the global partition sees it
    assert!(
        tokio::time::timeout(Duration::from_millis(100), b.next())
            .await
            .is_err()
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(100), global.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn global_partition_is_its_own_bucket() {
    let relay = relay();
    let mut scoped = relay.connect(s("s1")).await;
    let mut global = relay.connect(SessionKey::Global).await;
    drain_history(&mut scoped).await;
    drain_history(&mut global).await;

    let event = relay.publish_message("hello", SessionKey::Global).unwrap();
    assert_eq!(next_live(&mut global).await.id, event.id);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), scoped.next())
            .await
            .is_err()
    );

    // A session literally named "global" is still a distinct partition
    let mut literal = relay.connect(s("global")).await;
    let history = drain_history(&mut literal).await;
    assert!(history.iter().all(|e| e.id != event.id));
}

#[tokio::test]
async fn chart_lifecycle_end_to_end() {
    let relay = relay();
    let session = s("s1");

    let added = relay
        .publish_chart(
            ChartAction::Add,
            "rev-2024",
            Some(serde_json::json!({ "title": "Revenue" })),
            session.clone(),
        )
        .unwrap();

    let mut stream = relay.connect(session.clone()).await;
    let history = drain_history(&mut stream).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, added.id);

    relay.remove_chart("rev-2024", session.clone()).unwrap();
    let live = next_live(&mut stream).await;
    assert!(matches!(live.kind, EventKind::ChartRemove { .. }));
    assert_eq!(live.chart_id(), Some("rev-2024"));

    assert!(relay.snapshot(&session).await.is_empty());
}

#[tokio::test]
async fn update_collapses_to_latest_config() {
    let relay = relay();
    let session = s("s1");
    relay
        .publish_chart(
            ChartAction::Add,
            "x",
            Some(serde_json::json!({ "title": "old" })),
            session.clone(),
        )
        .unwrap();
    relay
        .publish_chart(
            ChartAction::Update,
            "x",
            Some(serde_json::json!({ "title": "new" })),
            session.clone(),
        )
        .unwrap();

    let charts = relay.snapshot(&session).await;
    assert_eq!(charts.len(), 1);
    assert_eq!(charts[0].chart_id, "x");
    assert_eq!(charts[0].config, serde_json::json!({ "title": "new" }));
}

#[tokio::test]
async fn replay_after_reconnect_has_no_gaps_or_duplicates() {
    let relay = relay();
    let session = s("s1");

    let first = relay.publish_message("before", session.clone()).unwrap();
    {
        let mut stream = relay.connect(session.clone()).await;
        let history = drain_history(&mut stream).await;
        assert_eq!(history.len(), 1);
        // Disconnect
    }

    let second = relay.publish_message("while away", session.clone()).unwrap();

    let mut stream = relay.connect(session.clone()).await;
    let history = drain_history(&mut stream).await;
    let ids: Vec<&str> = history.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);

    let third = relay.publish_message("after", session.clone()).unwrap();
    assert_eq!(next_live(&mut stream).await.id, third.id);
}

#[tokio::test]
async fn event_published_during_connect_is_not_lost() {
    let relay = relay();
    let session = s("s1");

    let mut stream = relay.connect(session.clone()).await;
    // Published after subscribe but before the consumer polls anything
    let racing = relay.publish_message("racing", session.clone()).unwrap();

    let mut seen = Vec::new();
    let _ack = stream.next().await;
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_millis(200), stream.next()).await {
            Ok(Some(Frame::Event { event, .. })) => seen.push(event.id),
            _ => break,
        }
    }
    assert_eq!(
        seen.iter().filter(|id| **id == racing.id).count(),
        1,
        "exactly one delivery across history/live"
    );
}

#[tokio::test]
async fn message_cap_evicts_oldest() {
    let relay = RelayService::new(
        MemoryKv::new(),
        RelayConfig {
            log: LogConfig {
                message_cap: 3,
                ..LogConfig::default()
            },
            ..RelayConfig::default()
        },
    );
    let session = s("s1");
    let mut published = Vec::new();
    for i in 0..4 {
        published.push(
            relay
                .publish_message(format!("m{}", i), session.clone())
                .unwrap(),
        );
    }

    let mut stream = relay.connect(session).await;
    let history = drain_history(&mut stream).await;
    let ids: Vec<&str> = history.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            published[1].id.as_str(),
            published[2].id.as_str(),
            published[3].id.as_str()
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishes_survive_in_durable_history() {
    let relay = relay();
    let session = s("s1");

    let mut handles = Vec::new();
    for i in 0..100 {
        let relay = relay.clone();
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            relay.publish_message(format!("m{}", i), session).unwrap()
        }));
    }
    let mut published = Vec::new();
    for handle in handles {
        published.push(handle.await.unwrap());
    }
    // Let the spawned durable appends land
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Drop the in-process buffer so reconnect history comes from storage
    // alone, as it would for a fresh process sharing the store
    relay.clear_session(&session);

    let mut stream = relay.connect(session).await;
    let history = drain_history(&mut stream).await;
    assert_eq!(history.len(), published.len());
    for event in &published {
        assert!(
            history.iter().any(|e| e.id == event.id),
            "event {} missing from stored history",
            event.id
        );
    }
}

#[tokio::test]
async fn clear_session_resets_in_process_state() {
    let relay = relay();
    let session = s("s1");
    relay.publish_message("one", session.clone()).unwrap();
    relay
        .publish_chart(
            ChartAction::Add,
            "c",
            Some(serde_json::json!({})),
            session.clone(),
        )
        .unwrap();

    assert_eq!(relay.clear_session(&session), 2);
    assert_eq!(relay.clear_session(&session), 0);

    // Durable logs are a separate concern
    relay.clear_durable(&session).await.unwrap();
    let mut stream = relay.connect(session).await;
    assert!(drain_history(&mut stream).await.is_empty());
}

#[tokio::test]
async fn polling_transport_delivers_published_events() {
    let relay = relay();
    let session = s("s1");

    let before = relay.publish_message("before", session.clone()).unwrap();
    // Let the spawned durable append land
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = relay
        .connect_polling(session.clone(), Some(Duration::from_millis(10)))
        .await;
    let history = drain_history(&mut stream).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, before.id);

    let after = relay.publish_message("after", session.clone()).unwrap();
    let live = next_live(&mut stream).await;
    assert_eq!(live.id, after.id);
}

#[tokio::test]
async fn health_reflects_subscribers() {
    let relay = relay();
    assert_eq!(relay.health().active_subscribers, 0);

    let stream = relay.connect(s("s1")).await;
    let health = relay.health();
    assert_eq!(health.active_subscribers, 1);
    assert_eq!(health.partitions, 1);
    assert_eq!(health.storage, "Memory");

    drop(stream);
    assert_eq!(relay.health().active_subscribers, 0);
}
