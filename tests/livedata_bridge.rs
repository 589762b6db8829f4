//! Livedata Bridge Tests
//!
//! Entity change streams published through real sessions:
//! - Filtered entity publications follow predicate flips
//! - `ready` waits for every source
//! - Source failures and clean ends stop the subscription

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use livesync::ddp::{DocumentFields, EJson, Encapsulation, ErrorCode, ServerMessage};
use livesync::engine::{
    ApiDefinition, Entity, EntityEngine, InMemoryEntityStorage, KindDefinition, MutationOutcome,
};
use livesync::realtime::{
    emit_to_sub, filter_event_stream, publication_fn, render_entities, DdpInterface, DdpSession,
    OutboundReceiver, SubscriptionEvent, SubscriptionHandle, SubscriptionSource,
};
use serde_json::json;

const API: &str = "tasks.example.com/v1";

fn engine() -> Arc<EntityEngine> {
    let engine = Arc::new(EntityEngine::new());
    engine
        .add_api(
            "tasks.example.com",
            Arc::new(InMemoryEntityStorage::new()),
            ApiDefinition::new("tasks.example.com").with_kind(KindDefinition::new("Task")),
        )
        .unwrap();
    engine
}

fn task(name: &str, done: bool) -> Entity {
    Entity::new(API, "Task", name).with_field("done", json!(done))
}

async fn next_batch(rx: &mut OutboundReceiver) -> Vec<ServerMessage> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for messages")
        .expect("outbound channel closed")
}

/// Read batches until `predicate` accepts a message, returning everything read
async fn read_until<F>(rx: &mut OutboundReceiver, mut predicate: F) -> Vec<ServerMessage>
where
    F: FnMut(&ServerMessage) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let batch = next_batch(rx).await;
        let done = batch.iter().any(&mut predicate);
        seen.extend(batch);
        if done {
            return seen;
        }
    }
}

async fn connected(interface: Arc<DdpInterface>) -> (DdpSession, OutboundReceiver) {
    let (session, mut rx) = DdpSession::new(interface, Encapsulation::Raw);
    session.handle_frame(r#"{"msg":"connect","version":"1","support":["1"]}"#);
    assert_eq!(next_batch(&mut rx).await[0].kind(), "connected");
    (session, rx)
}

fn scripted(events: Vec<SubscriptionEvent>) -> SubscriptionSource {
    stream::iter(events).chain(stream::pending()).boxed()
}

fn doc(pairs: &[(&str, i64)]) -> DocumentFields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), EJson::from(*v)))
        .collect()
}

// =============================================================================
// Entity Publication Tests
// =============================================================================

/// Open tasks appear and disappear as their `done` flag flips.
#[tokio::test]
async fn test_open_tasks_follow_mutations() {
    let engine = engine();
    engine.insert_entity(task("a", false)).await.unwrap();
    engine.insert_entity(task("b", true)).await.unwrap();

    let interface = Arc::new(DdpInterface::new());
    {
        let engine = Arc::clone(&engine);
        interface
            .add_publication(
                "open-tasks",
                publication_fn(move |sub: SubscriptionHandle, _| {
                    let engine = Arc::clone(&engine);
                    async move {
                        let events = engine.observe_entities(API, "Task", sub.signal())?;
                        let open = filter_event_stream(events, |task: &Entity| {
                            task.body.get("done") == Some(&json!(false))
                        });
                        emit_to_sub(sub, vec![render_entities(open, "tasks")]).await?;
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }
    let (session, mut rx) = connected(interface).await;

    session.handle_frame(r#"{"msg":"sub","id":"s","name":"open-tasks","params":[]}"#);
    let initial = read_until(&mut rx, |m| m.kind() == "ready").await;
    let added: Vec<&str> = initial
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Added { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(added, vec!["a"]);
    let view = session.client_view("tasks", "a").unwrap();
    assert_eq!(view.get("done"), Some(&EJson::Bool(false)));
    assert_eq!(view.get("kind").and_then(EJson::as_str), Some("Task"));

    engine
        .mutate_entity(API, "Task", "b", |mut task| {
            task.body.insert("done".into(), json!(false));
            MutationOutcome::Apply(task)
        })
        .await
        .unwrap();
    let reopened = read_until(&mut rx, |m| m.kind() == "added").await;
    assert!(reopened.iter().any(|m| matches!(m, ServerMessage::Added { id, .. } if id == "b")));

    engine
        .mutate_entity(API, "Task", "a", |mut task| {
            task.body.insert("done".into(), json!(true));
            MutationOutcome::Apply(task)
        })
        .await
        .unwrap();
    let closed = read_until(&mut rx, |m| m.kind() == "removed").await;
    assert!(closed.iter().any(|m| matches!(m, ServerMessage::Removed { id, .. } if id == "a")));

    assert_eq!(session.client_view("tasks", "a"), None);
    assert!(session.client_view("tasks", "b").is_some());

    session.handle_frame(r#"{"msg":"unsub","id":"s"}"#);
    let stopped = read_until(&mut rx, |m| m.kind() == "nosub").await;
    assert!(stopped.iter().any(|m| matches!(m, ServerMessage::Removed { id, .. } if id == "b")));
}

// =============================================================================
// Emitter Tests
// =============================================================================

fn emitting(sources: fn() -> Vec<SubscriptionSource>) -> Arc<DdpInterface> {
    let interface = Arc::new(DdpInterface::new());
    interface
        .add_publication(
            "pub",
            publication_fn(move |sub: SubscriptionHandle, _| async move {
                emit_to_sub(sub, sources()).await?;
                Ok(())
            }),
        )
        .unwrap();
    interface
}

/// With no sources the subscription is ready at once.
#[tokio::test]
async fn test_zero_sources_ready_immediately() {
    let (session, mut rx) = connected(emitting(Vec::new)).await;
    session.handle_frame(r#"{"msg":"sub","id":"s","name":"pub","params":[]}"#);
    assert_eq!(next_batch(&mut rx).await, vec![ServerMessage::Ready { subs: vec!["s".into()] }]);
}

/// `ready` is sent once, after the last source reports ready.
#[tokio::test]
async fn test_ready_waits_for_every_source() {
    fn sources() -> Vec<SubscriptionSource> {
        vec![
            scripted(vec![
                SubscriptionEvent::Added {
                    collection: "c".into(),
                    id: "1".into(),
                    fields: doc(&[("n", 1)]),
                },
                SubscriptionEvent::Ready,
                SubscriptionEvent::Ready,
            ]),
            scripted(vec![
                SubscriptionEvent::Added {
                    collection: "c".into(),
                    id: "2".into(),
                    fields: doc(&[("n", 2)]),
                },
                SubscriptionEvent::Ready,
            ]),
        ]
    }

    let (session, mut rx) = connected(emitting(sources)).await;
    session.handle_frame(r#"{"msg":"sub","id":"s","name":"pub","params":[]}"#);
    let messages = read_until(&mut rx, |m| m.kind() == "ready").await;

    let added = messages.iter().filter(|m| m.kind() == "added").count();
    assert_eq!(added, 2, "both documents precede ready: {:?}", messages);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "ready must be sent only once");
}

/// A source failing with an error stops the subscription with `server-error`.
#[tokio::test]
async fn test_source_error_stops_subscription() {
    fn sources() -> Vec<SubscriptionSource> {
        vec![scripted(vec![
            SubscriptionEvent::Added {
                collection: "c".into(),
                id: "1".into(),
                fields: doc(&[("n", 1)]),
            },
            SubscriptionEvent::NoSub {
                error: Some("watch expired".into()),
            },
        ])]
    }

    let (session, mut rx) = connected(emitting(sources)).await;
    session.handle_frame(r#"{"msg":"sub","id":"s","name":"pub","params":[]}"#);
    let messages = read_until(&mut rx, |m| m.kind() == "nosub").await;

    assert!(messages.iter().any(|m| m.kind() == "removed"));
    match messages.last() {
        Some(ServerMessage::Nosub { error: Some(error), .. }) => {
            assert_eq!(error.error, ErrorCode::Text("server-error".into()));
            assert_eq!(error.reason.as_deref(), Some("watch expired"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(session.subscription_ids().is_empty());
}

/// A source ending cleanly stops the subscription without an error.
#[tokio::test]
async fn test_lost_sync_stops_without_error() {
    fn sources() -> Vec<SubscriptionSource> {
        vec![scripted(vec![
            SubscriptionEvent::Ready,
            SubscriptionEvent::NoSub { error: None },
        ])]
    }

    let (session, mut rx) = connected(emitting(sources)).await;
    session.handle_frame(r#"{"msg":"sub","id":"s","name":"pub","params":[]}"#);
    let messages = read_until(&mut rx, |m| m.kind() == "nosub").await;
    assert_eq!(
        messages,
        vec![
            ServerMessage::Ready { subs: vec!["s".into()] },
            ServerMessage::Nosub { id: "s".into(), error: None },
        ]
    );
}
