//! Session Protocol Tests
//!
//! Drives a `DdpSession` directly and inspects its outbound channel:
//! - Handshake and pre-connect behavior
//! - Method results and error payloads
//! - Subscription lifecycle and retraction on unsub
//! - Stale subscription handles after an id is reused

use std::sync::{Arc, Mutex};
use std::time::Duration;

use livesync::ddp::{
    DocumentFields, EJson, Encapsulation, ErrorCode, RandomStream, ServerMessage,
};
use livesync::realtime::{
    method_fn, publication_fn, DdpInterface, DdpSession, HandlerError, MethodContext,
    OutboundReceiver, SubscriptionHandle,
};

fn fields(pairs: &[(&str, i64)]) -> DocumentFields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), EJson::from(*v)))
        .collect()
}

/// Collect exactly `count` messages, across batches
async fn recv_messages(rx: &mut OutboundReceiver, count: usize) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while out.len() < count {
        let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for messages")
            .expect("outbound channel closed");
        out.extend(batch);
    }
    assert_eq!(out.len(), count, "unexpected extra messages: {:?}", out);
    out
}

/// Assert nothing is sent for a short while
async fn assert_silent(rx: &mut OutboundReceiver) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "expected no frames");
}

fn shared_doc_interface() -> Arc<DdpInterface> {
    let interface = Arc::new(DdpInterface::new());
    interface
        .add_publication(
            "a",
            publication_fn(|sub: SubscriptionHandle, _| async move {
                sub.added("docs", "d", fields(&[("x", 1)]))?;
                sub.ready()?;
                Ok(())
            }),
        )
        .unwrap();
    interface
        .add_publication(
            "b",
            publication_fn(|sub: SubscriptionHandle, _| async move {
                sub.added("docs", "d", fields(&[("y", 2)]))?;
                sub.ready()?;
                Ok(())
            }),
        )
        .unwrap();
    interface
}

async fn connected(interface: Arc<DdpInterface>) -> (DdpSession, OutboundReceiver) {
    let (session, mut rx) = DdpSession::new(interface, Encapsulation::Raw);
    session.handle_frame(r#"{"msg":"connect","version":"1","support":["1"]}"#);
    match recv_messages(&mut rx, 1).await.as_slice() {
        [ServerMessage::Connected { session: id }] => assert_eq!(id, session.id()),
        other => panic!("expected connected, got {:?}", other),
    }
    (session, rx)
}

// =============================================================================
// Handshake Tests
// =============================================================================

/// `ping` is answered even before `connect`.
#[tokio::test]
async fn test_ping_before_connect() {
    let (session, mut rx) = DdpSession::new(Arc::new(DdpInterface::new()), Encapsulation::Raw);
    session.handle_frame(r#"{"msg":"ping","id":"p1"}"#);
    assert_eq!(
        recv_messages(&mut rx, 1).await,
        vec![ServerMessage::Pong { id: Some("p1".into()) }]
    );
    assert!(!session.is_connected());
}

/// Session-level messages before `connect` are refused.
#[tokio::test]
async fn test_method_before_connect() {
    let (session, mut rx) = DdpSession::new(Arc::new(DdpInterface::new()), Encapsulation::Raw);
    session.handle_frame(r#"{"msg":"method","id":"m","method":"x","params":[]}"#);
    match recv_messages(&mut rx, 1).await.as_slice() {
        [ServerMessage::Error { reason, offending_message }] => {
            assert_eq!(reason, "Must connect first");
            assert!(offending_message.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// Garbage frames produce a `Bad request` error and nothing else.
#[tokio::test]
async fn test_bad_frame() {
    let (session, mut rx) = connected(Arc::new(DdpInterface::new())).await;
    session.handle_frame("not json");
    session.handle_frame(r#"{"msg":"teleport"}"#);
    let messages = recv_messages(&mut rx, 2).await;
    for message in messages {
        match message {
            ServerMessage::Error { reason, .. } => assert_eq!(reason, "Bad request"),
            other => panic!("unexpected {:?}", other),
        }
    }
}

/// The array framing accepts several messages per frame.
#[tokio::test]
async fn test_sockjs_batch_frame() {
    let (session, mut rx) = DdpSession::new(Arc::new(DdpInterface::new()), Encapsulation::SockJs);
    session.handle_frame(
        r#"["{\"msg\":\"connect\",\"version\":\"1\",\"support\":[\"1\"]}","{\"msg\":\"ping\"}"]"#,
    );
    let messages = recv_messages(&mut rx, 2).await;
    assert_eq!(messages[0].kind(), "connected");
    assert_eq!(messages[1], ServerMessage::Pong { id: None });
}

// =============================================================================
// Method Tests
// =============================================================================

/// A client-safe error travels in full and is followed by `updated`.
#[tokio::test]
async fn test_method_client_safe_error() {
    let interface = Arc::new(DdpInterface::new());
    interface
        .add_method(
            "deny",
            method_fn(|_, _| async move {
                Err::<EJson, _>(HandlerError::client_safe(403, "Not allowed"))
            }),
        )
        .unwrap();
    let (session, mut rx) = connected(interface).await;

    session.handle_frame(r#"{"msg":"method","id":"m1","method":"deny","params":[]}"#);
    let messages = recv_messages(&mut rx, 2).await;
    match &messages[0] {
        ServerMessage::Result { id, result: None, error: Some(error) } => {
            assert_eq!(id, "m1");
            assert_eq!(error.error, ErrorCode::Number(403));
            assert_eq!(error.reason.as_deref(), Some("Not allowed"));
            assert_eq!(error.message.as_deref(), Some("Not allowed [403]"));
            assert_eq!(error.is_client_safe, Some(true));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(messages[1], ServerMessage::Updated { methods: vec!["m1".into()] });
}

/// Internal errors expose only an error and a message.
#[tokio::test]
async fn test_method_internal_error_is_opaque() {
    let interface = Arc::new(DdpInterface::new());
    interface
        .add_method(
            "boom",
            method_fn(|_, _| async move { Err::<EJson, _>(HandlerError::internal("disk on fire")) }),
        )
        .unwrap();
    let (session, mut rx) = connected(interface).await;

    session.handle_frame(r#"{"msg":"method","id":"m1","method":"boom","params":[]}"#);
    match recv_messages(&mut rx, 2).await.first() {
        Some(ServerMessage::Result { error: Some(error), .. }) => {
            assert_eq!(error.is_client_safe, None);
            assert_eq!(error.reason, None);
            assert_eq!(error.details, None);
            assert_eq!(error.error_type, None);
            assert_eq!(error.message.as_deref(), Some("disk on fire"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// Unknown methods are a 404.
#[tokio::test]
async fn test_unknown_method() {
    let (session, mut rx) = connected(Arc::new(DdpInterface::new())).await;
    session.handle_frame(r#"{"msg":"method","id":"m1","method":"nope","params":[]}"#);
    match recv_messages(&mut rx, 2).await.first() {
        Some(ServerMessage::Result { error: Some(error), .. }) => {
            assert_eq!(error.error, ErrorCode::Number(404));
            assert_eq!(error.reason.as_deref(), Some("Method 'nope' not found"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// A panicking method still gets its `result` and `updated`.
#[tokio::test]
async fn test_panicking_method_still_replies() {
    let interface = Arc::new(DdpInterface::new());
    interface
        .add_method(
            "buggy",
            method_fn(|_, params: Vec<EJson>| async move {
                if params.is_empty() {
                    panic!("handler bug");
                }
                Ok::<_, HandlerError>(EJson::Null)
            }),
        )
        .unwrap();
    let (session, mut rx) = connected(interface).await;

    session.handle_frame(r#"{"msg":"method","id":"m1","method":"buggy","params":[]}"#);
    let messages = recv_messages(&mut rx, 2).await;
    match &messages[0] {
        ServerMessage::Result { id, result: None, error: Some(error) } => {
            assert_eq!(id, "m1");
            assert_eq!(error.message.as_deref(), Some("Internal server error"));
            assert_eq!(error.reason, None);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(messages[1], ServerMessage::Updated { methods: vec!["m1".into()] });
}

/// A `randomSeed` lets client and server derive the same ids.
#[tokio::test]
async fn test_random_seed_reaches_method() {
    let interface = Arc::new(DdpInterface::new());
    interface
        .add_method(
            "insert",
            method_fn(|mut ctx: MethodContext, _| async move {
                let Some(random) = ctx.random.as_mut() else {
                    return Err(HandlerError::bad_request("randomSeed required"));
                };
                Ok(EJson::from(random.get_stream("/collection/tasks").id()))
            }),
        )
        .unwrap();
    let (session, mut rx) = connected(interface).await;

    session.handle_frame(
        r#"{"msg":"method","id":"m1","method":"insert","params":[],"randomSeed":"seed-1"}"#,
    );
    let expected = RandomStream::new("seed-1").get_stream("/collection/tasks").id();
    match recv_messages(&mut rx, 2).await.first() {
        Some(ServerMessage::Result { result: Some(result), .. }) => {
            assert_eq!(result.as_str(), Some(expected.as_str()));
        }
        other => panic!("unexpected {:?}", other),
    }
}

// =============================================================================
// Subscription Tests
// =============================================================================

/// Two subscriptions sharing a document, then both unsubscribing.
#[tokio::test]
async fn test_shared_document_lifecycle() {
    let (session, mut rx) = connected(shared_doc_interface()).await;

    session.handle_frame(r#"{"msg":"sub","id":"A","name":"a","params":[]}"#);
    assert_eq!(
        recv_messages(&mut rx, 2).await,
        vec![
            ServerMessage::Added {
                collection: "docs".into(),
                id: "d".into(),
                fields: Some(fields(&[("x", 1)])),
            },
            ServerMessage::Ready { subs: vec!["A".into()] },
        ]
    );

    session.handle_frame(r#"{"msg":"sub","id":"B","name":"b","params":[]}"#);
    assert_eq!(
        recv_messages(&mut rx, 2).await,
        vec![
            ServerMessage::changed("docs", "d", fields(&[("y", 2)]), vec![]),
            ServerMessage::Ready { subs: vec!["B".into()] },
        ]
    );
    assert_eq!(session.client_view("docs", "d"), Some(fields(&[("x", 1), ("y", 2)])));

    session.handle_frame(r#"{"msg":"unsub","id":"A"}"#);
    assert_eq!(
        recv_messages(&mut rx, 2).await,
        vec![
            ServerMessage::changed("docs", "d", DocumentFields::new(), vec!["x".into()]),
            ServerMessage::Nosub { id: "A".into(), error: None },
        ]
    );

    session.handle_frame(r#"{"msg":"unsub","id":"B"}"#);
    assert_eq!(
        recv_messages(&mut rx, 2).await,
        vec![
            ServerMessage::Removed {
                collection: "docs".into(),
                id: "d".into(),
            },
            ServerMessage::Nosub { id: "B".into(), error: None },
        ]
    );
    assert!(session.subscription_ids().is_empty());
    assert_eq!(session.client_view("docs", "d"), None);
}

/// `unsub` for an unknown id sends nothing.
#[tokio::test]
async fn test_unsub_unknown_is_silent() {
    let (session, mut rx) = connected(Arc::new(DdpInterface::new())).await;
    session.handle_frame(r#"{"msg":"unsub","id":"ghost"}"#);
    assert_silent(&mut rx).await;
}

/// Unknown publications are refused with a 404 `nosub`.
#[tokio::test]
async fn test_unknown_publication() {
    let (session, mut rx) = connected(Arc::new(DdpInterface::new())).await;
    session.handle_frame(r#"{"msg":"sub","id":"s","name":"nope","params":[]}"#);
    match recv_messages(&mut rx, 1).await.as_slice() {
        [ServerMessage::Nosub { id, error: Some(error) }] => {
            assert_eq!(id, "s");
            assert_eq!(error.error, ErrorCode::Number(404));
            assert_eq!(error.reason.as_deref(), Some("Subscription 'nope' not found"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(session.subscription_ids().is_empty());
}

/// A failing publication is stopped with its error and its documents are
/// retracted.
#[tokio::test]
async fn test_publication_error_retracts_documents() {
    let interface = Arc::new(DdpInterface::new());
    interface
        .add_publication(
            "flaky",
            publication_fn(|sub: SubscriptionHandle, _| async move {
                sub.added("docs", "d", fields(&[("x", 1)]))?;
                Err(HandlerError::client_safe("flaky", "Went away"))
            }),
        )
        .unwrap();
    let (session, mut rx) = connected(interface).await;

    session.handle_frame(r#"{"msg":"sub","id":"s","name":"flaky","params":[]}"#);
    let messages = recv_messages(&mut rx, 3).await;
    assert_eq!(messages[0].kind(), "added");
    assert_eq!(
        messages[1],
        ServerMessage::Removed {
            collection: "docs".into(),
            id: "d".into(),
        }
    );
    match &messages[2] {
        ServerMessage::Nosub { id, error: Some(error) } => {
            assert_eq!(id, "s");
            assert_eq!(error.reason.as_deref(), Some("Went away"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// A panicking publication is stopped like a failing one.
#[tokio::test]
async fn test_panicking_publication_is_stopped() {
    let interface = Arc::new(DdpInterface::new());
    interface
        .add_publication(
            "buggy",
            publication_fn(|sub: SubscriptionHandle, _| async move {
                sub.added("docs", "d", fields(&[("x", 1)]))?;
                if sub.is_active() {
                    panic!("handler bug");
                }
                Ok(())
            }),
        )
        .unwrap();
    let (session, mut rx) = connected(interface).await;

    session.handle_frame(r#"{"msg":"sub","id":"s","name":"buggy","params":[]}"#);
    let messages = recv_messages(&mut rx, 3).await;
    assert_eq!(messages[0].kind(), "added");
    assert_eq!(messages[1].kind(), "removed");
    match &messages[2] {
        ServerMessage::Nosub { id, error: Some(error) } => {
            assert_eq!(id, "s");
            assert_eq!(error.error, ErrorCode::Text("server-error".into()));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(session.subscription_ids().is_empty());
    assert_eq!(session.client_view("docs", "d"), None);
}

/// A duplicate `sub` id for a live subscription is ignored.
#[tokio::test]
async fn test_duplicate_sub_id_ignored() {
    let (session, mut rx) = connected(shared_doc_interface()).await;
    session.handle_frame(r#"{"msg":"sub","id":"A","name":"a","params":[]}"#);
    recv_messages(&mut rx, 2).await;

    session.handle_frame(r#"{"msg":"sub","id":"A","name":"b","params":[]}"#);
    assert_silent(&mut rx).await;
    assert_eq!(session.client_view("docs", "d"), Some(fields(&[("x", 1)])));
}

/// A handle from a stopped subscription cannot touch a new subscription
/// that reuses its id.
#[tokio::test]
async fn test_stale_handle_after_id_reuse() {
    let stash: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let interface = shared_doc_interface();
    {
        let stash = Arc::clone(&stash);
        interface
            .add_publication(
                "keeper",
                publication_fn(move |sub: SubscriptionHandle, _| {
                    let stash = Arc::clone(&stash);
                    async move {
                        sub.ready()?;
                        *stash.lock().unwrap() = Some(sub);
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }
    let (session, mut rx) = connected(interface).await;

    session.handle_frame(r#"{"msg":"sub","id":"s","name":"keeper","params":[]}"#);
    recv_messages(&mut rx, 1).await;
    session.handle_frame(r#"{"msg":"unsub","id":"s"}"#);
    recv_messages(&mut rx, 1).await;

    session.handle_frame(r#"{"msg":"sub","id":"s","name":"a","params":[]}"#);
    recv_messages(&mut rx, 2).await;

    let stale = stash.lock().unwrap().take().unwrap();
    assert!(!stale.is_active());
    assert!(stale.signal().is_stopped());
    stale.added("docs", "other", fields(&[("z", 3)])).unwrap();
    stale.removed("docs", "d").unwrap();
    stale.stop();
    assert_silent(&mut rx).await;
    assert_eq!(session.subscription_ids(), vec!["s".to_string()]);
    assert_eq!(session.client_view("docs", "d"), Some(fields(&[("x", 1)])));
}

/// Closing the session stops every subscription exactly once and sends
/// nothing further.
#[tokio::test]
async fn test_close_stops_subscriptions() {
    let (session, mut rx) = connected(shared_doc_interface()).await;
    session.handle_frame(r#"{"msg":"sub","id":"A","name":"a","params":[]}"#);
    recv_messages(&mut rx, 2).await;

    session.close();
    assert!(session.is_closed());
    session.handle_frame(r#"{"msg":"ping"}"#);
    assert_silent(&mut rx).await;
}
