//! End-to-end session tests.
//!
//! A real `SyncHandle` runtime talks to the in-process `SimServer` under
//! tokio's paused clock, so timers and reconnects are deterministic.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use courier_client::{Credentials, SessionConfig, SyncHandle};
use courier_core::{
    ConnectionState, ConversationId, DeliveryState, InboundEnvelope, MessageEnvelope, MessageId,
    Notification, ReceiptEnvelope, SendStatus, Topic, UserId,
};
use courier_harness::{
    ConnectOutcome, EchoMode, InvariantRegistry, SimEnv, SimServer, SystemSnapshot, settle,
};
use tokio::sync::broadcast;

fn spawn(server: &SimServer) -> SyncHandle<SimEnv> {
    let config = SessionConfig::new("alice", Credentials::new("token"));
    SyncHandle::spawn(SimEnv::with_seed(1), server.transport(), config)
}

fn c1() -> ConversationId {
    ConversationId::new("C1")
}

fn from_bob(conversation: &str, server_id: &str, body: &str) -> MessageEnvelope {
    MessageEnvelope {
        conversation_id: Some(conversation.into()),
        sender_id: Some("bob".into()),
        server_id: Some(server_id.into()),
        kind: None,
        body: Some(body.into()),
        timestamp_ms: Some(1_000),
        correlation_id: None,
    }
}

fn assert_invariants(handle: &SyncHandle<SimEnv>, context: &str) {
    let snapshot = handle.inspect(SystemSnapshot::from_core);
    InvariantRegistry::standard().assert_all(&snapshot, context);
}

fn drain(notifications: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        out.push(notification);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn connects_and_subscribes_user_topic() {
    let server = SimServer::new();
    let handle = spawn(&server);
    settle().await;

    assert_eq!(handle.connection_state(), ConnectionState::Connected);
    assert_eq!(server.session_count(), 1);
    assert_eq!(server.subscriptions(), vec![Topic::User(UserId::new("alice"))]);
}

#[tokio::test(start_paused = true)]
async fn confirmation_replaces_pending_message() {
    let server = SimServer::new();
    let handle = spawn(&server);
    settle().await;

    let pending = handle.send_text("C1", "hi").await.unwrap();
    assert_eq!(pending.delivery, DeliveryState::Pending);
    assert!(pending.id.is_pending());
    assert_eq!(handle.messages_of(&c1()).len(), 1);
    settle().await;

    let published = server.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].body, "hi");
    assert_eq!(published[0].correlation_id, pending.id.as_str());

    let confirmation = MessageEnvelope {
        conversation_id: Some("C1".into()),
        sender_id: Some("alice".into()),
        server_id: Some("42".into()),
        kind: None,
        body: Some("hi".into()),
        timestamp_ms: Some(2_000),
        correlation_id: Some(published[0].correlation_id.clone()),
    };
    assert_eq!(server.deliver_message(confirmation.clone()), 1);
    settle().await;

    let messages = handle.messages_of(&c1());
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId::Server("42".into()));
    assert_eq!(messages[0].delivery, DeliveryState::Sent);
    assert!(handle.pending_records().is_empty());

    server.deliver_message(confirmation);
    settle().await;
    assert_eq!(handle.messages_of(&c1()).len(), 1);
    assert_invariants(&handle, "after duplicate confirmation");
}

#[tokio::test(start_paused = true)]
async fn echoing_server_confirms_every_send() {
    let server = SimServer::new();
    server.set_echo(EchoMode::Confirm);
    let handle = spawn(&server);
    settle().await;

    handle.send_text("C1", "one").await.unwrap();
    handle.send_text("C1", "two").await.unwrap();
    settle().await;

    let messages = handle.messages_of(&c1());
    let ids: Vec<_> = messages.iter().map(|m| m.id.as_str().to_owned()).collect();
    assert_eq!(ids, ["srv-1", "srv-2"]);
    assert!(messages.iter().all(|m| m.delivery == DeliveryState::Sent));
    assert!(handle.pending_records().is_empty());
    assert_eq!(handle.unread_of(&c1()), 0);
    assert_invariants(&handle, "after echoed sends");
}

#[tokio::test(start_paused = true)]
async fn confirmations_without_correlation_match_oldest_first() {
    let server = SimServer::new();
    server.set_echo(EchoMode::ConfirmWithoutCorrelation);
    let handle = spawn(&server);
    settle().await;

    let first = handle.send_text("C1", "same").await.unwrap();
    let second = handle.send_text("C1", "same").await.unwrap();
    settle().await;

    let messages = handle.messages_of(&c1());
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, MessageId::Server("srv-1".into()));
    assert_eq!(messages[0].correlation_id, first.correlation_id);
    assert_eq!(messages[1].id, MessageId::Server("srv-2".into()));
    assert_eq!(messages[1].correlation_id, second.correlation_id);
    assert_invariants(&handle, "after heuristic confirmation");
}

#[tokio::test(start_paused = true)]
async fn queued_sends_flush_in_order_after_reconnect() {
    let server = SimServer::new();
    let handle = spawn(&server);
    settle().await;

    server.drop_connections();
    settle().await;
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);

    let mut sent = Vec::new();
    for body in ["first", "second", "third"] {
        sent.push(handle.send_text("C1", body).await.unwrap());
    }
    assert!(server.published().is_empty());
    let records = handle.pending_records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == SendStatus::Queued));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.connection_state(), ConnectionState::Connected);

    let published: Vec<_> = server.published().into_iter().map(|e| e.correlation_id).collect();
    let expected: Vec<_> = sent.iter().map(|m| m.id.as_str().to_owned()).collect();
    assert_eq!(published, expected);

    let subscriptions = server.subscriptions();
    assert_eq!(subscriptions.iter().filter(|t| matches!(t, Topic::User(_))).count(), 2);
    assert!(subscriptions.contains(&Topic::Conversation(c1())));
    assert_invariants(&handle, "after flush");
}

#[tokio::test(start_paused = true)]
async fn republished_send_is_confirmed_once() {
    let server = SimServer::new();
    let handle = spawn(&server);
    settle().await;

    let pending = handle.send_text("C1", "hello").await.unwrap();
    settle().await;
    assert_eq!(server.published().len(), 1);

    server.set_echo(EchoMode::Confirm);
    server.drop_connections();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(server.published().len(), 2);
    let server_id = server.server_id_for(pending.id.as_str()).unwrap();

    server.deliver_message(MessageEnvelope {
        conversation_id: Some("C1".into()),
        sender_id: Some("alice".into()),
        server_id: Some(server_id.clone()),
        kind: None,
        body: Some("hello".into()),
        timestamp_ms: Some(5),
        correlation_id: Some(pending.id.as_str().to_owned()),
    });
    settle().await;

    let messages = handle.messages_of(&c1());
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId::Server(server_id));
    assert_invariants(&handle, "after republish");
}

#[tokio::test(start_paused = true)]
async fn confirmed_send_in_left_conversation_is_not_republished() {
    let server = SimServer::new();
    let handle = spawn(&server);
    settle().await;
    server.drop_connections();
    settle().await;

    let pending = handle.send_text("C1", "hi").await.unwrap();
    handle.leave_conversation("C1").await.unwrap();
    assert_eq!(handle.messages_of(&c1()), vec![pending.clone()]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(server.published().len(), 1);

    let confirmation = MessageEnvelope {
        conversation_id: Some("C1".into()),
        sender_id: Some("alice".into()),
        server_id: Some("42".into()),
        kind: None,
        body: Some("hi".into()),
        timestamp_ms: Some(5),
        correlation_id: Some(pending.id.as_str().to_owned()),
    };
    let user = Topic::User(UserId::new("alice"));
    assert_eq!(server.deliver(&user, &InboundEnvelope::Message(confirmation)), 1);
    settle().await;

    assert!(handle.pending_records().is_empty());
    assert_eq!(handle.messages_of(&c1())[0].id, MessageId::Server("42".into()));

    server.drop_connections();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.connection_state(), ConnectionState::Connected);
    assert_eq!(server.published().len(), 1);
    assert_invariants(&handle, "after confirming a send in a left conversation");
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_then_goes_offline() {
    let server = SimServer::new();
    server.set_fallback(ConnectOutcome::Unreachable);
    let handle = spawn(&server);
    let mut notifications = handle.subscribe();

    tokio::time::sleep(Duration::from_secs(60)).await;

    let times = server.connect_times();
    assert_eq!(times.len(), 6, "initial attempt plus five retries");

    let expected = [500, 1_000, 2_000, 4_000, 8_000];
    for (window, expected_ms) in times.windows(2).zip(expected) {
        let gap = window[1] - window[0];
        assert!(
            gap >= Duration::from_millis(expected_ms)
                && gap < Duration::from_millis(expected_ms + 10),
            "gap {gap:?}, expected {expected_ms}ms"
        );
    }

    assert!(handle.is_offline());
    assert_eq!(handle.connection_state(), ConnectionState::Failed);
    assert!(drain(&mut notifications).contains(&Notification::OfflineChanged(true)));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(server.connect_attempts(), 6);
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_clears_offline() {
    let server = SimServer::new();
    server.set_fallback(ConnectOutcome::Reject);
    let handle = spawn(&server);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(handle.is_offline());

    server.set_fallback(ConnectOutcome::Accept);
    let mut notifications = handle.subscribe();
    handle.reconnect().await.unwrap();
    settle().await;

    assert!(!handle.is_offline());
    assert_eq!(handle.connection_state(), ConnectionState::Connected);
    assert_eq!(server.connect_attempts(), 7);

    let seen = drain(&mut notifications);
    assert!(seen.contains(&Notification::OfflineChanged(false)));
    assert!(seen.contains(&Notification::ConnectionChanged(ConnectionState::Connected)));
}

#[tokio::test(start_paused = true)]
async fn hung_connect_times_out_and_retries() {
    let server = SimServer::new();
    server.script([ConnectOutcome::Hang]);
    let handle = spawn(&server);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.connection_state(), ConnectionState::Connecting);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(handle.connection_state(), ConnectionState::Connected);
    assert_eq!(server.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn unread_tracks_messages_from_others() {
    let server = SimServer::new();
    let handle = spawn(&server);
    settle().await;
    let mut notifications = handle.subscribe();

    let user_topic = Topic::User(UserId::new("alice"));
    for (server_id, body) in [("b1", "hey"), ("b2", "you there?")] {
        let envelope = InboundEnvelope::Message(from_bob("C2", server_id, body));
        assert_eq!(server.deliver(&user_topic, &envelope), 1);
    }
    settle().await;

    let c2 = ConversationId::new("C2");
    assert_eq!(handle.unread_of(&c2), 2);
    assert_eq!(handle.total_unread(), 2);
    assert_eq!(handle.latest_of(&c2).unwrap().preview, "you there?");
    assert!(drain(&mut notifications).contains(&Notification::UnreadChanged {
        conversation_id: c2.clone(),
        unread: 2,
        total: 2,
    }));

    handle.open_conversation("C2").await.unwrap();
    assert_eq!(handle.unread_of(&c2), 0);
    settle().await;
    assert!(server.subscriptions().contains(&Topic::Conversation(c2.clone())));

    server.deliver_message(from_bob("C2", "b3", "while viewing"));
    settle().await;
    assert_eq!(handle.unread_of(&c2), 0);
    assert_invariants(&handle, "while viewing");

    handle.close_conversation().await.unwrap();
    server.deliver_message(from_bob("C2", "b4", "after closing"));
    settle().await;
    assert_eq!(handle.unread_of(&c2), 1);
    assert_invariants(&handle, "after closing");
}

#[tokio::test(start_paused = true)]
async fn receipts_advance_own_messages() {
    let server = SimServer::new();
    server.set_echo(EchoMode::Confirm);
    let handle = spawn(&server);
    settle().await;

    handle.send_text("C1", "read me").await.unwrap();
    settle().await;

    let receipt = InboundEnvelope::Receipt(ReceiptEnvelope {
        conversation_id: "C1".into(),
        server_id: "srv-1".into(),
        state: DeliveryState::Read,
    });
    server.deliver(&Topic::Conversation(c1()), &receipt);
    settle().await;

    assert_eq!(handle.messages_of(&c1())[0].delivery, DeliveryState::Read);
}

#[tokio::test(start_paused = true)]
async fn malformed_event_becomes_placeholder() {
    let server = SimServer::new();
    let handle = spawn(&server);
    settle().await;
    handle.open_conversation("C1").await.unwrap();
    settle().await;

    server.deliver_raw(&Topic::Conversation(c1()), bytes::Bytes::from_static(b"\xff\x00garbage"));
    settle().await;

    let messages = handle.messages_of(&c1());
    assert_eq!(messages.len(), 1);
    assert!(messages[0].content.is_unrecognized());
    assert_invariants(&handle, "after placeholder");
}

#[tokio::test(start_paused = true)]
async fn shutdown_disconnects_and_closes_handle() {
    let server = SimServer::new();
    let handle = spawn(&server);
    settle().await;

    handle.shutdown().await;
    settle().await;

    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    assert_eq!(server.session_count(), 0);
    assert!(handle.send_text("C1", "late").await.is_err());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.connect_attempts(), 1);
}
