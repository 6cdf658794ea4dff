//! Integration tests for the session facade.
//!
//! The server side is played by the test through a loopback transport that
//! hands every accepted link back over a channel.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use courier_client::{
    Credentials, Link, SessionConfig, SessionError, SyncHandle, SystemEnv, Transport,
    TransportError, TransportFrame,
};
use courier_core::{
    Content, ConversationId, CorrelationId, DeliveryState, InboundEnvelope, Message,
    MessageEnvelope, MessageId, Notification, OutboundEnvelope, RawEvent, Topic, UserId,
};
use tokio::{
    sync::{broadcast, mpsc},
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

/// Server end of one accepted link.
struct ServerEnd {
    frames: mpsc::Receiver<TransportFrame>,
    events: mpsc::Sender<RawEvent>,
}

impl ServerEnd {
    async fn next_frame(&mut self) -> TransportFrame {
        timeout(WAIT, self.frames.recv()).await.unwrap().unwrap()
    }

    async fn send(&self, topic: Topic, envelope: InboundEnvelope) {
        let payload = envelope.encode().unwrap();
        self.events.send(RawEvent { topic, payload }).await.unwrap();
    }
}

struct Loopback {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    outbound_capacity: usize,
}

impl Transport for Loopback {
    fn open(
        &self,
        _credentials: &Credentials,
    ) -> impl Future<Output = Result<Link, TransportError>> + Send {
        let accepted = self.accepted.clone();
        let outbound_capacity = self.outbound_capacity;
        async move {
            let (to_server, frames) = mpsc::channel(outbound_capacity);
            let (events, from_server) = mpsc::channel(16);
            accepted.send(ServerEnd { frames, events }).map_err(|_| TransportError::Closed)?;
            Ok(Link { to_server, from_server })
        }
    }
}

fn start(max_send_attempts: u32) -> (SyncHandle<SystemEnv>, mpsc::UnboundedReceiver<ServerEnd>) {
    let mut config = SessionConfig::new("alice", Credentials::new("token"));
    config.max_send_attempts = max_send_attempts;
    start_with(config, 16)
}

fn start_with(
    config: SessionConfig,
    outbound_capacity: usize,
) -> (SyncHandle<SystemEnv>, mpsc::UnboundedReceiver<ServerEnd>) {
    let (accepted, links) = mpsc::unbounded_channel();
    let transport = Loopback { accepted, outbound_capacity };
    let handle = SyncHandle::spawn(SystemEnv::new(), transport, config);
    (handle, links)
}

async fn accept(links: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    let mut server = timeout(WAIT, links.recv()).await.unwrap().unwrap();
    let subscribe = TransportFrame::Subscribe(Topic::User(UserId::new("alice")));
    assert_eq!(server.next_frame().await, subscribe);
    server
}

fn publish_body(frame: TransportFrame) -> String {
    match frame {
        TransportFrame::Publish { payload, .. } => OutboundEnvelope::decode(&payload).unwrap().body,
        other => unreachable!("expected a publish, got {other:?}"),
    }
}

async fn wait_for(
    notifications: &mut broadcast::Receiver<Notification>,
    wanted: impl Fn(&Notification) -> bool,
) -> Notification {
    timeout(WAIT, async {
        loop {
            let notification = notifications.recv().await.unwrap();
            if wanted(&notification) {
                return notification;
            }
        }
    })
    .await
    .unwrap()
}

fn c1() -> ConversationId {
    ConversationId::new("C1")
}

#[tokio::test(start_paused = true)]
async fn send_is_published_and_confirmed() {
    let (handle, mut links) = start(3);
    let mut server = accept(&mut links).await;

    let pending = handle.send_text("C1", "hi").await.unwrap();
    assert_eq!(handle.messages_of(&c1()), vec![pending.clone()]);

    assert_eq!(server.next_frame().await, TransportFrame::Subscribe(Topic::Conversation(c1())));
    let TransportFrame::Publish { topic, payload } = server.next_frame().await else {
        unreachable!("expected a publish");
    };
    let mut notifications = handle.subscribe();
    assert_eq!(topic, Topic::Conversation(c1()));
    let outbound = OutboundEnvelope::decode(&payload).unwrap();
    assert_eq!(outbound.body, "hi");
    assert_eq!(outbound.sender_id, "alice");

    let mut confirmed = Message { id: MessageId::Server("42".into()), ..pending };
    confirmed.delivery = DeliveryState::Sent;
    server
        .send(topic, InboundEnvelope::Message(MessageEnvelope::confirming(&confirmed, "42")))
        .await;

    let _ = wait_for(&mut notifications, |n| *n == Notification::ConversationUpdated(c1())).await;
    let messages = handle.messages_of(&c1());
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.server_id(), Some("42"));
    assert_eq!(messages[0].delivery, DeliveryState::Sent);
    assert!(handle.pending_records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn server_close_triggers_reconnect_and_resubscribe() {
    let (handle, mut links) = start(3);
    let mut server = accept(&mut links).await;

    handle.open_conversation("C1").await.unwrap();
    assert_eq!(server.next_frame().await, TransportFrame::Subscribe(Topic::Conversation(c1())));

    drop(server);

    let mut server = accept(&mut links).await;
    assert_eq!(server.next_frame().await, TransportFrame::Subscribe(Topic::Conversation(c1())));
    assert!(!handle.is_offline());
}

#[tokio::test(start_paused = true)]
async fn rejected_publishes_fail_and_retry_requeues() {
    let (handle, mut links) = start(1);
    let mut notifications = handle.subscribe();
    let server = accept(&mut links).await;

    // Keep the link up but refuse every outbound frame.
    let ServerEnd { frames, events } = server;
    drop(frames);

    let pending = handle.send_text("C1", "lost").await.unwrap();
    let correlation_id = pending.correlation_id.clone().unwrap();

    let failed =
        wait_for(&mut notifications, |n| matches!(n, Notification::SendFailed { .. })).await;
    assert_eq!(
        failed,
        Notification::SendFailed { conversation_id: c1(), correlation_id: correlation_id.clone() }
    );
    assert_eq!(handle.messages_of(&c1())[0].delivery, DeliveryState::Failed);

    handle.retry_send(&correlation_id).await.unwrap();
    let _ = wait_for(&mut notifications, |n| matches!(n, Notification::SendFailed { .. })).await;
    assert_eq!(handle.messages_of(&c1()).len(), 1);

    let unknown = handle.retry_send(&CorrelationId::from_wire("pending-missing")).await;
    assert!(matches!(unknown, Err(SessionError::Sync(_))));
    drop(events);
}

#[tokio::test(start_paused = true)]
async fn full_outbound_queue_resends_on_the_same_link() {
    let config = SessionConfig::new("alice", Credentials::new("token"));
    let (handle, mut links) = start_with(config, 2);
    let mut server = accept(&mut links).await;

    handle.send_text("C1", "first").await.unwrap();
    let second = handle.send_text("C1", "second").await.unwrap();
    let second_id = second.correlation_id.unwrap();
    assert_eq!(handle.pending_records()[1].attempts, 1);

    assert_eq!(server.next_frame().await, TransportFrame::Subscribe(Topic::Conversation(c1())));
    assert_eq!(publish_body(server.next_frame().await), "first");
    assert_eq!(publish_body(server.next_frame().await), "second");

    let records = handle.pending_records();
    let record = records.iter().find(|r| r.correlation_id == second_id).unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(handle.messages_of(&c1())[1].delivery, DeliveryState::Pending);
    assert!(links.try_recv().is_err(), "link was reopened");
}

#[tokio::test(start_paused = true)]
async fn lagging_inbound_is_reported() {
    let mut config = SessionConfig::new("alice", Credentials::new("token"));
    config.inbound_capacity = 1;
    let (handle, mut links) = start_with(config, 16);
    let mut notifications = handle.subscribe();
    let server = accept(&mut links).await;

    for n in 0..8 {
        let envelope = MessageEnvelope {
            conversation_id: Some("C1".into()),
            sender_id: Some("bob".into()),
            server_id: Some(format!("bob-{n}")),
            body: Some(format!("hello {n}")),
            ..Default::default()
        };
        server.send(Topic::Conversation(c1()), InboundEnvelope::Message(envelope)).await;
    }

    let lagged =
        wait_for(&mut notifications, |n| matches!(n, Notification::InboundLagged { .. })).await;
    assert!(matches!(lagged, Notification::InboundLagged { skipped } if skipped > 0));
}

#[tokio::test(start_paused = true)]
async fn history_and_leave() {
    let (handle, mut links) = start(3);
    let _server = accept(&mut links).await;

    let older = Message {
        id: MessageId::Server("old-1".into()),
        conversation_id: c1(),
        sender_id: UserId::new("bob"),
        content: Content::text("from yesterday"),
        sent_at_ms: 1,
        delivery: DeliveryState::Delivered,
        correlation_id: None,
    };
    handle.seed_history("C1", vec![older.clone(), older.clone()]).await.unwrap();
    assert_eq!(handle.messages_of(&c1()), vec![older]);
    assert_eq!(handle.unread_of(&c1()), 0);

    handle.leave_conversation("C1").await.unwrap();
    assert!(handle.messages_of(&c1()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_session() {
    let (handle, mut links) = start(3);
    let mut server = accept(&mut links).await;

    handle.shutdown().await;
    assert!(timeout(WAIT, server.frames.recv()).await.unwrap().is_none());

    let late = handle.send_text("C1", "late").await;
    assert_eq!(late, Err(SessionError::Closed));
    assert!(matches!(handle.reconnect().await, Err(SessionError::Closed)));
}
