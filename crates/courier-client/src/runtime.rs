//! Session runtime.
//!
//! One task per session serializes everything that mutates sync state. It
//! selects over:
//!
//! - commands from [`SyncHandle`](crate::SyncHandle)s
//! - connection-state transitions
//! - inbound transport events
//! - the reconnect and resend timers
//!
//! Each input is applied to the [`SyncCore`] under one short write lock, the
//! resulting actions are executed, and notifications go out only after the
//! lock is released.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use courier_core::{
    Content, ConnectionState, ConversationId, CorrelationId, Environment, Message, Notification,
    RawEvent, SyncAction, SyncCore, SyncError, SyncEvent,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::{
    config::Credentials,
    transport::{Transport, TransportConnection},
};

type Timer = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Requests from handles to the runtime.
pub(crate) enum Command {
    Send {
        conversation_id: ConversationId,
        content: Content,
        reply: oneshot::Sender<Result<Message, SyncError>>,
    },
    MarkRead {
        conversation_id: ConversationId,
        reply: oneshot::Sender<()>,
    },
    OpenConversation {
        conversation_id: ConversationId,
        reply: oneshot::Sender<()>,
    },
    CloseConversation {
        reply: oneshot::Sender<()>,
    },
    LeaveConversation {
        conversation_id: ConversationId,
        reply: oneshot::Sender<()>,
    },
    RetrySend {
        correlation_id: CorrelationId,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    SeedHistory {
        conversation_id: ConversationId,
        history: Vec<Message>,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) fn read_core<E: Environment>(
    core: &RwLock<SyncCore<E>>,
) -> RwLockReadGuard<'_, SyncCore<E>> {
    core.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_core<E: Environment>(core: &RwLock<SyncCore<E>>) -> RwLockWriteGuard<'_, SyncCore<E>> {
    core.write().unwrap_or_else(PoisonError::into_inner)
}

/// The session's processing loop.
pub(crate) struct Runtime<T: Transport, E: Environment> {
    core: Arc<RwLock<SyncCore<E>>>,
    connection: TransportConnection<T, E>,
    credentials: Credentials,
    env: E,
    commands: mpsc::Receiver<Command>,
    notifications: broadcast::Sender<Notification>,
    state_rx: watch::Receiver<ConnectionState>,
    inbound: broadcast::Receiver<RawEvent>,
    retry: Option<(u64, Timer)>,
    resend: Option<Timer>,
}

impl<T: Transport, E: Environment> Runtime<T, E> {
    pub(crate) fn new(
        core: Arc<RwLock<SyncCore<E>>>,
        connection: TransportConnection<T, E>,
        credentials: Credentials,
        env: E,
        commands: mpsc::Receiver<Command>,
        notifications: broadcast::Sender<Notification>,
    ) -> Self {
        let state_rx = connection.state_changes();
        let inbound = connection.inbound_events();
        Self {
            core,
            connection,
            credentials,
            env,
            commands,
            notifications,
            state_rx,
            inbound,
            retry: None,
            resend: None,
        }
    }

    /// Run until shutdown or until every handle is dropped.
    pub(crate) async fn run(mut self) {
        let started = write_core(&self.core).start();
        match started {
            Ok(actions) => self.execute(actions),
            Err(err) => {
                warn!(error = %err, "session cannot start");
                return;
            },
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command) {
                            break;
                        }
                    },
                    None => {
                        debug!("all handles dropped, shutting down");
                        let actions = write_core(&self.core).shutdown();
                        self.execute(actions);
                        break;
                    },
                },
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *self.state_rx.borrow_and_update();
                    self.dispatch(SyncEvent::ConnectionChanged(state));
                },
                event = self.inbound.recv() => match event {
                    Ok(raw) => self.dispatch(SyncEvent::Inbound(raw)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "inbound events lagged");
                        self.execute(vec![SyncAction::Notify(Notification::InboundLagged {
                            skipped,
                        })]);
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                generation = next_retry(&mut self.retry) => {
                    self.retry = None;
                    self.dispatch(SyncEvent::RetryElapsed { generation });
                },
                () = next_resend(&mut self.resend) => {
                    self.resend = None;
                    self.dispatch(SyncEvent::ResendElapsed);
                },
            }
        }

        info!("session runtime stopped");
    }

    /// Returns `true` once the session is shut down.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send { conversation_id, content, reply } => {
                let result = write_core(&self.core).send(conversation_id, content);
                let result = result.map(|(message, actions)| {
                    self.execute(actions);
                    message
                });
                let _ = reply.send(result);
            },
            Command::MarkRead { conversation_id, reply } => {
                let actions = write_core(&self.core).mark_read(&conversation_id);
                self.execute(actions);
                let _ = reply.send(());
            },
            Command::OpenConversation { conversation_id, reply } => {
                let actions = write_core(&self.core).open_conversation(&conversation_id);
                self.execute(actions);
                let _ = reply.send(());
            },
            Command::CloseConversation { reply } => {
                write_core(&self.core).close_conversation();
                let _ = reply.send(());
            },
            Command::LeaveConversation { conversation_id, reply } => {
                let actions = write_core(&self.core).leave_conversation(&conversation_id);
                self.execute(actions);
                let _ = reply.send(());
            },
            Command::RetrySend { correlation_id, reply } => {
                let result = write_core(&self.core).retry_send(&correlation_id);
                let result = result.map(|actions| self.execute(actions));
                let _ = reply.send(result);
            },
            Command::Reconnect { reply } => {
                let result = write_core(&self.core).reconnect();
                let result = result.map(|actions| self.execute(actions));
                let _ = reply.send(result);
            },
            Command::SeedHistory { conversation_id, history, reply } => {
                let actions = write_core(&self.core).seed_history(&conversation_id, history);
                self.execute(actions);
                let _ = reply.send(());
            },
            Command::Shutdown { reply } => {
                let actions = write_core(&self.core).shutdown();
                self.execute(actions);
                let _ = reply.send(());
                return true;
            },
        }
        false
    }

    fn dispatch(&mut self, event: SyncEvent) {
        let actions = write_core(&self.core).handle(event);
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<SyncAction>) {
        let mut queue: VecDeque<SyncAction> = actions.into();
        let mut notifications = Vec::new();

        while let Some(action) = queue.pop_front() {
            match action {
                SyncAction::Connect => {
                    self.connection.connect(&self.credentials);
                },
                SyncAction::Disconnect => self.connection.disconnect(),
                SyncAction::ScheduleRetry { delay, generation } => {
                    let env = self.env.clone();
                    let timer: Timer = Box::pin(async move { env.sleep(delay).await });
                    self.retry = Some((generation, timer));
                },
                SyncAction::CancelRetry => self.retry = None,
                SyncAction::ScheduleResend { delay } => {
                    let env = self.env.clone();
                    self.resend = Some(Box::pin(async move { env.sleep(delay).await }));
                },
                SyncAction::Subscribe(topic) => {
                    if !self.connection.subscribe(topic.clone()) {
                        debug!(%topic, "subscribe not sent");
                    }
                },
                SyncAction::Publish { correlation_id, topic, payload } => {
                    let accepted = self.connection.publish(topic, payload);
                    trace!(%correlation_id, accepted, "published");
                    let follow_up = write_core(&self.core)
                        .handle(SyncEvent::PublishResult { correlation_id, accepted });
                    queue.extend(follow_up);
                },
                SyncAction::Notify(notification) => notifications.push(notification),
            }
        }

        for notification in notifications {
            if self.notifications.send(notification).is_err() {
                trace!("notification with no observers");
            }
        }
    }
}

async fn next_retry(retry: &mut Option<(u64, Timer)>) -> u64 {
    match retry {
        Some((generation, timer)) => {
            timer.as_mut().await;
            *generation
        },
        None => std::future::pending().await,
    }
}

async fn next_resend(resend: &mut Option<Timer>) {
    match resend {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}
