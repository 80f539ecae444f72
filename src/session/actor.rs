//! Session actor.
//!
//! The socket IO runs outside kameo (a reader task plus a linked writer actor); this actor
//! owns the connection state machine, every timer handle and every component that mutates
//! with it. All transitions happen inside message handlers, so they are serialized.
//!
//! Every task-originated message carries the epoch it was spawned under. Teardown bumps the
//! epoch before aborting the tasks, so a message that was already queued by an aborted task
//! is recognised and dropped.

use std::ops::ControlFlow;
use std::time::Duration;

use futures_util::StreamExt;
use kameo::prelude::{
    Actor, ActorID, ActorRef, ActorStopReason, Context, Message as KameoMessage, PanicError,
    WeakActorRef,
};
use serde::Serialize;
use sonic_rs::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::writer::{WriterWrite, WriterWriteBatch, WsWriterActor};
use crate::core::protocol::{self, names};
use crate::core::{
    ClientConfig, ConnectionError, ConnectionMetrics, ConnectionState, Credential,
    DisconnectCause, ErrorKind, EventEnvelope, EventHandler, EventRouter, HeartbeatMonitor,
    HeartbeatTick, Inbound, MetricsCollector, NORMAL_CLOSURE, Outbound, RealtimeError,
    RealtimeResult, ReconnectionController, RetryDecision, ShutdownNotice, SubscriptionKey,
    SubscriptionManager, WsFrame,
};
use crate::transport::WsTransport;

/// Plain-data view of a session, published on every transition.
#[derive(Clone, Debug, Default)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub error: Option<ConnectionError>,
    pub metrics: ConnectionMetrics,
    pub active_subscriptions: usize,
}

/// Arguments passed when spawning a session actor.
pub struct SessionArgs<T: WsTransport> {
    pub config: ClientConfig,
    pub transport: T,
    pub snapshot_tx: watch::Sender<SessionSnapshot>,
    /// Fixed jitter seed; `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

pub struct SessionActor<T: WsTransport> {
    config: ClientConfig,
    transport: T,
    actor_ref: ActorRef<Self>,
    snapshot_tx: watch::Sender<SessionSnapshot>,

    state: ConnectionState,
    credential: Option<Credential>,
    last_error: Option<ConnectionError>,
    epoch: u64,
    attempt_started: Option<Instant>,
    disposed: bool,

    reconnect: ReconnectionController,
    heartbeat: HeartbeatMonitor,
    subscriptions: SubscriptionManager,
    router: EventRouter,
    metrics: MetricsCollector,

    writer: Option<ActorRef<WsWriterActor<T::Writer>>>,
    connect_task: Option<JoinHandle<()>>,
    handshake_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
}

#[derive(Serialize)]
struct ConnectData {}

#[derive(Serialize)]
struct DisconnectData<'a> {
    reason: &'a str,
}

#[derive(Serialize)]
struct ConnectErrorData<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReconnectAttemptData {
    attempt: u32,
    delay_ms: u64,
}

fn lifecycle_payload<S: Serialize>(data: &S) -> Value {
    sonic_rs::to_value(data).unwrap_or_default()
}

#[inline]
fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

impl<T: WsTransport> Actor for SessionActor<T> {
    type Args = SessionArgs<T>;
    type Error = RealtimeError;

    fn name() -> &'static str {
        "SessionActor"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> RealtimeResult<Self> {
        let SessionArgs {
            config,
            transport,
            snapshot_tx,
            rng_seed,
        } = args;

        let reconnect = match rng_seed {
            Some(seed) => ReconnectionController::seeded(config.retry, seed),
            None => ReconnectionController::new(config.retry),
        };
        let heartbeat = HeartbeatMonitor::new(config.heartbeat);

        Ok(Self {
            config,
            transport,
            actor_ref,
            snapshot_tx,
            state: ConnectionState::Disconnected,
            credential: None,
            last_error: None,
            epoch: 0,
            attempt_started: None,
            disposed: false,
            reconnect,
            heartbeat,
            subscriptions: SubscriptionManager::new(),
            router: EventRouter::new(),
            metrics: MetricsCollector::new(),
            writer: None,
            connect_task: None,
            handshake_task: None,
            reader_task: None,
            heartbeat_task: None,
            retry_task: None,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> RealtimeResult<()> {
        debug!(connection = %self.config.url, reason = ?reason, "session actor stopping");
        self.teardown_connection().await;
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: PanicError,
    ) -> impl std::future::Future<Output = Result<ControlFlow<ActorStopReason>, Self::Error>> + Send
    {
        async move {
            error!(error = ?err, "SessionActor panicked");
            Ok(ControlFlow::Break(ActorStopReason::Panicked(err)))
        }
    }

    fn on_link_died(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        id: ActorID,
        reason: ActorStopReason,
    ) -> impl std::future::Future<Output = Result<ControlFlow<ActorStopReason>, Self::Error>> + Send
    {
        async move {
            let current = self.writer.as_ref().map(|writer| writer.id());
            if current == Some(id) {
                // Already stopped; nothing left to unlink.
                self.writer = None;
                let error = format!("{reason:?}");
                self.connection_lost(
                    DisconnectCause::WriterFailed {
                        error: error.clone(),
                    },
                    RealtimeError::TransportError {
                        context: "write",
                        error,
                    },
                )
                .await;
                self.publish();
            }
            Ok(ControlFlow::Continue(()))
        }
    }
}

/// Caller-issued lifecycle and subscription commands.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Connect(Credential),
    Disconnect,
    Dispose,
    Subscribe(SubscriptionKey),
    Unsubscribe(SubscriptionKey),
    ResetMetrics,
}

impl<T: WsTransport> KameoMessage<SessionCommand> for SessionActor<T> {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        command: SessionCommand,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.disposed && !matches!(command, SessionCommand::Dispose) {
            return Err(RealtimeError::InvalidState("session disposed".to_string()));
        }

        match command {
            SessionCommand::Connect(credential) => self.connect(credential),
            SessionCommand::Disconnect => self.disconnect().await,
            SessionCommand::Dispose => self.dispose().await,
            SessionCommand::Subscribe(key) => self.subscribe(key).await,
            SessionCommand::Unsubscribe(key) => self.unsubscribe(key).await,
            SessionCommand::ResetMetrics => self.metrics.reset(),
        }
        self.publish();
        Ok(())
    }
}

/// Send an application event; replies `false` unless the session is connected.
#[derive(Debug, Clone)]
pub struct Emit {
    pub name: String,
    pub payload: Value,
}

impl<T: WsTransport> KameoMessage<Emit> for SessionActor<T> {
    type Reply = RealtimeResult<bool>;

    async fn handle(&mut self, msg: Emit, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if !self.state.is_connected() {
            debug!(event = %msg.name, state = %self.state, "emit dropped: not connected");
            return Ok(false);
        }
        match self
            .send(Outbound::Event {
                name: &msg.name,
                payload: &msg.payload,
            })
            .await
        {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(event = %msg.name, error = %err, "emit failed");
                Ok(false)
            }
        }
    }
}

/// Register a handler for one event name, or for every event when `event` is `None`.
pub struct RegisterHandler {
    pub event: Option<String>,
    pub handler: EventHandler,
}

impl<T: WsTransport> KameoMessage<RegisterHandler> for SessionActor<T> {
    type Reply = RealtimeResult<bool>;

    async fn handle(
        &mut self,
        msg: RegisterHandler,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.disposed {
            return Err(RealtimeError::InvalidState("session disposed".to_string()));
        }
        Ok(match msg.event {
            Some(event) => self.router.on(event, msg.handler),
            None => self.router.on_any(msg.handler),
        })
    }
}

pub struct RemoveHandler {
    pub event: Option<String>,
    pub handler: EventHandler,
}

impl<T: WsTransport> KameoMessage<RemoveHandler> for SessionActor<T> {
    type Reply = RealtimeResult<bool>;

    async fn handle(
        &mut self,
        msg: RemoveHandler,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(match msg.event {
            Some(event) => self.router.off(&event, &msg.handler),
            None => self.router.off_any(&msg.handler),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GetSnapshot;

impl<T: WsTransport> KameoMessage<GetSnapshot> for SessionActor<T> {
    type Reply = RealtimeResult<SessionSnapshot>;

    async fn handle(
        &mut self,
        _msg: GetSnapshot,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.snapshot())
    }
}

/// Events produced by the session's own tasks.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    ConnectFailed { epoch: u64, error: RealtimeError },
    Inbound { epoch: u64, frame: WsFrame },
    TransportClosed { epoch: u64, cause: DisconnectCause },
    HeartbeatTick { epoch: u64 },
    HandshakeTimeout { epoch: u64 },
    RetryDue { epoch: u64 },
}

impl<T: WsTransport> KameoMessage<SessionEvent> for SessionActor<T> {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        event: SessionEvent,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let changed = match event {
            SessionEvent::ConnectFailed { epoch, error } => {
                self.on_connect_failed(epoch, error).await
            }
            SessionEvent::Inbound { epoch, frame } => {
                epoch == self.epoch && self.on_frame(frame).await
            }
            SessionEvent::TransportClosed { epoch, cause } => {
                if epoch != self.epoch || !self.has_transport() {
                    false
                } else {
                    let error = RealtimeError::ConnectionFailed(cause.reason());
                    self.connection_lost(cause, error).await;
                    true
                }
            }
            SessionEvent::HeartbeatTick { epoch } => {
                epoch == self.epoch && self.state.is_connected() && self.on_heartbeat_tick().await
            }
            SessionEvent::HandshakeTimeout { epoch } => {
                if epoch != self.epoch || !self.state.is_attempting() {
                    false
                } else {
                    let after = self.config.handshake_timeout();
                    let cause = DisconnectCause::HandshakeTimeout { after };
                    let error = RealtimeError::Timeout {
                        context: cause.reason(),
                    };
                    self.connection_lost(cause, error).await;
                    true
                }
            }
            SessionEvent::RetryDue { epoch } => {
                if epoch == self.epoch && self.state == ConnectionState::Reconnecting {
                    self.retry_task = None;
                    self.start_attempt();
                }
                false
            }
        };
        if changed {
            self.publish();
        }
        Ok(())
    }
}

pub(crate) struct ConnectionEstablished<T: WsTransport> {
    pub(crate) epoch: u64,
    pub(crate) reader: T::Reader,
    pub(crate) writer: T::Writer,
}

impl<T: WsTransport> KameoMessage<ConnectionEstablished<T>> for SessionActor<T> {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: ConnectionEstablished<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let ConnectionEstablished {
            epoch,
            reader,
            writer,
        } = msg;
        if epoch != self.epoch || !self.state.is_attempting() {
            debug!(epoch, current = self.epoch, "dropping transport from a superseded attempt");
            return Ok(());
        }
        self.on_transport_opened(epoch, reader, writer).await;
        self.publish();
        Ok(())
    }
}

impl<T: WsTransport> SessionActor<T> {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            error: self.last_error.clone(),
            metrics: self.metrics.snapshot(),
            active_subscriptions: self.subscriptions.len(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "unexpected session state transition");
        }
        info!(connection = %self.config.url, from = %self.state, to = %next, "session state changed");
        self.state = next;
    }

    fn has_transport(&self) -> bool {
        self.state.is_connected() || self.state.is_attempting()
    }

    fn record_error(&mut self, error: ConnectionError) {
        self.metrics.record_error(&error);
        self.last_error = Some(error);
    }

    fn dispatch_lifecycle(&self, name: &str, payload: Value) {
        let report = self.router.dispatch(&EventEnvelope::new(name, payload));
        if report.failed > 0 {
            debug!(event = name, failed = report.failed, "lifecycle handlers failed");
        }
    }

    fn connect(&mut self, credential: Credential) {
        if credential.is_empty() {
            warn!(connection = %self.config.url, "connect rejected: empty credential");
            let error = RealtimeError::AuthenticationFailed {
                message: "missing credential".to_string(),
            };
            self.record_error(ConnectionError::from_error(&error, false));
            return;
        }
        self.credential = Some(credential);

        match self.state {
            ConnectionState::Connected => {
                debug!(connection = %self.config.url, "connect ignored: already connected");
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                debug!(
                    connection = %self.config.url,
                    state = %self.state,
                    "connect ignored: attempt in progress, credential updated"
                );
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.reconnect.reset();
                self.last_error = None;
                self.transition(ConnectionState::Connecting);
                self.start_attempt();
            }
        }
    }

    fn start_attempt(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        let epoch = self.epoch;
        self.attempt_started = Some(Instant::now());
        debug!(
            connection = %self.config.url,
            epoch,
            failed_attempts = self.reconnect.attempts(),
            "opening transport"
        );

        let transport = self.transport.clone();
        let url = self.config.url.clone();
        let buffers = self.config.buffers;
        let actor_ref = self.actor_ref.clone();
        self.connect_task = Some(tokio::spawn(async move {
            match transport.connect(url, buffers).await {
                Ok((reader, writer)) => {
                    let _ = actor_ref
                        .tell(ConnectionEstablished::<T> {
                            epoch,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Err(error) => {
                    let _ = actor_ref
                        .tell(SessionEvent::ConnectFailed { epoch, error })
                        .send()
                        .await;
                }
            }
        }));

        let timeout = self.config.handshake_timeout();
        let actor_ref = self.actor_ref.clone();
        self.handshake_task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = actor_ref
                .tell(SessionEvent::HandshakeTimeout { epoch })
                .send()
                .await;
        }));
    }

    async fn on_transport_opened(&mut self, epoch: u64, reader: T::Reader, writer: T::Writer) {
        self.connect_task = None;

        let writer = WsWriterActor::spawn(WsWriterActor::new(writer));
        writer.link(&self.actor_ref).await;
        self.writer = Some(writer);
        self.spawn_reader(epoch, reader);

        let Some(credential) = self.credential.clone() else {
            self.fail_authentication("no credential for handshake".to_string())
                .await;
            return;
        };
        debug!(connection = %self.config.url, "transport open, sending handshake");
        if let Err(err) = self.send(Outbound::Connect(&credential)).await {
            self.connection_lost(
                DisconnectCause::HandshakeFailed {
                    error: err.to_string(),
                },
                err,
            )
            .await;
        }
    }

    fn spawn_reader(&mut self, epoch: u64, mut reader: T::Reader) {
        let actor_ref = self.actor_ref.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let cause = loop {
                match reader.next().await {
                    Some(Ok(WsFrame::Close(frame))) => {
                        break DisconnectCause::RemoteClosed {
                            reason: frame
                                .as_ref()
                                .map(|f| f.describe())
                                .unwrap_or_else(|| "remote closed".to_string()),
                        };
                    }
                    Some(Ok(frame)) => {
                        if actor_ref
                            .tell(SessionEvent::Inbound { epoch, frame })
                            .send()
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        break DisconnectCause::ReadFailure {
                            error: err.to_string(),
                        };
                    }
                    None => {
                        break DisconnectCause::RemoteClosed {
                            reason: "stream ended".to_string(),
                        };
                    }
                }
            };
            let _ = actor_ref
                .tell(SessionEvent::TransportClosed { epoch, cause })
                .send()
                .await;
        }));
    }

    async fn send(&self, message: Outbound<'_>) -> RealtimeResult<()> {
        let frame = message.encode()?;
        self.send_frame(frame).await
    }

    async fn send_frame(&self, frame: WsFrame) -> RealtimeResult<()> {
        let Some(writer) = self.writer.as_ref() else {
            return Err(RealtimeError::InvalidState(
                "no live connection".to_string(),
            ));
        };
        writer
            .tell(WriterWrite { frame })
            .send()
            .await
            .map_err(|err| {
                warn!(connection = %self.config.url, error = %err, "websocket writer send failed");
                RealtimeError::ActorError(err.to_string())
            })
    }

    async fn on_frame(&mut self, frame: WsFrame) -> bool {
        if let Some(pong) = self.heartbeat.reply_to(&frame) {
            if let Err(err) = self.send_frame(pong).await {
                debug!(error = %err, "failed to answer control ping");
            }
            return false;
        }

        match frame {
            WsFrame::Text(bytes) | WsFrame::Binary(bytes) => match protocol::decode(&bytes) {
                Ok(inbound) => self.on_inbound(inbound).await,
                Err(err) => {
                    warn!(
                        connection = %self.config.url,
                        error = %err,
                        len = bytes.len(),
                        "dropping undecodable frame"
                    );
                    false
                }
            },
            WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_) => false,
        }
    }

    async fn on_inbound(&mut self, inbound: Inbound) -> bool {
        match inbound {
            Inbound::ConnectAck => {
                if !self.state.is_attempting() {
                    debug!(state = %self.state, "ignoring unexpected handshake ack");
                    return false;
                }
                self.on_handshake_ack().await;
                true
            }
            Inbound::ConnectError {
                message,
                authentication,
            } => {
                let kind = if authentication {
                    ErrorKind::Authentication
                } else {
                    ErrorKind::Connection
                };
                self.dispatch_lifecycle(
                    names::CONNECT_ERROR,
                    lifecycle_payload(&ConnectErrorData {
                        message: &message,
                        kind: kind.as_str(),
                    }),
                );
                if authentication {
                    self.fail_authentication(message).await;
                } else {
                    let error = RealtimeError::ConnectionFailed(message.clone());
                    self.connection_lost(DisconnectCause::HandshakeFailed { error: message }, error)
                        .await;
                }
                true
            }
            Inbound::Disconnect { reason } => {
                let error = RealtimeError::ConnectionFailed(format!("server disconnect: {reason}"));
                self.connection_lost(DisconnectCause::RemoteClosed { reason }, error)
                    .await;
                true
            }
            Inbound::Pong { timestamp_ms } => {
                if !self.state.is_connected() {
                    return false;
                }
                let latency = self.heartbeat.on_pong(timestamp_ms);
                self.metrics.record_heartbeat(latency);
                debug!(latency_ms = millis(latency), "heartbeat acknowledged");
                true
            }
            Inbound::ServerShutdown { notice, payload } => {
                self.dispatch_lifecycle(names::SERVER_SHUTDOWN, payload);
                self.on_server_shutdown(notice).await;
                true
            }
            Inbound::Event { name, payload } => {
                if !self.state.is_connected() {
                    debug!(event = %name, state = %self.state, "dropping event outside a live session");
                    return false;
                }
                self.metrics.record_event();
                let report = self.router.dispatch(&EventEnvelope::new(name, payload));
                if report.failed > 0 {
                    debug!(
                        delivered = report.delivered,
                        failed = report.failed,
                        "event delivered with handler failures"
                    );
                }
                false
            }
        }
    }

    async fn on_handshake_ack(&mut self) {
        if let Some(task) = self.handshake_task.take() {
            task.abort();
        }
        let handshake = self
            .attempt_started
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        if self.state == ConnectionState::Reconnecting {
            self.metrics.record_reconnected();
        } else {
            self.metrics.record_connected(handshake);
        }
        self.reconnect.reset();
        self.heartbeat.reset();
        self.last_error = None;
        self.transition(ConnectionState::Connected);
        info!(
            connection = %self.config.url,
            handshake_ms = millis(handshake),
            subscriptions = self.subscriptions.len(),
            "realtime session established"
        );

        if let Err(err) = self.replay_subscriptions().await {
            self.connection_lost(
                DisconnectCause::WriterFailed {
                    error: err.to_string(),
                },
                err,
            )
            .await;
            return;
        }
        self.start_heartbeat();
        self.dispatch_lifecycle(names::CONNECT, lifecycle_payload(&ConnectData {}));
    }

    async fn replay_subscriptions(&self) -> RealtimeResult<()> {
        let keys = self.subscriptions.replay_set();
        if keys.is_empty() {
            return Ok(());
        }
        let frames = keys
            .iter()
            .map(|key| Outbound::Subscribe(key).encode())
            .collect::<RealtimeResult<Vec<_>>>()?;
        debug!(count = frames.len(), "replaying subscriptions");

        let Some(writer) = self.writer.as_ref() else {
            return Err(RealtimeError::InvalidState(
                "no live connection".to_string(),
            ));
        };
        writer
            .tell(WriterWriteBatch { frames })
            .send()
            .await
            .map_err(|err| RealtimeError::ActorError(err.to_string()))
    }

    fn start_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        let interval = self.heartbeat.interval();
        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        self.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if actor_ref
                    .tell(SessionEvent::HeartbeatTick { epoch })
                    .send()
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    async fn on_heartbeat_tick(&mut self) -> bool {
        match self.heartbeat.tick() {
            HeartbeatTick::Ping { timestamp_ms } => {
                if let Err(err) = self.send(Outbound::Ping { timestamp_ms }).await {
                    debug!(error = %err, "heartbeat ping not sent");
                }
                false
            }
            HeartbeatTick::Skip => {
                debug!("heartbeat skipped: too many pings in flight");
                false
            }
            HeartbeatTick::Stale { missed } => {
                let cause = DisconnectCause::HeartbeatTimeout { missed };
                let error = RealtimeError::Timeout {
                    context: cause.reason(),
                };
                self.connection_lost(cause, error).await;
                true
            }
        }
    }

    async fn on_connect_failed(&mut self, epoch: u64, error: RealtimeError) -> bool {
        if epoch != self.epoch || !self.state.is_attempting() {
            return false;
        }
        self.connect_task = None;
        match error {
            RealtimeError::AuthenticationFailed { message } => {
                self.fail_authentication(message).await;
            }
            other => {
                let cause = DisconnectCause::HandshakeFailed {
                    error: other.to_string(),
                };
                self.connection_lost(cause, other).await;
            }
        }
        true
    }

    async fn on_server_shutdown(&mut self, notice: ShutdownNotice) {
        let ShutdownNotice {
            message,
            reconnection_delay,
            supported_reconnection,
        } = notice;
        let error = RealtimeError::ServerShutdown {
            message: message.clone(),
        };

        if supported_reconnection {
            if let Some(delay) = reconnection_delay {
                self.reconnect.server_directed(delay);
            }
            self.connection_lost(DisconnectCause::ServerShutdown { message }, error)
                .await;
            return;
        }

        let was_connected = self.state.is_connected();
        self.teardown_connection().await;
        self.reconnect.reset();
        if was_connected {
            self.metrics.record_disconnected();
        }
        warn!(
            connection = %self.config.url,
            reason = %message,
            "server shutdown without reconnection eligibility"
        );
        self.record_error(ConnectionError::from_error(&error, false));
        if was_connected {
            let reason = DisconnectCause::ServerShutdown { message }.reason();
            self.dispatch_lifecycle(
                names::DISCONNECT,
                lifecycle_payload(&DisconnectData { reason: &reason }),
            );
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Non-caller-initiated loss of the transport (or of a half-open attempt).
    async fn connection_lost(&mut self, cause: DisconnectCause, error: RealtimeError) {
        let was_connected = self.state.is_connected();
        self.teardown_connection().await;
        if was_connected {
            self.metrics.record_disconnected();
        }
        self.record_error(ConnectionError::from_error(&error, true));
        if was_connected {
            let reason = cause.reason();
            self.dispatch_lifecycle(
                names::DISCONNECT,
                lifecycle_payload(&DisconnectData { reason: &reason }),
            );
        }
        self.schedule_reconnect(&cause);
    }

    fn schedule_reconnect(&mut self, cause: &DisconnectCause) {
        match self.reconnect.next_retry() {
            RetryDecision::Retry {
                delay,
                attempt,
                server_directed,
            } => {
                self.metrics.record_reconnect_scheduled();
                self.transition(ConnectionState::Reconnecting);
                self.log_reconnect_plan("scheduled", cause, Some(delay), attempt, server_directed);
                self.dispatch_lifecycle(
                    names::RECONNECT_ATTEMPT,
                    lifecycle_payload(&ReconnectAttemptData {
                        attempt,
                        delay_ms: millis(delay),
                    }),
                );

                let epoch = self.epoch;
                let actor_ref = self.actor_ref.clone();
                self.retry_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = actor_ref.tell(SessionEvent::RetryDue { epoch }).send().await;
                }));
            }
            RetryDecision::Exhausted { attempts } => {
                self.log_reconnect_plan("exhausted", cause, None, attempts, false);
                self.record_error(ConnectionError::new(
                    ErrorKind::Connection,
                    format!(
                        "giving up after {attempts} failed connection attempts: {}",
                        cause.reason()
                    ),
                    false,
                ));
                self.transition(ConnectionState::Failed);
            }
        }
    }

    async fn fail_authentication(&mut self, message: String) {
        let was_connected = self.state.is_connected();
        self.teardown_connection().await;
        if was_connected {
            self.metrics.record_disconnected();
        }
        warn!(
            connection = %self.config.url,
            reason = %message,
            "authentication rejected, not retrying"
        );
        let error = RealtimeError::AuthenticationFailed { message };
        self.record_error(ConnectionError::from_error(&error, false));
        self.transition(ConnectionState::Failed);
    }

    async fn disconnect(&mut self) {
        let was_connected = self.state.is_connected();
        if let Some(writer) = self.writer.as_ref() {
            let close = WsFrame::close(NORMAL_CLOSURE, "client disconnect");
            if let Err(err) = writer.tell(WriterWrite { frame: close }).send().await {
                debug!(error = %err, "close frame not sent");
            }
        }
        self.teardown_connection().await;
        self.reconnect.reset();
        if was_connected {
            self.metrics.record_disconnected();
            let reason = DisconnectCause::ClientRequested.reason();
            self.dispatch_lifecycle(
                names::DISCONNECT,
                lifecycle_payload(&DisconnectData { reason: &reason }),
            );
        }
        self.transition(ConnectionState::Disconnected);
    }

    async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disconnect().await;
        self.router.clear();
        self.subscriptions.clear();
        self.credential = None;
        self.disposed = true;
        info!(connection = %self.config.url, "session disposed");
    }

    async fn subscribe(&mut self, key: SubscriptionKey) {
        let change = self.subscriptions.subscribe(key.clone());
        debug!(
            topic = key.topic(),
            ref_count = self.subscriptions.ref_count(&key),
            "subscription retained"
        );
        if change.needs_wire_message() && self.state.is_connected() {
            if let Err(err) = self.send(Outbound::Subscribe(&key)).await {
                warn!(topic = key.topic(), error = %err, "subscribe not sent, replayed on reconnect");
            }
        }
    }

    async fn unsubscribe(&mut self, key: SubscriptionKey) {
        let change = self.subscriptions.unsubscribe(&key);
        debug!(
            topic = key.topic(),
            ref_count = self.subscriptions.ref_count(&key),
            "subscription released"
        );
        if change.needs_wire_message() && self.state.is_connected() {
            if let Err(err) = self.send(Outbound::Unsubscribe(&key)).await {
                warn!(topic = key.topic(), error = %err, "unsubscribe not sent");
            }
        }
    }

    /// Abort every task, retire the writer and invalidate queued task messages.
    async fn teardown_connection(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        let tasks = [
            self.connect_task.take(),
            self.handshake_task.take(),
            self.reader_task.take(),
            self.heartbeat_task.take(),
            self.retry_task.take(),
        ];
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        self.attempt_started = None;
        self.heartbeat.reset();

        if let Some(writer) = self.writer.take() {
            writer.unlink(&self.actor_ref).await;
            let _ = writer.stop_gracefully().await;
        }
    }

    fn log_reconnect_plan(
        &self,
        note: &str,
        cause: &DisconnectCause,
        delay: Option<Duration>,
        attempt: u32,
        server_directed: bool,
    ) {
        let metrics = self.metrics.snapshot();
        warn!(
            connection = %self.config.url,
            note = %note,
            reason = %cause.reason(),
            cause = ?cause,
            attempt,
            max_attempts = self.reconnect.policy().max_attempts,
            delay_ms = delay.map(millis),
            server_directed,
            reconnections = metrics.reconnection_count,
            errors = metrics.errors,
            "realtime reconnect plan"
        );
    }
}
