//! Public façade over one session actor.

use std::time::Duration;

use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef, WeakActorRef};
use sonic_rs::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::core::{
    ClientConfig, ConnectionError, ConnectionMetrics, ConnectionState, Credential, EventHandler,
    RealtimeError, RealtimeResult, SubscriptionKey,
};
use crate::session::{
    Emit, GetSnapshot, RegisterHandler, RemoveHandler, SessionActor, SessionArgs, SessionCommand,
    SessionSnapshot,
};
use crate::transport::{TungsteniteTransport, WsTransport};

fn map_send_error<M>(err: SendError<M, RealtimeError>) -> RealtimeError {
    match err {
        SendError::HandlerError(err) => err,
        other => RealtimeError::ActorError(other.to_string()),
    }
}

/// Resilient realtime event client.
///
/// Owns one session actor; every method is a message to it, so calls from many tasks are
/// serialized. Requires a running tokio runtime. Dropping the client without
/// [`dispose`](Self::dispose) kills the session immediately.
pub struct RealtimeClient<T: WsTransport = TungsteniteTransport> {
    actor: ActorRef<SessionActor<T>>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    disposed: bool,
}

impl RealtimeClient<TungsteniteTransport> {
    pub fn new(config: ClientConfig) -> RealtimeResult<Self> {
        Self::with_transport(config, TungsteniteTransport::default())
    }
}

impl<T: WsTransport> RealtimeClient<T> {
    pub fn with_transport(config: ClientConfig, transport: T) -> RealtimeResult<Self> {
        Self::spawn(config, transport, None)
    }

    /// Like [`with_transport`](Self::with_transport) with reproducible retry jitter.
    pub fn with_seed(config: ClientConfig, transport: T, seed: u64) -> RealtimeResult<Self> {
        Self::spawn(config, transport, Some(seed))
    }

    fn spawn(config: ClientConfig, transport: T, rng_seed: Option<u64>) -> RealtimeResult<Self> {
        config.validate()?;
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let actor = SessionActor::spawn(SessionArgs {
            config,
            transport,
            snapshot_tx,
            rng_seed,
        });
        Ok(Self {
            actor,
            snapshot_rx,
            disposed: false,
        })
    }

    async fn command(&self, command: SessionCommand) -> RealtimeResult<()> {
        self.actor.ask(command).await.map_err(map_send_error)
    }

    /// Start connecting. Errors from the attempt itself surface through
    /// [`connection_error`](Self::connection_error), never here.
    pub async fn connect(&self, credential: Credential) -> RealtimeResult<()> {
        self.command(SessionCommand::Connect(credential)).await
    }

    /// Close the connection and cancel every timer before returning.
    pub async fn disconnect(&self) -> RealtimeResult<()> {
        self.command(SessionCommand::Disconnect).await
    }

    /// Disconnect, drop every handler and subscription, and stop the session.
    pub async fn dispose(mut self) -> RealtimeResult<()> {
        let result = self.command(SessionCommand::Dispose).await;
        let _ = self.actor.stop_gracefully().await;
        self.actor.wait_for_shutdown().await;
        self.disposed = true;
        result
    }

    pub async fn on(
        &self,
        event: impl Into<String>,
        handler: EventHandler,
    ) -> RealtimeResult<HandlerRegistration<T>> {
        self.register(Some(event.into()), handler).await
    }

    /// Catch-all handler, invoked after the named handlers of every event.
    pub async fn on_any(&self, handler: EventHandler) -> RealtimeResult<HandlerRegistration<T>> {
        self.register(None, handler).await
    }

    async fn register(
        &self,
        event: Option<String>,
        handler: EventHandler,
    ) -> RealtimeResult<HandlerRegistration<T>> {
        let added = self
            .actor
            .ask(RegisterHandler {
                event: event.clone(),
                handler: handler.clone(),
            })
            .await
            .map_err(map_send_error)?;
        Ok(HandlerRegistration {
            actor: self.actor.downgrade(),
            event,
            handler,
            added,
        })
    }

    pub async fn off(&self, event: &str, handler: &EventHandler) -> RealtimeResult<bool> {
        self.actor
            .ask(RemoveHandler {
                event: Some(event.to_string()),
                handler: handler.clone(),
            })
            .await
            .map_err(map_send_error)
    }

    /// `true` only when the frame was handed to a live connection.
    pub async fn emit(&self, name: impl Into<String>, payload: Value) -> bool {
        let name = name.into();
        match self.actor.ask(Emit { name, payload }).await {
            Ok(sent) => sent,
            Err(err) => {
                debug!(error = %err, "emit failed");
                false
            }
        }
    }

    pub async fn subscribe(&self, key: SubscriptionKey) -> RealtimeResult<()> {
        self.command(SessionCommand::Subscribe(key)).await
    }

    pub async fn unsubscribe(&self, key: SubscriptionKey) -> RealtimeResult<()> {
        self.command(SessionCommand::Unsubscribe(key)).await
    }

    pub async fn reset_metrics(&self) -> RealtimeResult<()> {
        self.command(SessionCommand::ResetMetrics).await
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot_rx.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn connection_error(&self) -> Option<ConnectionError> {
        self.snapshot_rx.borrow().error.clone()
    }

    /// Fresh metrics, including the age of the current connection.
    pub async fn metrics(&self) -> RealtimeResult<ConnectionMetrics> {
        Ok(self.snapshot().await?.metrics)
    }

    pub async fn snapshot(&self) -> RealtimeResult<SessionSnapshot> {
        self.actor.ask(GetSnapshot).await.map_err(map_send_error)
    }

    /// Receiver of the snapshot published on every transition.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until a published snapshot satisfies `pred`.
    pub async fn wait_for<F>(&self, mut pred: F, timeout: Duration) -> RealtimeResult<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|snapshot| pred(snapshot))).await {
            Ok(Ok(snapshot)) => Ok(snapshot.clone()),
            Ok(Err(_)) => Err(RealtimeError::ActorError("session stopped".to_string())),
            Err(_) => Err(RealtimeError::Timeout {
                context: format!("wait_for after {timeout:?}"),
            }),
        }
    }

    pub async fn wait_for_state(
        &self,
        state: ConnectionState,
        timeout: Duration,
    ) -> RealtimeResult<SessionSnapshot> {
        self.wait_for(|snapshot| snapshot.state == state, timeout)
            .await
    }
}

impl<T: WsTransport> Drop for RealtimeClient<T> {
    fn drop(&mut self) {
        if !self.disposed {
            self.actor.kill();
        }
    }
}

/// Handle to a registered handler.
pub struct HandlerRegistration<T: WsTransport> {
    actor: WeakActorRef<SessionActor<T>>,
    event: Option<String>,
    handler: EventHandler,
    added: bool,
}

impl<T: WsTransport> HandlerRegistration<T> {
    /// `false` when the same handler was already registered for this event.
    pub fn is_new(&self) -> bool {
        self.added
    }

    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }

    /// Unregister; `false` when it was already gone or the session stopped.
    pub async fn remove(self) -> bool {
        let Some(actor) = self.actor.upgrade() else {
            return false;
        };
        actor
            .ask(RemoveHandler {
                event: self.event,
                handler: self.handler,
            })
            .await
            .unwrap_or(false)
    }
}
