//! Resilient realtime event client over WebSocket, built on kameo actors.
//!
//! One [`RealtimeClient`] owns one session actor. The session handshakes with a credential,
//! keeps the connection alive with application heartbeats, reconnects with capped exponential
//! backoff, replays reference-counted subscriptions after every reconnect and routes inbound
//! events to registered handlers.

pub mod client;
pub mod core;
pub mod session;
pub mod testing;
pub mod transport;

pub use client::{HandlerRegistration, RealtimeClient};
pub use self::core::{
    ClientConfig, ConnectionError, ConnectionMetrics, ConnectionState, Credential, ErrorKind,
    EventEnvelope, EventHandler, HeartbeatConfig, RealtimeError, RealtimeResult, RetryPolicy,
    SubscriptionKey, handler,
};
pub use session::SessionSnapshot;
pub use transport::{TungsteniteTransport, WsTransport};
