use std::fmt;
use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Convenience result alias for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Canonical error surface shared across the client internals.
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Parse failed: {0}")]
    ParseFailed(String),

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Server shutdown: {message}")]
    ServerShutdown { message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Actor error: {0}")]
    ActorError(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RealtimeError {
    /// Classify the error into the surfaced taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RealtimeError::AuthenticationFailed { .. } => ErrorKind::Authentication,
            RealtimeError::Timeout { .. } => ErrorKind::Timeout,
            RealtimeError::ServerShutdown { .. } => ErrorKind::Server,
            _ => ErrorKind::Connection,
        }
    }
}

/// Error categories surfaced to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Authentication,
    Timeout,
    Server,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Server => "server",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest connection problem, exposed to consumers as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: SystemTime,
    pub retryable: bool,
}

impl ConnectionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: SystemTime::now(),
            retryable,
        }
    }

    pub fn from_error(error: &RealtimeError, retryable: bool) -> Self {
        Self::new(error.kind(), error.to_string(), retryable)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error (retryable={}): {}",
            self.kind, self.retryable, self.message
        )
    }
}

/// Single authoritative connection state of a client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until the caller connects again.
    Failed,
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// A transport attempt may be in flight in these states.
    #[inline]
    pub fn is_attempting(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    /// Whether the lifecycle table allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if self == next {
            return matches!(self, Disconnected | Reconnecting);
        }
        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected | Failed, Connecting) => true,
            (Connecting | Reconnecting, Connected) => true,
            (Connecting | Connected, Reconnecting) => true,
            (Connecting | Connected | Reconnecting, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bearer token plus the identity it was issued for, supplied by the auth collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    identity: String,
}

impl Credential {
    pub fn new(token: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            identity: identity.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Empty or whitespace-only tokens are never sent.
    pub fn is_empty(&self) -> bool {
        self.token.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("identity", &self.identity)
            .finish()
    }
}

/// Why a live (or half-open) connection went away.
#[derive(Debug, Clone)]
pub enum DisconnectCause {
    ClientRequested,
    RemoteClosed { reason: String },
    ReadFailure { error: String },
    WriterFailed { error: String },
    HeartbeatTimeout { missed: u32 },
    HandshakeFailed { error: String },
    HandshakeTimeout { after: Duration },
    ServerShutdown { message: String },
}

impl DisconnectCause {
    pub fn reason(&self) -> String {
        match self {
            DisconnectCause::ClientRequested => "client disconnect".to_string(),
            DisconnectCause::RemoteClosed { reason } => reason.clone(),
            DisconnectCause::ReadFailure { error } => format!("read error: {error}"),
            DisconnectCause::WriterFailed { error } => format!("write error: {error}"),
            DisconnectCause::HeartbeatTimeout { missed } => {
                format!("{missed} consecutive heartbeats unanswered")
            }
            DisconnectCause::HandshakeFailed { error } => format!("handshake failed: {error}"),
            DisconnectCause::HandshakeTimeout { after } => {
                format!("handshake not acknowledged within {after:?}")
            }
            DisconnectCause::ServerShutdown { message } => format!("server shutdown: {message}"),
        }
    }
}

/// Transport-independent buffer sizing parameters used for websocket configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WebSocketBufferConfig {
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 128 << 10,
            max_write_buffer_bytes: 256 << 10,
            max_message_bytes: 4 * 1024 * 1024,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Best-effort current time as Unix epoch milliseconds.
#[inline]
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}
