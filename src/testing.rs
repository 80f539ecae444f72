//! In-memory transport for exercising the session without a real socket.
//!
//! [`MockTransport::channel_pair`] returns the transport handed to the client plus a
//! [`MockServer`] that scripts how each connection attempt behaves, observes every outbound
//! frame, pushes inbound events and drops sockets.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Sink, Stream};
use serde::{Deserialize, Serialize};
use sonic_rs::{JsonValueTrait, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::protocol::names;
use crate::core::{RealtimeError, RealtimeResult, WebSocketBufferConfig, WsFrame};
use crate::transport::{WsTransport, WsTransportConnectFuture};

/// How the fake server treats one connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MockConnectOutcome {
    /// Open the socket and acknowledge the handshake.
    #[default]
    Accept,
    /// Open the socket and answer the handshake with an authentication `connect_error`.
    RejectAuth(String),
    /// Fail the socket open itself.
    Refuse(String),
    /// Fail the upgrade with an HTTP 401/403, before any frame is exchanged.
    RejectUpgrade(String),
    /// Open the socket and never answer the handshake.
    Unresponsive,
}

struct MockConnection {
    inbound_tx: Option<mpsc::UnboundedSender<RealtimeResult<WsFrame>>>,
    outcome: MockConnectOutcome,
}

struct MockShared {
    script: VecDeque<MockConnectOutcome>,
    default_outcome: MockConnectOutcome,
    attempts: Vec<Instant>,
    connections: Vec<MockConnection>,
    auto_pong: bool,
    fail_writes: bool,
}

fn lock(shared: &Mutex<MockShared>) -> MutexGuard<'_, MockShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Serialize)]
struct WireOut<'a, D: Serialize> {
    event: &'a str,
    data: &'a D,
}

#[derive(Deserialize)]
struct WireIn {
    event: String,
    #[serde(default)]
    data: Value,
}

fn event_frame<D: Serialize>(event: &str, data: &D) -> WsFrame {
    let text = sonic_rs::to_string(&WireOut { event, data })
        .unwrap_or_else(|_| format!(r#"{{"event":"{event}","data":null}}"#));
    WsFrame::text(text)
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
struct RejectData<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct PongData {
    timestamp: u64,
}

/// A transport that uses in-memory channels so tests can emulate server behavior.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Mutex<MockShared>>,
    outbound_tx: mpsc::UnboundedSender<MockOutbound>,
}

impl MockTransport {
    /// Build a transport + server control pair.
    pub fn channel_pair() -> (Self, MockServer) {
        let shared = Arc::new(Mutex::new(MockShared {
            script: VecDeque::new(),
            default_outcome: MockConnectOutcome::Accept,
            attempts: Vec::new(),
            connections: Vec::new(),
            auto_pong: true,
            fail_writes: false,
        }));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: shared.clone(),
                outbound_tx,
            },
            MockServer {
                shared,
                outbound_rx,
            },
        )
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        _url: String,
        _buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = self.shared.clone();
        let outbound_tx = self.outbound_tx.clone();
        Box::pin(async move {
            let mut guard = lock(&shared);
            guard.attempts.push(Instant::now());
            let scripted = guard.script.pop_front();
            let outcome = scripted.unwrap_or_else(|| guard.default_outcome.clone());
            match &outcome {
                MockConnectOutcome::Refuse(message) => {
                    return Err(RealtimeError::ConnectionFailed(message.clone()));
                }
                MockConnectOutcome::RejectUpgrade(message) => {
                    return Err(RealtimeError::AuthenticationFailed {
                        message: message.clone(),
                    });
                }
                _ => {}
            }

            let (inbound_tx, rx) = mpsc::unbounded_channel();
            let connection = guard.connections.len();
            guard.connections.push(MockConnection {
                inbound_tx: Some(inbound_tx),
                outcome,
            });
            drop(guard);

            Ok((
                MockReader { rx },
                MockWriter {
                    connection,
                    shared,
                    outbound_tx,
                },
            ))
        })
    }
}

/// One frame written by the client, tagged with the connection it went out on.
#[derive(Debug, Clone)]
pub struct MockOutbound {
    pub connection: usize,
    pub frame: WsFrame,
}

impl MockOutbound {
    /// Event name and data, when the frame is a protocol message.
    pub fn decode(&self) -> Option<(String, Value)> {
        let payload = match &self.frame {
            WsFrame::Text(bytes) | WsFrame::Binary(bytes) => bytes,
            _ => return None,
        };
        let wire: WireIn = sonic_rs::from_slice(payload).ok()?;
        Some((wire.event, wire.data))
    }

    pub fn event(&self) -> Option<String> {
        self.decode().map(|(event, _)| event)
    }
}

/// Server-side test handle paired with [`MockTransport`].
pub struct MockServer {
    shared: Arc<Mutex<MockShared>>,
    outbound_rx: mpsc::UnboundedReceiver<MockOutbound>,
}

impl MockServer {
    /// Receive a frame written by the client.
    pub async fn recv_outbound(&mut self) -> Option<MockOutbound> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<MockOutbound> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Skip outbound frames until one carries `event`.
    pub async fn expect_event(&mut self, event: &str, timeout: Duration) -> Option<MockOutbound> {
        tokio::time::timeout(timeout, async {
            while let Some(outbound) = self.outbound_rx.recv().await {
                if outbound.event().as_deref() == Some(event) {
                    return Some(outbound);
                }
            }
            None
        })
        .await
        .unwrap_or_default()
    }

    /// Every outbound frame already written, without waiting.
    pub fn drain_outbound(&mut self) -> Vec<MockOutbound> {
        let mut out = Vec::new();
        while let Ok(outbound) = self.outbound_rx.try_recv() {
            out.push(outbound);
        }
        out
    }

    /// Push an application event on the newest connection.
    pub fn send_event(&self, event: &str, data: &Value) -> bool {
        self.send_frame(event_frame(event, data))
    }

    pub fn send_frame(&self, frame: WsFrame) -> bool {
        self.push(Ok(frame))
    }

    /// Surface a read error on the newest connection.
    pub fn fail_read(&self, error: &str) -> bool {
        self.push(Err(RealtimeError::TransportError {
            context: "mock_transport_read",
            error: error.to_string(),
        }))
    }

    fn push(&self, item: RealtimeResult<WsFrame>) -> bool {
        let guard = lock(&self.shared);
        let Some(tx) = guard
            .connections
            .last()
            .and_then(|connection| connection.inbound_tx.as_ref())
        else {
            return false;
        };
        tx.send(item).is_ok()
    }

    /// Simulate a server-side socket drop on the newest connection.
    pub fn drop_socket(&self) -> bool {
        let mut guard = lock(&self.shared);
        guard
            .connections
            .last_mut()
            .and_then(|connection| connection.inbound_tx.take())
            .is_some()
    }

    /// Instants of every connection attempt, successful or not.
    pub fn attempts(&self) -> Vec<Instant> {
        lock(&self.shared).attempts.clone()
    }

    /// Sockets opened so far.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared).connections.len()
    }

    /// Outcomes for the next attempts, in order; afterwards the default applies.
    pub fn push_outcomes(&self, outcomes: impl IntoIterator<Item = MockConnectOutcome>) {
        lock(&self.shared).script.extend(outcomes);
    }

    pub fn set_default_outcome(&self, outcome: MockConnectOutcome) {
        lock(&self.shared).default_outcome = outcome;
    }

    /// Make every write fail while the inbound side stays open.
    pub fn set_fail_writes(&self, enabled: bool) {
        lock(&self.shared).fail_writes = enabled;
    }

    /// Automatic `pong` replies to heartbeat pings (on by default).
    pub fn set_auto_pong(&self, enabled: bool) {
        lock(&self.shared).auto_pong = enabled;
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<RealtimeResult<WsFrame>>,
}

impl Stream for MockReader {
    type Item = RealtimeResult<WsFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

/// Writer side for [`MockTransport`]; answers handshakes and pings like a server would.
pub struct MockWriter {
    connection: usize,
    shared: Arc<Mutex<MockShared>>,
    outbound_tx: mpsc::UnboundedSender<MockOutbound>,
}

impl MockWriter {
    fn reply_to(&self, outbound: &MockOutbound) -> RealtimeResult<()> {
        let mut guard = lock(&self.shared);
        if guard.fail_writes {
            return Err(RealtimeError::TransportError {
                context: "mock_transport_write",
                error: "write refused".to_string(),
            });
        }
        let auto_pong = guard.auto_pong;
        let Some(connection) = guard.connections.get_mut(self.connection) else {
            return Err(RealtimeError::InvalidState(
                "unknown mock connection".to_string(),
            ));
        };
        let Some(tx) = connection.inbound_tx.as_ref() else {
            return Err(RealtimeError::TransportError {
                context: "mock_transport_write",
                error: "socket dropped".to_string(),
            });
        };

        if matches!(outbound.frame, WsFrame::Close(_)) {
            connection.inbound_tx = None;
            return Ok(());
        }

        let Some((event, data)) = outbound.decode() else {
            return Ok(());
        };
        let reply = match (event.as_str(), &connection.outcome) {
            (names::CONNECT, MockConnectOutcome::Accept) => {
                Some(event_frame(names::CONNECT, &Empty {}))
            }
            (names::CONNECT, MockConnectOutcome::RejectAuth(message)) => Some(event_frame(
                names::CONNECT_ERROR,
                &RejectData {
                    message: message.as_str(),
                    kind: "authentication",
                },
            )),
            (names::PING, _) if auto_pong => {
                let timestamp = data
                    .get("timestamp")
                    .and_then(|ts| ts.as_u64())
                    .unwrap_or_default();
                Some(event_frame(names::PONG, &PongData { timestamp }))
            }
            _ => None,
        };
        if let Some(reply) = reply {
            // The reader may already be gone after a client-side teardown.
            let _ = tx.send(Ok(reply));
        }
        Ok(())
    }
}

impl Sink<WsFrame> for MockWriter {
    type Error = RealtimeError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        let this = self.get_mut();
        let outbound = MockOutbound {
            connection: this.connection,
            frame: item,
        };
        this.reply_to(&outbound)?;
        let _ = this.outbound_tx.send(outbound);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}
