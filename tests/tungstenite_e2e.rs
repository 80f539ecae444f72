use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use realtime_link::{
    ClientConfig, ConnectionState, Credential, EventEnvelope, RealtimeClient, handler,
};
use sonic_rs::{JsonValueTrait, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

fn event_of(message: &Message) -> Option<(String, Value)> {
    let text = message.to_text().ok()?;
    let value: Value = sonic_rs::from_str(text).ok()?;
    let event = value.get("event")?.as_str()?.to_string();
    let data = value.get("data").cloned().unwrap_or_default();
    Some((event, data))
}

/// Minimal server: acks the handshake, pushes one event and reports what the client sends.
async fn spawn_server() -> (String, mpsc::UnboundedReceiver<(String, Value)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("websocket upgrade");
        while let Some(Ok(message)) = ws.next().await {
            let Some((event, data)) = event_of(&message) else {
                continue;
            };
            if event == "connect" {
                ws.send(Message::text(r#"{"event":"connect","data":{}}"#))
                    .await
                    .expect("ack");
                ws.send(Message::text(
                    r#"{"event":"greeting","data":{"text":"hello"}}"#,
                ))
                .await
                .expect("push");
            }
            let _ = seen_tx.send((event, data));
        }
    });

    (format!("ws://{addr}"), seen_rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_events_and_emit_over_a_real_socket() {
    let (url, mut seen) = spawn_server().await;
    let client = RealtimeClient::new(ClientConfig::new(url)).expect("valid config");

    let greetings = Arc::new(AtomicUsize::new(0));
    let counted = greetings.clone();
    client
        .on(
            "greeting",
            handler(move |event: &EventEnvelope| {
                if event.payload.get("text").and_then(|v| v.as_str()) == Some("hello") {
                    counted.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .await
        .unwrap();

    client.connect(Credential::new("e2e-token", "org-e2e")).await.unwrap();
    client
        .wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
        .await
        .expect("connected over tungstenite");

    let (event, data) = tokio::time::timeout(Duration::from_secs(2), seen.recv())
        .await
        .expect("handshake observed")
        .expect("server alive");
    assert_eq!(event, "connect");
    assert_eq!(data.get("token").and_then(|v| v.as_str()), Some("e2e-token"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while greetings.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "greeting not delivered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(client.emit("chat", sonic_rs::json!({ "text": "hi" })).await);
    let (event, data) = tokio::time::timeout(Duration::from_secs(2), seen.recv())
        .await
        .expect("emit observed")
        .expect("server alive");
    assert_eq!(event, "chat");
    assert_eq!(data.get("text").and_then(|v| v.as_str()), Some("hi"));

    client.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_endpoint_schedules_a_retry() {
    // Bind then drop to get a port nothing listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr")
    };
    let client =
        RealtimeClient::new(ClientConfig::new(format!("ws://{addr}"))).expect("valid config");
    client.connect(Credential::new("token", "org")).await.unwrap();

    let snapshot = client
        .wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(5))
        .await
        .expect("connect failure is retryable");
    let error = snapshot.error.expect("error recorded");
    assert!(error.retryable);

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
