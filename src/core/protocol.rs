//! Wire codec for the event stream.
//!
//! Every message is one JSON text frame shaped `{"event": "<name>", "data": <json>}`.
//! Reserved names drive the session lifecycle; every other name is an application event
//! delivered to the router untouched.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sonic_rs::{JsonValueTrait, Value};

use super::frame::WsFrame;
use super::subscriptions::SubscriptionKey;
use super::types::{Credential, RealtimeError, RealtimeResult};

pub mod names {
    pub const CONNECT: &str = "connect";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const DISCONNECT: &str = "disconnect";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
    pub const RECONNECT_ATTEMPT: &str = "reconnect_attempt";
    pub const SUBSCRIBE_PREFIX: &str = "subscribe_";
    pub const UNSUBSCRIBE_PREFIX: &str = "unsubscribe_";
}

#[derive(Serialize)]
struct WireOut<'a, D: Serialize> {
    event: &'a str,
    data: D,
}

#[derive(Deserialize)]
struct WireIn {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeData<'a> {
    token: &'a str,
    organization_id: &'a str,
}

#[derive(Serialize)]
struct PingData {
    timestamp: u64,
}

/// Messages produced by the client.
#[derive(Debug, Clone)]
pub enum Outbound<'a> {
    Connect(&'a Credential),
    Ping { timestamp_ms: u64 },
    Subscribe(&'a SubscriptionKey),
    Unsubscribe(&'a SubscriptionKey),
    Event { name: &'a str, payload: &'a Value },
}

impl Outbound<'_> {
    pub fn event_name(&self) -> String {
        match self {
            Outbound::Connect(_) => names::CONNECT.to_string(),
            Outbound::Ping { .. } => names::PING.to_string(),
            Outbound::Subscribe(key) => format!("{}{}", names::SUBSCRIBE_PREFIX, key.topic()),
            Outbound::Unsubscribe(key) => {
                format!("{}{}", names::UNSUBSCRIBE_PREFIX, key.topic())
            }
            Outbound::Event { name, .. } => (*name).to_string(),
        }
    }

    pub fn encode(&self) -> RealtimeResult<WsFrame> {
        let event = self.event_name();
        let text = match self {
            Outbound::Connect(credential) => to_json(&WireOut {
                event: &event,
                data: HandshakeData {
                    token: credential.token(),
                    organization_id: credential.identity(),
                },
            }),
            Outbound::Ping { timestamp_ms } => to_json(&WireOut {
                event: &event,
                data: PingData {
                    timestamp: *timestamp_ms,
                },
            }),
            Outbound::Subscribe(key) | Outbound::Unsubscribe(key) => to_json(&WireOut {
                event: &event,
                data: key.params(),
            }),
            Outbound::Event { payload, .. } => to_json(&WireOut {
                event: &event,
                data: *payload,
            }),
        }?;
        Ok(WsFrame::text(text))
    }
}

fn to_json<T: Serialize>(value: &T) -> RealtimeResult<String> {
    sonic_rs::to_string(value).map_err(|err| RealtimeError::ParseFailed(err.to_string()))
}

/// Server-directed shutdown notice.
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownNotice {
    pub message: String,
    pub reconnection_delay: Option<Duration>,
    pub supported_reconnection: bool,
}

/// Messages consumed by the client.
#[derive(Debug, Clone)]
pub enum Inbound {
    ConnectAck,
    ConnectError {
        message: String,
        authentication: bool,
    },
    Disconnect {
        reason: String,
    },
    Pong {
        timestamp_ms: Option<u64>,
    },
    ServerShutdown {
        notice: ShutdownNotice,
        payload: Value,
    },
    Event {
        name: String,
        payload: Value,
    },
}

pub fn decode(bytes: &[u8]) -> RealtimeResult<Inbound> {
    let wire: WireIn =
        sonic_rs::from_slice(bytes).map_err(|err| RealtimeError::ParseFailed(err.to_string()))?;
    let WireIn { event, data } = wire;

    let inbound = match event.as_str() {
        names::CONNECT => Inbound::ConnectAck,
        names::CONNECT_ERROR => {
            let message = str_field(&data, "message")
                .or_else(|| data.as_str().map(str::to_string))
                .unwrap_or_else(|| "connection rejected".to_string());
            let authentication = is_authentication_rejection(&data, &message);
            Inbound::ConnectError {
                message,
                authentication,
            }
        }
        names::DISCONNECT => Inbound::Disconnect {
            reason: str_field(&data, "reason")
                .or_else(|| data.as_str().map(str::to_string))
                .unwrap_or_else(|| "server disconnect".to_string()),
        },
        names::PONG => Inbound::Pong {
            timestamp_ms: data.get("timestamp").and_then(millis),
        },
        names::SERVER_SHUTDOWN => Inbound::ServerShutdown {
            notice: ShutdownNotice {
                message: str_field(&data, "message")
                    .unwrap_or_else(|| "server shutting down".to_string()),
                reconnection_delay: data
                    .get("reconnectionDelay")
                    .and_then(millis)
                    .map(Duration::from_millis),
                // Reconnecting needs an explicit opt-in from the server.
                supported_reconnection: data
                    .get("supportedReconnection")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            },
            payload: data,
        },
        _ => Inbound::Event {
            name: event,
            payload: data,
        },
    };
    Ok(inbound)
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Integral or fractional millisecond values, as sent by JS servers.
fn millis(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| ms as u64)
    })
}

/// An explicit `type` wins; otherwise fall back to the message wording servers use.
fn is_authentication_rejection(data: &Value, message: &str) -> bool {
    if let Some(kind) = data.get("type").and_then(|v| v.as_str()) {
        return kind.eq_ignore_ascii_case("authentication");
    }
    let lowered = message.to_ascii_lowercase();
    ["auth", "unauthorized", "forbidden", "token", "credential"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_str(s: &str) -> Inbound {
        decode(s.as_bytes()).expect("valid frame")
    }

    #[test]
    fn handshake_carries_token_and_identity() {
        let credential = Credential::new("tok", "org-1");
        let WsFrame::Text(bytes) = Outbound::Connect(&credential).encode().unwrap() else {
            panic!("expected text frame");
        };
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"event\":\"connect\""));
        assert!(text.contains("\"token\":\"tok\""));
        assert!(text.contains("\"organizationId\":\"org-1\""));
    }

    #[test]
    fn subscribe_uses_topic_suffixed_event_name() {
        let key = SubscriptionKey::new("billing").with_param("id", "org-9");
        let frame = Outbound::Subscribe(&key).encode().unwrap();
        let text = std::str::from_utf8(frame.payload().unwrap()).unwrap();
        assert_eq!(text, r#"{"event":"subscribe_billing","data":{"id":"org-9"}}"#);

        let frame = Outbound::Unsubscribe(&key).encode().unwrap();
        let text = std::str::from_utf8(frame.payload().unwrap()).unwrap();
        assert!(text.starts_with(r#"{"event":"unsubscribe_billing""#));
    }

    #[test]
    fn decodes_server_shutdown_notice() {
        let inbound = decode_str(
            r#"{"event":"server_shutdown","data":{"message":"deploy","reconnectionDelay":5000,"supportedReconnection":true}}"#,
        );
        let Inbound::ServerShutdown { notice, .. } = inbound else {
            panic!("expected shutdown notice");
        };
        assert_eq!(notice.message, "deploy");
        assert_eq!(notice.reconnection_delay, Some(Duration::from_millis(5000)));
        assert!(notice.supported_reconnection);

        let Inbound::ServerShutdown { notice, .. } = decode_str(
            r#"{"event":"server_shutdown","data":{"message":"gone","supportedReconnection":false}}"#,
        ) else {
            panic!("expected shutdown notice");
        };
        assert_eq!(notice.reconnection_delay, None);
        assert!(!notice.supported_reconnection);
    }

    #[test]
    fn shutdown_without_reconnection_flag_is_not_eligible() {
        let Inbound::ServerShutdown { notice, .. } = decode_str(
            r#"{"event":"server_shutdown","data":{"message":"deploy","reconnectionDelay":5000}}"#,
        ) else {
            panic!("expected shutdown notice");
        };
        assert_eq!(notice.reconnection_delay, Some(Duration::from_millis(5000)));
        assert!(!notice.supported_reconnection);

        let Inbound::ServerShutdown { notice, .. } = decode_str(
            r#"{"event":"server_shutdown","data":{"supportedReconnection":"yes"}}"#,
        ) else {
            panic!("expected shutdown notice");
        };
        assert!(!notice.supported_reconnection);
    }

    #[test]
    fn classifies_connect_errors() {
        let Inbound::ConnectError { authentication, .. } = decode_str(
            r#"{"event":"connect_error","data":{"message":"boom","type":"authentication"}}"#,
        ) else {
            panic!("expected connect_error");
        };
        assert!(authentication);

        let Inbound::ConnectError { authentication, .. } =
            decode_str(r#"{"event":"connect_error","data":{"message":"Unauthorized"}}"#)
        else {
            panic!("expected connect_error");
        };
        assert!(authentication);

        let Inbound::ConnectError {
            authentication,
            message,
        } = decode_str(r#"{"event":"connect_error","data":{"message":"server overloaded"}}"#)
        else {
            panic!("expected connect_error");
        };
        assert!(!authentication);
        assert_eq!(message, "server overloaded");
    }

    #[test]
    fn unknown_names_are_application_events() {
        let Inbound::Event { name, payload } =
            decode_str(r#"{"event":"billing_update","data":{"credits":12}}"#)
        else {
            panic!("expected application event");
        };
        assert_eq!(name, "billing_update");
        assert_eq!(payload.get("credits").and_then(|v| v.as_u64()), Some(12));

        assert!(matches!(
            decode_str(r#"{"event":"pong","data":{"timestamp":1700000000000}}"#),
            Inbound::Pong {
                timestamp_ms: Some(1_700_000_000_000)
            }
        ));
    }

    #[test]
    fn rejects_frames_without_event_name() {
        assert!(matches!(
            decode(br#"{"data":{}}"#),
            Err(RealtimeError::ParseFailed(_))
        ));
        assert!(decode(b"not json").is_err());
    }
}
