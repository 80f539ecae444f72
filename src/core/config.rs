use std::time::Duration;

use serde::Deserialize;

use super::heartbeat::HeartbeatConfig;
use super::reconnect::RetryPolicy;
use super::types::{RealtimeError, RealtimeResult, WebSocketBufferConfig};

/// Client configuration. Every field has a default except the endpoint.
///
/// ```toml
/// url = "wss://realtime.example.com/ws"
/// handshake_timeout_ms = 10000
///
/// [retry]
/// max_attempts = 5
/// base_delay_ms = 1000
///
/// [heartbeat]
/// interval_ms = 25000
/// max_missed = 2
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub retry: RetryPolicy,
    pub heartbeat: HeartbeatConfig,
    pub handshake_timeout_ms: u64,
    #[serde(skip)]
    pub buffers: WebSocketBufferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            retry: RetryPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            handshake_timeout_ms: 10_000,
            buffers: WebSocketBufferConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> RealtimeResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|err| RealtimeError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RealtimeResult<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(RealtimeError::Config("url must not be empty".into()));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(RealtimeError::Config(format!(
                "url must use ws:// or wss://, got {url}"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(RealtimeError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(RealtimeError::Config(
                "retry.base_delay_ms must be positive".into(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(RealtimeError::Config(
                "retry.max_delay_ms must be >= retry.base_delay_ms".into(),
            ));
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms == 0 {
            return Err(RealtimeError::Config(
                "heartbeat interval and timeout must be positive".into(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(RealtimeError::Config(
                "handshake_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            url = "wss://rt.example.com/ws"

            [retry]
            max_attempts = 3

            [heartbeat]
            interval_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.heartbeat.interval_ms, 5_000);
        assert_eq!(config.heartbeat.max_missed, Some(2));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_invalid_settings() {
        assert!(matches!(
            ClientConfig::new("").validate(),
            Err(RealtimeError::Config(_))
        ));
        assert!(ClientConfig::new("http://rt.example.com").validate().is_err());

        let mut config = ClientConfig::new("ws://localhost:1");
        config.retry.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new("ws://localhost:1");
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        assert!(ClientConfig::from_toml_str("url = 5").is_err());
    }
}
