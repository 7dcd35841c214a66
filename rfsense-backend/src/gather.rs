//! Scatter-gather over the broker
//!
//! One request is published, then up to `how_many` replies are collected
//! on a reply subject until a deadline. When the deadline fires first, the
//! replies gathered so far come back inside the error.
//!
//! Cardinality is read from broker presence when `how_many` is zero. A node
//! joining or leaving between that read and the publish is not compensated
//! for: a late joiner may go uncounted and a departed node is waited on
//! until the deadline.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{BrokerClient, BrokerError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Replies to wait for; 0 means "ask the broker how many are listening".
    pub how_many: usize,
    pub timeout: Duration,
    /// Bound on the post-publish flush; falls back to `timeout`.
    pub flush_timeout: Option<Duration>,
    pub message: Value,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            how_many: 0,
            timeout: DEFAULT_TIMEOUT,
            flush_timeout: None,
            message: Value::String(String::new()),
        }
    }
}

impl PingConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = Some(flush_timeout);
        self
    }

    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout.unwrap_or(self.timeout)
    }

    pub fn expecting(mut self, how_many: usize) -> Self {
        self.how_many = how_many;
        self
    }

    pub fn with_message(mut self, message: Value) -> Self {
        self.message = message;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatherError<T> {
    #[error("presence query failed: {0}")]
    Presence(#[source] BrokerError),
    #[error("reply subscription failed: {0}")]
    Subscribe(#[source] BrokerError),
    #[error("request publish failed: {0}")]
    Publish(#[source] BrokerError),
    #[error("request flush failed: {0}")]
    Flush(#[source] BrokerError),
    #[error("collected {} of {expected} replies before {timeout:?} deadline", partial.len())]
    TimedOut {
        partial: Vec<T>,
        expected: usize,
        timeout: Duration,
    },
    #[error("broker closed the reply subscription")]
    Disconnected { partial: Vec<T> },
}

impl<T> GatherError<T> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatherError::TimedOut { .. })
    }

    pub fn partial(&self) -> &[T] {
        match self {
            GatherError::TimedOut { partial, .. } | GatherError::Disconnected { partial } => partial,
            _ => &[],
        }
    }

    pub fn into_partial(self) -> Vec<T> {
        match self {
            GatherError::TimedOut { partial, .. } | GatherError::Disconnected { partial } => partial,
            _ => Vec::new(),
        }
    }
}

/// Publishes `cfg.message` on `subject` with `reply` as reply address and
/// collects decoded replies. The reply subscription is released on every
/// return path.
pub async fn ping<T: DeserializeOwned>(
    client: &BrokerClient,
    subject: &str,
    reply: &str,
    cfg: PingConfig,
) -> Result<Vec<T>, GatherError<T>> {
    let expected = if cfg.how_many == 0 {
        let n = client.presence(subject).map_err(GatherError::Presence)?;
        if n == 0 {
            debug!(subject, "no subscribers, nothing to gather");
            return Ok(Vec::new());
        }
        n
    } else {
        cfg.how_many
    };

    let mut sub = client.subscribe(reply).map_err(GatherError::Subscribe)?;
    client
        .publish_request(subject, reply, &cfg.message)
        .map_err(GatherError::Publish)?;
    client.flush(cfg.flush_timeout()).await.map_err(GatherError::Flush)?;

    let mut results = Vec::with_capacity(expected);
    let deadline = tokio::time::sleep_until(Instant::now() + cfg.timeout);
    tokio::pin!(deadline);

    while results.len() < expected {
        tokio::select! {
            msg = sub.next() => {
                let Some(msg) = msg else {
                    return Err(GatherError::Disconnected { partial: results });
                };
                match BrokerClient::decode::<T>(&msg) {
                    Ok(v) => results.push(v),
                    Err(e) => warn!(subject, reply, error = %e, "dropping undecodable reply"),
                }
            }
            _ = &mut deadline => {
                debug!(subject, got = results.len(), expected, "gather deadline reached");
                return Err(GatherError::TimedOut {
                    partial: results,
                    expected,
                    timeout: cfg.timeout,
                });
            }
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use serde_json::json;

    fn responder(client: &BrokerClient, subject: &str, answer: Value) {
        let mut sub = client.subscribe(subject).unwrap();
        let client = client.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let _ = client.respond(&msg, &answer);
            }
        });
    }

    #[tokio::test]
    async fn test_all_responders_answer() {
        let broker = Broker::new();
        broker.start();
        let client = broker.client();
        responder(&client, "node.all", json!({"id": "a"}));
        responder(&client, "node.all", json!({"id": "b"}));

        let got: Vec<Value> = ping(&client, "node.all", "node.get.all", PingConfig::default())
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_returns_partial() {
        let broker = Broker::new();
        broker.start();
        let client = broker.client();
        responder(&client, "node.all", json!({"id": "a"}));
        let _silent = client.subscribe("node.all").unwrap();

        let started = std::time::Instant::now();
        let err = ping::<Value>(
            &client,
            "node.all",
            "node.get.all",
            PingConfig::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.partial().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        // reply subscription released
        assert_eq!(client.presence("node.get.all").unwrap(), 0);
    }

    #[test]
    fn test_flush_timeout_defaults_to_gather_timeout() {
        let cfg = PingConfig::default().with_timeout(Duration::from_millis(120));
        assert_eq!(cfg.flush_timeout(), Duration::from_millis(120));
        let cfg = cfg.with_flush_timeout(Duration::from_millis(40));
        assert_eq!(cfg.flush_timeout(), Duration::from_millis(40));
        assert_eq!(cfg.timeout, Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_zero_presence_skips_publish() {
        let broker = Broker::new();
        broker.start();
        let client = broker.client();

        let got: Vec<Value> = ping(&client, "node.all", "node.get.all", PingConfig::default())
            .await
            .unwrap();
        assert!(got.is_empty());
        assert_eq!(broker.stats().published, 0);
    }

    #[tokio::test]
    async fn test_explicit_count_overrides_presence() {
        let broker = Broker::new();
        broker.start();
        let client = broker.client();
        responder(&client, "node.all.aggregated", json!({"ok": true}));
        responder(&client, "node.all.aggregated", json!({"ok": true}));
        responder(&client, "node.all.aggregated", json!({"ok": true}));

        let got: Vec<Value> = ping(
            &client,
            "node.all.aggregated",
            "node.get.all.aggregated",
            PingConfig::default().expecting(1),
        )
        .await
        .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_not_counted() {
        #[derive(serde::Deserialize, Debug)]
        struct Stats {
            #[allow(dead_code)]
            cpu: u32,
        }

        let broker = Broker::new();
        broker.start();
        let client = broker.client();
        responder(&client, "node.all", json!({"cpu": 3}));
        responder(&client, "node.all", json!("garbage"));

        let err = ping::<Stats>(
            &client,
            "node.all",
            "node.get.all",
            PingConfig::default().with_timeout(Duration::from_millis(80)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.partial().len(), 1);
    }
}
