//! Embedded message broker
//!
//! Subject-routed publish/subscribe with request-reply addressing and live
//! presence counts. The broker is an owned object with an explicit
//! `start`/`stop` lifecycle: `start` spawns the dispatcher task that fans
//! published messages out to subscriptions, `stop` closes every subscription.
//!
//! The subscriber registry is written only by `subscribe`/`Subscription::drop`
//! and read by the dispatcher and by presence queries.

mod client;
pub mod subject;

pub use client::{BrokerClient, INBOX_PREFIX};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is not running")]
    NotRunning,
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("flush not acknowledged within {0:?}")]
    FlushTimeout(Duration),
    #[error("no reply on {subject} within {timeout:?}")]
    Timeout { subject: String, timeout: Duration },
    #[error("no responders on {0}")]
    NoResponders(String),
    #[error("payload encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("payload decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("access token unavailable: {0}")]
    Key(#[from] crate::keystore::KeyError),
}

/// A message as routed by the broker. Payloads are opaque bytes
/// (JSON when produced through [`BrokerClient`]).
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
    /// Access token resolved by the publisher, carried but not enforced.
    pub token: Option<String>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
            token: None,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub subscriptions: usize,
}

enum Command {
    Publish(Message),
    Flush(oneshot::Sender<()>),
}

struct SubEntry {
    pattern: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Registry {
    subs: RwLock<HashMap<u64, SubEntry>>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl Registry {
    fn remove(&self, id: u64) {
        self.subs.write().remove(&id);
    }

    fn route(&self, msg: &Message) {
        let mut dead = Vec::new();
        {
            let subs = self.subs.read();
            for (id, entry) in subs.iter() {
                if !subject::matches(&entry.pattern, &msg.subject) {
                    continue;
                }
                if entry.tx.send(msg.clone()).is_err() {
                    dead.push(*id);
                } else {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subs.write();
            for id in dead {
                subs.remove(&id);
            }
        }
    }
}

/// Handle to a registered subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    pattern: String,
    rx: mpsc::UnboundedReceiver<Message>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Next message, or `None` once the broker stopped.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
            trace!(pattern = %self.pattern, "unsubscribed");
        }
    }
}

/// The broker process. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Broker {
    registry: Arc<Registry>,
    commands: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
    running: Arc<AtomicBool>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            commands: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the dispatcher. Must be called from within a tokio runtime.
    /// Starting an already running broker is a no-op.
    pub fn start(&self) {
        let mut commands = self.commands.lock();
        if commands.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Publish(msg) => registry.route(&msg),
                    Command::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("broker dispatcher stopped");
        });

        *commands = Some(tx);
        self.running.store(true, Ordering::SeqCst);
        info!("broker ready for connections");
    }

    /// Stops routing and closes every subscription channel.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.commands.lock().take();
        let dropped = {
            let mut subs = self.registry.subs.write();
            let n = subs.len();
            subs.clear();
            n
        };
        info!(subscriptions = dropped, "broker stopped");
    }

    pub fn is_ready(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Registers a subscription synchronously: any message published after
    /// this returns is routed to it.
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        if !self.is_ready() {
            return Err(BrokerError::NotRunning);
        }
        subject::validate_pattern(pattern)?;

        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.subs.write().insert(
            id,
            SubEntry {
                pattern: pattern.to_string(),
                tx,
            },
        );
        trace!(pattern, id, "subscribed");

        Ok(Subscription {
            id,
            pattern: pattern.to_string(),
            rx,
            registry: Arc::downgrade(&self.registry),
        })
    }

    pub fn publish(&self, msg: Message) -> Result<(), BrokerError> {
        subject::validate_subject(&msg.subject)?;
        if let Some(reply) = &msg.reply {
            subject::validate_subject(reply)?;
        }

        let commands = self.commands.lock();
        let tx = commands.as_ref().ok_or(BrokerError::NotRunning)?;
        tx.send(Command::Publish(msg)).map_err(|_| BrokerError::NotRunning)?;
        self.registry.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Waits until every message published before this call was routed.
    pub async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let commands = self.commands.lock();
            let tx = commands.as_ref().ok_or(BrokerError::NotRunning)?;
            tx.send(Command::Flush(ack_tx)).map_err(|_| BrokerError::NotRunning)?;
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::NotRunning),
            Err(_) => Err(BrokerError::FlushTimeout(timeout)),
        }
    }

    /// Number of live subscriptions that would receive a message on `subject`.
    pub fn presence(&self, subject: &str) -> Result<usize, BrokerError> {
        if !self.is_ready() {
            return Err(BrokerError::NotRunning);
        }
        subject::validate_subject(subject)?;

        let subs = self.registry.subs.read();
        Ok(subs
            .values()
            .filter(|e| !e.tx.is_closed() && subject::matches(&e.pattern, subject))
            .count())
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.registry.published.load(Ordering::Relaxed),
            delivered: self.registry.delivered.load(Ordering::Relaxed),
            subscriptions: self.registry.subs.read().len(),
        }
    }

    pub fn client(&self) -> BrokerClient {
        BrokerClient::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> Broker {
        let broker = Broker::new();
        broker.start();
        broker
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_only() {
        let broker = started();
        let mut all = broker.subscribe("node.all").unwrap();
        let mut wild = broker.subscribe("node.>").unwrap();
        let mut other = broker.subscribe("node.x.stats").unwrap();

        broker.publish(Message::new("node.all", b"hi".to_vec())).unwrap();
        broker.flush(Duration::from_millis(100)).await.unwrap();

        assert_eq!(all.next().await.unwrap().payload, b"hi");
        assert_eq!(wild.next().await.unwrap().subject, "node.all");
        assert!(other.rx.try_recv().is_err());
        assert_eq!(broker.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_presence_counts_live_subscriptions() {
        let broker = started();
        assert_eq!(broker.presence("node.all").unwrap(), 0);

        let a = broker.subscribe("node.all").unwrap();
        let _b = broker.subscribe("node.*").unwrap();
        let _c = broker.subscribe("node.abc.stats").unwrap();
        assert_eq!(broker.presence("node.all").unwrap(), 2);

        drop(a);
        assert_eq!(broker.presence("node.all").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_subscriptions() {
        let broker = started();
        let mut sub = broker.subscribe("node.all").unwrap();
        broker.stop();

        assert!(sub.next().await.is_none());
        assert!(matches!(
            broker.publish(Message::new("node.all", Vec::new())),
            Err(BrokerError::NotRunning)
        ));
        assert!(matches!(broker.presence("node.all"), Err(BrokerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_not_started_rejects_calls() {
        let broker = Broker::new();
        assert!(!broker.is_ready());
        assert!(matches!(broker.subscribe("node.all"), Err(BrokerError::NotRunning)));
        assert!(matches!(
            broker.flush(Duration::from_millis(10)).await,
            Err(BrokerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_invalid_subjects() {
        let broker = started();
        assert!(matches!(
            broker.publish(Message::new("node..all", Vec::new())),
            Err(BrokerError::InvalidSubject(_))
        ));
        assert!(broker.subscribe("node.>.x").is_err());
    }
}
