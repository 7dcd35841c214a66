//! JSON-encoding broker connection handed to components.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{Broker, BrokerError, Message, Subscription};
use crate::keystore::{AccessMode, TokenResolver};

/// Prefix of the one-shot reply subjects created by `request`.
pub const INBOX_PREFIX: &str = "_INBOX.";

#[derive(Clone)]
pub struct BrokerClient {
    broker: Broker,
    tokens: Option<Arc<dyn TokenResolver>>,
}

impl BrokerClient {
    pub fn new(broker: Broker) -> Self {
        Self { broker, tokens: None }
    }

    /// Resolves an access token before every publish and subscribe.
    pub fn with_tokens(mut self, resolver: Arc<dyn TokenResolver>) -> Self {
        self.tokens = Some(resolver);
        self
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    fn token(&self, subject: &str, mode: AccessMode) -> Result<Option<String>, BrokerError> {
        match &self.tokens {
            Some(resolver) => Ok(Some(resolver.resolve(subject, mode)?)),
            None => Ok(None),
        }
    }

    fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(payload).map_err(BrokerError::Encode)
    }

    pub fn decode<R: DeserializeOwned>(msg: &Message) -> Result<R, BrokerError> {
        serde_json::from_slice(&msg.payload).map_err(BrokerError::Decode)
    }

    /// Publishes already-encoded bytes (bridged traffic).
    pub fn publish_bytes(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let token = self.token(subject, AccessMode::Write)?;
        self.broker.publish(Message {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
            token,
        })
    }

    pub fn publish<T: Serialize + ?Sized>(&self, subject: &str, payload: &T) -> Result<(), BrokerError> {
        self.publish_bytes(subject, None, Self::encode(payload)?)
    }

    pub fn publish_request<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        reply: &str,
        payload: &T,
    ) -> Result<(), BrokerError> {
        self.publish_bytes(subject, Some(reply), Self::encode(payload)?)
    }

    /// Answers `msg` on its reply subject. Messages without one are ignored.
    pub fn respond<T: Serialize + ?Sized>(&self, msg: &Message, payload: &T) -> Result<(), BrokerError> {
        match &msg.reply {
            Some(reply) => self.publish(reply, payload),
            None => Ok(()),
        }
    }

    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        self.token(pattern, AccessMode::Read)?;
        self.broker.subscribe(pattern)
    }

    pub async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.broker.flush(timeout).await
    }

    pub fn presence(&self, subject: &str) -> Result<usize, BrokerError> {
        self.token(subject, AccessMode::Presence)?;
        self.broker.presence(subject)
    }

    /// Single request-reply exchange on a fresh inbox subject.
    pub async fn request<T, R>(&self, subject: &str, payload: &T, timeout: Duration) -> Result<R, BrokerError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.presence(subject)? == 0 {
            return Err(BrokerError::NoResponders(subject.to_string()));
        }

        let inbox = format!("{INBOX_PREFIX}{}", Uuid::new_v4().simple());
        let mut sub = self.subscribe(&inbox)?;
        self.publish_request(subject, &inbox, payload)?;
        debug!(subject, inbox = %inbox, "request sent");

        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(msg)) => Self::decode(&msg),
            Ok(None) => Err(BrokerError::NotRunning),
            Err(_) => Err(BrokerError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }
}
