/*!
Relais MQTT simulé pour développement sans broker

Implémente `NodeRelay` : tout ce que le pont enverrait aux nœuds est
enregistré et peut être inspecté par les tests.
*/

use anyhow::Result;
use rfsense_backend::models::{InboxEnvelope, OutboxEnvelope, PresenceIn};
use rfsense_backend::mqtt::{inbox_topic, BridgeError, NodeRelay};
use serde_json::Value;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, topic: String, payload: Vec<u8>) {
        log::info!("📤 [MOCK] Published to {}: {} bytes", topic, payload.len());
        if let Ok(mut messages) = self.published_messages.lock() {
            messages.push(MockMessage { topic, payload });
        }
    }

    /// Récupère tous les messages relayés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.get_published_messages()
            .into_iter()
            .filter(|msg| msg.topic == topic)
            .collect()
    }

    /// Enveloppes reçues par un nœud, dans l'ordre
    pub fn inbox_of(&self, node_id: &str) -> Result<Vec<InboxEnvelope>> {
        self.find_messages_by_topic(&inbox_topic(node_id))
            .iter()
            .map(|m| Ok(serde_json::from_slice(&m.payload)?))
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut messages) = self.published_messages.lock() {
            messages.clear();
        }
    }
}

impl NodeRelay for MockMqttClient {
    async fn relay(&self, topic: String, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.record(topic, payload);
        Ok(())
    }
}

/// Messages que les nœuds publient vers le pont
pub struct NodeMessageBuilder;

impl NodeMessageBuilder {
    pub fn presence(node_id: &str, subjects: &[&str]) -> Vec<u8> {
        let presence = PresenceIn {
            node_id: node_id.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
        };
        serde_json::to_vec(&presence).unwrap_or_default()
    }

    /// Réponse d'un nœud à une enveloppe reçue ; `None` si elle n'attend pas de réponse
    pub fn reply_to(envelope: &InboxEnvelope, payload: Value) -> Option<Vec<u8>> {
        let outbox = OutboxEnvelope {
            subject: envelope.reply.clone()?,
            payload,
        };
        serde_json::to_vec(&outbox).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfsense_backend::broker::Broker;
    use rfsense_backend::mqtt::{NodeDirectory, PRESENCE_TOPIC};
    use std::time::Duration;

    #[tokio::test]
    async fn test_relayed_messages_are_recorded() {
        let broker = Broker::new();
        broker.start();
        let relay = Arc::new(MockMqttClient::new());
        let directory = NodeDirectory::new(broker.client(), relay.clone(), Duration::from_secs(30));

        directory
            .handle_publish(PRESENCE_TOPIC, &NodeMessageBuilder::presence("n1", &["node.all"]))
            .unwrap();
        broker
            .client()
            .publish_request("node.all", "node.get.all", &serde_json::json!({"hello": 1}))
            .unwrap();

        for _ in 0..50 {
            if !relay.get_published_messages().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let inbox = relay.inbox_of("n1").unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].payload["hello"], 1);

        let reply = NodeMessageBuilder::reply_to(&inbox[0], serde_json::json!({"ok": true}));
        assert!(reply.is_some());
    }
}
