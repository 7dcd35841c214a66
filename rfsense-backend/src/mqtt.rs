/**
 * MQTT BRIDGE - Pont entre les nœuds distants (clients MQTT) et le broker embarqué
 *
 * RÔLE :
 * Les nœuds annoncent leur présence et les sujets qu'ils écoutent ; le bridge
 * crée pour eux des abonnements proxy sur le broker, ce qui les rend visibles
 * au comptage de présence du scatter-gather.
 *
 * FLUX :
 * - nœud → `rfsense/nodes/presence@v1` {node_id, subjects[]}  : (ré)enregistrement
 * - broker → `rfsense/nodes/<id>/inbox@v1` {subject, reply, payload} : requêtes relayées
 * - nœud → `rfsense/nodes/outbox@v1` {subject, payload}       : réponses republiées
 *
 * Pas de désinscription explicite : un nœud silencieux plus longtemps que
 * `presence_ttl` est retiré par le moniteur et ses abonnements disparaissent.
 */

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerError, Subscription};
use crate::config::MqttConf;
use crate::models::{InboxEnvelope, OutboxEnvelope, PresenceIn};

pub const PRESENCE_TOPIC: &str = "rfsense/nodes/presence@v1";
pub const OUTBOX_TOPIC: &str = "rfsense/nodes/outbox@v1";

pub fn inbox_topic(node_id: &str) -> String {
    format!("rfsense/nodes/{node_id}/inbox@v1")
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("mqtt client: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Sends relayed messages towards nodes.
pub trait NodeRelay: Send + Sync + 'static {
    fn relay(&self, topic: String, payload: Vec<u8>) -> impl Future<Output = Result<(), BridgeError>> + Send;
}

impl NodeRelay for AsyncClient {
    async fn relay(&self, topic: String, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

struct NodeEntry {
    subjects: Vec<String>,
    last_seen: Instant,
    proxies: Vec<AbortHandle>,
}

impl Drop for NodeEntry {
    fn drop(&mut self) {
        // aborting drops each proxy Subscription, which unregisters it
        for p in &self.proxies {
            p.abort();
        }
    }
}

/// Nœuds connus et leurs abonnements proxy
pub struct NodeDirectory<R> {
    client: BrokerClient,
    relay: Arc<R>,
    ttl: Duration,
    nodes: Mutex<HashMap<String, NodeEntry>>,
}

impl<R: NodeRelay> NodeDirectory<R> {
    pub fn new(client: BrokerClient, relay: Arc<R>, ttl: Duration) -> Self {
        Self {
            client,
            relay,
            ttl,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Enregistre ou rafraîchit un nœud
    pub fn announce(&self, presence: PresenceIn) -> Result<(), BridgeError> {
        let mut nodes = self.nodes.lock();
        if let Some(entry) = nodes.get_mut(&presence.node_id) {
            if entry.subjects == presence.subjects {
                entry.last_seen = Instant::now();
                return Ok(());
            }
        }

        // subscribe everything first so a bad subject leaves the old entry intact
        let subs = presence
            .subjects
            .iter()
            .map(|s| self.client.subscribe(s))
            .collect::<Result<Vec<Subscription>, _>>()?;

        let proxies = subs
            .into_iter()
            .map(|sub| {
                tokio::spawn(forward(sub, inbox_topic(&presence.node_id), self.relay.clone())).abort_handle()
            })
            .collect();

        info!(node = %presence.node_id, subjects = ?presence.subjects, "node registered");
        nodes.insert(
            presence.node_id,
            NodeEntry {
                subjects: presence.subjects,
                last_seen: Instant::now(),
                proxies,
            },
        );
        Ok(())
    }

    /// Republie sur le broker un message émis par un nœud
    pub fn republish(&self, envelope: OutboxEnvelope) -> Result<(), BridgeError> {
        self.client.publish(&envelope.subject, &envelope.payload)?;
        Ok(())
    }

    /// Retire les nœuds dont la présence a expiré
    pub fn expire(&self, now: Instant) -> Vec<String> {
        let mut removed = Vec::new();
        self.nodes.lock().retain(|id, entry| {
            let alive = now.saturating_duration_since(entry.last_seen) < self.ttl;
            if !alive {
                removed.push(id.clone());
            }
            alive
        });
        for id in &removed {
            info!(node = %id, "node presence lapsed");
        }
        removed
    }

    pub fn nodes(&self) -> Vec<String> {
        self.nodes.lock().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.nodes.lock().clear();
    }

    /// Routes one MQTT publish by topic.
    pub fn handle_publish(&self, topic: &str, payload: &[u8]) -> Result<(), BridgeError> {
        match topic {
            PRESENCE_TOPIC => self.announce(serde_json::from_slice(payload)?),
            OUTBOX_TOPIC => self.republish(serde_json::from_slice(payload)?),
            other => {
                debug!(topic = other, "ignoring unexpected topic");
                Ok(())
            }
        }
    }
}

async fn forward<R: NodeRelay>(mut sub: Subscription, topic: String, relay: Arc<R>) {
    while let Some(msg) = sub.next().await {
        let payload = serde_json::from_slice::<Value>(&msg.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&msg.payload).into_owned()));
        let envelope = InboxEnvelope {
            subject: msg.subject,
            reply: msg.reply,
            payload,
        };
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "cannot encode inbox envelope");
                continue;
            }
        };
        if let Err(e) = relay.relay(topic.clone(), bytes).await {
            warn!(topic = %topic, error = %e, "relay to node failed");
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub connected: bool,
    pub nodes: usize,
}

#[derive(Clone)]
pub struct MqttBridge {
    directory: Arc<NodeDirectory<AsyncClient>>,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl MqttBridge {
    /// Lance la boucle d'événements MQTT et le moniteur de présence
    pub fn spawn(cfg: &MqttConf, broker: BrokerClient) -> Self {
        let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        let directory = Arc::new(NodeDirectory::new(broker, Arc::new(client.clone()), cfg.presence_ttl()));
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        {
            let directory = directory.clone();
            let connected = connected.clone();
            let cancel = cancel.clone();
            let client = client.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => break,
                        event = eventloop.poll() => event,
                    };
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            connected.store(true, Ordering::SeqCst);
                            info!("mqtt connected");
                            for topic in [PRESENCE_TOPIC, OUTBOX_TOPIC] {
                                if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                                    warn!(topic, error = %e, "mqtt subscribe failed");
                                }
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(p))) => {
                            if let Err(e) = directory.handle_publish(&p.topic, &p.payload) {
                                warn!(topic = %p.topic, error = %e, "bad message from node");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            connected.store(false, Ordering::SeqCst);
                            warn!(error = %e, "mqtt error");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
                debug!("mqtt event loop stopped");
            });
        }

        {
            let directory = directory.clone();
            let cancel = cancel.clone();
            let period = (cfg.presence_ttl() / 2).max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            directory.expire(Instant::now());
                        }
                    }
                }
            });
        }

        info!(host = %cfg.host, port = cfg.port, "mqtt bridge started");
        Self {
            directory,
            client,
            connected,
            cancel,
        }
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            connected: self.connected.load(Ordering::SeqCst),
            nodes: self.directory.nodes().len(),
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let _ = self.client.disconnect().await;
        self.directory.clear();
        info!("mqtt bridge stopped");
    }
}
