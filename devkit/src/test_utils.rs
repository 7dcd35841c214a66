/*!
Test Harness pour le backend RFSense

Facilite l'écriture de tests de scénario avec:
- Service de coordination démarré et isolé par test
- Répertoire temporaire pour le store redb
- Pipeline d'ingestion sur un port éphémère
- Attente active sur les compteurs et assertions sur le relais MQTT simulé
*/

use anyhow::Result;
use rfsense_backend::broker::BrokerClient;
use rfsense_backend::config::{BrokerConf, CollectorConf, MqttConf};
use rfsense_backend::mqtt::NodeDirectory;
use rfsense_backend::pipeline::{IngestSnapshot, IngestionPipeline};
use rfsense_backend::samples::{Framing, SampleSchema};
use rfsense_backend::service::CoordinationService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::frame_writer::FrameWriter;
use crate::mock_node::MockNode;
use crate::mqtt_stub::MockMqttClient;

pub struct TestHarness {
    pub service: CoordinationService,
    pub schema: SampleSchema,
    pub mqtt_client: Arc<MockMqttClient>,
    dir: TempDir,
    nodes: Vec<MockNode>,
}

impl TestHarness {
    /// Crée un harness avec un broker démarré
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let mut service = CoordinationService::new(&BrokerConf::default(), &MqttConf::default());
        service.start();
        Ok(Self {
            service,
            schema: SampleSchema::bundled()?,
            mqtt_client: Arc::new(MockMqttClient::new()),
            dir: TempDir::new()?,
            nodes: Vec::new(),
        })
    }

    pub fn client(&self) -> BrokerClient {
        self.service.client()
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir.path().join("samples.redb")
    }

    /// Collecteur sur un port éphémère
    pub fn collector_conf(framing: Framing, decode_in_listener: bool) -> CollectorConf {
        CollectorConf {
            port: 0,
            framing,
            decode_in_listener,
            drain_timeout_ms: 500,
            ..Default::default()
        }
    }

    pub async fn start_pipeline(&self, cfg: &CollectorConf) -> Result<(IngestionPipeline, FrameWriter)> {
        let pipeline = IngestionPipeline::start(cfg, &self.store_path(), self.schema.clone()).await?;
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], pipeline.local_addr().port()));
        log::info!("🚰 pipeline listening on {}", addr);
        Ok((pipeline, FrameWriter::new(addr, cfg.framing)))
    }

    /// Ajoute un nœud simulé qui répond, gardé en vie jusqu'à la fin du test
    pub fn add_node(&mut self, id: &str, subjects: &[&str]) -> Result<&MockNode> {
        let node = MockNode::responding(&self.client(), id, subjects)?;
        self.nodes.push(node);
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    pub fn add_silent_node(&mut self, id: &str, subjects: &[&str]) -> Result<&MockNode> {
        let node = MockNode::silent(&self.client(), id, subjects)?;
        self.nodes.push(node);
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    /// Annuaire de nœuds MQTT relié au relais simulé
    pub fn node_directory(&self, ttl: Duration) -> NodeDirectory<MockMqttClient> {
        NodeDirectory::new(self.client(), self.mqtt_client.clone(), ttl)
    }

    /// Attend que les compteurs d'ingestion satisfassent `done`
    pub async fn wait_for_ingest<F>(pipeline: &IngestionPipeline, timeout_ms: u64, done: F) -> Result<IngestSnapshot>
    where
        F: Fn(&IngestSnapshot) -> bool,
    {
        let start = Instant::now();
        loop {
            let snapshot = pipeline.stats().snapshot();
            if done(&snapshot) {
                return Ok(snapshot);
            }
            if start.elapsed() > Duration::from_millis(timeout_ms) {
                log::warn!("⏰ Timeout waiting for ingestion, last {:?}", snapshot);
                anyhow::bail!("ingestion did not settle: {:?}", snapshot);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Attend qu'un message soit relayé sur un topic
    pub async fn wait_for_relay(&self, topic: &str, timeout_ms: u64) -> Option<Vec<u8>> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.mqtt_client.find_messages_by_topic(topic).pop() {
                return Some(msg.payload);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// Arrête le broker; les nœuds simulés sont détruits avec le harness
    pub async fn shutdown(mut self) {
        self.nodes.clear();
        self.service.stop().await;
        log::info!("🧹 Test harness stopped");
    }
}
