/*!
Nœuds simulés branchés sur le broker

Un `MockNode` s'abonne à des sujets et répond (ou non) avec ses `NodeStats`.
Les tâches de réponse sont arrêtées quand le nœud est détruit.
*/

use anyhow::Result;
use rfsense_backend::broker::BrokerClient;
use rfsense_backend::models::NodeStats;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct MockNode {
    pub stats: NodeStats,
    received: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockNode {
    pub fn node_stats(id: &str) -> NodeStats {
        NodeStats {
            id: id.to_string(),
            hostname: format!("mock-{id}"),
            model: "mock".to_string(),
            uptime_secs: 1,
            providers: HashMap::new(),
        }
    }

    /// Nœud qui répond sur chacun des sujets
    pub fn responding(client: &BrokerClient, id: &str, subjects: &[&str]) -> Result<Self> {
        Self::spawn(client, id, subjects, true)
    }

    /// Nœud abonné qui ne répond jamais : compte dans la présence, pas dans les réponses
    pub fn silent(client: &BrokerClient, id: &str, subjects: &[&str]) -> Result<Self> {
        Self::spawn(client, id, subjects, false)
    }

    fn spawn(client: &BrokerClient, id: &str, subjects: &[&str], answer: bool) -> Result<Self> {
        let stats = Self::node_stats(id);
        let received = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::with_capacity(subjects.len());

        for subject in subjects {
            let mut sub = client.subscribe(subject)?;
            let client = client.clone();
            let stats = stats.clone();
            let received = received.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(msg) = sub.next().await {
                    received.fetch_add(1, Ordering::SeqCst);
                    if answer {
                        if let Err(e) = client.respond(&msg, &stats) {
                            log::warn!("mock node {} cannot answer: {}", stats.id, e);
                        }
                    }
                }
            }));
        }

        log::info!("🤖 mock node {} on {:?} (answers: {})", id, subjects, answer);
        Ok(Self { stats, received, tasks })
    }

    /// Nombre de messages reçus, tous sujets confondus
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
