//! Node queries and measurement launches on top of scatter-gather.

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::broker::{BrokerClient, BrokerError};
use crate::campaigns::{CampaignError, CampaignRecorder};
use crate::gather::{self, GatherError, PingConfig};
use crate::models::{Campaign, MeasurementRequest, NodeStats};

pub const LIST_SUBJECT: &str = "node.all";
pub const LIST_REPLY: &str = "node.get.all";
pub const CAMPAIGN_ID_LEN: usize = 9;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid node id {0:?}")]
    InvalidId(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, thiserror::Error)]
pub enum MeasurementError {
    #[error("invalid measurement request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Gather(#[from] GatherError<NodeStats>),
    #[error("campaign not recorded: {0}")]
    Record(#[from] CampaignError),
}

#[derive(Clone)]
pub struct NodeService {
    client: BrokerClient,
    campaigns: Arc<dyn CampaignRecorder>,
    flush_timeout: Option<Duration>,
}

pub fn stats_subject(node_id: &str) -> Result<String, NodeError> {
    let id = node_id.trim_matches('.');
    if id.is_empty() || id.contains(['.', '/', '*', '>', ' ']) {
        return Err(NodeError::InvalidId(node_id.to_string()));
    }
    Ok(format!("node.{id}.stats"))
}

pub fn new_campaign_id() -> String {
    Uuid::new_v4().simple().to_string()[..CAMPAIGN_ID_LEN].to_string()
}

impl NodeService {
    pub fn new(client: BrokerClient, campaigns: Arc<dyn CampaignRecorder>) -> Self {
        Self {
            client,
            campaigns,
            flush_timeout: None,
        }
    }

    /// Bounds the broker flush after each scatter publish.
    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = Some(flush_timeout);
        self
    }

    fn ping_config(&self, timeout: Duration) -> PingConfig {
        let cfg = PingConfig::default().with_timeout(timeout);
        match self.flush_timeout {
            Some(flush) => cfg.with_flush_timeout(flush),
            None => cfg,
        }
    }

    pub fn campaigns(&self) -> &Arc<dyn CampaignRecorder> {
        &self.campaigns
    }

    /// Stats of every node currently subscribed to `node.all`.
    pub async fn list_active_nodes(&self, timeout: Duration) -> Result<Vec<NodeStats>, GatherError<NodeStats>> {
        gather::ping(
            &self.client,
            LIST_SUBJECT,
            LIST_REPLY,
            self.ping_config(timeout),
        )
        .await
    }

    pub async fn get_node_stats(&self, node_id: &str, timeout: Duration) -> Result<NodeStats, NodeError> {
        let subject = stats_subject(node_id)?;
        Ok(self.client.request(&subject, "", timeout).await?)
    }

    /// Asks the listed sensors to start measuring, then records the campaign.
    /// The request's campaign id is always replaced by a fresh one.
    pub async fn run_measurement(
        &self,
        mut request: MeasurementRequest,
        timeout: Duration,
    ) -> Result<(Campaign, Vec<NodeStats>), MeasurementError> {
        request.validate().map_err(MeasurementError::Invalid)?;
        request.campaign_id = new_campaign_id();

        let (subject, reply) = request.kind.subjects();
        let message = serde_json::to_value(&request)
            .map_err(|e| MeasurementError::Invalid(e.to_string()))?;
        let stats = gather::ping::<NodeStats>(
            &self.client,
            subject,
            reply,
            self.ping_config(timeout)
                .expecting(request.sensors.len())
                .with_message(message),
        )
        .await?;

        let campaign = Campaign {
            campaign_id: request.campaign_id,
            sensors: request.sensors,
            kind: request.kind,
            begin: request.begin,
            end: request.end,
            created_at: OffsetDateTime::now_utc(),
        };
        // the JSON recorder writes the file synchronously
        let recorder = self.campaigns.clone();
        let campaign = tokio::task::spawn_blocking(move || recorder.record(&campaign).map(|()| campaign))
            .await
            .map_err(CampaignError::from)??;
        info!(
            campaign = %campaign.campaign_id,
            kind = campaign.kind.as_str(),
            nodes = stats.len(),
            "measurement campaign started"
        );
        Ok((campaign, stats))
    }
}
