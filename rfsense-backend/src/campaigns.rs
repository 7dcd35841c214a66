/**
 * CAMPAIGNS - Registre des campagnes de mesure lancées
 *
 * RÔLE : Enregistre chaque campagne (id, capteurs, type, fenêtre temporelle)
 * une fois que les nœuds ont accepté la requête de mesure.
 *
 * ARCHITECTURE : Trait `CampaignRecorder` + persistance JSON (binaire) ou mémoire (tests).
 */

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::models::Campaign;

#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("campaign file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("campaign file format: {0}")]
    Json(#[from] serde_json::Error),
    #[error("campaign {0} already recorded")]
    Duplicate(String),
    #[error("campaign writer task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub trait CampaignRecorder: Send + Sync {
    fn record(&self, campaign: &Campaign) -> Result<(), CampaignError>;
    fn list(&self) -> Vec<Campaign>;

    fn get(&self, campaign_id: &str) -> Option<Campaign> {
        self.list().into_iter().find(|c| c.campaign_id == campaign_id)
    }
}

/// Campagnes persistées dans un tableau JSON, réécrit à chaque ajout.
pub struct JsonCampaignStore {
    path: PathBuf,
    campaigns: Mutex<Vec<Campaign>>,
}

impl JsonCampaignStore {
    /// Charge le fichier s'il existe, sinon démarre à vide
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CampaignError> {
        let path = path.as_ref().to_path_buf();
        let campaigns = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let campaigns: Vec<Campaign> = serde_json::from_str(&content)?;
            info!(count = campaigns.len(), path = %path.display(), "campaigns loaded");
            campaigns
        } else {
            info!(path = %path.display(), "no campaign file, starting fresh");
            Vec::new()
        };

        Ok(Self {
            path,
            campaigns: Mutex::new(campaigns),
        })
    }

    fn save(&self, campaigns: &[Campaign]) -> Result<(), CampaignError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(campaigns)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl CampaignRecorder for JsonCampaignStore {
    fn record(&self, campaign: &Campaign) -> Result<(), CampaignError> {
        let mut campaigns = self.campaigns.lock();
        if campaigns.iter().any(|c| c.campaign_id == campaign.campaign_id) {
            return Err(CampaignError::Duplicate(campaign.campaign_id.clone()));
        }
        campaigns.push(campaign.clone());
        if let Err(e) = self.save(&campaigns) {
            campaigns.pop();
            warn!(campaign = %campaign.campaign_id, error = %e, "failed to persist campaign");
            return Err(e);
        }
        Ok(())
    }

    fn list(&self) -> Vec<Campaign> {
        self.campaigns.lock().clone()
    }
}

#[derive(Default)]
pub struct MemoryCampaignStore {
    campaigns: Mutex<Vec<Campaign>>,
}

impl CampaignRecorder for MemoryCampaignStore {
    fn record(&self, campaign: &Campaign) -> Result<(), CampaignError> {
        let mut campaigns = self.campaigns.lock();
        if campaigns.iter().any(|c| c.campaign_id == campaign.campaign_id) {
            return Err(CampaignError::Duplicate(campaign.campaign_id.clone()));
        }
        campaigns.push(campaign.clone());
        Ok(())
    }

    fn list(&self) -> Vec<Campaign> {
        self.campaigns.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MeasurementKind;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn campaign(id: &str) -> Campaign {
        Campaign {
            campaign_id: id.into(),
            sensors: vec!["s1".into()],
            kind: MeasurementKind::Raw,
            begin: datetime!(2024-01-01 0:00 UTC),
            end: datetime!(2024-01-01 1:00 UTC),
            created_at: datetime!(2024-01-01 0:00 UTC),
        }
    }

    #[test]
    fn test_json_store_persists_across_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("campaigns.json");

        let store = JsonCampaignStore::load(&path).unwrap();
        store.record(&campaign("abc123xyz")).unwrap();
        assert!(matches!(
            store.record(&campaign("abc123xyz")),
            Err(CampaignError::Duplicate(_))
        ));

        let reloaded = JsonCampaignStore::load(&path).unwrap();
        assert_eq!(reloaded.list(), vec![campaign("abc123xyz")]);
        assert!(reloaded.get("abc123xyz").is_some());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCampaignStore::default();
        store.record(&campaign("a")).unwrap();
        store.record(&campaign("b")).unwrap();
        assert_eq!(store.list().len(), 2);
        assert!(store.get("c").is_none());
    }
}
