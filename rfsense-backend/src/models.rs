use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use time::OffsetDateTime;

/// Status a node reports about itself.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    /// Hardware id
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub uptime_secs: u64,
    /// Free-form provider sections (system, sensor status...)
    #[serde(default)]
    pub providers: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeasurementKind {
    /// Aggregated power spectral density
    #[default]
    #[serde(rename = "PSD")]
    Aggregated,
    /// Raw IQ samples
    #[serde(rename = "IQ")]
    Raw,
}

impl MeasurementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementKind::Aggregated => "PSD",
            MeasurementKind::Raw => "IQ",
        }
    }

    /// (request subject, reply subject)
    pub fn subjects(&self) -> (&'static str, &'static str) {
        match self {
            MeasurementKind::Aggregated => ("node.all.aggregated", "node.get.all.aggregated"),
            MeasurementKind::Raw => ("node.all.raw", "node.get.all.raw"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRequest {
    #[serde(rename = "type", default)]
    pub kind: MeasurementKind,
    pub sensors: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub begin: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    /// Hz
    pub freq_min: i64,
    pub freq_max: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq_res: Option<i64>,
    /// Seconds between aggregated spectra
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_res: Option<i64>,
    /// Always overwritten by the backend
    #[serde(default)]
    pub campaign_id: String,
}

impl MeasurementRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.sensors.is_empty() {
            return Err("sensors must not be empty".into());
        }
        if self.sensors.iter().any(|s| s.trim().is_empty()) {
            return Err("sensor ids must not be blank".into());
        }
        if self.end <= self.begin {
            return Err("end must be after begin".into());
        }
        if self.freq_min < 0 || self.freq_max <= self.freq_min {
            return Err("frequency range is invalid".into());
        }
        if matches!(self.freq_res, Some(r) if r <= 0) || matches!(self.time_res, Some(r) if r <= 0) {
            return Err("resolutions must be positive".into());
        }
        Ok(())
    }
}

/// A launched measurement campaign.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub campaign_id: String,
    pub sensors: Vec<String>,
    #[serde(rename = "type")]
    pub kind: MeasurementKind,
    #[serde(with = "time::serde::rfc3339")]
    pub begin: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// MQTT bridge envelopes

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PresenceIn {
    pub node_id: String,
    pub subjects: Vec<String>,
}

/// Broker message relayed to a node.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InboxEnvelope {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Value,
}

/// Node message to republish on the broker.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutboxEnvelope {
    pub subject: String,
    pub payload: Value,
}
