use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One measurement pushed by a sensor. Field order follows `sample.avsc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRecord {
    /// Hardware id of the sensor
    pub sensor_id: String,
    pub campaign_id: String,
    /// IQ, PSD or DEC
    pub sample_type: String,
    pub time: SampleTime,
    pub config: SampleConfig,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleTime {
    /// Seconds since the UNIX epoch
    pub seconds: i64,
    pub microseconds: i32,
}

/// Front-end configuration in use while the sample was recorded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleConfig {
    #[serde(default)]
    pub antenna_gain: Option<f32>,
    #[serde(default)]
    pub antenna_id: Option<i32>,
    /// Hz, correction already applied
    pub center_freq: i64,
    #[serde(default)]
    pub est_noise_floor: Option<f32>,
    #[serde(default)]
    pub frequency_correction_factor: Option<f32>,
    /// dB, -1 for automatic gain control
    #[serde(default)]
    pub frontend_gain: Option<f32>,
    #[serde(default)]
    pub hopping_strategy: Option<i32>,
    #[serde(default)]
    pub iq_balance_calibration: Option<bool>,
    #[serde(default)]
    pub rf_sync: Option<i32>,
    #[serde(default)]
    pub sampling_rate: Option<i32>,
    #[serde(default)]
    pub sig_strength_calibration: Option<bool>,
    #[serde(default)]
    pub system_sync: Option<String>,
    #[serde(default)]
    pub extra_conf: Option<HashMap<String, String>>,
}

impl SampleRecord {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(&self.campaign_id, &self.sensor_id)
    }
}

impl SampleTime {
    /// Microseconds since the UNIX epoch, saturating at the `i64` range.
    pub fn as_micros(&self) -> i64 {
        self.seconds
            .saturating_mul(1_000_000)
            .saturating_add(i64::from(self.microseconds))
    }
}

/// `campaign ++ "_" ++ sensor`: the prefix of every store key of one
/// (campaign, sensor) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(Vec<u8>);

impl PartitionKey {
    pub fn new(campaign_id: &str, sensor_id: &str) -> Self {
        let mut key = Vec::with_capacity(campaign_id.len() + 1 + sensor_id.len());
        key.extend_from_slice(campaign_id.as_bytes());
        key.push(b'_');
        key.extend_from_slice(sensor_id.as_bytes());
        Self(key)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for PartitionKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}
