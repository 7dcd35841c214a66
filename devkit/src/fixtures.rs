//! Sample fixtures

use rfsense_backend::samples::{DecodeError, SampleConfig, SampleRecord, SampleSchema, SampleTime};
use std::collections::HashMap;

/// A small PSD sample recorded at `seconds`.
pub fn sample_record(campaign_id: &str, sensor_id: &str, seconds: i64) -> SampleRecord {
    SampleRecord {
        sensor_id: sensor_id.to_string(),
        campaign_id: campaign_id.to_string(),
        sample_type: "PSD".to_string(),
        time: SampleTime {
            seconds,
            microseconds: 0,
        },
        config: SampleConfig {
            antenna_gain: Some(2.5),
            center_freq: 98_000_000,
            sampling_rate: Some(2_400_000),
            hopping_strategy: Some(1),
            extra_conf: Some(HashMap::from([("fw".to_string(), "1.0".to_string())])),
            ..Default::default()
        },
        data: vec![-92.5, -88.0, -71.25, -90.0],
    }
}

/// Avro datum of [`sample_record`].
pub fn encoded_sample(
    schema: &SampleSchema,
    campaign_id: &str,
    sensor_id: &str,
    seconds: i64,
) -> Result<Vec<u8>, DecodeError> {
    schema.encode(&sample_record(campaign_id, sensor_id, seconds))
}
