use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::broker::{Broker, BrokerStats};
use crate::mqtt::{BridgeStatus, MqttBridge};
use crate::pipeline::{IngestSnapshot, IngestStats};

#[derive(Debug, Serialize)]
pub struct SystemHealth {
    pub uptime_seconds: u64,
    pub broker_ready: bool,
    pub broker: BrokerStats,
    pub ingest: IngestSnapshot,
    /// Absent when the MQTT bridge is disabled
    pub mqtt: Option<BridgeStatus>,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    broker: Broker,
    ingest: Arc<IngestStats>,
    bridge: Option<MqttBridge>,
}

impl HealthTracker {
    pub fn new(broker: Broker, ingest: Arc<IngestStats>, bridge: Option<MqttBridge>) -> Self {
        Self {
            start_time: Instant::now(),
            broker,
            ingest,
            bridge,
        }
    }

    pub fn get_health(&self) -> SystemHealth {
        SystemHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            broker_ready: self.broker.is_ready(),
            broker: self.broker.stats(),
            ingest: self.ingest.snapshot(),
            mqtt: self.bridge.as_ref().map(MqttBridge::status),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.broker.is_ready()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) {
            let rss_kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
