//! Backend configuration
//!
//! Loaded once at startup from a YAML file (path from `RFSENSE_CONFIG`,
//! `backend.yaml` by default), then overridden by `RFSENSE_<SECTION>_<KEY>`
//! environment variables. A missing file means defaults; a broken file is fatal.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::samples::Framing;

const ENV_PREFIX: &str = "RFSENSE_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Env { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BackendConfig {
    pub backend: BackendConf,
    pub collector: CollectorConf,
    pub broker: BrokerConf,
    pub mqtt: MqttConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConf {
    pub host: String,
    pub port: u16,
    /// redb file holding the sample log.
    pub storage: PathBuf,
    /// JSON file recording measurement campaigns.
    pub campaigns: PathBuf,
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorConf {
    pub port: u16,
    pub framing: Framing,
    /// Decode frames inside the connection handler. When false the listener
    /// only frames bytes and the partition key is extracted just before storage.
    pub decode_in_listener: bool,
    pub max_frame_bytes: usize,
    pub drain_timeout_ms: u64,
    /// Idle bound on reading one connection's frame.
    pub read_timeout_ms: u64,
    pub sequence_bandwidth: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConf {
    /// Opaque access token handed to the keystore; never checked by the broker.
    pub token: Option<String>,
    pub ping_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub flush_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub presence_ttl_secs: u64,
}

impl Default for BackendConf {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            storage: PathBuf::from("./data/samples.redb"),
            campaigns: PathBuf::from("./data/campaigns.json"),
            api_key: None,
        }
    }
}

impl Default for CollectorConf {
    fn default() -> Self {
        Self {
            port: 2022,
            framing: Framing::LengthPrefixed,
            decode_in_listener: true,
            max_frame_bytes: 16 * 1024 * 1024,
            drain_timeout_ms: 2000,
            read_timeout_ms: 10_000,
            sequence_bandwidth: 65_000,
        }
    }
}

impl Default for BrokerConf {
    fn default() -> Self {
        Self {
            token: None,
            ping_timeout_ms: 300,
            request_timeout_ms: 300,
            flush_timeout_ms: 300,
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".into(),
            port: 1883,
            client_id: "rfsense-backend".into(),
            presence_ttl_secs: 30,
        }
    }
}

impl CollectorConf {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl BrokerConf {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl MqttConf {
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }
}

impl BackendConfig {
    /// Parses a YAML document; an empty document yields the defaults.
    pub fn from_yaml(txt: &str, path: &Path) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `RFSENSE_<SECTION>_<KEY>` overrides from the given variables.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(path) = key.strip_prefix(ENV_PREFIX) else { continue };
            let path = path.to_ascii_lowercase();
            let bad = || ConfigError::Env { key: key.clone(), value: value.clone() };

            match path.as_str() {
                "backend_host" => self.backend.host = value.clone(),
                "backend_port" => self.backend.port = value.parse().map_err(|_| bad())?,
                "backend_storage" => self.backend.storage = PathBuf::from(&value),
                "backend_campaigns" => self.backend.campaigns = PathBuf::from(&value),
                "backend_api_key" => self.backend.api_key = Some(value.clone()),
                "collector_port" => self.collector.port = value.parse().map_err(|_| bad())?,
                "collector_framing" => {
                    self.collector.framing = match value.as_str() {
                        "length_prefixed" => Framing::LengthPrefixed,
                        "whole_connection" => Framing::WholeConnection,
                        _ => return Err(bad()),
                    }
                }
                "collector_decode_in_listener" => {
                    self.collector.decode_in_listener = value.parse().map_err(|_| bad())?
                }
                "collector_max_frame_bytes" => {
                    self.collector.max_frame_bytes = value.parse().map_err(|_| bad())?
                }
                "collector_drain_timeout_ms" => {
                    self.collector.drain_timeout_ms = value.parse().map_err(|_| bad())?
                }
                "collector_read_timeout_ms" => {
                    self.collector.read_timeout_ms = value.parse().map_err(|_| bad())?
                }
                "collector_sequence_bandwidth" => {
                    self.collector.sequence_bandwidth = value.parse().map_err(|_| bad())?
                }
                "broker_token" => self.broker.token = Some(value.clone()),
                "broker_ping_timeout_ms" => {
                    self.broker.ping_timeout_ms = value.parse().map_err(|_| bad())?
                }
                "broker_request_timeout_ms" => {
                    self.broker.request_timeout_ms = value.parse().map_err(|_| bad())?
                }
                "broker_flush_timeout_ms" => {
                    self.broker.flush_timeout_ms = value.parse().map_err(|_| bad())?
                }
                "mqtt_enabled" => self.mqtt.enabled = value.parse().map_err(|_| bad())?,
                "mqtt_host" => self.mqtt.host = value.clone(),
                "mqtt_port" => self.mqtt.port = value.parse().map_err(|_| bad())?,
                "mqtt_client_id" => self.mqtt.client_id = value.clone(),
                "mqtt_presence_ttl_secs" => {
                    self.mqtt.presence_ttl_secs = value.parse().map_err(|_| bad())?
                }
                // RFSENSE_CONFIG itself and unrelated variables
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.port == 0 || self.collector.port == 0 {
            return Err(ConfigError::Invalid("ports must be non-zero".into()));
        }
        if self.collector.sequence_bandwidth == 0 {
            return Err(ConfigError::Invalid("collector.sequence_bandwidth must be >= 1".into()));
        }
        if self.collector.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("collector.max_frame_bytes must be >= 1".into()));
        }
        if self.collector.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("collector.read_timeout_ms must be non-zero".into()));
        }
        if self.broker.ping_timeout_ms == 0
            || self.broker.request_timeout_ms == 0
            || self.broker.flush_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("broker timeouts must be non-zero".into()));
        }
        if self.mqtt.enabled && self.mqtt.presence_ttl_secs == 0 {
            return Err(ConfigError::Invalid("mqtt.presence_ttl_secs must be non-zero".into()));
        }
        Ok(())
    }
}

pub async fn load_config() -> Result<BackendConfig, ConfigError> {
    let path = PathBuf::from(std::env::var("RFSENSE_CONFIG").unwrap_or_else(|_| "backend.yaml".into()));

    let mut cfg = if path.exists() {
        let txt = fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        info!(path = %path.display(), "loaded configuration file");
        BackendConfig::from_yaml(&txt, &path)?
    } else {
        warn!(path = %path.display(), "no configuration file, using defaults");
        BackendConfig::default()
    };

    cfg.apply_env(std::env::vars())?;
    cfg.validate()?;
    Ok(cfg)
}
