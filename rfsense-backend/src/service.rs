//! Coordination service: owns the broker and everything wired to it.
//!
//! Components receive a [`BrokerClient`] from here instead of reaching for
//! process-wide handles, so several isolated services can live in one
//! process (tests do exactly that).

use std::sync::Arc;
use tracing::info;

use crate::broker::{Broker, BrokerClient, BrokerStats};
use crate::config::{BrokerConf, MqttConf};
use crate::keystore::{Keystore, StaticTokenResolver, TokenResolver};
use crate::mqtt::{BridgeStatus, MqttBridge};

pub struct CoordinationService {
    broker: Broker,
    tokens: Option<Arc<dyn TokenResolver>>,
    mqtt: MqttConf,
    bridge: Option<MqttBridge>,
}

impl CoordinationService {
    pub fn new(broker_cfg: &BrokerConf, mqtt: &MqttConf) -> Self {
        let tokens = broker_cfg.token.clone().map(|token| {
            let resolver: Arc<dyn TokenResolver> =
                Arc::new(Keystore::new(Arc::new(StaticTokenResolver::new(Some(token)))));
            resolver
        });
        Self {
            broker: Broker::new(),
            tokens,
            mqtt: mqtt.clone(),
            bridge: None,
        }
    }

    /// Plugs in an external key service instead of the configured token.
    pub fn with_token_resolver(mut self, resolver: Arc<dyn TokenResolver>) -> Self {
        self.tokens = Some(resolver);
        self
    }

    /// Starts the broker, then the MQTT bridge when enabled. The broker is
    /// ready before this returns.
    pub fn start(&mut self) {
        self.broker.start();
        if self.mqtt.enabled && self.bridge.is_none() {
            self.bridge = Some(MqttBridge::spawn(&self.mqtt, self.client()));
        }
        info!(mqtt = self.bridge.is_some(), "coordination service started");
    }

    pub async fn stop(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.stop().await;
        }
        self.broker.stop();
        info!("coordination service stopped");
    }

    pub fn is_ready(&self) -> bool {
        self.broker.is_ready()
    }

    pub fn client(&self) -> BrokerClient {
        let client = self.broker.client();
        match &self.tokens {
            Some(resolver) => client.with_tokens(resolver.clone()),
            None => client,
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn broker_stats(&self) -> BrokerStats {
        self.broker.stats()
    }

    pub fn bridge(&self) -> Option<MqttBridge> {
        self.bridge.clone()
    }

    pub fn bridge_status(&self) -> Option<BridgeStatus> {
        self.bridge.as_ref().map(MqttBridge::status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_and_isolation() {
        let mut a = CoordinationService::new(&BrokerConf::default(), &MqttConf::default());
        let mut b = CoordinationService::new(&BrokerConf::default(), &MqttConf::default());
        a.start();
        b.start();

        let _sub = a.client().subscribe("node.all").unwrap();
        assert_eq!(a.client().presence("node.all").unwrap(), 1);
        assert_eq!(b.client().presence("node.all").unwrap(), 0);
        assert!(a.bridge_status().is_none());

        a.stop().await;
        assert!(!a.is_ready());
        assert!(b.is_ready());
        b.stop().await;
    }

    #[tokio::test]
    async fn test_configured_token_is_attached() {
        let cfg = BrokerConf {
            token: Some("secret".into()),
            ..Default::default()
        };
        let mut svc = CoordinationService::new(&cfg, &MqttConf::default());
        svc.start();

        let client = svc.client();
        let mut sub = client.subscribe("node.all").unwrap();
        client.publish("node.all", "").unwrap();
        assert_eq!(sub.next().await.unwrap().token.as_deref(), Some("secret"));
    }
}
