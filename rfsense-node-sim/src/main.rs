/**
 * RFSENSE NODE SIM - Nœud capteur simulé
 *
 * RÔLE : Se comporte comme un capteur réel vis-à-vis du backend :
 * - annonce sa présence sur MQTT (sujets écoutés) à intervalle régulier
 * - répond aux enveloppes reçues par le pont avec ses NodeStats (sysinfo)
 * - sur une requête de mesure, pousse des échantillons Avro au collecteur TCP
 *
 * CONFIG (env) : RFSENSE_NODE_ID, RFSENSE_MQTT_HOST, RFSENSE_MQTT_PORT,
 * RFSENSE_COLLECTOR_ADDR, RFSENSE_HEARTBEAT (ex. "10s"), RFSENSE_SAMPLES.
 */

use anyhow::Context;
use gethostname::gethostname;
use local_ip_address::local_ip;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::System;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rfsense_backend::models::{InboxEnvelope, MeasurementRequest, NodeStats, OutboxEnvelope, PresenceIn};
use rfsense_backend::mqtt::{inbox_topic, OUTBOX_TOPIC, PRESENCE_TOPIC};
use rfsense_backend::samples::{write_frame, Framing, SampleConfig, SampleRecord, SampleSchema, SampleTime};

struct NodeConf {
    node_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    collector: String,
    heartbeat: Duration,
    samples: usize,
}

impl NodeConf {
    fn from_env() -> anyhow::Result<Self> {
        let var = |k: &str| std::env::var(k).ok();
        Ok(Self {
            node_id: var("RFSENSE_NODE_ID").unwrap_or_else(|| gethostname().to_string_lossy().replace('.', "-")),
            mqtt_host: var("RFSENSE_MQTT_HOST").unwrap_or_else(|| "localhost".into()),
            mqtt_port: var("RFSENSE_MQTT_PORT")
                .map(|p| p.parse())
                .transpose()
                .context("RFSENSE_MQTT_PORT")?
                .unwrap_or(1883),
            collector: var("RFSENSE_COLLECTOR_ADDR").unwrap_or_else(|| "127.0.0.1:2022".into()),
            heartbeat: var("RFSENSE_HEARTBEAT")
                .map(|h| humantime::parse_duration(&h))
                .transpose()
                .context("RFSENSE_HEARTBEAT")?
                .unwrap_or(Duration::from_secs(10)),
            samples: var("RFSENSE_SAMPLES")
                .map(|n| n.parse())
                .transpose()
                .context("RFSENSE_SAMPLES")?
                .unwrap_or(5),
        })
    }

    fn subjects(&self) -> Vec<String> {
        vec![
            "node.all".to_string(),
            format!("node.{}.stats", self.node_id),
            "node.all.aggregated".to_string(),
            "node.all.raw".to_string(),
        ]
    }
}

fn node_stats(conf: &NodeConf, sys: &mut System) -> NodeStats {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total = sys.total_memory() as f32;
    let ram = if total > 0.0 { sys.used_memory() as f32 / total } else { 0.0 };
    let ip = local_ip().map(|i| i.to_string()).unwrap_or_else(|_| "0.0.0.0".into());

    let mut providers = HashMap::new();
    providers.insert(
        "system".to_string(),
        json!({
            "cpu": sys.global_cpu_info().cpu_usage() / 100.0,
            "ram": ram,
            "ip": ip,
            "os": System::long_os_version(),
        }),
    );
    NodeStats {
        id: conf.node_id.clone(),
        hostname: gethostname().to_string_lossy().to_string(),
        model: "node-sim".to_string(),
        uptime_secs: System::uptime(),
        providers,
    }
}

/// Fake spectrum: a carrier in the middle of the band over a noise floor
fn spectrum(bins: usize, step: usize) -> Vec<f32> {
    (0..bins)
        .map(|i| {
            let x = (i as f32 - bins as f32 / 2.0) / 4.0;
            let noise = ((i * 7 + step * 13) % 11) as f32 / 10.0;
            -95.0 + 40.0 * (-x * x).exp() + noise
        })
        .collect()
}

async fn push_samples(conf: Arc<NodeConf>, schema: SampleSchema, request: MeasurementRequest) -> anyhow::Result<()> {
    let center = (request.freq_min + request.freq_max) / 2;
    let span = (request.freq_max - request.freq_min).max(1);

    for step in 0..conf.samples {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let record = SampleRecord {
            sensor_id: conf.node_id.clone(),
            campaign_id: request.campaign_id.clone(),
            sample_type: request.kind.as_str().to_string(),
            time: SampleTime {
                seconds: now.as_secs() as i64,
                microseconds: now.subsec_micros() as i32,
            },
            config: SampleConfig {
                center_freq: center,
                sampling_rate: i32::try_from(span).ok(),
                frontend_gain: Some(20.0),
                ..Default::default()
            },
            data: spectrum(64, step),
        };
        let payload = schema.encode(&record)?;

        let mut stream = TcpStream::connect(&conf.collector)
            .await
            .with_context(|| format!("connecting to collector {}", conf.collector))?;
        write_frame(&mut stream, Framing::LengthPrefixed, &payload).await?;
        stream.shutdown().await?;

        let pause = request.time_res.unwrap_or(1).max(1) as u64;
        tokio::time::sleep(Duration::from_secs(pause)).await;
    }
    info!(campaign = %request.campaign_id, samples = conf.samples, "measurement finished");
    Ok(())
}

async fn handle_inbox(
    conf: &Arc<NodeConf>,
    client: &AsyncClient,
    schema: &SampleSchema,
    sys: &mut System,
    envelope: InboxEnvelope,
) -> anyhow::Result<()> {
    if envelope.subject == "node.all.aggregated" || envelope.subject == "node.all.raw" {
        let request: MeasurementRequest = serde_json::from_value(envelope.payload.clone())?;
        if !request.sensors.iter().any(|s| s == &conf.node_id) {
            return Ok(());
        }
        info!(campaign = %request.campaign_id, kind = request.kind.as_str(), "measurement requested");
        let (conf, schema) = (conf.clone(), schema.clone());
        tokio::spawn(async move {
            if let Err(e) = push_samples(conf, schema, request).await {
                warn!(error = %e, "sample push failed");
            }
        });
    }

    let Some(reply) = envelope.reply else { return Ok(()) };
    let outbox = OutboxEnvelope {
        subject: reply,
        payload: serde_json::to_value(node_stats(conf, sys))?,
    };
    client
        .publish(OUTBOX_TOPIC, QoS::AtLeastOnce, false, serde_json::to_vec(&outbox)?)
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let conf = Arc::new(NodeConf::from_env()?);
    let schema = SampleSchema::bundled()?;
    info!(node = %conf.node_id, collector = %conf.collector, "node simulator starting");

    let mut opts = MqttOptions::new(format!("rfsense-node-{}", conf.node_id), conf.mqtt_host.clone(), conf.mqtt_port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    // Boucle présence (envoi)
    {
        let client = client.clone();
        let presence = serde_json::to_vec(&PresenceIn {
            node_id: conf.node_id.clone(),
            subjects: conf.subjects(),
        })?;
        let period = conf.heartbeat;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = client
                    .publish(PRESENCE_TOPIC, QoS::AtLeastOnce, false, presence.clone())
                    .await
                {
                    warn!(error = %e, "presence publish failed");
                }
            }
        });
    }

    // Boucle d'événements MQTT (réception)
    let inbox = inbox_topic(&conf.node_id);
    let mut sys = System::new();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!(topic = %inbox, "connected, subscribing to inbox");
                client.subscribe(inbox.as_str(), QoS::AtLeastOnce).await?;
            }
            Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == inbox => {
                match serde_json::from_slice::<InboxEnvelope>(&p.payload) {
                    Ok(envelope) => {
                        if let Err(e) = handle_inbox(&conf, &client, &schema, &mut sys, envelope).await {
                            warn!(error = %e, "cannot handle inbox message");
                        }
                    }
                    Err(e) => warn!(error = %e, bytes = p.payload.len(), "bad inbox envelope"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
