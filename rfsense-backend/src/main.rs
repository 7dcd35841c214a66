/**
 * RFSENSE BACKEND - Point d'entrée du serveur
 *
 * RÔLE : Orchestration : config, broker + pont MQTT, pipeline d'ingestion,
 * registre des campagnes, API REST. Arrêt propre sur Ctrl-C.
 *
 * ORDRE D'ARRÊT : HTTP → pipeline (vidange du store) → service de coordination.
 */

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rfsense_backend::campaigns::JsonCampaignStore;
use rfsense_backend::config::load_config;
use rfsense_backend::health::HealthTracker;
use rfsense_backend::http::{self, AppState};
use rfsense_backend::nodes::NodeService;
use rfsense_backend::pipeline::IngestionPipeline;
use rfsense_backend::samples::SampleSchema;
use rfsense_backend::service::CoordinationService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rfsense_backend=info")),
        )
        .init();

    let cfg = load_config().await.context("loading configuration")?;

    // broker + pont MQTT
    let mut service = CoordinationService::new(&cfg.broker, &cfg.mqtt);
    service.start();

    let campaigns = JsonCampaignStore::load(&cfg.backend.campaigns)
        .with_context(|| format!("loading campaigns from {}", cfg.backend.campaigns.display()))?;

    // collecteur TCP → redb
    let schema = SampleSchema::bundled().context("parsing bundled sample schema")?;
    let pipeline = IngestionPipeline::start(&cfg.collector, &cfg.backend.storage, schema.clone())
        .await
        .context("starting ingestion pipeline")?;

    let health = HealthTracker::new(service.broker().clone(), pipeline.stats(), service.bridge());
    let app_state = AppState {
        nodes: NodeService::new(service.client(), Arc::new(campaigns))
            .with_flush_timeout(cfg.broker.flush_timeout()),
        health,
        store: pipeline.store(),
        schema,
        ping_timeout: cfg.broker.ping_timeout(),
        request_timeout: cfg.broker.request_timeout(),
    };
    if cfg.backend.api_key.is_none() {
        warn!("backend.api_key not set, only /health will answer");
    }
    let app = http::build_router(app_state, cfg.backend.api_key.clone());

    let addr: SocketAddr = format!("{}:{}", cfg.backend.host, cfg.backend.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.backend.host, cfg.backend.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding http on {addr}"))?;
    info!(%addr, collector = %pipeline.local_addr(), "backend listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for shutdown signal");
            }
            info!("shutdown requested");
        })
        .await;

    let snapshot = pipeline.shutdown().await;
    info!(stored = snapshot.stored, dropped = snapshot.dropped, "ingestion drained");
    service.stop().await;

    served.context("http server")?;
    Ok(())
}
