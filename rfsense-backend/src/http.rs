/**
 * API REST RFSENSE - Couche HTTP fine au-dessus du noyau
 *
 * RÔLE :
 * Expose les opérations du noyau (nœuds, mesures, campagnes, échantillons)
 * aux outils humains : dashboard, CLI, scripts.
 *
 * FONCTIONNEMENT :
 * - Routeur Axum, middleware x-api-key sur tout sauf /health
 * - Timeout d'un scatter-gather → 504 avec les réponses partielles
 * - Lecture des échantillons : StoreSource → décodage Avro → fenêtre d'échantillonnage
 */

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::broker::BrokerError;
use crate::gather::GatherError;
use crate::health::{HealthTracker, SystemHealth};
use crate::models::{Campaign, MeasurementKind, MeasurementRequest, NodeStats};
use crate::nodes::{MeasurementError, NodeError, NodeService};
use crate::samples::{PartitionKey, SampleRecord, SampleSchema};
use crate::store::{AppendStore, StoreSource, StoredEntry};
use crate::stream::{DiscardingWindow, FilterMap, Source, Stream};

#[derive(Clone)]
pub struct AppState {
    pub nodes: NodeService,
    pub health: HealthTracker,
    pub store: Arc<AppendStore>,
    pub schema: SampleSchema,
    pub ping_timeout: Duration,
    pub request_timeout: Duration,
}

pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl ToString) -> Self {
        Self {
            status,
            body: json!({ "error": message.to_string() }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<GatherError<NodeStats>> for ApiError {
    fn from(e: GatherError<NodeStats>) -> Self {
        if e.is_timeout() {
            let message = e.to_string();
            return Self {
                status: StatusCode::GATEWAY_TIMEOUT,
                body: json!({ "error": message, "nodes": e.into_partial() }),
            };
        }
        warn!(error = %e, "scatter-gather failed");
        Self::new(StatusCode::SERVICE_UNAVAILABLE, e)
    }
}

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        let status = match &e {
            NodeError::InvalidId(_) => StatusCode::BAD_REQUEST,
            NodeError::Broker(BrokerError::NoResponders(_)) => StatusCode::NOT_FOUND,
            NodeError::Broker(BrokerError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            NodeError::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e)
    }
}

impl From<MeasurementError> for ApiError {
    fn from(e: MeasurementError) -> Self {
        match e {
            MeasurementError::Invalid(msg) => Self::new(StatusCode::BAD_REQUEST, msg),
            MeasurementError::Gather(e) => e.into(),
            MeasurementError::Record(e) => {
                warn!(error = %e, "campaign not recorded");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e)
            }
        }
    }
}

async fn require_api_key(
    State(expected): State<Option<String>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = expected.filter(|k| !k.is_empty()) else {
        warn!("SECURITY: no api key configured, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState, api_key: Option<String>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/{sensor_id}", get(get_node))
        .route("/api/v1/aggregated", post(start_aggregated))
        .route("/api/v1/raw", post(start_raw))
        .route("/api/v1/campaigns", get(list_campaigns))
        .route("/api/v1/campaigns/{campaign_id}", get(get_campaign))
        .route("/api/v1/samples/{campaign_id}/{sensor_id}", get(get_samples))
        .with_state(app_state)
        .layer(middleware::from_fn_with_state(api_key, require_api_key))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<SystemHealth> {
    Json(app.health.get_health())
}

// GET /api/v1/nodes
async fn list_nodes(State(app): State<AppState>) -> Result<Json<Vec<NodeStats>>, ApiError> {
    Ok(Json(app.nodes.list_active_nodes(app.ping_timeout).await?))
}

// GET /api/v1/nodes/{sensor_id}
async fn get_node(
    State(app): State<AppState>,
    Path(sensor_id): Path<String>,
) -> Result<Json<NodeStats>, ApiError> {
    Ok(Json(app.nodes.get_node_stats(&sensor_id, app.request_timeout).await?))
}

async fn start_measurement(
    app: AppState,
    kind: MeasurementKind,
    mut request: MeasurementRequest,
) -> Result<Response, ApiError> {
    request.kind = kind;
    let (campaign, nodes) = app.nodes.run_measurement(request, app.ping_timeout).await?;
    let location = format!("/api/v1/campaigns/{}", campaign.campaign_id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(json!({ "campaign": campaign, "nodes": nodes })),
    )
        .into_response())
}

// POST /api/v1/aggregated
async fn start_aggregated(
    State(app): State<AppState>,
    Json(request): Json<MeasurementRequest>,
) -> Result<Response, ApiError> {
    start_measurement(app, MeasurementKind::Aggregated, request).await
}

// POST /api/v1/raw
async fn start_raw(
    State(app): State<AppState>,
    Json(request): Json<MeasurementRequest>,
) -> Result<Response, ApiError> {
    start_measurement(app, MeasurementKind::Raw, request).await
}

// GET /api/v1/campaigns
async fn list_campaigns(State(app): State<AppState>) -> Json<Vec<Campaign>> {
    Json(app.nodes.campaigns().list())
}

// GET /api/v1/campaigns/{campaign_id}
async fn get_campaign(
    State(app): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<Json<Campaign>, StatusCode> {
    app.nodes
        .campaigns()
        .get(&campaign_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize, Default)]
struct SampleQuery {
    /// Unix seconds, inclusive
    from: Option<i64>,
    /// Unix seconds, exclusive
    to: Option<i64>,
    limit: Option<usize>,
    /// Keep at most one sample per interval
    interval_ms: Option<u64>,
}

// GET /api/v1/samples/{campaign_id}/{sensor_id}
async fn get_samples(
    State(app): State<AppState>,
    Path((campaign_id, sensor_id)): Path<(String, String)>,
    Query(q): Query<SampleQuery>,
) -> Json<Vec<SampleRecord>> {
    let partition = PartitionKey::new(&campaign_id, &sensor_id);
    let schema = app.schema.clone();
    let (from, to) = (q.from, q.to);

    let decoded: Stream<SampleRecord> = StoreSource::new(app.store.clone(), partition.clone()).via(
        FilterMap::new(move |entry: StoredEntry| {
            let record = match schema.decode(&entry.bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(partition = %partition, seq = entry.seq, error = %e, "stored sample unreadable");
                    return None;
                }
            };
            let secs = record.time.seconds;
            let in_range = from.is_none_or(|f| secs >= f) && to.is_none_or(|t| secs < t);
            in_range.then_some(record)
        }),
    );

    let mut samples = match q.interval_ms {
        Some(ms) if ms > 0 => decoded.via(DiscardingWindow::with_timestamps(
            Duration::from_millis(ms),
            |r: &SampleRecord| r.time.as_micros().saturating_mul(1000),
        )),
        _ => decoded,
    };

    let limit = q.limit.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    while out.len() < limit {
        let Some(record) = samples.recv().await else { break };
        out.push(record);
    }
    Json(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerClient};
    use crate::campaigns::MemoryCampaignStore;
    use crate::pipeline::IngestStats;
    use crate::samples::{SampleConfig, SampleTime};
    use axum::body::{to_bytes, Body};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        router: Router,
        broker: Broker,
        store: Arc<AppendStore>,
        schema: SampleSchema,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new();
        broker.start();
        let store = Arc::new(AppendStore::open(dir.path().join("samples.redb"), 10).unwrap());
        let schema = SampleSchema::bundled().unwrap();
        let state = AppState {
            nodes: NodeService::new(broker.client(), Arc::new(MemoryCampaignStore::default())),
            health: HealthTracker::new(broker.clone(), Arc::new(IngestStats::default()), None),
            store: store.clone(),
            schema: schema.clone(),
            ping_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_millis(100),
        };
        Fixture {
            router: build_router(state, Some("k".into())),
            broker,
            store,
            schema,
            _dir: dir,
        }
    }

    fn node(client: BrokerClient, id: &str, subject: &str) {
        let mut sub = client.subscribe(subject).unwrap();
        let me = NodeStats {
            id: id.into(),
            hostname: id.into(),
            model: String::new(),
            uptime_secs: 1,
            providers: Default::default(),
        };
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let _ = client.respond(&msg, &me);
            }
        });
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("x-api-key", "k")
            .header(header::CONTENT_TYPE, "application/json");
        let req = match body {
            Some(v) => req.body(Body::from(v.to_string())).unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_api_key_required_except_health() {
        let f = fixture();
        let resp = f
            .router
            .clone()
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = f
            .router
            .clone()
            .oneshot(axum::http::Request::builder().uri("/api/v1/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let (status, body) = call(&f.router, "GET", "/system/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["broker_ready"], json!(true));
    }

    #[tokio::test]
    async fn test_nodes_endpoints() {
        let f = fixture();
        node(f.broker.client(), "a", "node.all");
        node(f.broker.client(), "a", "node.a.stats");

        let (status, body) = call(&f.router, "GET", "/api/v1/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = call(&f.router, "GET", "/api/v1/nodes/a", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], json!("a"));

        let (status, _) = call(&f.router, "GET", "/api/v1/nodes/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_measurement_created_and_timeout() {
        let f = fixture();
        node(f.broker.client(), "a", "node.all.aggregated");
        let body = json!({
            "sensors": ["a"],
            "begin": "2024-01-01T00:00:00Z",
            "end": "2024-01-01T01:00:00Z",
            "freqMin": 100,
            "freqMax": 200
        });

        let (status, created) = call(&f.router, "POST", "/api/v1/aggregated", Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["campaign"]["campaignId"].as_str().unwrap().to_string();

        let (status, campaign) = call(&f.router, "GET", &format!("/api/v1/campaigns/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(campaign["type"], json!("PSD"));

        // Only one of the two sensors answers on the raw subject
        let mut raw = body;
        raw["sensors"] = json!(["a", "b"]);
        node(f.broker.client(), "a", "node.all.raw");
        let (status, partial) = call(&f.router, "POST", "/api/v1/raw", Some(raw)).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(partial["nodes"].as_array().unwrap().len(), 1);

        let (_, all) = call(&f.router, "GET", "/api/v1/campaigns", None).await;
        assert_eq!(all.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_samples_filtering_and_thinning() {
        let f = fixture();
        let key = PartitionKey::new("c1", "s1");
        for (i, secs) in [100i64, 100, 101, 102, 200].into_iter().enumerate() {
            let record = SampleRecord {
                sensor_id: "s1".into(),
                campaign_id: "c1".into(),
                sample_type: "PSD".into(),
                time: SampleTime {
                    seconds: secs,
                    microseconds: i as i32,
                },
                config: SampleConfig {
                    center_freq: 100,
                    ..Default::default()
                },
                data: vec![i as f32],
            };
            f.store.append(&key, &f.schema.encode(&record).unwrap()).unwrap();
        }
        f.store.append(&key, b"not avro").unwrap();

        let (_, all) = call(&f.router, "GET", "/api/v1/samples/c1/s1", None).await;
        assert_eq!(all.as_array().unwrap().len(), 5);

        let (_, ranged) = call(&f.router, "GET", "/api/v1/samples/c1/s1?from=101&to=200", None).await;
        assert_eq!(ranged.as_array().unwrap().len(), 2);

        let (_, thinned) = call(&f.router, "GET", "/api/v1/samples/c1/s1?interval_ms=1500", None).await;
        let secs: Vec<i64> = thinned
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["time"]["seconds"].as_i64().unwrap())
            .collect();
        assert_eq!(secs, vec![100, 102, 200]);

        let (_, limited) = call(&f.router, "GET", "/api/v1/samples/c1/s1?limit=2", None).await;
        assert_eq!(limited.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_thinning_survives_far_future_timestamps() {
        let f = fixture();
        let key = PartitionKey::new("c9", "s9");
        for secs in [100i64, 101, i64::MAX / 1000] {
            let record = SampleRecord {
                sensor_id: "s9".into(),
                campaign_id: "c9".into(),
                sample_type: "PSD".into(),
                time: SampleTime {
                    seconds: secs,
                    microseconds: 0,
                },
                config: Default::default(),
                data: vec![1.0],
            };
            f.store.append(&key, &f.schema.encode(&record).unwrap()).unwrap();
        }

        let (status, thinned) = call(&f.router, "GET", "/api/v1/samples/c9/s9?interval_ms=10", None).await;
        assert_eq!(status, StatusCode::OK);
        let secs: Vec<i64> = thinned
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["time"]["seconds"].as_i64().unwrap())
            .collect();
        assert_eq!(secs, vec![100, 101, i64::MAX / 1000]);
    }
}
