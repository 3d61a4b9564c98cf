//! Axum HTTP surface for the administrative trigger, distribution sweep and run-log queries.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;
use tenderwatch_notify::{Distributor, NotifyConfig, SweepSummary};
use tenderwatch_sync::{run_log_tree, SyncConfig, SyncPipeline, TriggerRequest, TriggerResponse};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tenderwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub distributor: Arc<Distributor>,
    pub lookback_hours: i64,
    pub sweep_limit: i64,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, distributor: Arc<Distributor>) -> Self {
        let defaults = NotifyConfig::default();
        Self {
            pipeline,
            distributor,
            lookback_hours: defaults.lookback_hours,
            sweep_limit: defaults.sweep_limit,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/scrape", post(scrape_handler))
        .route("/api/distribute", post(distribute_handler))
        .route("/api/runs/{id}", get(run_tree_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TENDERWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let pipeline = Arc::new(SyncPipeline::from_config(SyncConfig::from_env()).await?);
    let notify = NotifyConfig::from_env();
    let distributor = Arc::new(Distributor::new(pipeline.store(), notify.build_notifiers()?));
    let scheduler = pipeline.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(
            every_hours = pipeline.config().schedule_interval_hours,
            "periodic sync scheduled"
        );
    }

    let state = AppState {
        lookback_hours: notify.lookback_hours,
        sweep_limit: notify.sweep_limit,
        ..AppState::new(pipeline, distributor)
    };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving tenderwatch api");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "could not listen for shutdown signal");
            }
        })
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().count_tenders().await {
        Ok(tenders) => Json(json!({ "status": "ok", "tenders": tenders })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "error": err.to_string() })),
        )
            .into_response(),
    }
}

/// An empty body is a manual trigger with every field defaulted.
async fn scrape_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: TriggerRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => {
                return trigger_response(
                    StatusCode::BAD_REQUEST,
                    TriggerResponse::failure(format!("invalid request body: {err}")),
                )
            }
        }
    };

    if let Some(raw) = request.log_id.as_deref() {
        if Uuid::parse_str(raw).is_err() {
            return trigger_response(
                StatusCode::BAD_REQUEST,
                TriggerResponse::failure(format!("invalid logId `{raw}`")),
            );
        }
    }
    if let Some(id) = request.source.as_deref() {
        if state.pipeline.registry().find(id).is_none() {
            return trigger_response(
                StatusCode::NOT_FOUND,
                TriggerResponse::failure(format!("unknown source `{id}`")),
            );
        }
    }

    let response = state.pipeline.trigger(request).await;
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    trigger_response(status, response)
}

fn trigger_response(status: StatusCode, body: TriggerResponse) -> Response {
    (status, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
struct DistributeResponse {
    success: bool,
    channels: Vec<&'static str>,
    #[serde(flatten)]
    summary: SweepSummary,
}

async fn distribute_handler(State(state): State<Arc<AppState>>) -> Response {
    let since = Utc::now() - ChronoDuration::hours(state.lookback_hours.max(1));
    match state.distributor.sweep(since, state.sweep_limit.max(1)).await {
        Ok(summary) => Json(DistributeResponse {
            success: true,
            channels: state
                .distributor
                .channels()
                .into_iter()
                .map(|c| c.as_str())
                .collect(),
            summary,
        })
        .into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

async fn run_tree_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("invalid run id `{id}`") })),
        )
            .into_response();
    };
    match run_log_tree(state.pipeline.store().as_ref(), id).await {
        Ok(Some(tree)) => Json(tree).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "run log not found" })),
        )
            .into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

fn server_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tenderwatch_core::{Channel, Tender};
    use tenderwatch_notify::{Notifier, NotifyError};
    use tenderwatch_storage::{FetchError, FetchOptions, FetchedResponse, MemoryStore, PageFetcher, Store};
    use tenderwatch_sync::{Normalizer, SourceRegistry};
    use tower::ServiceExt;

    const REGISTRY_YAML: &str = r#"
sources:
  - source_id: mygov
    display_name: MyGov
    base_url: https://www.mygov.go.ke/all-tenders
"#;

    const MYGOV_HTML: &str = r#"<table>
        <tr><th>Tender</th><th>Ministry</th><th>Closes</th></tr>
        <tr><td>Youth ICT Equipment Supply</td><td>Ministry of ICT</td><td>20/05/2030</td></tr>
        <tr><td>Office Partitioning</td><td>State Department for Housing</td><td>23/05/2030</td></tr>
    </table>"#;

    struct StaticFetcher;

    #[async_trait]
    impl PageFetcher for StaticFetcher {
        async fn fetch(
            &self,
            _source_id: &str,
            url: &str,
            _options: FetchOptions,
        ) -> Result<FetchedResponse, FetchError> {
            Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                content_type: Some("text/html".into()),
                body: MYGOV_HTML.as_bytes().to_vec(),
            })
        }
    }

    struct OkNotifier;

    #[async_trait]
    impl Notifier for OkNotifier {
        fn channel(&self) -> Channel {
            Channel::Webhook
        }

        async fn send(&self, _tender: &Tender) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    fn test_app(store: Arc<MemoryStore>) -> Router {
        let pipeline = Arc::new(SyncPipeline::new(
            SyncConfig::default(),
            SourceRegistry::from_yaml_str(REGISTRY_YAML).unwrap(),
            store.clone(),
            Arc::new(StaticFetcher),
            Normalizer::default(),
        ));
        let distributor = Arc::new(Distributor::new(store, vec![Arc::new(OkNotifier)]));
        app(AppState::new(pipeline, distributor))
    }

    fn post(uri: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn scrape_then_fetch_run_tree() {
        let store = Arc::new(MemoryStore::new());
        let app = test_app(store.clone());

        let resp = app
            .clone()
            .oneshot(post("/api/scrape", r#"{"force": true}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["tenders_scraped"], 2);
        assert_eq!(body["tenders_inserted"], 2);
        let log_id = body["logId"].as_str().unwrap().to_string();

        let tree = app.oneshot(get(&format!("/api/runs/{log_id}"))).await.unwrap();
        assert_eq!(tree.status(), StatusCode::OK);
        let tree = json_body(tree).await;
        assert_eq!(tree["source_name"], "tender_pipeline");
        assert_eq!(tree["children"][0]["source_name"], "mygov");
        assert_eq!(tree["children"][0]["records_inserted"], 2);
    }

    #[tokio::test]
    async fn empty_body_is_a_default_trigger() {
        let store = Arc::new(MemoryStore::new());
        let resp = test_app(store.clone())
            .oneshot(post("/api/scrape", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.count_tenders().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unreachable_store_returns_structured_500() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true).await;
        let resp = test_app(store)
            .oneshot(post("/api/scrape", r#"{"force": true}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn bad_requests_are_rejected_before_running() {
        let store = Arc::new(MemoryStore::new());
        let app = test_app(store.clone());

        let bad_log = app
            .clone()
            .oneshot(post("/api/scrape", r#"{"logId": "not-a-uuid"}"#))
            .await
            .unwrap();
        assert_eq!(bad_log.status(), StatusCode::BAD_REQUEST);

        let unknown = app
            .clone()
            .oneshot(post("/api/scrape", r#"{"source": "nowhere"}"#))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let missing = app
            .oneshot(get(&format!("/api/runs/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert!(store.run_logs().await.is_empty());
    }

    #[tokio::test]
    async fn distribute_sends_each_new_tender_once() {
        let store = Arc::new(MemoryStore::new());
        let app = test_app(store.clone());
        app.clone()
            .oneshot(post("/api/scrape", r#"{"force": true}"#))
            .await
            .unwrap();

        let first = json_body(app.clone().oneshot(post("/api/distribute", "")).await.unwrap()).await;
        assert_eq!(first["sent"], 2);
        assert_eq!(first["channels"][0], "webhook");

        let second = json_body(app.clone().oneshot(post("/api/distribute", "")).await.unwrap()).await;
        assert_eq!(second["sent"], 0);
        assert_eq!(store.distributions().await.len(), 2);

        let health = app.oneshot(get("/healthz")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(json_body(health).await["tenders"], 2);
    }
}
