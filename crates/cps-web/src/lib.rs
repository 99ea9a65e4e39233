//! HTTP control surface: trigger syncs, drive the scheduler, read status.
//!
//! JSON in, JSON out. A busy engine answers 409 rather than queueing; the
//! caller retries when the in-flight run is done.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use cps_core::{SyncRun, SyncScope};
use cps_crm::{CrmClient, CrmConfig};
use cps_store::Store;
use cps_sync::{Scheduler, SchedulerError, SyncConfig, SyncEngine, TriggerError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "cps-web";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub store: Store,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync/candidates", post(sync_candidates_handler))
        .route("/sync/interviews", post(sync_interviews_handler))
        .route("/sync/all", post(sync_all_handler))
        .route("/sync/status", get(sync_status_handler))
        .route("/scheduler/status", get(scheduler_status_handler))
        .route("/scheduler/start", post(scheduler_start_handler))
        .route("/scheduler/stop", post(scheduler_stop_handler))
        .route("/scheduler/interval", put(scheduler_interval_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    use anyhow::Context;

    let sync_config = SyncConfig::from_env();
    if let Some(dir) = sync_config.database_path.parent() {
        std::fs::create_dir_all(dir).context("creating database directory")?;
    }
    let store = Store::open(&sync_config.database_path).await?;
    let client = CrmClient::from_config(&CrmConfig::from_env())?;
    let engine = Arc::new(SyncEngine::new(Arc::new(client), store.clone()));
    let scheduler = Scheduler::new(engine, sync_config.interval_minutes)?;
    if sync_config.scheduler_enabled {
        scheduler.start(None)?;
    }

    let port: u16 = std::env::var("CPS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "control surface listening");
    axum::serve(listener, app(AppState { scheduler, store })).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn sync_candidates_handler(State(state): State<Arc<AppState>>) -> Response {
    run_sync(&state, SyncScope::Candidates).await
}

async fn sync_interviews_handler(State(state): State<Arc<AppState>>) -> Response {
    run_sync(&state, SyncScope::Interviews).await
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> Response {
    run_sync(&state, SyncScope::Both).await
}

async fn run_sync(state: &AppState, scope: SyncScope) -> Response {
    match state.scheduler.trigger(scope).await {
        Ok(run) => Json(run).into_response(),
        Err(TriggerError::InFlight) => {
            error_body(StatusCode::CONFLICT, "a sync is already in flight")
        }
        Err(TriggerError::Sync(err)) => {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct SyncStatusBody {
    last_run: Option<SyncRun>,
    candidates: i64,
    interviews: i64,
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    let last_run = match state.store.latest_finished_run().await {
        Ok(run) => run,
        Err(err) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let candidates = match state.store.count_candidates().await {
        Ok(n) => n,
        Err(err) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let interviews = match state.store.count_interviews().await {
        Ok(n) => n,
        Err(err) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    Json(SyncStatusBody { last_run, candidates, interviews }).into_response()
}

async fn scheduler_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.scheduler.status()).into_response()
}

#[derive(Debug, Deserialize)]
struct IntervalBody {
    interval_minutes: Option<u64>,
}

async fn scheduler_start_handler(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Response {
    // Body is optional on start; an absent or empty one keeps the interval.
    let minutes = serde_json::from_slice::<IntervalBody>(&body)
        .ok()
        .and_then(|b| b.interval_minutes);
    match state.scheduler.start(minutes) {
        Ok(()) => Json(state.scheduler.status()).into_response(),
        Err(err) => scheduler_error(err),
    }
}

async fn scheduler_stop_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.stop() {
        Ok(()) => Json(state.scheduler.status()).into_response(),
        Err(err) => scheduler_error(err),
    }
}

async fn scheduler_interval_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IntervalBody>,
) -> Response {
    let Some(minutes) = body.interval_minutes else {
        return error_body(StatusCode::UNPROCESSABLE_ENTITY, "interval_minutes is required");
    };
    match state.scheduler.set_interval(minutes) {
        Ok(()) => Json(state.scheduler.status()).into_response(),
        Err(err) => scheduler_error(err),
    }
}

fn scheduler_error(err: SchedulerError) -> Response {
    let status = match err {
        SchedulerError::IntervalOutOfRange(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SchedulerError::AlreadyRunning | SchedulerError::NotRunning => StatusCode::CONFLICT,
    };
    error_body(status, err.to_string())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use cps_crm::{CrmError, EventRecord, LeadRecord};
    use cps_sync::RecordSource;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct EmptySource {
        delay: Duration,
    }

    #[async_trait]
    impl RecordSource for EmptySource {
        async fn fetch_leads(&self, _page: u32) -> Result<(Vec<LeadRecord>, bool), CrmError> {
            tokio::time::sleep(self.delay).await;
            Ok((Vec::new(), false))
        }

        async fn fetch_events(&self, _page: u32) -> Result<(Vec<EventRecord>, bool), CrmError> {
            tokio::time::sleep(self.delay).await;
            Ok((Vec::new(), false))
        }
    }

    async fn test_app(delay: Duration) -> Router {
        let store = Store::open_in_memory().await.unwrap();
        let engine = Arc::new(SyncEngine::new(Arc::new(EmptySource { delay }), store.clone()));
        let scheduler = Scheduler::new(engine, 60).unwrap();
        app(AppState { scheduler, store })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = test_app(Duration::ZERO).await;
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_returns_run_record() {
        let app = test_app(Duration::ZERO).await;
        let resp = app.clone().oneshot(post_empty("/sync/all")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["outcome"], "success");
        assert_eq!(body["scope"], "both");
        assert_eq!(body["records_fetched"], 0);

        let resp = app
            .oneshot(Request::builder().uri("/sync/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["last_run"]["outcome"], "success");
        assert_eq!(body["candidates"], 0);
        assert_eq!(body["interviews"], 0);
    }

    #[tokio::test]
    async fn concurrent_trigger_conflicts() {
        let app = test_app(Duration::from_millis(200)).await;

        let slow = app.clone();
        let first = tokio::spawn(async move { slow.oneshot(post_empty("/sync/all")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resp = app.clone().oneshot(post_empty("/sync/candidates")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = first.await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn scheduler_lifecycle_over_http() {
        let app = test_app(Duration::ZERO).await;

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/scheduler/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["running"], false);
        assert_eq!(body["interval_minutes"], 60);

        let resp = app
            .clone()
            .oneshot(json_request("POST", "/scheduler/start", serde_json::json!({"interval_minutes": 30})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["running"], true);
        assert_eq!(body["interval_minutes"], 30);

        let resp = app.clone().oneshot(post_empty("/scheduler/start")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app.clone().oneshot(post_empty("/scheduler/stop")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(post_empty("/scheduler/stop")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn interval_bounds_over_http() {
        let app = test_app(Duration::ZERO).await;

        let resp = app
            .clone()
            .oneshot(json_request("PUT", "/scheduler/interval", serde_json::json!({"interval_minutes": 4})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = app
            .clone()
            .oneshot(json_request("PUT", "/scheduler/interval", serde_json::json!({"interval_minutes": 1441})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = app
            .clone()
            .oneshot(json_request("PUT", "/scheduler/interval", serde_json::json!({"interval_minutes": 1440})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["interval_minutes"], 1440);
    }
}
