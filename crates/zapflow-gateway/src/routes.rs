//! API route handlers for the gateway.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zapflow_core::error::ZapflowError;
use zapflow_scheduler::{NewInstance, NewItem, NewJob};

use super::server::AppState;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn status_for(e: &ZapflowError) -> StatusCode {
    match e {
        ZapflowError::NotFound { .. } => StatusCode::NOT_FOUND,
        ZapflowError::InvalidState(_) => StatusCode::CONFLICT,
        ZapflowError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: ZapflowError) -> ApiResponse {
    let status = status_for(&e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("❌ API error: {e}");
    }
    (status, Json(serde_json::json!({"ok": false, "error": e.to_string()})))
}

/// `{"ok": true, "<key>": value}` on success.
fn respond<T: Serialize>(key: &str, result: zapflow_core::Result<T>) -> ApiResponse {
    match result {
        Ok(value) => {
            let mut body = serde_json::json!({"ok": true});
            body[key] = serde_json::to_value(value).unwrap_or_default();
            (StatusCode::OK, Json(body))
        }
        Err(e) => error_response(e),
    }
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "zapflow-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ─── Instances ──────────────────────────────────────────────

pub async fn register_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewInstance>,
) -> ApiResponse {
    respond("instance", state.engine.register_instance(req))
}

pub async fn list_instances(State(state): State<Arc<AppState>>) -> ApiResponse {
    respond("instances", state.engine.list_instances())
}

#[derive(Debug, Deserialize)]
pub struct ConnectionRequest {
    pub connected: bool,
}

pub async fn set_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ConnectionRequest>,
) -> ApiResponse {
    respond("instance", state.engine.set_instance_connected(&id, req.connected))
}

// ─── Jobs ───────────────────────────────────────────────────

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewJob>,
) -> ApiResponse {
    respond("job", state.engine.create_job(req))
}

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResponse {
    respond("jobs", state.engine.list_jobs())
}

pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    respond("job", state.engine.get_job(&id))
}

#[derive(Debug, Deserialize)]
pub struct AddItemsRequest {
    pub items: Vec<NewItem>,
}

pub async fn add_items(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AddItemsRequest>,
) -> ApiResponse {
    match state.engine.add_items(&id, req.items) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "count": outcome.count, "total": outcome.total})),
        ),
        Err(e) => error_response(e),
    }
}

/// Start the dispatch loop. Returns once it is launched, not when it finishes.
pub async fn start_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    respond("job", state.engine.start(&id))
}

pub async fn pause_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    respond("job", state.engine.pause(&id))
}

pub async fn resume_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    respond("job", state.engine.resume(&id))
}

pub async fn stop_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    respond("job", state.engine.stop(&id))
}

/// Job, per-status item counts, and the most recent log entries.
pub async fn job_stats(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    match state.engine.stats(&id) {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ok": true,
                "job": stats.job,
                "items": stats.items,
                "logs": stats.logs,
            })),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    #[serde(default = "default_rounds")]
    pub rounds: u32,
}

fn default_rounds() -> u32 { 1 }

pub async fn plan_warming(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<PlanQuery>,
) -> ApiResponse {
    match state.engine.plan_warming(&id, q.rounds) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "count": outcome.count, "total": outcome.total})),
        ),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use zapflow_channels::{MessageSender, SendError, SendReceipt};
    use zapflow_core::config::{DispatchConfig, GatewayConfig};
    use zapflow_scheduler::{DispatchDb, DispatchEngine, EngineSettings};

    struct AcceptAll;

    #[async_trait::async_trait]
    impl MessageSender for AcceptAll {
        fn name(&self) -> &str {
            "accept-all"
        }

        async fn send_text(&self, _: &str, _: &str, _: &str) -> Result<SendReceipt, SendError> {
            Ok(SendReceipt::default())
        }
    }

    fn test_app() -> (axum::Router, DispatchEngine) {
        let db = Arc::new(DispatchDb::open_in_memory().unwrap());
        let settings = EngineSettings::from_config(&DispatchConfig::default()).unwrap();
        let engine = DispatchEngine::new(db, Arc::new(AcceptAll), settings);
        let state = AppState {
            gateway_config: GatewayConfig::default(),
            start_time: std::time::Instant::now(),
            engine: engine.clone(),
        };
        (build_router(state), engine)
    }

    async fn call(
        app: &axum::Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    async fn register(app: &axum::Router, name: &str, phone: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/api/v1/instances",
            Some(serde_json::json!({"name": name, "token": format!("tok-{name}"), "phone": phone})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["instance"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_instance_token_hidden() {
        let (app, _) = test_app();
        register(&app, "loja", "5511900000001").await;
        let (status, body) = call(&app, "GET", "/api/v1/instances", None).await;
        assert_eq!(status, StatusCode::OK);
        let list = body["instances"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].get("token").is_none());
        assert_eq!(list[0]["daily_limit"], 200);
    }

    #[tokio::test]
    async fn test_campaign_lifecycle() {
        let (app, engine) = test_app();
        let instance_id = register(&app, "loja", "5511900000001").await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/jobs",
            Some(serde_json::json!({
                "name": "promo",
                "kind": "campaign",
                "instance_id": instance_id,
                "message_template": "Oi {{name}}",
                "pacing": {"min_delay_secs": 0, "max_delay_secs": 0, "pause_after": 0, "pause_duration_secs": 0}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let job_id = body["job"]["id"].as_str().unwrap().to_string();
        assert_eq!(body["job"]["status"], "draft");

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/v1/jobs/{job_id}/items"),
            Some(serde_json::json!({"items": [
                {"target": {"type": "contact", "phone": "11999990001", "name": "Ana"}},
                {"target": {"type": "contact", "phone": "11999990002"}}
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!((body["count"].as_u64(), body["total"].as_u64()), (Some(2), Some(2)));

        let (status, body) = call(&app, "POST", &format!("/api/v1/jobs/{job_id}/start"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["status"], "running");

        for _ in 0..500 {
            if !engine.is_active(&job_id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let (status, body) = call(&app, "GET", &format!("/api/v1/jobs/{job_id}/stats"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["status"], "completed");
        assert_eq!(body["job"]["progress"], 100);
        assert_eq!(body["items"]["sent"], 2);
        assert_eq!(body["logs"][0]["event"], "completed");

        // Terminal jobs cannot be paused.
        let (status, body) = call(&app, "POST", &format!("/api/v1/jobs/{job_id}/pause"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (app, _) = test_app();

        let (status, _) = call(&app, "GET", "/api/v1/jobs/nope/stats", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/jobs",
            Some(serde_json::json!({"name": "x", "kind": "campaign", "instance_id": "ghost"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(
            &app,
            "POST",
            "/api/v1/jobs",
            Some(serde_json::json!({"name": "warm", "kind": "warming", "message_pool": ["oi"]})),
        )
        .await;
        let job_id = body["job"]["id"].as_str().unwrap().to_string();

        // Contact items on a warming job.
        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/v1/jobs/{job_id}/items"),
            Some(serde_json::json!({"items": [{"target": {"type": "contact", "phone": "1"}}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Fewer than two connected instances.
        let (status, body) = call(&app, "POST", &format!("/api/v1/warming/{job_id}/plan"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("2 connected"));
    }

    #[tokio::test]
    async fn test_plan_warming_pairs() {
        let (app, _) = test_app();
        register(&app, "a", "5511900000001").await;
        register(&app, "b", "5511900000002").await;
        let off = register(&app, "c", "5511900000003").await;

        let (status, body) = call(
            &app,
            "PUT",
            &format!("/api/v1/instances/{off}/connection"),
            Some(serde_json::json!({"connected": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instance"]["connected"], false);

        let (_, body) = call(
            &app,
            "POST",
            "/api/v1/jobs",
            Some(serde_json::json!({"name": "warm", "kind": "warming", "message_pool": ["oi"]})),
        )
        .await;
        let job_id = body["job"]["id"].as_str().unwrap().to_string();

        let (status, body) =
            call(&app, "POST", &format!("/api/v1/warming/{job_id}/plan?rounds=3"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 6);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/v1/warming/{job_id}/plan?rounds=4294967295"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);

        let (_, body) = call(&app, "GET", &format!("/api/v1/jobs/{job_id}"), None).await;
        assert_eq!(body["job"]["total"], 6);
    }
}
