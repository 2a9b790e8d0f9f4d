//! HTTP surface: health, delivery-receipt webhook, on-demand sync, store stats.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use smslog_core::{SyncStatus, SyncWindow};
use smslog_storage::MessageStore;
use smslog_sync::normalize::normalize_notification;
use smslog_sync::{SyncError, SyncRunner};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "smslog-web";

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn MessageStore>,
    runner: Option<Arc<dyn SyncRunner>>,
    /// Why `runner` is absent, shown to trigger callers.
    runner_unavailable: String,
    cancel: CancellationToken,
}

impl AppState {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            runner: None,
            runner_unavailable: "sync is not configured".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn SyncRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_runner_unavailable(mut self, reason: impl Into<String>) -> Self {
        self.runner = None;
        self.runner_unavailable = reason.into();
        self
    }

    /// Triggered syncs stop when this token fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Deserialize)]
struct TriggerQuery {
    hours: Option<u32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/webhooks/signalwire",
            get(webhook_probe_handler).post(webhook_handler),
        )
        .route("/api/sync/trigger", get(trigger_sync_handler))
        .route("/api/db/stats", get(db_stats_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` is cancelled, then drains in-flight requests.
pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("web server stopped");
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let (status, database) = match state.store.ping().await {
        Ok(()) => ("ok", "connected".to_string()),
        Err(err) => {
            warn!(error = %err, "health check could not reach the store");
            ("degraded", format!("error: {err}"))
        }
    };
    Json(json!({
        "status": status,
        "database": database,
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

async fn webhook_probe_handler() -> Response {
    Json(json!({
        "status": "ok",
        "endpoint": "signalwire-webhook",
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let notification = match normalize_notification(&form, Utc::now()) {
        Ok(notification) => notification,
        Err(skip) => return json_error(StatusCode::BAD_REQUEST, skip.to_string()),
    };
    match state.store.apply_notification(&notification).await {
        Ok(()) => {
            info!(
                message_id = %notification.id,
                status = %notification.status,
                "applied status notification"
            );
            Json(json!({"status": "ok", "message_id": notification.id})).into_response()
        }
        Err(err) => {
            warn!(message_id = %notification.id, error = %err, "status notification not stored");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TriggerQuery>,
) -> Response {
    let Some(runner) = state.runner.clone() else {
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            state.runner_unavailable.clone(),
        );
    };
    let window = SyncWindow::Hours(query.hours.unwrap_or(1).max(1));
    if window.start_boundary(Utc::now()).is_none() {
        return json_error(
            StatusCode::BAD_REQUEST,
            SyncError::InvalidWindow(window).to_string(),
        );
    }
    info!(%window, "sync triggered over http");

    match runner.run(window, state.cancel.child_token()).await {
        Ok(report) => {
            let code = match report.status {
                SyncStatus::Completed => StatusCode::OK,
                SyncStatus::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                SyncStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
            };
            if report.is_completed() {
                (code, Json(json!(report))).into_response()
            } else {
                (
                    code,
                    Json(json!({"error": report.summary(), "report": report})),
                )
                    .into_response()
            }
        }
        Err(err @ SyncError::InvalidWindow(_)) => {
            json_error(StatusCode::BAD_REQUEST, err.to_string())
        }
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn db_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn json_error(code: StatusCode, message: String) -> Response {
    (code, Json(json!({"error": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use smslog_core::{MessageStatus, SyncMode, SyncProgress, SyncReport};
    use smslog_storage::MemoryMessageStore;
    use tower::ServiceExt;

    struct CannedRunner(SyncStatus);

    #[async_trait]
    impl SyncRunner for CannedRunner {
        fn mode(&self) -> SyncMode {
            SyncMode::Synchronous
        }

        async fn run(
            &self,
            window: SyncWindow,
            _cancel: CancellationToken,
        ) -> Result<SyncReport, SyncError> {
            let now = Utc::now();
            Ok(SyncReport {
                run_id: uuid::Uuid::new_v4(),
                mode: SyncMode::Synchronous,
                window,
                started_at: now,
                finished_at: now,
                status: self.0,
                progress: SyncProgress {
                    pages_fetched: 1,
                    records_fetched: 2,
                    records_saved: 2,
                    records_skipped: 0,
                },
                limit_hit: false,
                failure: None,
            })
        }
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn form_post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/signalwire")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_connected_store() {
        let app = app(AppState::new(Arc::new(MemoryMessageStore::new())));
        let resp = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], "connected");
    }

    #[tokio::test]
    async fn webhook_post_upserts_the_notification() {
        let store = Arc::new(MemoryMessageStore::new());
        let app = app(AppState::new(store.clone()));

        let probe = app.clone().oneshot(get_req("/webhooks/signalwire")).await.unwrap();
        assert_eq!(probe.status(), StatusCode::OK);

        let resp = app
            .oneshot(form_post(
                "MessageSid=SM42&MessageStatus=delivered&To=%2B15550001111&From=%2B15550002222",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["message_id"], "SM42");

        let row = store.get("SM42").await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Delivered);
        assert_eq!(row.to_address.as_deref(), Some("+15550001111"));
        assert_eq!(row.price, 0.0);
    }

    #[tokio::test]
    async fn webhook_without_message_id_is_rejected() {
        let store = Arc::new(MemoryMessageStore::new());
        let app = app(AppState::new(store.clone()));
        let resp = app.oneshot(form_post("MessageStatus=failed")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn trigger_without_credentials_returns_error() {
        let state = AppState::new(Arc::new(MemoryMessageStore::new()))
            .with_runner_unavailable("missing required environment variables: SIGNALWIRE_PROJECT_ID");
        let resp = app(state).oneshot(get_req("/api/sync/trigger")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("SIGNALWIRE_PROJECT_ID"));
    }

    #[tokio::test]
    async fn trigger_runs_requested_window() {
        let state = AppState::new(Arc::new(MemoryMessageStore::new()))
            .with_runner(Arc::new(CannedRunner(SyncStatus::Completed)));
        let resp = app(state)
            .oneshot(get_req("/api/sync/trigger?hours=6"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["window"]["unit"], "hours");
        assert_eq!(body["window"]["value"], 6);
        assert_eq!(body["progress"]["records_saved"], 2);
    }

    #[tokio::test]
    async fn trigger_with_window_past_the_calendar_is_rejected() {
        let state = AppState::new(Arc::new(MemoryMessageStore::new()))
            .with_runner(Arc::new(CannedRunner(SyncStatus::Completed)));
        let resp = app(state)
            .oneshot(get_req("/api/sync/trigger?hours=4294967295"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("4294967295 hour(s)"));
    }

    #[tokio::test]
    async fn failed_trigger_surfaces_summary() {
        let state = AppState::new(Arc::new(MemoryMessageStore::new()))
            .with_runner(Arc::new(CannedRunner(SyncStatus::Failed)));
        let resp = app(state).oneshot(get_req("/api/sync/trigger")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().starts_with("sync failed"));
        assert_eq!(body["report"]["window"]["value"], 1);
    }

    #[tokio::test]
    async fn stats_reflect_store_contents() {
        let store = Arc::new(MemoryMessageStore::new());
        let app = app(AppState::new(store.clone()));
        app.clone()
            .oneshot(form_post("SmsSid=SM1&SmsStatus=sent"))
            .await
            .unwrap();

        let resp = app.oneshot(get_req("/api/db/stats")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["total_messages"], 1);
        assert!(body["oldest_message"].is_string());
    }
}
