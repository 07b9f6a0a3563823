//! The daemon's HTTP surface: a health probe and the PM webhook.
//!
//! The listener binds loopback by default. On a non-loopback bind an API
//! key is required on every request; refusing to start without one beats
//! an open webhook.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use vs_sync::{handle_webhook, TriggerHub, WebhookEvent};

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct ServerState {
    pub hub: Arc<TriggerHub>,
    pub api_key: Option<String>,
}

pub fn router(state: ServerState) -> Router {
    let require_key = state.api_key.clone();
    Router::new()
        .route("/healthz", get(health))
        .route("/webhook/issues", post(webhook))
        .layer(middleware::from_fn(move |req, next| {
            let key = require_key.clone();
            auth_middleware(key, req, next)
        }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binding outside loopback without an API key is a configuration error.
pub fn validate_bind(host: &IpAddr, api_key: Option<&str>) -> Result<(), String> {
    if !host.is_loopback() && api_key.is_none() {
        return Err(format!(
            "refusing to bind {host} without an API key; set one or bind loopback"
        ));
    }
    Ok(())
}

async fn auth_middleware(api_key: Option<String>, req: Request, next: Next) -> Response {
    if let Some(expected) = api_key {
        let provided = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            warn!("request rejected: missing or wrong API key");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

/// Accepts `{project, changedIssues:[...]}` and responds 202 after
/// enqueueing the targeted run.
async fn webhook(
    State(state): State<ServerState>,
    Json(event): Json<WebhookEvent>,
) -> impl IntoResponse {
    handle_webhook(&state.hub, event);
    StatusCode::ACCEPTED
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ServerState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let addr = listener.local_addr().ok();
    info!(?addr, "http server listening");
    let app = router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await;
    if let Err(e) = result {
        warn!(error = %e, "http server exited with error");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vs_core::error::SyncError;
    use vs_core::types::SyncRunCounts;
    use vs_sync::{FetchPlan, ProjectSyncer};

    struct NullSyncer(AtomicUsize);

    #[async_trait]
    impl ProjectSyncer for NullSyncer {
        async fn sync_project(
            &self,
            _project: &str,
            _plan: FetchPlan,
        ) -> Result<SyncRunCounts, SyncError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(SyncRunCounts::default())
        }
    }

    fn test_state(api_key: Option<&str>) -> (ServerState, Arc<NullSyncer>) {
        let syncer = Arc::new(NullSyncer(AtomicUsize::new(0)));
        let hub = TriggerHub::new(syncer.clone());
        (
            ServerState {
                hub,
                api_key: api_key.map(String::from),
            },
            syncer,
        )
    }

    #[tokio::test]
    async fn webhook_responds_202_and_triggers() {
        let (state, syncer) = test_state(None);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(serve(listener, state, stop_rx));

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/webhook/issues"))
            .json(&serde_json::json!({"project": "HVSYN", "changedIssues": ["HVSYN-1"]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 202);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(syncer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy() {
        let (state, _) = test_state(None);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(serve(listener, state, stop_rx));

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn api_key_is_enforced_when_configured() {
        let (state, _) = test_state(Some("sekret"));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(serve(listener, state, stop_rx));

        let client = reqwest::Client::new();
        let denied = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status().as_u16(), 401);

        let allowed = client
            .get(format!("http://{addr}/healthz"))
            .header(API_KEY_HEADER, "sekret")
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status().as_u16(), 200);
    }

    #[test]
    fn non_loopback_bind_requires_key() {
        let public: IpAddr = "0.0.0.0".parse().unwrap();
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(validate_bind(&public, None).is_err());
        assert!(validate_bind(&public, Some("k")).is_ok());
        assert!(validate_bind(&local, None).is_ok());
    }
}
