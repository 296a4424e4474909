//! Status Server
//!
//! Serves health, readiness, Prometheus metrics and the latest pass report.

use crate::error::{Error, Result};
use crate::reconciler::MultishareReconciler;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

// =============================================================================
// Router
// =============================================================================

/// Build the status router
pub fn router(reconciler: Arc<MultishareReconciler>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics))
        .route("/v1/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(reconciler)
}

/// Serve the status router until `shutdown` fires
pub async fn serve(
    addr: SocketAddr,
    reconciler: Arc<MultishareReconciler>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind status server: {}", e)))?;
    info!("Status server listening on {}", addr);

    axum::serve(listener, router(reconciler))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Status server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("Status server error: {}", e)))
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readiness_check(State(reconciler): State<Arc<MultishareReconciler>>) -> impl IntoResponse {
    if reconciler.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

async fn metrics(State(reconciler): State<Arc<MultishareReconciler>>) -> impl IntoResponse {
    match reconciler.metrics().render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Rendering metrics failed: {}", e);
            internal_error(e).into_response()
        }
    }
}

async fn status(State(reconciler): State<Arc<MultishareReconciler>>) -> impl IntoResponse {
    match reconciler.last_report() {
        Some(report) => (StatusCode::OK, Json(report)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: "no_pass_yet".into(),
                message: "No reconciliation pass has completed".into(),
            }),
        )
            .into_response(),
    }
}

fn internal_error(e: Error) -> (StatusCode, Json<ApiErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiErrorResponse {
            error: "internal".into(),
            message: e.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::testing::Harness;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();

        let (status, _) = get_path(router(reconciler.clone()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get_path(router(reconciler.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        reconciler
            .wait_for_cache_sync(&CancellationToken::new())
            .await
            .unwrap();
        let (status, _) = get_path(router(reconciler), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_and_metrics() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();

        let (status, _) = get_path(router(reconciler.clone()), "/v1/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        reconciler.reconcile_once().await.unwrap();
        let (status, body) = get_path(router(reconciler.clone()), "/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["managedInstances"], 0);

        let (status, body) = get_path(router(reconciler), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("multishare_reconciler_passes_total 1"));
    }
}
