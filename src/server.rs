// ============================================================================
// HTTP RESPONDER
// ============================================================================
// Serves the registry snapshot. Handlers only read; publishing happens on
// the ingestion side under the registry's publish lock.
// ============================================================================

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::constants::{EXPORTER_FULL_NAME, EXPORTER_VERSION};
use crate::error::{ExporterResult, OutputError};
use crate::metrics::ExporterMetrics;

#[derive(Clone)]
struct AppState {
    metrics: Arc<ExporterMetrics>,
    metrics_path: Arc<str>,
}

/// Routes: `<metrics_path>`, `/` (index page) and `/health`.
///
/// `metrics_path` must not be `/` or `/health`; config validation rejects
/// both before a router is built.
pub fn router(metrics: Arc<ExporterMetrics>, metrics_path: &str) -> Router {
    let state = AppState {
        metrics,
        metrics_path: Arc::from(metrics_path),
    };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/", get(index_handler))
        .with_state(state)
}

/// Text exposition of the whole registry
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(target: "squid_exporter::server", error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Liveness only; says nothing about the last pass
async fn health_handler() -> &'static str {
    "ok"
}

/// Landing page linking to the metrics path
async fn index_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>{name}</title></head>\n<body>\n<h1>{name}</h1>\n\
         <p>Version {version}</p>\n<p><a href=\"{path}\">Metrics</a></p>\n</body>\n</html>\n",
        name = EXPORTER_FULL_NAME,
        version = EXPORTER_VERSION,
        path = state.metrics_path,
    ))
}

/// Bind the listener; a failure here is a configuration problem.
pub async fn bind(address: &str) -> ExporterResult<TcpListener> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| OutputError::Bind {
            address: address.to_string(),
            source,
        })?;
    Ok(listener)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> ExporterResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(target: "squid_exporter::server", %addr, "Metrics server listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            OutputError::Serve {
                message: e.to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Arc::new(ExporterMetrics::new(&[]).unwrap());
        let (status, content_type, body) = get_body(router(metrics, "/metrics"), "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(prometheus::TEXT_FORMAT));
        assert!(body.contains("# TYPE squid_exporter_position_bytes gauge"));
    }

    #[tokio::test]
    async fn test_custom_metrics_path_and_index() {
        let metrics = Arc::new(ExporterMetrics::new(&[]).unwrap());
        let app = router(metrics, "/squid/metrics");

        let (status, _, _) = get_body(app.clone(), "/squid/metrics").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = get_body(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("href=\"/squid/metrics\""));

        let (status, _, _) = get_body(app, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let metrics = Arc::new(ExporterMetrics::new(&[]).unwrap());
        let (status, _, body) = get_body(router(metrics, "/metrics"), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_bind_failure_is_config_error() {
        let first = bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().unwrap().to_string();
        let err = bind(&taken).await.unwrap_err();
        assert_eq!(err.category(), "output");
        assert!(!err.is_recoverable());
    }
}
