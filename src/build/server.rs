use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::supervisor::BuildSupervisor;
use crate::config::ServiceConfig;

/// Build the application router around an existing supervisor.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let app = api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the REST server: recover persisted state, serve until Ctrl+C, then
/// kill whatever is still running.
pub async fn start_server(config: ServiceConfig) -> Result<()> {
    for warning in config.validate() {
        warn!("{}", warning);
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let dev_mode = config.server.dev_mode;
    let supervisor =
        BuildSupervisor::new(config).context("Failed to open build state directory")?;

    let report = supervisor
        .recover()
        .context("Failed to recover build state")?;
    if !report.is_empty() {
        info!(
            interrupted = ?report.interrupted,
            adopted = ?report.adopted,
            stale_locks = ?report.stale_locks,
            "recovery complete"
        );
    }

    let state = Arc::new(AppState {
        supervisor: supervisor.clone(),
    });
    let app = build_router(state, dev_mode);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "buildmaster listening");
    println!("buildmaster running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let running = supervisor.running_count();
    if running > 0 {
        println!("Stopping {} running build(s)...", running);
    }
    supervisor.shutdown().await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router(dev_mode: bool) -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::default().with_base_dir(dir.path());
        let state = Arc::new(AppState {
            supervisor: BuildSupervisor::new(config).unwrap(),
        });
        (dir, build_router(state, dev_mode))
    }

    #[tokio::test]
    async fn test_router_serves_health() {
        let (_dir, app) = test_router(false);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (_dir, app) = test_router(false);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/nothing-here")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dev_mode_adds_cors_headers() {
        let (_dir, app) = test_router(true);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .contains_key("access-control-allow-origin")
        );
    }
}
