//! HTTP surface: axum routers per gateway mode.

pub mod routes;

pub use routes::{auth_router, cion_router};

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Wrap a mode router with the shared middleware stack.
pub fn build_router(api: Router) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    api.layer(cors)
}

/// Start the HTTP server; returns once a shutdown signal is received.
pub async fn start_server(app: Router, host: &str, port: u16) -> std::io::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("PTC Gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
}
