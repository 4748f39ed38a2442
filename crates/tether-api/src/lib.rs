pub mod gateway;
pub mod handlers;
pub mod relay;

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use gateway::{Authenticator, ConnectParams, HeaderAuthenticator};
pub use handlers::ApiState;
pub use relay::HttpRelayClient;

/// All routes: the client socket endpoint, the push surface and the
/// node-to-node relay surface.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/sessions/{uid}", get(handlers::handle_sessions))
        .route("/push", post(handlers::handle_push))
        .route("/broadcast", post(handlers::handle_broadcast))
        .route("/batch_push", post(handlers::handle_batch_push))
        .route("/forward", post(handlers::handle_forward))
        .with_state(state.clone());

    Router::new()
        .route("/ws", get(gateway::handle_ws))
        .with_state(state)
        .nest("/api", api_routes)
        .layer(cors)
}

pub async fn serve(
    state: ApiState,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr, "API listening");
    serve_on(listener, state, shutdown).await
}

/// Serve on an already-bound listener.
pub async fn serve_on(
    listener: TcpListener,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
