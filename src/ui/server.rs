//! HTTP server for the control API

use axum::{
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::ApiConfig;
use crate::control::ControlPlane;
use crate::error::{NetworkError, Result};
use crate::ui::{handlers, websocket};

/// Shared handler state
pub struct AppState {
    pub plane: ControlPlane,
}

pub struct WebServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: ApiConfig, plane: ControlPlane) -> Self {
        Self {
            config,
            state: Arc::new(AppState { plane }),
        }
    }

    /// Build the router; exposed so tests can drive it without a socket
    pub fn router(&self) -> Router {
        let api = Router::new()
            .route("/snapshot", get(handlers::get_snapshot))
            .route("/server/connections", get(handlers::get_server_connections))
            .route(
                "/server/connections/:id",
                axum::routing::delete(handlers::disconnect_server),
            )
            .route("/server/devices", get(handlers::get_server_devices))
            .route("/server/output", put(handlers::set_server_output))
            .route(
                "/client/connections",
                get(handlers::get_client_connections).post(handlers::connect_client),
            )
            .route(
                "/client/connections/:id",
                axum::routing::delete(handlers::disconnect_client),
            )
            .route("/client/connections/:id/input", put(handlers::set_client_input))
            .route("/client/connections/:id/output", put(handlers::set_client_output))
            .route("/client/devices", get(handlers::get_client_devices))
            .route("/routes", get(handlers::get_routes))
            .route(
                "/routes/:id",
                put(handlers::set_route).delete(handlers::clear_route),
            )
            .route("/devices/refresh", post(handlers::refresh_devices))
            .route("/events", get(websocket::events));

        let router = Router::new()
            .nest("/api", api)
            .with_state(self.state.clone());

        if self.config.permissive_cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.http_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        tracing::info!("Control API listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
