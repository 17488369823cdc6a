//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ConnectError, Error, Result};
use crate::protocol::{
    Applied, ConnectionId, ConnectionInfo, Device, DeviceRole, DeviceScope, Route, Snapshot,
};
use crate::ui::server::AppState;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

/// HTTP status for a failed command
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Connect(ConnectError::InvalidAddress(_)) => StatusCode::BAD_REQUEST,
        Error::Connect(ConnectError::AlreadyConnected(_) | ConnectError::Cancelled(_)) => {
            StatusCode::CONFLICT
        }
        Error::Connect(ConnectError::Unreachable(_) | ConnectError::Rejected(_)) => {
            StatusCode::BAD_GATEWAY
        }
        Error::Connect(ConnectError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::State(_) => StatusCode::CONFLICT,
        Error::Device(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T>(result: Result<T>, success: StatusCode) -> Reply<T> {
    match result {
        Ok(data) => (success, Json(ApiResponse::ok(data))),
        Err(e) => {
            if e.is_rejection() {
                tracing::debug!("Command rejected: {}", e);
            } else {
                tracing::warn!("Command failed: {}", e);
            }
            (status_for(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// Device choice in a request body
#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub device: String,
}

#[derive(Debug, Deserialize)]
pub struct ConnectBody {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    pub input: String,
    pub output: String,
}

/// Which list to re-read; omitted fields mean local and both roles
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RefreshRequest {
    pub scope: Option<DeviceScope>,
    pub role: Option<DeviceRole>,
}

/// Full snapshot for pollers
pub async fn get_snapshot(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Arc<Snapshot>>> {
    Json(ApiResponse::ok(state.plane.snapshot()))
}

pub async fn get_server_connections(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<ConnectionInfo>>> {
    Json(ApiResponse::ok(state.plane.list_server_connections()))
}

pub async fn get_client_connections(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<ConnectionInfo>>> {
    Json(ApiResponse::ok(state.plane.list_client_connections()))
}

/// Close an inbound client
pub async fn disconnect_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Reply<Arc<Snapshot>> {
    reply(state.plane.disconnect_server(ConnectionId(id)).await, StatusCode::OK)
}

/// Close an outbound connection
pub async fn disconnect_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Reply<Arc<Snapshot>> {
    reply(state.plane.disconnect_client(ConnectionId(id)).await, StatusCode::OK)
}

pub async fn connect_client(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConnectBody>,
) -> Reply<Applied<ConnectionInfo>> {
    reply(
        state.plane.connect_client(&body.address).await,
        StatusCode::CREATED,
    )
}

pub async fn get_server_devices(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Device>>> {
    Json(ApiResponse::ok(state.plane.list_server_devices()))
}

pub async fn get_client_devices(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Device>>> {
    Json(ApiResponse::ok(state.plane.list_client_devices()))
}

pub async fn set_server_output(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeviceRequest>,
) -> Reply<Arc<Snapshot>> {
    reply(
        state.plane.set_server_output_device(&req.device),
        StatusCode::OK,
    )
}

pub async fn set_client_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(req): Json<DeviceRequest>,
) -> Reply<Arc<Snapshot>> {
    reply(
        state
            .plane
            .set_client_input_device(ConnectionId(id), &req.device),
        StatusCode::OK,
    )
}

/// Pick the remote output an outbound connection plays into
pub async fn set_client_output(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(req): Json<DeviceRequest>,
) -> Reply<Arc<Snapshot>> {
    reply(
        state
            .plane
            .select_output_device(DeviceScope::Remote(ConnectionId(id)), &req.device),
        StatusCode::OK,
    )
}

pub async fn get_routes(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<BTreeMap<ConnectionId, Route>>> {
    Json(ApiResponse::ok(state.plane.get_routes()))
}

pub async fn set_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(req): Json<RouteRequest>,
) -> Reply<Arc<Snapshot>> {
    reply(
        state
            .plane
            .set_route(ConnectionId(id), &req.input, &req.output),
        StatusCode::OK,
    )
}

pub async fn clear_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Reply<Arc<Snapshot>> {
    reply(state.plane.clear_route(ConnectionId(id)), StatusCode::OK)
}

/// Re-enumerate device lists
pub async fn refresh_devices(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Reply<Arc<Snapshot>> {
    let scope = req.scope.unwrap_or(DeviceScope::Local);
    let roles = match req.role {
        Some(role) => vec![role],
        None => vec![DeviceRole::Input, DeviceRole::Output],
    };

    let mut result = Ok(state.plane.snapshot());
    for role in roles {
        result = state.plane.refresh(scope, role).await;
        if result.is_err() {
            break;
        }
    }
    reply(result, StatusCode::OK)
}
