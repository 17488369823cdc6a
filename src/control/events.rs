//! Notifications published after each commit

use serde::Serialize;

use crate::protocol::{ConnectionId, ConnectionInfo, DeviceRole, DeviceScope, Role, Route};

/// Emitted in commit order, after the snapshot reflecting it is visible
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    ConnectionOpened(ConnectionInfo),
    ConnectionClosed { id: ConnectionId, role: Role },
    RouteSet(Route),
    RouteCleared(Route),
    DevicesChanged { scope: DeviceScope, role: DeviceRole },
    ServerOutputSelected { device: String },
}

