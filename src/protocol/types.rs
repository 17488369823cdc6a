//! Control-plane data model shared by the state machine, the HTTP API and pollers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable connection identity, issued once and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the link this process plays for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepted by our server: a remote client feeding our outputs
    Server,
    /// Initiated by our client: our inputs feeding a remote server
    Client,
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Active,
    Disconnecting,
    Closed,
}

/// Read-only view of a registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: Role,
    pub endpoint: String,
    pub state: ConnectionState,
    pub opened_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Input,
    Output,
}

/// Who owns a device list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "connection")]
pub enum DeviceScope {
    /// Devices of this machine
    Local,
    /// Devices reported by the peer of a connection
    Remote(ConnectionId),
}

impl fmt::Display for DeviceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceScope::Local => write!(f, "local"),
            DeviceScope::Remote(id) => write!(f, "remote:{}", id),
        }
    }
}

/// Audio device as seen by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub role: DeviceRole,
    pub scope: DeviceScope,
    pub is_default: bool,
}

/// Input device of one connection feeding an output device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub connection: ConnectionId,
    pub input: String,
    pub output: String,
    pub established_at: DateTime<Utc>,
}

impl Route {
    /// Same endpoints, ignoring when the route was installed
    pub fn same_endpoints(&self, other: &Route) -> bool {
        self.connection == other.connection
            && self.input == other.input
            && self.output == other.output
    }
}

/// Where the two ends of a connection's route must be found
pub fn route_scopes(role: Role, id: ConnectionId) -> (DeviceScope, DeviceScope) {
    match role {
        Role::Server => (DeviceScope::Remote(id), DeviceScope::Local),
        Role::Client => (DeviceScope::Local, DeviceScope::Remote(id)),
    }
}

/// Immutable, internally consistent view of the whole control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Incremented on every commit
    pub generation: u64,
    pub taken_at: DateTime<Utc>,
    /// Active and disconnecting connections, in id order
    pub connections: Vec<ConnectionInfo>,
    /// Connect attempts and inbound handshakes still in flight
    pub pending: Vec<ConnectionInfo>,
    pub devices: Vec<Device>,
    pub routes: BTreeMap<ConnectionId, Route>,
    /// Default target for newly admitted inbound clients
    pub server_output: Option<String>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            generation: 0,
            taken_at: Utc::now(),
            connections: Vec::new(),
            pending: Vec::new(),
            devices: Vec::new(),
            routes: BTreeMap::new(),
            server_output: None,
        }
    }

    pub fn connections_for(&self, role: Role) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .filter(|c| c.role == role)
            .cloned()
            .collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn devices_for(&self, scope: DeviceScope, role: DeviceRole) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|d| d.scope == scope && d.role == role)
            .cloned()
            .collect()
    }
}

/// Result of a mutating command: its value plus the post-commit snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Applied<T> {
    pub value: T,
    pub snapshot: std::sync::Arc<Snapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_scopes_follow_role() {
        let id = ConnectionId(3);
        assert_eq!(
            route_scopes(Role::Server, id),
            (DeviceScope::Remote(id), DeviceScope::Local)
        );
        assert_eq!(
            route_scopes(Role::Client, id),
            (DeviceScope::Local, DeviceScope::Remote(id))
        );
    }

    #[test]
    fn test_scope_serializes_with_tag() {
        let json = serde_json::to_string(&DeviceScope::Remote(ConnectionId(4))).unwrap();
        assert_eq!(json, r#"{"kind":"remote","connection":4}"#);
        let json = serde_json::to_string(&DeviceScope::Local).unwrap();
        assert_eq!(json, r#"{"kind":"local"}"#);
    }
}
