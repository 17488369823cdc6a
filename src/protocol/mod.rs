//! Shared data model and peer wire format

pub mod types;
pub mod wire;

pub use types::{
    route_scopes, Applied, ConnectionId, ConnectionInfo, ConnectionState, Device, DeviceRole,
    DeviceScope, Role, Route, Snapshot,
};
pub use wire::{Endpoint, StreamParams, WireDevice, WireMessage, PROTOCOL_VERSION};
