//! Authoritative control-plane state
//!
//! [`ControlState`] bundles the connection registry, the device inventory and
//! the routing table so that a command touching all three happens under one
//! lock. Every commit ends with [`ControlState::maintain`], which drops routes
//! that no longer satisfy the routing invariant, and then takes a
//! [`Snapshot`].

pub mod inventory;
pub mod registry;
pub mod routing;

pub use inventory::DeviceInventory;
pub use registry::{ConnectionRegistry, Entry};
pub use routing::RoutingTable;

use chrono::Utc;

use crate::control::ControlEvent;
use crate::error::{NotFoundError, Result, StateError};
use crate::protocol::{
    route_scopes, ConnectionId, ConnectionState, DeviceRole, DeviceScope, Route, Snapshot,
    WireDevice,
};

pub struct ControlState {
    pub registry: ConnectionRegistry,
    pub inventory: DeviceInventory,
    pub routing: RoutingTable,
    server_output: Option<String>,
    generation: u64,
    events: Vec<ControlEvent>,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            inventory: DeviceInventory::new(),
            routing: RoutingTable::new(),
            server_output: None,
            generation: 0,
            events: Vec::new(),
        }
    }

    pub fn server_output(&self) -> Option<&str> {
        self.server_output.as_deref()
    }

    pub fn select_server_output(&mut self, name: &str) -> Result<()> {
        if !self.inventory.contains(DeviceScope::Local, DeviceRole::Output, name) {
            return Err(NotFoundError::Device {
                name: name.to_string(),
                scope: DeviceScope::Local,
            }
            .into());
        }
        if self.server_output.as_deref() != Some(name) {
            tracing::info!(
                "Server output set to {} ({} connections already feed it)",
                name,
                self.routing.sources_of(name).len()
            );
            self.server_output = Some(name.to_string());
            self.events.push(ControlEvent::ServerOutputSelected {
                device: name.to_string(),
            });
        }
        Ok(())
    }

    /// Check a prospective route against the invariant without touching state
    pub fn validate_route(&self, id: ConnectionId, input: &str, output: &str) -> Result<Route> {
        let entry = self
            .registry
            .get(id)
            .filter(|e| e.info.is_active())
            .ok_or(StateError::ConnectionNotActive(id))?;

        let (input_scope, output_scope) = route_scopes(entry.info.role, id);
        for (scope, role, name) in [
            (input_scope, DeviceRole::Input, input),
            (output_scope, DeviceRole::Output, output),
        ] {
            if !self.inventory.contains(scope, role, name) {
                return Err(NotFoundError::Device {
                    name: name.to_string(),
                    scope,
                }
                .into());
            }
        }

        Ok(Route {
            connection: id,
            input: input.to_string(),
            output: output.to_string(),
            established_at: Utc::now(),
        })
    }

    /// Install a validated route. Re-installing the same endpoints is a no-op.
    pub fn install_route(&mut self, route: Route) -> bool {
        if let Some(existing) = self.routing.get(route.connection) {
            if existing.same_endpoints(&route) {
                return false;
            }
        }
        self.routing.set(route.clone());
        self.events.push(ControlEvent::RouteSet(route));
        true
    }

    pub fn clear_route(&mut self, id: ConnectionId) -> Option<Route> {
        let removed = self.routing.clear(id)?;
        self.events.push(ControlEvent::RouteCleared(removed.clone()));
        Some(removed)
    }

    pub fn replace_devices(&mut self, scope: DeviceScope, role: DeviceRole, devices: Vec<WireDevice>) -> bool {
        let changed = self.inventory.replace(scope, role, devices);
        if changed {
            self.events.push(ControlEvent::DevicesChanged { scope, role });
        }
        changed
    }

    /// Remove a connection together with everything scoped to it
    pub fn close(&mut self, id: ConnectionId) -> Option<Entry> {
        let committed = self.registry.state_of(id)? != ConnectionState::Connecting;
        let entry = self.registry.remove(id)?;
        self.clear_route(id);
        self.inventory.drop_scope(DeviceScope::Remote(id));
        if committed {
            self.events.push(ControlEvent::ConnectionClosed {
                id,
                role: entry.info.role,
            });
        }
        Some(entry)
    }

    /// Drop every route whose connection left `Active` or whose devices vanished,
    /// along with output selections naming devices that are gone
    pub fn maintain(&mut self) -> usize {
        if let Some(name) = self.server_output.as_deref() {
            if !self.inventory.contains(DeviceScope::Local, DeviceRole::Output, name) {
                tracing::info!("Server output {} disappeared", name);
                self.server_output = None;
            }
        }
        for entry in self.registry.iter_mut() {
            let scope = DeviceScope::Remote(entry.info.id);
            if let Some(name) = entry.preferred_output.as_deref() {
                if !self.inventory.contains(scope, DeviceRole::Output, name) {
                    tracing::info!("Output {} of connection {} disappeared", name, entry.info.id);
                    entry.preferred_output = None;
                }
            }
        }

        let registry = &self.registry;
        let inventory = &self.inventory;
        let removed = self
            .routing
            .retain(|route| route_is_valid(registry, inventory, route));

        for route in &removed {
            tracing::debug!(
                "Dropping route {} -> {} of connection {}",
                route.input,
                route.output,
                route.connection
            );
        }
        let count = removed.len();
        self.events
            .extend(removed.into_iter().map(ControlEvent::RouteCleared));
        count
    }

    pub fn snapshot(&mut self) -> Snapshot {
        self.generation += 1;
        Snapshot {
            generation: self.generation,
            taken_at: Utc::now(),
            connections: self.registry.connections(),
            pending: self.registry.pending(),
            devices: self.inventory.all(),
            routes: self.routing.routes().clone(),
            server_output: self.server_output.clone(),
        }
    }

    pub fn push_event(&mut self, event: ControlEvent) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<ControlEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

fn route_is_valid(registry: &ConnectionRegistry, inventory: &DeviceInventory, route: &Route) -> bool {
    let Some(entry) = registry.get(route.connection) else {
        return false;
    };
    if !entry.info.is_active() {
        return false;
    }
    let (input_scope, output_scope) = route_scopes(entry.info.role, route.connection);
    inventory.contains(input_scope, DeviceRole::Input, &route.input)
        && inventory.contains(output_scope, DeviceRole::Output, &route.output)
}
