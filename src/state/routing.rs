//! Routing table: at most one route per connection

use std::collections::BTreeMap;

use crate::protocol::{ConnectionId, Route};

#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: BTreeMap<ConnectionId, Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a route, replacing whatever the connection had before
    pub fn set(&mut self, route: Route) -> Option<Route> {
        self.routes.insert(route.connection, route)
    }

    pub fn clear(&mut self, connection: ConnectionId) -> Option<Route> {
        self.routes.remove(&connection)
    }

    pub fn get(&self, connection: ConnectionId) -> Option<&Route> {
        self.routes.get(&connection)
    }

    /// Drop every route failing `keep`, returning the dropped ones
    pub fn retain(&mut self, mut keep: impl FnMut(&Route) -> bool) -> Vec<Route> {
        let doomed: Vec<ConnectionId> = self
            .routes
            .values()
            .filter(|r| !keep(r))
            .map(|r| r.connection)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| self.routes.remove(&id))
            .collect()
    }

    /// Connections currently feeding `output`
    pub fn sources_of(&self, output: &str) -> Vec<ConnectionId> {
        self.routes
            .values()
            .filter(|r| r.output == output)
            .map(|r| r.connection)
            .collect()
    }

    pub fn routes(&self) -> &BTreeMap<ConnectionId, Route> {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn route(id: u64, input: &str, output: &str) -> Route {
        Route {
            connection: ConnectionId(id),
            input: input.into(),
            output: output.into(),
            established_at: Utc::now(),
        }
    }

    #[test]
    fn test_last_write_wins_per_connection() {
        let mut table = RoutingTable::new();
        assert!(table.set(route(1, "Mic1", "Speakers")).is_none());
        let previous = table.set(route(1, "Mic2", "Headphones")).unwrap();

        assert_eq!(previous.input, "Mic1");
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(ConnectionId(1)).unwrap().output, "Headphones");
    }

    #[test]
    fn test_output_accepts_many_sources() {
        let mut table = RoutingTable::new();
        table.set(route(1, "Mic1", "Speakers"));
        table.set(route(2, "Mic1", "Speakers"));
        assert_eq!(table.sources_of("Speakers"), vec![ConnectionId(1), ConnectionId(2)]);
    }

    #[test]
    fn test_retain_reports_removed() {
        let mut table = RoutingTable::new();
        table.set(route(1, "Mic1", "Speakers"));
        table.set(route(2, "Mic2", "Headphones"));

        let removed = table.retain(|r| r.output != "Speakers");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].connection, ConnectionId(1));
        assert!(table.get(ConnectionId(2)).is_some());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut table = RoutingTable::new();
        table.set(route(1, "Mic1", "Speakers"));
        assert!(table.clear(ConnectionId(1)).is_some());
        assert!(table.clear(ConnectionId(1)).is_none());
        assert!(table.is_empty());
    }
}
