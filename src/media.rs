//! Media transport boundary
//!
//! The control plane decides *which* input feeds *which* output; moving the
//! samples is left to a [`MediaTransport`]. A [`MediaDriver`] keeps the
//! transport's open sessions in step with the routing table by following
//! [`ControlEvent`]s, and resynchronises from a snapshot whenever it falls
//! behind.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::control::{ControlEvent, ControlPlane};
use crate::error::Result;
use crate::protocol::{ConnectionId, Route};

/// Carries audio for installed routes
pub trait MediaTransport: Send + Sync + 'static {
    /// Start (or re-point) the stream of `route.connection`
    fn open(&self, route: &Route) -> Result<()>;

    /// Stop the stream of a connection
    fn close(&self, connection: ConnectionId);

    /// Audio received from a routed peer
    fn deliver(&self, _connection: ConnectionId, _payload: Bytes) {}
}

/// Transport that only logs what it would do
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

impl MediaTransport for LogTransport {
    fn open(&self, route: &Route) -> Result<()> {
        tracing::info!(
            "Media: connection {} streams {} -> {}",
            route.connection,
            route.input,
            route.output
        );
        Ok(())
    }

    fn close(&self, connection: ConnectionId) {
        tracing::info!("Media: connection {} stopped", connection);
    }

    fn deliver(&self, connection: ConnectionId, payload: Bytes) {
        tracing::trace!("Media: {} bytes from connection {}", payload.len(), connection);
    }
}

/// Follows the routing table and drives a [`MediaTransport`]
pub struct MediaDriver {
    sessions: Arc<DashMap<ConnectionId, Route>>,
    task: JoinHandle<()>,
}

impl MediaDriver {
    /// Install `transport` on the plane and start following its routes
    pub fn attach(plane: &ControlPlane, transport: Arc<dyn MediaTransport>) -> Self {
        let sessions = Arc::new(DashMap::new());
        // subscribe first so no commit slips between resync and the first event
        let mut events = plane.subscribe();
        plane.set_media(transport.clone());
        resync(plane, transport.as_ref(), &sessions);

        let task_plane = plane.clone();
        let task_sessions = sessions.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ControlEvent::RouteSet(route)) => {
                        open(transport.as_ref(), &task_sessions, route)
                    }
                    Ok(ControlEvent::RouteCleared(route)) => {
                        if task_sessions.remove(&route.connection).is_some() {
                            transport.close(route.connection);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Media driver missed {} events, resyncing", missed);
                        resync(&task_plane, transport.as_ref(), &task_sessions);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self { sessions, task }
    }

    /// Routes with an open media session
    pub fn active_sessions(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.sessions.iter().map(|r| r.value().clone()).collect();
        routes.sort_by_key(|r| r.connection);
        routes
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn open(transport: &dyn MediaTransport, sessions: &DashMap<ConnectionId, Route>, route: Route) {
    match transport.open(&route) {
        Ok(()) => {
            sessions.insert(route.connection, route);
        }
        Err(e) => {
            tracing::error!("Media session for connection {} failed: {}", route.connection, e);
            sessions.remove(&route.connection);
        }
    }
}

/// Bring the open sessions in line with the plane's current routes
fn resync(plane: &ControlPlane, transport: &dyn MediaTransport, sessions: &DashMap<ConnectionId, Route>) {
    let routes = plane.get_routes();

    let stale: Vec<ConnectionId> = sessions
        .iter()
        .filter(|s| !routes.contains_key(s.key()))
        .map(|s| *s.key())
        .collect();
    for id in stale {
        sessions.remove(&id);
        transport.close(id);
    }

    for route in routes.into_values() {
        let current = sessions.get(&route.connection).map(|s| s.same_endpoints(&route));
        if current != Some(true) {
            open(transport, sessions, route);
        }
    }
}
