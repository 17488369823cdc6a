//! Control plane
//!
//! [`ControlPlane`] is the single entry point for every command. Mutations run
//! under one lock over [`ControlState`] and end by publishing a fresh
//! [`Snapshot`]; readers only ever see published snapshots. Anything that
//! waits on the network (handshakes, closing a link, enumerating devices)
//! happens with the lock released.
//!
//! ```text
//!   command ──► validate ──► mutate ──► maintain ──► snapshot ──► publish
//!                                                                    │
//!                                               ControlEvent ◄───────┘
//! ```

pub mod events;

pub use events::ControlEvent;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::audio::DeviceEnumerator;
use crate::config::AppConfig;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::{ConnectError, DeviceError, NotFoundError, Result, StateError};
use crate::media::MediaTransport;
use crate::network::{
    ConnectRequest, Connector, Established, LinkSender, PeerEvent, PeerEventKind, PeerEvents,
};
use crate::protocol::{
    Applied, ConnectionId, ConnectionInfo, ConnectionState, Device, DeviceRole, DeviceScope,
    Endpoint, Role, Route, Snapshot, StreamParams, WireDevice, WireMessage,
};
use crate::state::ControlState;

/// Timeouts and defaults taken from the configuration at startup
#[derive(Debug, Clone)]
struct Settings {
    connect_timeout: Duration,
    handshake_timeout: Duration,
    close_grace: Duration,
    stream: StreamParams,
    default_output: Option<String>,
}

impl Settings {
    fn from_config(config: &AppConfig) -> Self {
        Self {
            connect_timeout: config.client.connect_timeout(),
            handshake_timeout: config.server.handshake_timeout(),
            close_grace: config.client.close_grace(),
            stream: config.client.stream,
            default_output: config.server.default_output.clone(),
        }
    }
}

struct Inner {
    state: Mutex<ControlState>,
    published: RwLock<Arc<Snapshot>>,
    connector: Arc<dyn Connector>,
    enumerator: Arc<dyn DeviceEnumerator>,
    media: RwLock<Option<Arc<dyn MediaTransport>>>,
    events: broadcast::Sender<ControlEvent>,
    peer_tx: PeerEvents,
    settings: Settings,
}

/// Cheaply cloneable handle to the control plane
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<Inner>,
}

impl ControlPlane {
    /// Create a control plane. Must be called from within a Tokio runtime.
    pub fn new(
        config: &AppConfig,
        connector: Arc<dyn Connector>,
        enumerator: Arc<dyn DeviceEnumerator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            state: Mutex::new(ControlState::new()),
            published: RwLock::new(Arc::new(Snapshot::empty())),
            connector,
            enumerator,
            media: RwLock::new(None),
            events,
            peer_tx,
            settings: Settings::from_config(config),
        });
        tokio::spawn(pump_peer_events(Arc::downgrade(&inner), peer_rx));

        Self { inner }
    }

    /// Run `op` against the state and publish the result.
    ///
    /// Events queued by `op` are broadcast only after the snapshot that
    /// reflects them is visible, and before the lock is released so that
    /// subscribers see them in commit order. A failed `op` has not touched
    /// the state and publishes nothing.
    fn commit<T>(
        &self,
        op: impl FnOnce(&mut ControlState) -> Result<T>,
    ) -> Result<(T, Arc<Snapshot>)> {
        let mut state = self.inner.state.lock();
        let value = op(&mut state)?;
        state.maintain();
        let snapshot = Arc::new(state.snapshot());
        *self.inner.published.write() = snapshot.clone();

        for event in state.take_events() {
            // no subscribers is fine; send never blocks
            let _ = self.inner.events.send(event);
        }
        Ok((value, snapshot))
    }

    // ---- queries -------------------------------------------------------

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.published.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.inner.events.subscribe()
    }

    pub fn list_connections(&self, role: Role) -> Vec<ConnectionInfo> {
        self.snapshot().connections_for(role)
    }

    /// Clients connected to this host's server
    pub fn list_server_connections(&self) -> Vec<ConnectionInfo> {
        self.list_connections(Role::Server)
    }

    /// Servers this host is connected to
    pub fn list_client_connections(&self) -> Vec<ConnectionInfo> {
        self.list_connections(Role::Client)
    }

    pub fn list_devices(&self, scope: DeviceScope, role: DeviceRole) -> Vec<Device> {
        self.snapshot().devices_for(scope, role)
    }

    /// Local outputs a server can play into
    pub fn list_server_devices(&self) -> Vec<Device> {
        self.list_devices(DeviceScope::Local, DeviceRole::Output)
    }

    /// Local inputs a client can capture from
    pub fn list_client_devices(&self) -> Vec<Device> {
        self.list_devices(DeviceScope::Local, DeviceRole::Input)
    }

    pub fn get_routes(&self) -> BTreeMap<ConnectionId, Route> {
        self.snapshot().routes.clone()
    }

    /// Local devices of one role in wire form, as advertised to peers
    pub fn local_wire_devices(&self, role: DeviceRole) -> Vec<WireDevice> {
        self.list_devices(DeviceScope::Local, role)
            .into_iter()
            .map(|d| WireDevice::new(d.name, d.is_default))
            .collect()
    }

    // ---- connections ---------------------------------------------------

    /// Open a client connection to the server at `address`
    pub async fn connect(&self, address: &str) -> Result<Applied<ConnectionInfo>> {
        let endpoint = Endpoint::parse(address)?;
        let url = endpoint.url().to_string();
        let inputs = self.local_wire_devices(DeviceRole::Input);
        let stream = self.inner.settings.stream;
        let connector = self.inner.connector.clone();

        self.establish(
            Role::Client,
            url,
            self.inner.settings.connect_timeout,
            move |id, events| async move {
                connector
                    .connect(ConnectRequest {
                        id,
                        endpoint,
                        inputs,
                        stream,
                        events,
                    })
                    .await
            },
        )
        .await
    }

    pub async fn connect_client(&self, address: &str) -> Result<Applied<ConnectionInfo>> {
        self.connect(address).await
    }

    /// Register an inbound client once `handshake` succeeds.
    ///
    /// The id is reserved before the handshake starts; a newly admitted client
    /// is routed to the server output when one is selected.
    pub async fn admit<F, Fut>(&self, endpoint: String, handshake: F) -> Result<Applied<ConnectionInfo>>
    where
        F: FnOnce(ConnectionId, PeerEvents) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Established, ConnectError>> + Send,
    {
        self.establish(
            Role::Server,
            endpoint,
            self.inner.settings.handshake_timeout,
            handshake,
        )
        .await
    }

    async fn establish<F, Fut>(
        &self,
        role: Role,
        endpoint: String,
        timeout: Duration,
        handshake: F,
    ) -> Result<Applied<ConnectionInfo>>
    where
        F: FnOnce(ConnectionId, PeerEvents) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Established, ConnectError>> + Send,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (id, _) = self.commit(|state| {
            if state.registry.find_endpoint(role, &endpoint).is_some() {
                return Err(ConnectError::AlreadyConnected(endpoint.clone()).into());
            }
            Ok(state.registry.reserve(role, &endpoint, cancel_tx))
        })?;
        tracing::debug!("Connection {} to {} reserved ({:?})", id, endpoint, role);

        let attempt = tokio::time::timeout(timeout, handshake(id, self.inner.peer_tx.clone()));
        let outcome = tokio::select! {
            result = attempt => result.unwrap_or(Err(ConnectError::Timeout(timeout))),
            _ = cancel_rx => Err(ConnectError::Cancelled(id)),
        };

        match outcome {
            Ok(established) => self.register(id, established).await,
            Err(error) => {
                // a cancelled reservation is already gone; otherwise release it
                self.commit(|state| {
                    state.close(id);
                    Ok(())
                })?;
                tracing::warn!("Connection {} to {} failed: {}", id, endpoint, error);
                Err(error.into())
            }
        }
    }

    async fn register(&self, id: ConnectionId, established: Established) -> Result<Applied<ConnectionInfo>> {
        let Established {
            link,
            remote_devices,
        } = established;

        let (registered, snapshot) = self.commit(move |state| {
            let info = match state.registry.activate(id, link) {
                Ok(info) => info.clone(),
                Err(link) => return Ok(Err(link)),
            };
            state.push_event(ControlEvent::ConnectionOpened(info.clone()));
            state.replace_devices(
                DeviceScope::Remote(id),
                remote_role(info.role),
                remote_devices,
            );
            if info.role == Role::Server {
                route_to_server_output(state, id);
            }
            Ok(Ok(info))
        })?;

        match registered {
            Ok(info) => {
                tracing::info!("Connection {} to {} is active", id, info.endpoint);
                Ok(Applied {
                    value: info,
                    snapshot,
                })
            }
            Err(link) => {
                // disconnected while the handshake was finishing
                link.close(self.inner.settings.close_grace).await;
                Err(ConnectError::Cancelled(id).into())
            }
        }
    }

    /// Close a connection, or abort it while it is still connecting
    pub async fn disconnect(&self, id: ConnectionId) -> Result<Arc<Snapshot>> {
        self.disconnect_as(None, id).await
    }

    /// Close an inbound client; ids of outbound connections are not found
    pub async fn disconnect_server(&self, id: ConnectionId) -> Result<Arc<Snapshot>> {
        self.disconnect_as(Some(Role::Server), id).await
    }

    /// Close an outbound connection; ids of inbound clients are not found
    pub async fn disconnect_client(&self, id: ConnectionId) -> Result<Arc<Snapshot>> {
        self.disconnect_as(Some(Role::Client), id).await
    }

    async fn disconnect_as(&self, role: Option<Role>, id: ConnectionId) -> Result<Arc<Snapshot>> {
        let (step, snapshot) = self.commit(|state| {
            let current = state
                .registry
                .get(id)
                .filter(|e| role.map_or(true, |role| e.info.role == role))
                .map(|e| e.info.state);
            match current {
                None => Err(NotFoundError::Connection(id).into()),
                Some(ConnectionState::Connecting) => {
                    state.registry.cancel(id);
                    Ok(None)
                }
                Some(ConnectionState::Active) => {
                    let link = state.registry.begin_disconnect(id);
                    state.clear_route(id);
                    Ok(Some(link))
                }
                Some(_) => Err(StateError::ConnectionNotActive(id).into()),
            }
        })?;

        let Some(link) = step else {
            tracing::info!("Cancelled connect attempt {}", id);
            return Ok(snapshot);
        };
        if let Some(link) = link {
            link.close(self.inner.settings.close_grace).await;
        }

        let (_, snapshot) = self.commit(|state| {
            state.close(id);
            Ok(())
        })?;
        tracing::info!("Connection {} closed", id);
        Ok(snapshot)
    }

    /// Tear down a connection whose transport failed
    async fn connection_lost(&self, id: ConnectionId, reason: &str) {
        let committed = self.commit(|state| match state.registry.state_of(id) {
            Some(ConnectionState::Active) => Ok(state.close(id).and_then(|mut e| e.link.take())),
            // a disconnect in progress owns the teardown
            _ => Ok(None),
        });
        if let Ok((Some(link), _)) = committed {
            link.close(self.inner.settings.close_grace).await;
            tracing::warn!("Connection {} lost: {}", id, reason);
        }
    }

    // ---- devices -------------------------------------------------------

    /// Re-read one device list.
    ///
    /// Local lists are enumerated on a blocking thread; on failure the last
    /// known list stays in place. Remote lists are requested from the peer
    /// and arrive later as a `DevicesChanged` event.
    pub async fn refresh(&self, scope: DeviceScope, role: DeviceRole) -> Result<Arc<Snapshot>> {
        match scope {
            DeviceScope::Local => self.refresh_local(role).await,
            DeviceScope::Remote(id) => {
                let sender = {
                    let state = self.inner.state.lock();
                    let entry = state
                        .registry
                        .get(id)
                        .ok_or(NotFoundError::Connection(id))?;
                    if !entry.info.is_active() {
                        return Err(StateError::ConnectionNotActive(id).into());
                    }
                    entry.sender()
                };
                if let Some(sender) = sender {
                    sender.send(WireMessage::ListDevices)?;
                }
                Ok(self.snapshot())
            }
        }
    }

    async fn refresh_local(&self, role: DeviceRole) -> Result<Arc<Snapshot>> {
        let enumerator = self.inner.enumerator.clone();
        let listed = tokio::task::spawn_blocking(move || enumerator.enumerate(role))
            .await
            .map_err(|e| DeviceError::Backend(format!("enumeration task failed: {}", e)))?;

        let devices = match listed {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Keeping last known {:?} devices: {}", role, e);
                return Err(e.into());
            }
        };

        let default_output = self.inner.settings.default_output.clone();
        let (notify, snapshot) = self.commit(|state| {
            let changed = state.replace_devices(DeviceScope::Local, role, devices);
            if role == DeviceRole::Output && state.server_output().is_none() {
                if let Some(name) = default_output.as_deref() {
                    if state.inventory.contains(DeviceScope::Local, role, name) {
                        state.select_server_output(name)?;
                    }
                }
            }
            if !changed {
                return Ok(None);
            }
            let update = WireMessage::Devices(state.inventory.to_wire(DeviceScope::Local, role));
            Ok(Some((update, state.registry.senders(peer_role(role)))))
        })?;

        if let Some((update, peers)) = notify {
            for peer in peers {
                if let Err(e) = peer.send(update.clone()) {
                    tracing::debug!("Device update not delivered: {}", e);
                }
            }
        }
        Ok(snapshot)
    }

    /// Re-enumerate local devices every `period` until the plane is dropped
    pub fn spawn_device_refresh(&self, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let plane = ControlPlane { inner };
                for role in [DeviceRole::Input, DeviceRole::Output] {
                    if let Err(e) = plane.refresh(DeviceScope::Local, role).await {
                        tracing::debug!("Periodic {:?} refresh failed: {}", role, e);
                    }
                }
            }
        })
    }

    /// Pick the output device for a scope.
    ///
    /// `Local` selects the server output new inbound clients are routed to.
    /// `Remote(id)` selects the server-side output for an outbound connection
    /// and re-points its route if one exists.
    pub fn select_output_device(&self, scope: DeviceScope, name: &str) -> Result<Arc<Snapshot>> {
        let id = match scope {
            DeviceScope::Local => {
                return self
                    .commit(|state| state.select_server_output(name))
                    .map(|(_, snapshot)| snapshot)
            }
            DeviceScope::Remote(id) => id,
        };

        let (announce, snapshot) = self.commit(|state| {
            let entry = state
                .registry
                .get(id)
                .ok_or(NotFoundError::Connection(id))?;
            if !entry.info.is_active() {
                return Err(StateError::ConnectionNotActive(id).into());
            }
            if !state.inventory.contains(scope, DeviceRole::Output, name) {
                return Err(NotFoundError::Device {
                    name: name.to_string(),
                    scope,
                }
                .into());
            }
            let retarget = match state.routing.get(id) {
                Some(route) => Some(state.validate_route(id, &route.input, name)?),
                None => None,
            };

            if let Some(entry) = state.registry.get_mut(id) {
                entry.preferred_output = Some(name.to_string());
            }
            Ok(match retarget {
                Some(route) => install_and_announce(state, route),
                None => None,
            })
        })?;

        if let Some((sender, route)) = announce {
            announce_route(&sender, &route);
        }
        Ok(snapshot)
    }

    pub fn set_server_output_device(&self, name: &str) -> Result<Arc<Snapshot>> {
        self.select_output_device(DeviceScope::Local, name)
    }

    // ---- routing -------------------------------------------------------

    /// Point a connection's route at `input` → `output`, replacing any
    /// existing route of that connection
    pub fn set_route(&self, id: ConnectionId, input: &str, output: &str) -> Result<Arc<Snapshot>> {
        let (announce, snapshot) = self.commit(|state| {
            let route = state.validate_route(id, input, output)?;
            Ok(install_and_announce(state, route))
        })?;

        if let Some((sender, route)) = announce {
            announce_route(&sender, &route);
        }
        Ok(snapshot)
    }

    /// Choose the input of a connection, keeping or deriving its output.
    ///
    /// For an outbound connection the output is the one picked with
    /// [`select_output_device`](Self::select_output_device), else the
    /// server's default device. For an inbound one it is the current route's
    /// output, else the server output.
    pub fn set_client_input_device(&self, id: ConnectionId, input: &str) -> Result<Arc<Snapshot>> {
        let (announce, snapshot) = self.commit(|state| {
            let entry = state
                .registry
                .get(id)
                .filter(|e| e.info.is_active())
                .ok_or(StateError::ConnectionNotActive(id))?;

            let output_scope = match entry.info.role {
                Role::Client => DeviceScope::Remote(id),
                Role::Server => DeviceScope::Local,
            };
            let output = match entry.info.role {
                Role::Client => entry.preferred_output.clone().or_else(|| {
                    state
                        .inventory
                        .preferred(output_scope, DeviceRole::Output)
                        .map(|d| d.name.clone())
                }),
                Role::Server => state
                    .routing
                    .get(id)
                    .map(|r| r.output.clone())
                    .or_else(|| state.server_output().map(str::to_string))
                    .or_else(|| {
                        state
                            .inventory
                            .preferred(output_scope, DeviceRole::Output)
                            .map(|d| d.name.clone())
                    }),
            }
            .ok_or(NotFoundError::NoOutput(output_scope))?;

            let route = state.validate_route(id, input, &output)?;
            Ok(install_and_announce(state, route))
        })?;

        if let Some((sender, route)) = announce {
            announce_route(&sender, &route);
        }
        Ok(snapshot)
    }

    /// Remove a connection's route. Clearing an absent route succeeds.
    pub fn clear_route(&self, id: ConnectionId) -> Result<Arc<Snapshot>> {
        let (sender, snapshot) = self.commit(|state| {
            if state.clear_route(id).is_none() {
                return Ok(None);
            }
            Ok(outbound_sender(state, id))
        })?;

        if let Some(sender) = sender {
            if let Err(e) = sender.send(WireMessage::ClearRoute) {
                tracing::debug!("Route clear for {} not announced: {}", id, e);
            }
        }
        Ok(snapshot)
    }

    // ---- media ---------------------------------------------------------

    /// Install the transport routed audio payloads are handed to
    pub fn set_media(&self, transport: Arc<dyn MediaTransport>) {
        *self.inner.media.write() = Some(transport);
    }

    /// Send an audio payload over an outbound connection's link
    pub fn send_audio(&self, id: ConnectionId, payload: Bytes) -> Result<()> {
        let sender = {
            let state = self.inner.state.lock();
            if state.routing.get(id).is_none() {
                return Err(StateError::ConnectionNotActive(id).into());
            }
            state.registry.get(id).and_then(|e| e.sender())
        };
        match sender {
            Some(sender) => Ok(sender.send(WireMessage::Audio(payload))?),
            None => Err(StateError::ConnectionNotActive(id).into()),
        }
    }

    fn deliver_audio(&self, id: ConnectionId, payload: Bytes) {
        if !self.snapshot().routes.contains_key(&id) {
            tracing::trace!("Dropping audio from unrouted connection {}", id);
            return;
        }
        let media = self.inner.media.read().clone();
        if let Some(media) = media {
            media.deliver(id, payload);
        }
    }

    // ---- peer traffic --------------------------------------------------

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event.kind {
            PeerEventKind::Lost(reason) => self.connection_lost(event.id, &reason).await,
            PeerEventKind::Message(message) => self.handle_peer_message(event.id, message),
        }
    }

    fn handle_peer_message(&self, id: ConnectionId, message: WireMessage) {
        let role = {
            let state = self.inner.state.lock();
            match state.registry.get(id) {
                Some(entry) if entry.info.is_active() => entry.info.role,
                _ => {
                    tracing::debug!("Ignoring {} from inactive connection {}", message.kind(), id);
                    return;
                }
            }
        };

        match (role, message) {
            (_, WireMessage::Devices(devices)) => {
                let _ = self.commit(|state| {
                    state.replace_devices(DeviceScope::Remote(id), remote_role(role), devices);
                    Ok(())
                });
            }
            (_, WireMessage::ListDevices) => {
                let devices = self.local_wire_devices(local_role(role));
                let sender = self
                    .inner
                    .state
                    .lock()
                    .registry
                    .get(id)
                    .and_then(|e| e.sender());
                if let Some(sender) = sender {
                    if let Err(e) = sender.send(WireMessage::Devices(devices)) {
                        tracing::debug!("Device list for {} not sent: {}", id, e);
                    }
                }
            }
            (Role::Server, WireMessage::Route { input, output }) => {
                if let Err(e) = self.set_route(id, &input, &output) {
                    tracing::warn!("Route requested by connection {} refused: {}", id, e);
                }
            }
            (Role::Server, WireMessage::ClearRoute) => {
                let _ = self.clear_route(id);
            }
            (_, WireMessage::Audio(payload)) => self.deliver_audio(id, payload),
            (_, other) => {
                tracing::warn!("Unexpected {} from connection {}", other.kind(), id)
            }
        }
    }
}

async fn pump_peer_events(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        ControlPlane { inner }.handle_peer_event(event).await;
    }
}

/// Role of the devices a peer reports to us
fn remote_role(role: Role) -> DeviceRole {
    match role {
        Role::Server => DeviceRole::Input,
        Role::Client => DeviceRole::Output,
    }
}

/// Role of our devices a peer is interested in
fn local_role(role: Role) -> DeviceRole {
    match role {
        Role::Server => DeviceRole::Output,
        Role::Client => DeviceRole::Input,
    }
}

/// Connections that receive updates of our devices of `role`
fn peer_role(role: DeviceRole) -> Role {
    match role {
        DeviceRole::Input => Role::Client,
        DeviceRole::Output => Role::Server,
    }
}

fn outbound_sender(state: &ControlState, id: ConnectionId) -> Option<LinkSender> {
    state
        .registry
        .get(id)
        .filter(|e| e.info.role == Role::Client)
        .and_then(|e| e.sender())
}

/// Install `route`; outbound routes that changed are returned for mirroring
fn install_and_announce(state: &mut ControlState, route: Route) -> Option<(LinkSender, Route)> {
    if !state.install_route(route.clone()) {
        return None;
    }
    outbound_sender(state, route.connection).map(|sender| (sender, route))
}

fn announce_route(sender: &LinkSender, route: &Route) {
    let message = WireMessage::Route {
        input: route.input.clone(),
        output: route.output.clone(),
    };
    if let Err(e) = sender.send(message) {
        tracing::debug!("Route of {} not announced: {}", route.connection, e);
    }
}

fn route_to_server_output(state: &mut ControlState, id: ConnectionId) {
    let Some(output) = state.server_output().map(str::to_string) else {
        return;
    };
    let Some(input) = state
        .inventory
        .preferred(DeviceScope::Remote(id), DeviceRole::Input)
        .map(|d| d.name.clone())
    else {
        return;
    };
    match state.validate_route(id, &input, &output) {
        Ok(route) => {
            state.install_route(route);
        }
        Err(e) => tracing::debug!("Connection {} not auto-routed: {}", id, e),
    }
}
