//! Scriptable connector for exercising the control plane without sockets.
//!
//! Each endpoint can be told to accept, refuse, hang or stall before
//! answering. Accepted links record what the control plane sends and can be
//! made to fail or to deliver peer messages on demand.
//!
//! ```
//! use remoteio::network::{MockBehavior, MockConnector};
//! use remoteio::protocol::WireDevice;
//!
//! let connector = MockConnector::new(vec![WireDevice::new("Speakers", true)]);
//! connector.script("ws://10.0.0.9:8000", MockBehavior::Unreachable);
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::ConnectError;
use crate::network::{ConnectRequest, Connector, Established, Link, PeerEvent, PeerEventKind, PeerEvents};
use crate::protocol::{ConnectionId, WireDevice, WireMessage};

#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Complete the handshake reporting these remote devices
    Accept(Vec<WireDevice>),
    /// Wait, then accept
    Delay(Duration, Vec<WireDevice>),
    Unreachable,
    Reject(String),
    /// Never answer
    Hang,
}

struct MockLink {
    events: PeerEvents,
    sent: Arc<Mutex<Vec<WireMessage>>>,
    kill: Option<oneshot::Sender<()>>,
}

pub struct MockConnector {
    default: Mutex<MockBehavior>,
    scripts: DashMap<String, MockBehavior>,
    links: DashMap<ConnectionId, MockLink>,
    inputs_seen: DashMap<ConnectionId, Vec<WireDevice>>,
}

impl MockConnector {
    /// Accept every endpoint, reporting `outputs` as the server's devices
    pub fn new(outputs: Vec<WireDevice>) -> Self {
        Self {
            default: Mutex::new(MockBehavior::Accept(outputs)),
            scripts: DashMap::new(),
            links: DashMap::new(),
            inputs_seen: DashMap::new(),
        }
    }

    /// Override the behaviour for one `ws://host:port` url
    pub fn script(&self, url: &str, behavior: MockBehavior) {
        self.scripts.insert(url.to_string(), behavior);
    }

    pub fn set_default(&self, behavior: MockBehavior) {
        *self.default.lock() = behavior;
    }

    /// Messages the control plane sent over a link
    pub fn sent(&self, id: ConnectionId) -> Vec<WireMessage> {
        self.links
            .get(&id)
            .map(|link| link.sent.lock().clone())
            .unwrap_or_default()
    }

    /// Inputs advertised in the `Hello` of a connection
    pub fn advertised_inputs(&self, id: ConnectionId) -> Vec<WireDevice> {
        self.inputs_seen
            .get(&id)
            .map(|inputs| inputs.clone())
            .unwrap_or_default()
    }

    /// Pretend the peer sent `message`
    pub fn inject(&self, id: ConnectionId, message: WireMessage) -> bool {
        self.links
            .get(&id)
            .map(|link| {
                link.events
                    .send(PeerEvent {
                        id,
                        kind: PeerEventKind::Message(message),
                    })
                    .is_ok()
            })
            .unwrap_or(false)
    }

    /// Pretend the transport died
    pub fn sever(&self, id: ConnectionId) -> bool {
        match self.links.get_mut(&id).and_then(|mut link| link.kill.take()) {
            Some(kill) => kill.send(()).is_ok(),
            None => false,
        }
    }

    fn open_link(&self, id: ConnectionId, events: PeerEvents) -> Link {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let sent = Arc::new(Mutex::new(Vec::new()));

        let task_sent = sent.clone();
        let task_events = events.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        task_sent.lock().push(WireMessage::Bye);
                        return;
                    }
                    killed = &mut kill_rx => {
                        if killed.is_ok() {
                            let _ = task_events.send(PeerEvent {
                                id,
                                kind: PeerEventKind::Lost("severed".to_string()),
                            });
                        }
                        return;
                    }
                    Some(message) = outbound_rx.recv() => task_sent.lock().push(message),
                }
            }
        });

        self.links.insert(
            id,
            MockLink {
                events,
                sent,
                kill: Some(kill_tx),
            },
        );
        Link::new(outbound_tx, shutdown_tx, task)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Established, ConnectError> {
        let behavior = self
            .scripts
            .get(request.endpoint.url())
            .map(|b| b.clone())
            .unwrap_or_else(|| self.default.lock().clone());

        let outputs = match behavior {
            MockBehavior::Accept(outputs) => outputs,
            MockBehavior::Delay(delay, outputs) => {
                tokio::time::sleep(delay).await;
                outputs
            }
            MockBehavior::Unreachable => {
                return Err(ConnectError::Unreachable(format!(
                    "{}: connection refused",
                    request.endpoint
                )))
            }
            MockBehavior::Reject(reason) => return Err(ConnectError::Rejected(reason)),
            MockBehavior::Hang => std::future::pending().await,
        };

        self.inputs_seen.insert(request.id, request.inputs);
        Ok(Established {
            link: self.open_link(request.id, request.events),
            remote_devices: outputs,
        })
    }
}
