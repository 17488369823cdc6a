//! Network subsystem: WebSocket links between servers and clients
//!
//! The control plane never talks to sockets directly. Outbound handshakes go
//! through a [`Connector`]; inbound ones through [`server::AudioServer`].
//! Both hand back an [`Established`] link whose traffic is reported as
//! [`PeerEvent`]s.

pub mod client;
pub mod link;
pub mod mock;
pub mod server;

pub use client::WsConnector;
pub use link::{spawn_link, Link, LinkSender};
pub use mock::{MockBehavior, MockConnector};
pub use server::AudioServer;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ConnectError;
use crate::protocol::{ConnectionId, Endpoint, StreamParams, WireDevice, WireMessage};

/// Something that happened on a peer link
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub id: ConnectionId,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// A decoded message from the peer
    Message(WireMessage),
    /// The transport is gone; the reason is for logs only
    Lost(String),
}

/// Channel links report their traffic on
pub type PeerEvents = mpsc::UnboundedSender<PeerEvent>;

/// Everything an outbound handshake needs
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Id reserved for this attempt
    pub id: ConnectionId,
    pub endpoint: Endpoint,
    /// Local inputs advertised in `Hello`
    pub inputs: Vec<WireDevice>,
    pub stream: StreamParams,
    pub events: PeerEvents,
}

/// Outcome of a successful handshake
pub struct Established {
    pub link: Link,
    /// Devices the peer reported: inputs of a client, outputs of a server
    pub remote_devices: Vec<WireDevice>,
}

/// Performs the client side of the handshake.
///
/// Implementations must not touch control-plane state; the caller bounds the
/// call with a timeout and may drop the future to cancel it.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, request: ConnectRequest) -> Result<Established, ConnectError>;
}
