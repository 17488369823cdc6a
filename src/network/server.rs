//! Inbound WebSocket listener
//!
//! Every accepted socket is admitted through the control plane, which reserves
//! an id, runs the handshake below under the configured timeout and only then
//! registers the connection.

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;

use crate::config::ServerConfig;
use crate::control::ControlPlane;
use crate::error::{ConnectError, NetworkError, Result};
use crate::network::link::{next_message, send_message, spawn_link};
use crate::network::{Established, PeerEvents};
use crate::protocol::{ConnectionId, DeviceRole, WireDevice, WireMessage, PROTOCOL_VERSION};

pub struct AudioServer {
    listener: TcpListener,
    plane: ControlPlane,
}

impl AudioServer {
    /// Bind the listener described by `config`
    pub async fn bind(config: &ServerConfig, plane: ControlPlane) -> Result<Self> {
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        Ok(Self { listener, plane })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop in the background
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!("Accepting audio clients on ws://{}", addr),
            Err(e) => tracing::warn!("Listener has no local address: {}", e),
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            };

            let plane = self.plane.clone();
            tokio::spawn(async move {
                let endpoint = format!("ws://{}", peer);
                let outputs = plane.local_wire_devices(DeviceRole::Output);
                match plane
                    .admit(endpoint.clone(), move |id, events| {
                        handshake(stream, id, events, outputs)
                    })
                    .await
                {
                    Ok(applied) => tracing::info!(
                        "Admitted {} as connection {}",
                        endpoint,
                        applied.value.id
                    ),
                    Err(e) => tracing::warn!("Rejected {}: {}", endpoint, e),
                }
            });
        }
    }
}

async fn handshake(
    stream: TcpStream,
    id: ConnectionId,
    events: PeerEvents,
    outputs: Vec<WireDevice>,
) -> std::result::Result<Established, ConnectError> {
    let _ = stream.set_nodelay(true);
    let mut ws = accept_async(stream)
        .await
        .map_err(|e| ConnectError::Rejected(format!("websocket upgrade failed: {}", e)))?;

    let inputs = match next_message(&mut ws).await {
        Ok(WireMessage::Hello {
            version,
            stream,
            inputs,
        }) if version == PROTOCOL_VERSION => {
            tracing::debug!(
                "Connection {} streams {} ch @ {} Hz, buffer {}",
                id,
                stream.channels,
                stream.sample_rate,
                stream.buffer_size
            );
            inputs
        }
        Ok(WireMessage::Hello { version, .. }) => {
            return Err(ConnectError::Rejected(format!(
                "client speaks protocol {}, expected {}",
                version, PROTOCOL_VERSION
            )))
        }
        Ok(other) => {
            return Err(ConnectError::Rejected(format!(
                "expected hello, got {}",
                other.kind()
            )))
        }
        Err(NetworkError::Closed) => {
            return Err(ConnectError::Rejected("peer closed during handshake".to_string()))
        }
        Err(e) => return Err(ConnectError::Rejected(e.to_string())),
    };

    let welcome = WireMessage::Welcome {
        version: PROTOCOL_VERSION,
        outputs,
    };
    send_message(&mut ws, &welcome)
        .await
        .map_err(|e| ConnectError::Rejected(e.to_string()))?;

    Ok(Established {
        link: spawn_link(id, ws, events),
        remote_devices: inputs,
    })
}
