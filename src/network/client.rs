//! Outbound WebSocket connector

use async_trait::async_trait;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::error::{ConnectError, NetworkError};
use crate::network::link::{next_message, send_message, spawn_link};
use crate::network::{ConnectRequest, Connector, Established};
use crate::protocol::{WireMessage, PROTOCOL_VERSION};

/// Connects to remote servers over `ws://`
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Established, ConnectError> {
        let ConnectRequest {
            id,
            endpoint,
            inputs,
            stream,
            events,
        } = request;

        let (mut ws, _response) = connect_async(endpoint.url())
            .await
            .map_err(|e| map_ws_error(endpoint.url(), e))?;

        let hello = WireMessage::Hello {
            version: PROTOCOL_VERSION,
            stream,
            inputs,
        };
        send_message(&mut ws, &hello).await.map_err(handshake_error)?;

        let outputs = match next_message(&mut ws).await.map_err(handshake_error)? {
            WireMessage::Welcome { version, outputs } if version == PROTOCOL_VERSION => outputs,
            WireMessage::Welcome { version, .. } => {
                return Err(ConnectError::Rejected(format!(
                    "server speaks protocol {}, expected {}",
                    version, PROTOCOL_VERSION
                )))
            }
            other => {
                return Err(ConnectError::Rejected(format!(
                    "expected welcome, got {}",
                    other.kind()
                )))
            }
        };

        tracing::info!(
            "Connected to {} as connection {} ({} remote outputs)",
            endpoint,
            id,
            outputs.len()
        );

        Ok(Established {
            link: spawn_link(id, ws, events),
            remote_devices: outputs,
        })
    }
}

fn map_ws_error(url: &str, error: WsError) -> ConnectError {
    match error {
        WsError::Url(e) => ConnectError::InvalidAddress(format!("{}: {}", url, e)),
        WsError::Http(response) => {
            ConnectError::Rejected(format!("{} answered HTTP {}", url, response.status()))
        }
        WsError::Io(e) => ConnectError::Unreachable(format!("{}: {}", url, e)),
        other => ConnectError::Unreachable(format!("{}: {}", url, other)),
    }
}

fn handshake_error(error: NetworkError) -> ConnectError {
    match error {
        NetworkError::Closed => ConnectError::Rejected("peer closed during handshake".to_string()),
        other => ConnectError::Rejected(other.to_string()),
    }
}
