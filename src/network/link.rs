//! Transport handle for one peer connection
//!
//! A [`Link`] owns the task pumping a WebSocket. Outgoing messages go through a
//! cloneable [`LinkSender`]; incoming messages and transport loss are reported
//! as [`PeerEvent`]s tagged with the connection id.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::NetworkError;
use crate::network::{PeerEvent, PeerEventKind, PeerEvents};
use crate::protocol::{ConnectionId, WireMessage};

/// Cloneable outgoing half of a link
#[derive(Clone, Debug)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<WireMessage>,
}

impl LinkSender {
    pub fn send(&self, message: WireMessage) -> Result<(), NetworkError> {
        self.tx.send(message).map_err(|_| NetworkError::Closed)
    }
}

pub struct Link {
    outbound: mpsc::UnboundedSender<WireMessage>,
    shutdown: Option<oneshot::Sender<()>>,
    /// Held back until the connection is registered
    ready: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    /// Wrap an already running transport task.
    ///
    /// The task must drain `outbound` and stop when `shutdown` fires or is
    /// dropped.
    pub fn new(
        outbound: mpsc::UnboundedSender<WireMessage>,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            outbound,
            shutdown: Some(shutdown),
            ready: None,
            task: Some(task),
        }
    }

    /// Keep the transport from reporting peer traffic until [`Link::release`]
    pub fn gated(mut self, ready: oneshot::Sender<()>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Let a gated transport start reporting peer traffic
    pub fn release(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
    }

    /// A link with no transport behind it
    #[cfg(test)]
    pub(crate) fn inert() -> Self {
        let (outbound, _) = mpsc::unbounded_channel();
        Self {
            outbound,
            shutdown: None,
            ready: None,
            task: None,
        }
    }

    pub fn sender(&self) -> LinkSender {
        LinkSender {
            tx: self.outbound.clone(),
        }
    }

    /// Ask the transport to stop and wait up to `grace` for it to finish
    pub async fn close(mut self, grace: Duration) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!("Link task did not stop within {:?}, aborting", grace);
                task.abort();
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // dropping the shutdown sender already stops the task; abort covers
        // a task stuck in a send
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawn the pump for an established WebSocket and wrap it in a [`Link`]
pub fn spawn_link<S>(id: ConnectionId, ws: WebSocketStream<S>, events: PeerEvents) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let task = tokio::spawn(drive(id, ws, outbound_rx, shutdown_rx, ready_rx, events));
    Link::new(outbound_tx, shutdown_tx, task).gated(ready_tx)
}

async fn drive<S>(
    id: ConnectionId,
    mut ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<WireMessage>,
    mut shutdown: oneshot::Receiver<()>,
    ready: oneshot::Receiver<()>,
    events: PeerEvents,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let lost = |reason: String| {
        let _ = events.send(PeerEvent {
            id,
            kind: PeerEventKind::Lost(reason),
        });
    };

    // nothing is reported before the connection exists in the registry
    tokio::select! {
        released = ready => if released.is_err() { return },
        _ = &mut shutdown => {
            let _ = ws.close(None).await;
            return;
        }
    }

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if let Ok(bye) = WireMessage::Bye.encode() {
                    let _ = ws.send(Message::Binary(bye)).await;
                }
                let _ = ws.close(None).await;
                tracing::debug!("Link {} shut down", id);
                return;
            }
            Some(message) = outbound.recv() => {
                let frame = match message.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Dropping unencodable {} message on link {}: {}", message.kind(), id, e);
                        continue;
                    }
                };
                if let Err(e) = ws.send(Message::Binary(frame)).await {
                    lost(format!("send failed: {}", e));
                    return;
                }
            }
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Binary(data))) => match WireMessage::decode(&data) {
                    Ok(WireMessage::Bye) => {
                        lost("peer said goodbye".to_string());
                        return;
                    }
                    Ok(message) => {
                        let _ = events.send(PeerEvent {
                            id,
                            kind: PeerEventKind::Message(message),
                        });
                    }
                    Err(e) => tracing::warn!("Undecodable frame on link {}: {}", id, e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    lost("connection closed by peer".to_string());
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    lost(format!("receive failed: {}", e));
                    return;
                }
            },
        }
    }
}

/// Read the next binary frame as a [`WireMessage`], skipping control frames
pub async fn next_message<S>(ws: &mut WebSocketStream<S>) -> Result<WireMessage, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = ws.next().await {
        match frame.map_err(|e| NetworkError::Protocol(e.to_string()))? {
            Message::Binary(data) => return WireMessage::decode(&data),
            Message::Close(_) => return Err(NetworkError::Closed),
            _ => continue,
        }
    }
    Err(NetworkError::Closed)
}

/// Encode and send one [`WireMessage`]
pub async fn send_message<S>(ws: &mut WebSocketStream<S>, message: &WireMessage) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = message.encode()?;
    ws.send(Message::Binary(frame))
        .await
        .map_err(|e| NetworkError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sender_fails_after_link_dropped() {
        let link = Link::inert();
        let sender = link.sender();
        drop(link);
        // inert links own no receiver, so sends never succeed
        assert!(matches!(sender.send(WireMessage::Bye), Err(NetworkError::Closed)));
    }

    #[tokio::test]
    async fn test_close_stops_task() {
        let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => return,
                    Some(_) = rx.recv() => {}
                }
            }
        });
        let link = Link::new(tx, shutdown_tx, task);
        link.sender().send(WireMessage::ListDevices).unwrap();
        link.close(Duration::from_secs(1)).await;
    }
}
