//! Push channel for control events
//!
//! Pollers that would rather not poll can open `/api/events`. The first frame
//! is the current snapshot; every later frame is one [`ControlEvent`] as JSON.
//! A subscriber that falls behind gets a fresh snapshot instead of the events
//! it missed.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::control::ControlEvent;
use crate::protocol::Snapshot;
use crate::ui::server::AppState;

#[derive(Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum Frame<'a> {
    Snapshot(&'a Snapshot),
    Event(&'a ControlEvent),
}

pub async fn events(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| forward_events(socket, state))
}

async fn forward_events(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events = state.plane.subscribe();

    let snapshot = state.plane.snapshot();
    if send(&mut socket, &Frame::Snapshot(&snapshot)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            received = events.recv() => {
                let sent = match received {
                    Ok(event) => send(&mut socket, &Frame::Event(&event)).await,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!("Event subscriber lagged by {}", missed);
                        let snapshot = state.plane.snapshot();
                        send(&mut socket, &Frame::Snapshot(&snapshot)).await
                    }
                    Err(RecvError::Closed) => break,
                };
                if sent.is_err() {
                    break; // client gone
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }
}

async fn send(socket: &mut WebSocket, frame: &Frame<'_>) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(e) => {
            tracing::warn!("Event not serializable: {}", e);
            Ok(())
        }
    }
}
