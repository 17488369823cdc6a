//! # RemoteIO
//!
//! Control plane for routing audio between machines on a LAN.
//!
//! Every host can act as a **server** (accepting clients and playing their
//! audio into a local output device) and as a **client** (connecting to
//! servers and streaming a local input device to them) at the same time.
//! The control plane tracks who is connected, which devices exist on each
//! side, and which input feeds which output.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 HOST                                     │
//! │                                                                          │
//! │   HTTP API (ui::server)            Event stream (ui::websocket)          │
//! │          │                                   ▲                           │
//! │          ▼                                   │                           │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │                  ControlPlane (control)                            │  │
//! │  │   ┌──────────────┐   ┌───────────────┐   ┌──────────────────┐      │  │
//! │  │   │ Connection   │   │    Device     │   │    Routing       │      │  │
//! │  │   │ Registry     │   │   Inventory   │   │    Table         │      │  │
//! │  │   └──────────────┘   └───────────────┘   └──────────────────┘      │  │
//! │  │          one lock, one commit, one published Snapshot              │  │
//! │  └───────┬───────────────────────┬───────────────────────┬────────────┘  │
//! │          │                       │                       │               │
//! │          ▼                       ▼                       ▼               │
//! │  ┌───────────────┐      ┌─────────────────┐      ┌──────────────────┐    │
//! │  │ AudioServer   │      │  WsConnector    │      │  MediaDriver     │    │
//! │  │ (inbound ws)  │      │  (outbound ws)  │      │  (media)         │    │
//! │  └───────┬───────┘      └────────┬────────┘      └──────────────────┘    │
//! │          │   Links: bincode WireMessage per binary frame                 │
//! └──────────┼───────────────────────┼───────────────────────────────────────┘
//!            ▼                       ▼
//!       remote clients          remote servers
//! ```

pub mod audio;
pub mod config;
pub mod control;
pub mod error;
pub mod media;
pub mod network;
pub mod protocol;
pub mod state;
pub mod ui;

pub use control::{ControlEvent, ControlPlane};
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate advertised in the handshake
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default capture buffer in frames
    pub const DEFAULT_BUFFER_FRAMES: u32 = 4096;

    /// Default WebSocket port peers connect to
    pub const DEFAULT_WS_PORT: u16 = 8000;

    /// Default port of the HTTP control API
    pub const DEFAULT_API_PORT: u16 = 8080;

    /// Inbound handshake budget
    pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

    /// Outbound connect budget, including the handshake
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// How long a closing link may take to say goodbye
    pub const DEFAULT_CLOSE_GRACE_MS: u64 = 1_000;

    /// Local device re-enumeration period
    pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5;

    /// Buffered control events per subscriber
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
}
