//! Peer wire protocol
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! [`WireMessage`]. A client opens with `Hello`, the server answers with
//! `Welcome`; after that either side may send device updates, the client
//! announces routes, and media flows as opaque `Audio` payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BUFFER_FRAMES, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::{ConnectError, NetworkError};

/// Bumped on incompatible changes to [`WireMessage`]
pub const PROTOCOL_VERSION: u16 = 1;

/// Capture format a client will stream with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    pub channels: u16,
    pub sample_rate: u32,
    pub buffer_size: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS,
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_FRAMES,
        }
    }
}

/// Device entry as exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDevice {
    pub name: String,
    pub is_default: bool,
}

impl WireDevice {
    pub fn new(name: impl Into<String>, is_default: bool) -> Self {
        Self {
            name: name.into(),
            is_default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Client → server, first frame of a session
    Hello {
        version: u16,
        stream: StreamParams,
        inputs: Vec<WireDevice>,
    },
    /// Server → client, answer to `Hello`
    Welcome {
        version: u16,
        outputs: Vec<WireDevice>,
    },
    /// Ask the peer to report its devices again
    ListDevices,
    /// Full replacement of the sender's device list for its role
    Devices(Vec<WireDevice>),
    /// Client → server: feed `input` into `output`
    Route { input: String, output: String },
    ClearRoute,
    Audio(Bytes),
    Bye,
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, NetworkError> {
        Ok(bincode::deserialize(data)?)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "hello",
            WireMessage::Welcome { .. } => "welcome",
            WireMessage::ListDevices => "list-devices",
            WireMessage::Devices(_) => "devices",
            WireMessage::Route { .. } => "route",
            WireMessage::ClearRoute => "clear-route",
            WireMessage::Audio(_) => "audio",
            WireMessage::Bye => "bye",
        }
    }
}

/// Normalised `ws://host:port` address of a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    url: String,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Parse `ws://host:port` or bare `host:port`
    pub fn parse(address: &str) -> Result<Self, ConnectError> {
        let invalid = || ConnectError::InvalidAddress(address.to_string());
        let trimmed = address.trim();

        let rest = match trimmed.split_once("://") {
            Some(("ws", rest)) => rest,
            Some(_) => return Err(invalid()),
            None => trimmed,
        };
        let authority = rest.strip_suffix('/').unwrap_or(rest);
        if authority.is_empty() || authority.contains('/') {
            return Err(invalid());
        }

        let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        let url = if host.contains(':') {
            format!("ws://[{}]:{}", host, port)
        } else {
            format!("ws://{}:{}", host, port)
        };
        Ok(Self {
            url,
            host: host.to_string(),
            port,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}
