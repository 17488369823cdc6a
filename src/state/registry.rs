//! Connection registry
//!
//! An arena indexed by [`ConnectionId`]. Ids are handed out in increasing
//! order and never reused; a removed entry leaves a tombstone so the
//! position of every later entry stays put. Leading tombstones are dropped
//! to keep a long-running server from growing without bound.

use chrono::Utc;
use std::collections::VecDeque;
use tokio::sync::oneshot;

use crate::network::{Link, LinkSender};
use crate::protocol::{ConnectionId, ConnectionInfo, ConnectionState, Role};

/// Registry slot for one connection
pub struct Entry {
    pub info: ConnectionInfo,
    /// Present while the transport is owned by the registry
    pub link: Option<Link>,
    /// Fires the in-flight handshake's cancellation while `Connecting`
    cancel: Option<oneshot::Sender<()>>,
    /// Remote output chosen for an outbound link
    pub preferred_output: Option<String>,
}

impl Entry {
    pub fn sender(&self) -> Option<LinkSender> {
        self.link.as_ref().map(Link::sender)
    }
}

pub struct ConnectionRegistry {
    /// Id of `slots[0]`
    base: u64,
    slots: VecDeque<Option<Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            base: 1,
            slots: VecDeque::new(),
        }
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.base + self.slots.len() as u64)
    }

    fn index(&self, id: ConnectionId) -> Option<usize> {
        id.0.checked_sub(self.base).map(|i| i as usize)
    }

    /// Reserve the next id for a handshake in progress
    pub fn reserve(
        &mut self,
        role: Role,
        endpoint: &str,
        cancel: oneshot::Sender<()>,
    ) -> ConnectionId {
        let id = self.next_id();
        self.slots.push_back(Some(Entry {
            info: ConnectionInfo {
                id,
                role,
                endpoint: endpoint.to_string(),
                state: ConnectionState::Connecting,
                opened_at: Utc::now(),
            },
            link: None,
            cancel: Some(cancel),
            preferred_output: None,
        }));
        id
    }

    /// Promote a `Connecting` entry to `Active`, handing it the transport.
    /// Gives the link back when the reservation is gone.
    pub fn activate(&mut self, id: ConnectionId, mut link: Link) -> Result<&ConnectionInfo, Link> {
        match self.get_mut(id) {
            Some(entry) if entry.info.state == ConnectionState::Connecting => {
                link.release();
                entry.info.state = ConnectionState::Active;
                entry.info.opened_at = Utc::now();
                entry.cancel = None;
                entry.link = Some(link);
                Ok(&entry.info)
            }
            _ => Err(link),
        }
    }

    /// Abort a `Connecting` entry: fire its cancel signal and tombstone it
    pub fn cancel(&mut self, id: ConnectionId) -> bool {
        match self.get_mut(id) {
            Some(entry) if entry.info.state == ConnectionState::Connecting => {
                if let Some(cancel) = entry.cancel.take() {
                    let _ = cancel.send(());
                }
                self.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Move an `Active` entry to `Disconnecting` and take its transport
    pub fn begin_disconnect(&mut self, id: ConnectionId) -> Option<Link> {
        let entry = self.get_mut(id)?;
        if entry.info.state != ConnectionState::Active {
            return None;
        }
        entry.info.state = ConnectionState::Disconnecting;
        entry.link.take()
    }

    /// Tombstone an entry, returning it with its state set to `Closed`
    pub fn remove(&mut self, id: ConnectionId) -> Option<Entry> {
        let index = self.index(id)?;
        let mut entry = self.slots.get_mut(index)?.take()?;
        entry.info.state = ConnectionState::Closed;

        while matches!(self.slots.front(), Some(None)) {
            self.slots.pop_front();
            self.base += 1;
        }
        Some(entry)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Entry> {
        self.slots.get(self.index(id)?)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Entry> {
        let index = self.index(id)?;
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn state_of(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.get(id).map(|e| e.info.state)
    }

    /// Live entries in id order
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.slots.iter_mut().flatten()
    }

    /// Live entry for the same peer in the same role, if any
    pub fn find_endpoint(&self, role: Role, endpoint: &str) -> Option<&Entry> {
        self.iter()
            .find(|e| e.info.role == role && e.info.endpoint == endpoint)
    }

    /// Committed connections (everything past `Connecting`)
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.iter()
            .filter(|e| e.info.state != ConnectionState::Connecting)
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn pending(&self) -> Vec<ConnectionInfo> {
        self.iter()
            .filter(|e| e.info.state == ConnectionState::Connecting)
            .map(|e| e.info.clone())
            .collect()
    }

    /// Senders of active links in one role
    pub fn senders(&self, role: Role) -> Vec<LinkSender> {
        self.iter()
            .filter(|e| e.info.role == role && e.info.state == ConnectionState::Active)
            .filter_map(Entry::sender)
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
