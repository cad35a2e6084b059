//! Connection registry.
//!
//! Tracks which full JIDs are bound to live connections, owns the bind
//! conflict check, and notifies interested components when a client goes
//! away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use jid::{BareJid, FullJid};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stanza::Stanza;
use crate::XmppError;

/// A stanza queued for delivery to a connection's writer.
#[derive(Debug, Clone)]
pub struct OutboundStanza {
    /// The stanza to write.
    pub stanza: Stanza,
}

impl OutboundStanza {
    /// Wrap a stanza for the outbound channel.
    pub fn new(stanza: Stanza) -> Self {
        Self { stanza }
    }
}

/// Result of attempting to hand a stanza to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Queued for delivery.
    Sent,
    /// No connection is bound to that JID.
    NotConnected,
    /// The connection's outbound channel is full; the stanza was dropped.
    ChannelFull,
    /// The connection's outbound channel is gone.
    ChannelClosed,
}

/// Identifies one disconnect listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked when a watched client disconnects.
pub type DisconnectCallback = Arc<dyn Fn(&FullJid) + Send + Sync>;

struct DisconnectListener {
    id: ListenerId,
    jid: FullJid,
    callback: DisconnectCallback,
}

/// Registry of bound client connections.
///
/// Claiming a full JID is atomic, which is what makes the bind conflict
/// check race-free: of two clients requesting the same resource, exactly one
/// `register` succeeds.
pub struct ConnectionRegistry {
    connections: DashMap<FullJid, mpsc::Sender<OutboundStanza>>,
    listeners: Mutex<Vec<DisconnectListener>>,
    next_listener_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Claim a full JID for a connection.
    ///
    /// Fails with `BindConflict` when the JID is already bound.
    pub fn register(
        &self,
        jid: FullJid,
        sender: mpsc::Sender<OutboundStanza>,
    ) -> Result<(), XmppError> {
        use dashmap::mapref::entry::Entry;

        let label = jid.to_string();
        match self.connections.entry(jid) {
            Entry::Occupied(_) => Err(XmppError::BindConflict(label)),
            Entry::Vacant(entry) => {
                entry.insert(sender);
                debug!(jid = %label, "connection registered");
                Ok(())
            }
        }
    }

    /// Release a full JID and fire its disconnect listeners.
    ///
    /// Safe to call more than once; releasing an unknown JID is a no-op.
    pub fn unregister(&self, jid: &FullJid) -> bool {
        if self.connections.remove(jid).is_none() {
            debug!(jid = %jid, "connection was not registered");
            return false;
        }
        debug!(jid = %jid, "connection unregistered");
        self.notify_disconnect(jid);
        true
    }

    /// Whether a full JID is currently bound.
    pub fn is_bound(&self, jid: &FullJid) -> bool {
        self.connections.contains_key(jid)
    }

    /// Number of bound connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// All currently bound full JIDs.
    pub fn bound_jids(&self) -> Vec<FullJid> {
        self.connections.iter().map(|r| r.key().clone()).collect()
    }

    /// All bound resources for a bare JID.
    pub fn resources_for(&self, bare: &BareJid) -> Vec<FullJid> {
        self.connections
            .iter()
            .filter(|r| r.key().to_bare() == *bare)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Queue a stanza for a bound connection.
    ///
    /// Best-effort and non-blocking: a full channel drops the stanza rather
    /// than throttling the sender. A closed channel removes the stale entry.
    pub fn send_to(&self, jid: &FullJid, stanza: Stanza) -> SendResult {
        let sender = match self.connections.get(jid) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(to = %jid, "recipient not connected");
                return SendResult::NotConnected;
            }
        };

        match sender.try_send(OutboundStanza::new(stanza)) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(to = %jid, "outbound channel full, stanza dropped");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(to = %jid, "outbound channel closed, removing stale entry");
                self.connections.remove(jid);
                SendResult::ChannelClosed
            }
        }
    }

    /// Watch a full JID for disconnection.
    ///
    /// The callback fires once, when the JID is unregistered, and the
    /// listener is removed afterwards. The returned id can cancel the watch
    /// early.
    pub fn add_disconnect_listener(
        &self,
        jid: FullJid,
        callback: DisconnectCallback,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners_lock().push(DisconnectListener { id, jid, callback });
        id
    }

    /// Cancel a disconnect watch. Unknown ids warn and no-op.
    pub fn remove_disconnect_listener(&self, id: ListenerId) {
        let mut listeners = self.listeners_lock();
        match listeners.iter().position(|l| l.id == id) {
            Some(index) => {
                listeners.remove(index);
            }
            None => warn!(?id, "attempted to remove non-existent disconnect listener"),
        }
    }

    fn listeners_lock(&self) -> std::sync::MutexGuard<'_, Vec<DisconnectListener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fire and drop all listeners watching this JID.
    ///
    /// Listeners are collected under the lock but invoked outside it, so a
    /// listener may call back into the registry.
    fn notify_disconnect(&self, jid: &FullJid) {
        let mut fired = Vec::new();
        {
            let mut listeners = self.listeners_lock();
            let mut index = 0;
            while index < listeners.len() {
                if listeners[index].jid == *jid {
                    fired.push(listeners.remove(index));
                } else {
                    index += 1;
                }
            }
        }
        for listener in fired {
            (listener.callback)(jid);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}
