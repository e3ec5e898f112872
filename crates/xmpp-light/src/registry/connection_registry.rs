//! Connection registry implementation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::{BareJid, FullJid};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::stream_errors;
use crate::metrics;
use crate::stanza::Stanza;
use crate::XmppError;

/// Items on a session's output queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Stanza(Stanza),
    /// Send a stream error and terminate the session
    Close {
        condition: &'static str,
        text: String,
    },
}

/// Out-of-band termination signal for one session.
///
/// Fires when a close request cannot be queued, so eviction never waits on
/// the session draining its output.
#[derive(Debug, Clone, Default)]
pub struct Eviction {
    token: CancellationToken,
    reason: Arc<OnceLock<(&'static str, String)>>,
}

impl Eviction {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first reason given wins.
    pub fn evict(&self, condition: &'static str, text: &str) {
        if self.reason.set((condition, text.to_string())).is_err() {
            debug!("Session already evicted");
        }
        self.token.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves with the stream error condition and text once evicted.
    pub async fn evicted(&self) -> (&'static str, String) {
        self.token.cancelled().await;
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| (stream_errors::CONFLICT, String::new()))
    }
}

/// A registered session.
#[derive(Debug)]
pub struct ConnectionEntry {
    session_id: Uuid,
    sender: mpsc::Sender<Outbound>,
    eviction: Eviction,
    closing: AtomicBool,
    exclusive: AtomicBool,
}

impl ConnectionEntry {
    pub fn new(session_id: Uuid, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            session_id,
            sender,
            eviction: Eviction::new(),
            closing: AtomicBool::new(false),
            exclusive: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn sender(&self) -> &mpsc::Sender<Outbound> {
        &self.sender
    }

    pub fn eviction(&self) -> &Eviction {
        &self.eviction
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::Relaxed)
    }
}

/// Outcome of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Queued for the session
    Sent,
    /// No session with that full JID
    NotConnected,
    /// The session is being torn down
    Closing,
    /// The queue was full, past the deadline if there was one
    Dropped,
    /// The session task is gone
    ChannelClosed,
}

/// Thread-safe map from full JID to registered session.
pub struct ConnectionRegistry {
    connections: DashMap<FullJid, ConnectionEntry>,
    delivery_timeout: Duration,
    backpressure_drops: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            delivery_timeout,
            backpressure_drops: AtomicU64::new(0),
        }
    }

    /// Register a session. Fails with a resource conflict if the full JID is
    /// already taken; the caller decides whether to evict the holder.
    ///
    /// The returned [`Eviction`] fires if the session is later evicted while
    /// its output queue is full.
    #[instrument(skip(self, sender), fields(jid = %jid))]
    pub fn register(
        &self,
        jid: FullJid,
        session_id: Uuid,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<Eviction, XmppError> {
        match self.connections.entry(jid) {
            Entry::Occupied(existing) => Err(XmppError::ResourceConflict(format!(
                "{} is already bound by session {}",
                existing.key(),
                existing.get().session_id
            ))),
            Entry::Vacant(slot) => {
                let entry = slot.insert(ConnectionEntry::new(session_id, sender));
                let eviction = entry.eviction.clone();
                drop(entry);
                metrics::record_session_count(self.connections.len() as i64);
                debug!("Registered session");
                Ok(eviction)
            }
        }
    }

    /// Session currently holding a full JID.
    pub fn session_id(&self, jid: &FullJid) -> Option<Uuid> {
        self.connections.get(jid).map(|e| e.session_id)
    }

    pub fn is_current(&self, jid: &FullJid, session_id: Uuid) -> bool {
        self.session_id(jid) == Some(session_id)
    }

    /// `session_id` holds the JID and is not tearing down.
    pub fn is_active(&self, jid: &FullJid, session_id: Uuid) -> bool {
        self.connections
            .get(jid)
            .is_some_and(|entry| entry.session_id == session_id && !entry.is_closing())
    }

    /// Stop deliveries to a session that is tearing down.
    pub fn mark_closing(&self, jid: &FullJid, session_id: Uuid) -> bool {
        match self.connections.get(jid) {
            Some(entry) if entry.session_id == session_id => {
                entry.closing.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Remove a session, but only if `session_id` still owns the JID.
    #[instrument(skip(self), fields(jid = %jid))]
    pub fn unregister(&self, jid: &FullJid, session_id: Uuid) -> Option<ConnectionEntry> {
        let removed = self
            .connections
            .remove_if(jid, |_, entry| entry.session_id == session_id)
            .map(|(_, entry)| entry);
        if removed.is_some() {
            metrics::record_session_count(self.connections.len() as i64);
            debug!("Unregistered session");
        }
        removed
    }

    /// Connected and not tearing down.
    pub fn is_connected(&self, jid: &FullJid) -> bool {
        self.connections
            .get(jid)
            .is_some_and(|entry| !entry.is_closing())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Enqueue a stanza, waiting at most the delivery deadline for space.
    pub async fn send_to(&self, jid: &FullJid, stanza: Stanza) -> SendResult {
        let sender = match self.connections.get(jid) {
            Some(entry) if entry.is_closing() => return SendResult::Closing,
            Some(entry) => entry.sender.clone(),
            None => return SendResult::NotConnected,
        };

        match sender
            .send_timeout(Outbound::Stanza(stanza), self.delivery_timeout)
            .await
        {
            Ok(()) => SendResult::Sent,
            Err(SendTimeoutError::Timeout(_)) => {
                self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
                metrics::record_backpressure_drop();
                warn!(to = %jid, "Output queue full past deadline, dropping stanza");
                SendResult::Dropped
            }
            Err(SendTimeoutError::Closed(_)) => SendResult::ChannelClosed,
        }
    }

    /// Enqueue a stanza only if the queue has room right now.
    ///
    /// Used for fan-out, where one slow recipient must not hold up the rest.
    pub fn try_send_to(&self, jid: &FullJid, stanza: Stanza) -> SendResult {
        let Some(entry) = self.connections.get(jid) else {
            return SendResult::NotConnected;
        };
        if entry.is_closing() {
            return SendResult::Closing;
        }
        match entry.sender.try_send(Outbound::Stanza(stanza)) {
            Ok(()) => SendResult::Sent,
            Err(TrySendError::Full(_)) => {
                self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
                metrics::record_backpressure_drop();
                warn!(to = %jid, "Output queue full, dropping fan-out stanza");
                SendResult::Dropped
            }
            Err(TrySendError::Closed(_)) => SendResult::ChannelClosed,
        }
    }

    /// Ask a session to terminate with a stream error.
    ///
    /// The close request goes behind whatever is already queued. If the
    /// queue has no room the session is evicted out of band instead.
    pub fn close_session(&self, entry: &ConnectionEntry, condition: &'static str, text: &str) {
        let close = Outbound::Close {
            condition,
            text: text.to_string(),
        };
        if let Err(e) = entry.sender.try_send(close) {
            debug!(session = %entry.session_id, error = %e, "Close request not queued, evicting");
            entry.eviction.evict(condition, text);
        }
    }

    /// All bound resources of a bare JID, including ones without presence.
    pub fn resources_for(&self, bare: &BareJid) -> Vec<FullJid> {
        self.connections
            .iter()
            .filter(|e| &e.key().to_bare() == bare && !e.value().is_closing())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn set_exclusive(&self, jid: &FullJid, enabled: bool) -> bool {
        match self.connections.get(jid) {
            Some(entry) => {
                entry.exclusive.store(enabled, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn is_exclusive(&self, jid: &FullJid) -> bool {
        self.connections
            .get(jid)
            .is_some_and(|entry| entry.is_exclusive())
    }

    /// Deliveries dropped because a queue stayed full.
    pub fn backpressure_drops(&self) -> u64 {
        self.backpressure_drops.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.len())
            .field("backpressure_drops", &self.backpressure_drops())
            .finish()
    }
}
