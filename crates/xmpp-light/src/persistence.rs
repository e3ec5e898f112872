//! Message persistence hook.
//!
//! The router hands undeliverable (or, in `All` mode, every) chat and normal
//! message to a [`MessageStore`]. Storage failures are the store's problem:
//! the router logs them and carries on.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jid::Jid;

use crate::stanza::Stanza;
use crate::XmppError;

/// What a store receives for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    pub from: String,
    pub to: String,
    pub id: Option<String>,
    pub message_type: String,
    pub body: Option<String>,
    /// Whole stanza as sent
    pub stanza_xml: String,
    pub timestamp: DateTime<Utc>,
}

impl PersistedMessage {
    pub fn from_stanza(stanza: &Stanza, from: &Jid, to: &Jid) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            id: stanza.id().map(String::from),
            message_type: stanza.message_type().as_str().to_string(),
            body: stanza.body(),
            stanza_xml: stanza.to_xml(),
            timestamp: Utc::now(),
        }
    }
}

/// Durable storage for messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, message: &PersistedMessage) -> Result<(), XmppError>;
}

/// Keeps saved messages in memory.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<Vec<PersistedMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<PersistedMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save(&self, message: &PersistedMessage) -> Result<(), XmppError> {
        self.messages
            .lock()
            .map_err(|_| XmppError::persistence("message store lock poisoned"))?
            .push(message.clone());
        Ok(())
    }
}
