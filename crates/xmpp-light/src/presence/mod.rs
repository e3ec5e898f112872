//! Presence tracking.
//!
//! [`PresenceTracker`] is the only writer of presence records. Each bare JID
//! maps to an immutable snapshot of its available resources; updates swap in
//! a new snapshot, so readers never hold a lock while fanning out.
//!
//! The tracker never delivers anything itself. Every operation returns the
//! stanzas that should be sent, already addressed to full JIDs, and the
//! router hands them to the session queues.

pub mod subscription;

pub use subscription::SubscriptionStateMachine;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use tracing::{debug, instrument};
use xmpp_parsers::presence::{Presence, Show};

use crate::registry::ConnectionRegistry;
use crate::roster::{roster_push, RosterItem, RosterStore};
use crate::stanza::{PresenceType, Stanza};
use crate::XmppError;

/// Advertised availability of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    #[default]
    Available,
    Chat,
    Away,
    Xa,
    Dnd,
}

impl Availability {
    fn from_show(show: Option<&Show>) -> Self {
        match show {
            None => Availability::Available,
            Some(Show::Chat) => Availability::Chat,
            Some(Show::Away) => Availability::Away,
            Some(Show::Xa) => Availability::Xa,
            Some(Show::Dnd) => Availability::Dnd,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Chat => "chat",
            Availability::Away => "away",
            Availability::Xa => "xa",
            Availability::Dnd => "dnd",
        }
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last available presence of one resource.
#[derive(Debug, Clone)]
pub struct ResourcePresence {
    pub jid: FullJid,
    pub availability: Availability,
    pub priority: i8,
    pub status: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Broadcast form, re-sent to contacts that ask later
    stanza: Stanza,
}

impl ResourcePresence {
    pub fn resource(&self) -> String {
        self.jid.resource().to_string()
    }

    pub fn stanza(&self) -> &Stanza {
        &self.stanza
    }
}

type Snapshot = Arc<Vec<ResourcePresence>>;

/// Presence records and the subscription flows that depend on them.
pub struct PresenceTracker {
    records: DashMap<BareJid, Snapshot>,
    roster: Arc<RosterStore>,
    registry: Arc<ConnectionRegistry>,
}

impl PresenceTracker {
    pub fn new(roster: Arc<RosterStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            records: DashMap::new(),
            roster,
            registry,
        }
    }

    pub fn roster(&self) -> &RosterStore {
        &self.roster
    }

    /// Apply an undirected available/unavailable presence from a session.
    #[instrument(skip(self, stanza), name = "xmpp.presence.update", fields(from = %from))]
    pub fn update_presence(&self, from: &FullJid, stanza: &Stanza) -> Result<Vec<Stanza>, XmppError> {
        match stanza.presence_type() {
            Some(PresenceType::Available) => self.set_available(from, stanza),
            Some(PresenceType::Unavailable) => Ok(self.set_unavailable(from, Some(stanza))),
            _ => Err(XmppError::bad_request(Some(
                "not an availability presence".to_string(),
            ))),
        }
    }

    fn set_available(&self, from: &FullJid, stanza: &Stanza) -> Result<Vec<Stanza>, XmppError> {
        let parsed = Presence::try_from(stanza.element().clone())
            .map_err(|e| XmppError::bad_request(Some(format!("invalid presence: {}", e))))?;

        let record = ResourcePresence {
            jid: from.clone(),
            availability: Availability::from_show(parsed.show.as_ref()),
            priority: parsed.priority,
            status: parsed.statuses.values().next().cloned(),
            updated_at: Utc::now(),
            stanza: stanza.clone(),
        };
        let user = from.to_bare();

        let initial = {
            let mut entry = self.records.entry(user.clone()).or_default();
            let mut next: Vec<ResourcePresence> = (**entry).clone();
            let initial = match next.iter_mut().find(|r| &r.jid == from) {
                Some(existing) => {
                    *existing = record;
                    false
                }
                None => {
                    next.push(record);
                    true
                }
            };
            *entry = Arc::new(next);
            initial
        };
        debug!(initial, "Resource available");

        let from_jid = Jid::from(from.clone());
        let mut out: Vec<Stanza> = self
            .broadcast_targets(&user, from)
            .iter()
            .map(|target| stanza.readdressed(&from_jid, &Jid::from(target.clone())))
            .collect();

        if initial {
            let to = Jid::from(from.clone());
            for contact in self.roster.subscriptions(&user) {
                for presence in self.query_availability(&contact) {
                    out.push(presence.stanza.readdressed(&Jid::from(presence.jid.clone()), &to));
                }
            }
            for request in self.roster.pending(&user) {
                out.push(Stanza::presence(
                    PresenceType::Subscribe,
                    &Jid::from(request.from.clone()),
                    &to,
                    request.status.as_deref(),
                    None,
                ));
            }
        }
        Ok(out)
    }

    fn set_unavailable(&self, from: &FullJid, stanza: Option<&Stanza>) -> Vec<Stanza> {
        let user = from.to_bare();
        {
            let Some(mut entry) = self.records.get_mut(&user) else {
                return Vec::new();
            };
            if !entry.iter().any(|r| &r.jid == from) {
                return Vec::new();
            }
            let next: Vec<ResourcePresence> =
                entry.iter().filter(|r| &r.jid != from).cloned().collect();
            *entry = Arc::new(next);
        }
        self.records.remove_if(&user, |_, snapshot| snapshot.is_empty());
        debug!("Resource unavailable");

        let from_jid = Jid::from(from.clone());
        self.broadcast_targets(&user, from)
            .iter()
            .map(|target| {
                let to = Jid::from(target.clone());
                match stanza {
                    Some(stanza) => stanza.readdressed(&from_jid, &to),
                    None => Stanza::presence(PresenceType::Unavailable, &from_jid, &to, None, None),
                }
            })
            .collect()
    }

    /// Drop a session's record and produce its implicit unavailable broadcast.
    pub fn remove_session(&self, jid: &FullJid) -> Vec<Stanza> {
        self.set_unavailable(jid, None)
    }

    /// Available resources, highest priority first; ties keep arrival order.
    pub fn query_availability(&self, user: &BareJid) -> Vec<ResourcePresence> {
        let Some(snapshot) = self.records.get(user).map(|s| Arc::clone(s.value())) else {
            return Vec::new();
        };
        let mut resources = (*snapshot).clone();
        resources.sort_by(|a, b| b.priority.cmp(&a.priority));
        resources
    }

    pub fn is_available(&self, jid: &FullJid) -> bool {
        self.records
            .get(&jid.to_bare())
            .is_some_and(|s| s.iter().any(|r| &r.jid == jid))
    }

    pub fn highest_priority(&self, user: &BareJid) -> Option<FullJid> {
        self.query_availability(user).into_iter().next().map(|r| r.jid)
    }

    /// Answer a probe with the contact's current presence, if visible.
    pub fn probe(&self, from: &FullJid, contact: &BareJid) -> Vec<Stanza> {
        let visible = &from.to_bare() == contact
            || self
                .roster
                .get(contact, &from.to_bare())
                .is_some_and(|item| item.sends_presence());
        if !visible {
            return Vec::new();
        }
        let to = Jid::from(from.clone());
        self.query_availability(contact)
            .into_iter()
            .map(|p| p.stanza.readdressed(&Jid::from(p.jid.clone()), &to))
            .collect()
    }

    /// Available resources of subscribers plus the user's other resources.
    fn broadcast_targets(&self, user: &BareJid, except: &FullJid) -> Vec<FullJid> {
        let mut targets: Vec<FullJid> = self
            .query_availability(user)
            .into_iter()
            .map(|r| r.jid)
            .filter(|jid| jid != except)
            .collect();
        for subscriber in self.roster.subscribers(user) {
            if &subscriber == user {
                continue;
            }
            targets.extend(self.query_availability(&subscriber).into_iter().map(|r| r.jid));
        }
        targets
    }

    fn available_resources(&self, user: &BareJid) -> Vec<FullJid> {
        self.query_availability(user).into_iter().map(|r| r.jid).collect()
    }

    fn roster_pushes(&self, user: &BareJid, item: &RosterItem) -> Vec<Stanza> {
        self.registry
            .resources_for(user)
            .iter()
            .map(|resource| roster_push(user, resource, item))
            .collect()
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("users", &self.records.len())
            .finish()
    }
}
