//! Rosters and subscription state (RFC 6121).
//!
//! A roster maps a user's bare JID to the contacts it has a subscription
//! relationship with. The store keeps both halves of every relationship, so
//! a `to` on one side is always mirrored by a `from` on the peer's side.
//!
//! ```xml
//! <iq type='set' id='push-1'>
//!   <query xmlns='jabber:iq:roster'>
//!     <item jid='contact@example.com' subscription='both'/>
//!   </query>
//! </iq>
//! ```

mod module;

pub use module::RosterModule;

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::parser::ns;
use crate::stanza::{IqType, Stanza};
use crate::XmppError;

/// A contact in a user's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    pub jid: BareJid,
    pub name: Option<String>,
    pub subscription: Subscription,
    /// Outbound request awaiting the contact's answer
    pub ask: Option<AskType>,
    pub groups: Vec<String>,
}

impl RosterItem {
    pub fn new(jid: BareJid) -> Self {
        Self {
            jid,
            name: None,
            subscription: Subscription::None,
            ask: None,
            groups: Vec::new(),
        }
    }

    pub fn set_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = subscription;
        self
    }

    /// Parse an `<item/>` from a roster set.
    pub fn from_element(elem: &Element) -> Result<Self, XmppError> {
        let jid_str = elem.attr("jid").ok_or_else(|| {
            XmppError::bad_request(Some("Roster item missing 'jid' attribute".to_string()))
        })?;
        let jid: BareJid = jid_str.parse().map_err(|e| {
            XmppError::jid_malformed(Some(format!("Invalid JID '{}': {}", jid_str, e)))
        })?;

        let subscription = elem
            .attr("subscription")
            .map(Subscription::parse)
            .transpose()?
            .unwrap_or(Subscription::None);

        let mut groups = Vec::new();
        let mut seen = HashSet::new();
        for group in elem
            .children()
            .filter(|c| c.name() == "group" && c.ns() == ns::ROSTER)
        {
            let name = group.text();
            if name.trim().is_empty() {
                return Err(XmppError::not_acceptable(Some(
                    "Roster group name must not be empty".to_string(),
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(XmppError::bad_request(Some(
                    "Roster group names must be unique".to_string(),
                )));
            }
            groups.push(name);
        }

        Ok(Self {
            jid,
            name: elem.attr("name").map(str::to_string),
            subscription,
            ask: None,
            groups,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("item", ns::ROSTER)
            .attr("jid", self.jid.to_string())
            .attr("subscription", self.subscription.as_str());
        if let Some(ref name) = self.name {
            builder = builder.attr("name", name);
        }
        if let Some(ask) = self.ask {
            builder = builder.attr("ask", ask.as_str());
        }
        for group in &self.groups {
            builder = builder.append(
                Element::builder("group", ns::ROSTER)
                    .append(group.as_str())
                    .build(),
            );
        }
        builder.build()
    }

    /// The user receives the contact's presence.
    pub fn receives_presence(&self) -> bool {
        matches!(self.subscription, Subscription::To | Subscription::Both)
    }

    /// The contact receives the user's presence.
    pub fn sends_presence(&self) -> bool {
        matches!(self.subscription, Subscription::From | Subscription::Both)
    }

    /// A subscription request from the user is outstanding.
    pub fn is_pending_out(&self) -> bool {
        self.ask.is_some()
    }
}

/// Subscription state of a roster item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
    /// Only valid in a roster set or push
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    pub fn parse(s: &str) -> Result<Self, XmppError> {
        match s {
            "none" => Ok(Subscription::None),
            "to" => Ok(Subscription::To),
            "from" => Ok(Subscription::From),
            "both" => Ok(Subscription::Both),
            "remove" => Ok(Subscription::Remove),
            _ => Err(XmppError::bad_request(Some(format!(
                "Invalid subscription state: {}",
                s
            )))),
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the `ask` attribute; RFC 6121 only defines `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AskType {
    Subscribe,
}

impl AskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AskType::Subscribe => "subscribe",
        }
    }
}

/// An inbound subscription request the user has not answered yet.
#[derive(Debug, Clone)]
pub struct PendingSubscription {
    pub from: BareJid,
    pub status: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl PendingSubscription {
    pub fn new(from: BareJid, status: Option<String>) -> Self {
        Self {
            from,
            status,
            received_at: Utc::now(),
        }
    }
}

/// In-memory rosters for every local user.
#[derive(Debug, Default)]
pub struct RosterStore {
    rosters: DashMap<BareJid, BTreeMap<String, RosterItem>>,
    pending: DashMap<BareJid, Vec<PendingSubscription>>,
}

impl RosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self, user: &BareJid) -> Vec<RosterItem> {
        self.rosters
            .get(user)
            .map(|roster| roster.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, user: &BareJid, contact: &BareJid) -> Option<RosterItem> {
        self.rosters
            .get(user)
            .and_then(|roster| roster.get(&contact.to_string()).cloned())
    }

    /// Add or rename a contact; subscription state is never set this way.
    pub fn upsert(&self, user: &BareJid, item: &RosterItem) -> RosterItem {
        let mut roster = self.rosters.entry(user.clone()).or_default();
        let entry = roster
            .entry(item.jid.to_string())
            .or_insert_with(|| RosterItem::new(item.jid.clone()));
        entry.name = item.name.clone();
        entry.groups = item.groups.clone();
        debug!(user = %user, contact = %item.jid, "Roster item updated");
        entry.clone()
    }

    /// Apply `change` to an item, creating it if needed, and return the result.
    pub fn update<F>(&self, user: &BareJid, contact: &BareJid, change: F) -> RosterItem
    where
        F: FnOnce(&mut RosterItem),
    {
        let mut roster = self.rosters.entry(user.clone()).or_default();
        let item = roster
            .entry(contact.to_string())
            .or_insert_with(|| RosterItem::new(contact.clone()));
        change(item);
        item.clone()
    }

    pub fn remove(&self, user: &BareJid, contact: &BareJid) -> Option<RosterItem> {
        self.rosters
            .get_mut(user)
            .and_then(|mut roster| roster.remove(&contact.to_string()))
    }

    /// Contacts that receive `user`'s presence (`from` or `both`).
    pub fn subscribers(&self, user: &BareJid) -> Vec<BareJid> {
        self.filtered(user, RosterItem::sends_presence)
    }

    /// Contacts whose presence `user` receives (`to` or `both`).
    pub fn subscriptions(&self, user: &BareJid) -> Vec<BareJid> {
        self.filtered(user, RosterItem::receives_presence)
    }

    fn filtered(&self, user: &BareJid, keep: fn(&RosterItem) -> bool) -> Vec<BareJid> {
        self.rosters
            .get(user)
            .map(|roster| {
                roster
                    .values()
                    .filter(|item| keep(item))
                    .map(|item| item.jid.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remember an inbound request; a repeated request replaces the old one.
    pub fn add_pending(&self, user: &BareJid, request: PendingSubscription) {
        let mut pending = self.pending.entry(user.clone()).or_default();
        pending.retain(|p| p.from != request.from);
        pending.push(request);
    }

    pub fn take_pending_from(&self, user: &BareJid, from: &BareJid) -> Option<PendingSubscription> {
        let mut pending = self.pending.get_mut(user)?;
        let index = pending.iter().position(|p| &p.from == from)?;
        Some(pending.remove(index))
    }

    pub fn pending(&self, user: &BareJid) -> Vec<PendingSubscription> {
        self.pending
            .get(user)
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

/// `<query xmlns='jabber:iq:roster'/>` holding the given items.
pub fn roster_query(items: &[RosterItem]) -> Element {
    Element::builder("query", ns::ROSTER)
        .append_all(items.iter().map(RosterItem::to_element))
        .build()
}

/// Roster push to one connected resource of `user`.
pub fn roster_push(user: &BareJid, resource: &FullJid, item: &RosterItem) -> Stanza {
    Stanza::iq(
        IqType::Set,
        &format!("push-{}", Uuid::new_v4().simple()),
        &Jid::from(user.clone()),
        &Jid::from(resource.clone()),
        roster_query(std::slice::from_ref(item)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_element;

    fn bare(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    #[test]
    fn test_item_from_element() {
        let elem = parse_element(
            "<item xmlns='jabber:iq:roster' jid='bob@example.com' name='Bob'><group>Friends</group></item>",
        )
        .unwrap();
        let item = RosterItem::from_element(&elem).unwrap();
        assert_eq!(item.jid, bare("bob@example.com"));
        assert_eq!(item.name.as_deref(), Some("Bob"));
        assert_eq!(item.groups, vec!["Friends".to_string()]);
        assert_eq!(item.subscription, Subscription::None);
    }

    #[test]
    fn test_duplicate_groups_rejected() {
        let elem = parse_element(
            "<item xmlns='jabber:iq:roster' jid='bob@example.com'><group>A</group><group>A</group></item>",
        )
        .unwrap();
        assert!(RosterItem::from_element(&elem).is_err());
    }

    #[test]
    fn test_upsert_keeps_subscription() {
        let store = RosterStore::new();
        let alice = bare("alice@example.com");
        let bob = bare("bob@example.com");
        store.update(&alice, &bob, |item| item.subscription = Subscription::Both);

        let mut renamed = RosterItem::new(bob.clone());
        renamed.name = Some("Bobby".to_string());
        renamed.subscription = Subscription::None;
        let stored = store.upsert(&alice, &renamed);

        assert_eq!(stored.subscription, Subscription::Both);
        assert_eq!(stored.name.as_deref(), Some("Bobby"));
        assert_eq!(store.subscribers(&alice), vec![bob.clone()]);
        assert_eq!(store.subscriptions(&alice), vec![bob]);
    }

    #[test]
    fn test_pending_requests_replace_duplicates() {
        let store = RosterStore::new();
        let bob = bare("bob@example.com");
        let alice = bare("alice@example.com");
        store.add_pending(&bob, PendingSubscription::new(alice.clone(), None));
        store.add_pending(&bob, PendingSubscription::new(alice.clone(), Some("hi".into())));

        assert_eq!(store.pending(&bob).len(), 1);
        let taken = store.take_pending_from(&bob, &alice).unwrap();
        assert_eq!(taken.status.as_deref(), Some("hi"));
        assert!(store.pending(&bob).is_empty());
    }

    #[test]
    fn test_item_element_carries_ask() {
        let mut item = RosterItem::new(bare("bob@example.com"));
        item.ask = Some(AskType::Subscribe);
        let elem = item.to_element();
        assert_eq!(elem.attr("ask"), Some("subscribe"));
        assert_eq!(elem.attr("subscription"), Some("none"));
    }
}
