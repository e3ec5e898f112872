//! Presence subscription flows (RFC 6121 section 3).
//!
//! State transitions applied to a user's roster item:
//!
//! On outbound `subscribe`: ask=subscribe, subscription unchanged.
//!
//! On inbound `subscribed`: none -> to, from -> both, ask cleared.
//!
//! On outbound `subscribed`: none -> from, to -> both.
//!
//! On outbound `unsubscribe`: to -> none, both -> from, ask cleared.
//!
//! On inbound `unsubscribe`: from -> none, both -> to.
//!
//! On outbound `unsubscribed`: from -> none, both -> to.
//!
//! On inbound `unsubscribed`: to -> none, both -> from, ask cleared.
//!
//! Every flow updates both users' rosters in the same call, so the relation
//! stays symmetric: `a` has `to` for `b` exactly when `b` has `from` for `a`.

use jid::{BareJid, FullJid, Jid};
use tracing::{debug, instrument};

use super::PresenceTracker;
use crate::roster::{AskType, PendingSubscription, RosterItem, Subscription};
use crate::stanza::{PresenceType, Stanza};

/// Pure transitions on a single roster item.
#[derive(Debug, Clone)]
pub struct SubscriptionStateMachine;

impl SubscriptionStateMachine {
    pub fn apply_outbound_subscribe(item: &mut RosterItem) {
        item.ask = Some(AskType::Subscribe);
    }

    pub fn apply_inbound_subscribed(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::None | Subscription::Remove | Subscription::To => Subscription::To,
            Subscription::From | Subscription::Both => Subscription::Both,
        };
        item.ask = None;
    }

    pub fn apply_outbound_subscribed(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::None | Subscription::Remove | Subscription::From => Subscription::From,
            Subscription::To | Subscription::Both => Subscription::Both,
        };
    }

    pub fn apply_outbound_unsubscribe(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::To | Subscription::None | Subscription::Remove => Subscription::None,
            Subscription::Both | Subscription::From => Subscription::From,
        };
        item.ask = None;
    }

    pub fn apply_inbound_unsubscribe(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::From | Subscription::None | Subscription::Remove => Subscription::None,
            Subscription::Both | Subscription::To => Subscription::To,
        };
    }

    pub fn apply_outbound_unsubscribed(item: &mut RosterItem) {
        Self::apply_inbound_unsubscribe(item);
    }

    pub fn apply_inbound_unsubscribed(item: &mut RosterItem) {
        Self::apply_outbound_unsubscribe(item);
    }
}

impl PresenceTracker {
    /// `from` asks to receive `to`'s presence.
    #[instrument(skip(self, status), name = "xmpp.presence.subscribe", fields(from = %from, to = %to))]
    pub fn subscribe(&self, from: &BareJid, to: &BareJid, status: Option<String>) -> Vec<Stanza> {
        let mut out = Vec::new();

        if self
            .roster()
            .get(to, from)
            .is_some_and(|item| item.sends_presence())
        {
            // Already approved: answer on the contact's behalf.
            for resource in self.available_resources(from) {
                out.push(subscription_presence(PresenceType::Subscribed, to, &resource, None));
            }
            return out;
        }

        let item = self
            .roster()
            .update(from, to, SubscriptionStateMachine::apply_outbound_subscribe);
        out.extend(self.roster_pushes(from, &item));

        self.roster()
            .add_pending(to, PendingSubscription::new(from.clone(), status.clone()));
        for resource in self.available_resources(to) {
            out.push(subscription_presence(
                PresenceType::Subscribe,
                from,
                &resource,
                status.as_deref(),
            ));
        }
        debug!(delivered = out.len(), "Subscription request recorded");
        out
    }

    /// `approver` accepts a pending request from `requester`.
    #[instrument(skip(self), name = "xmpp.presence.approve", fields(approver = %approver, requester = %requester))]
    pub fn approve(&self, approver: &BareJid, requester: &BareJid) -> Vec<Stanza> {
        if self
            .roster()
            .take_pending_from(approver, requester)
            .is_none()
        {
            debug!("No pending request, ignoring approval");
            return Vec::new();
        }

        let mine = self
            .roster()
            .update(approver, requester, SubscriptionStateMachine::apply_outbound_subscribed);
        let theirs = self
            .roster()
            .update(requester, approver, SubscriptionStateMachine::apply_inbound_subscribed);

        let mut out = self.roster_pushes(approver, &mine);
        out.extend(self.roster_pushes(requester, &theirs));

        let requester_resources = self.available_resources(requester);
        for resource in &requester_resources {
            out.push(subscription_presence(PresenceType::Subscribed, approver, resource, None));
        }
        for presence in self.query_availability(approver) {
            let from = Jid::from(presence.jid.clone());
            for resource in &requester_resources {
                out.push(presence.stanza().readdressed(&from, &Jid::from(resource.clone())));
            }
        }
        out
    }

    /// `denier` refuses or revokes `other`'s subscription.
    #[instrument(skip(self), name = "xmpp.presence.deny", fields(denier = %denier, other = %other))]
    pub fn deny(&self, denier: &BareJid, other: &BareJid) -> Vec<Stanza> {
        let had_pending = self.roster().take_pending_from(denier, other).is_some();
        let was_sending = self
            .roster()
            .get(denier, other)
            .is_some_and(|item| item.sends_presence());
        if !had_pending && !was_sending {
            return Vec::new();
        }

        let mut out = Vec::new();
        if self.roster().get(denier, other).is_some() {
            let mine = self
                .roster()
                .update(denier, other, SubscriptionStateMachine::apply_outbound_unsubscribed);
            out.extend(self.roster_pushes(denier, &mine));
        }
        if self.roster().get(other, denier).is_some() {
            let theirs = self
                .roster()
                .update(other, denier, SubscriptionStateMachine::apply_inbound_unsubscribed);
            out.extend(self.roster_pushes(other, &theirs));
        }

        let other_resources = self.available_resources(other);
        for resource in &other_resources {
            out.push(subscription_presence(PresenceType::Unsubscribed, denier, resource, None));
        }
        if was_sending {
            out.extend(self.unavailable_between(denier, &other_resources));
        }
        out
    }

    /// `from` stops receiving `to`'s presence.
    #[instrument(skip(self), name = "xmpp.presence.unsubscribe", fields(from = %from, to = %to))]
    pub fn unsubscribe(&self, from: &BareJid, to: &BareJid) -> Vec<Stanza> {
        let Some(item) = self.roster().get(from, to) else {
            return Vec::new();
        };
        let was_receiving = item.receives_presence();

        let mine = self
            .roster()
            .update(from, to, SubscriptionStateMachine::apply_outbound_unsubscribe);
        let mut out = self.roster_pushes(from, &mine);
        if self.roster().get(to, from).is_some() {
            let theirs = self
                .roster()
                .update(to, from, SubscriptionStateMachine::apply_inbound_unsubscribe);
            out.extend(self.roster_pushes(to, &theirs));
        }
        self.roster().take_pending_from(to, from);

        for resource in self.available_resources(to) {
            out.push(subscription_presence(PresenceType::Unsubscribe, from, &resource, None));
        }
        if was_receiving {
            let from_resources = self.available_resources(from);
            out.extend(self.unavailable_between(to, &from_resources));
        }
        out
    }

    /// Unavailable presence from each resource of `user` to every target.
    fn unavailable_between(&self, user: &BareJid, targets: &[FullJid]) -> Vec<Stanza> {
        let mut out = Vec::new();
        for presence in self.query_availability(user) {
            let from = Jid::from(presence.jid.clone());
            for target in targets {
                out.push(Stanza::presence(
                    PresenceType::Unavailable,
                    &from,
                    &Jid::from(target.clone()),
                    None,
                    None,
                ));
            }
        }
        out
    }
}

fn subscription_presence(
    type_: PresenceType,
    from: &BareJid,
    to: &FullJid,
    status: Option<&str>,
) -> Stanza {
    Stanza::presence(
        type_,
        &Jid::from(from.clone()),
        &Jid::from(to.clone()),
        status,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_element;
    use crate::registry::ConnectionRegistry;
    use crate::roster::RosterStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(
            Arc::new(RosterStore::new()),
            Arc::new(ConnectionRegistry::new(Duration::from_millis(10))),
        )
    }

    fn bare(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    fn online(t: &PresenceTracker, jid: &str) {
        let stanza =
            Stanza::from_element(parse_element("<presence xmlns='jabber:client'/>").unwrap()).unwrap();
        t.update_presence(&jid.parse().unwrap(), &stanza).unwrap();
    }

    fn subscription(t: &PresenceTracker, user: &str, contact: &str) -> Option<Subscription> {
        t.roster().get(&bare(user), &bare(contact)).map(|i| i.subscription)
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut item = RosterItem::new(bare("bob@example.com"));
        SubscriptionStateMachine::apply_outbound_subscribe(&mut item);
        assert_eq!(item.ask, Some(AskType::Subscribe));
        SubscriptionStateMachine::apply_inbound_subscribed(&mut item);
        assert_eq!(item.subscription, Subscription::To);
        assert_eq!(item.ask, None);
        SubscriptionStateMachine::apply_outbound_subscribed(&mut item);
        assert_eq!(item.subscription, Subscription::Both);
        SubscriptionStateMachine::apply_outbound_unsubscribe(&mut item);
        assert_eq!(item.subscription, Subscription::From);
        SubscriptionStateMachine::apply_outbound_unsubscribed(&mut item);
        assert_eq!(item.subscription, Subscription::None);
    }

    #[test]
    fn test_subscribe_then_approve_is_symmetric() {
        let t = tracker();
        let alice = bare("alice@example.com");
        let bob = bare("bob@example.com");
        online(&t, "bob@example.com/r1");

        let out = t.subscribe(&alice, &bob, Some("hi".to_string()));
        assert!(out
            .iter()
            .any(|s| s.type_attr() == Some("subscribe") && s.to().unwrap().to_string() == "bob@example.com/r1"));
        assert_eq!(t.roster().get(&alice, &bob).unwrap().ask, Some(AskType::Subscribe));

        t.approve(&bob, &alice);
        assert_eq!(subscription(&t, "alice@example.com", "bob@example.com"), Some(Subscription::To));
        assert_eq!(subscription(&t, "bob@example.com", "alice@example.com"), Some(Subscription::From));
        assert!(t.roster().pending(&bob).is_empty());
    }

    #[test]
    fn test_request_to_offline_contact_stays_pending() {
        let t = tracker();
        let alice = bare("alice@example.com");
        let bob = bare("bob@example.com");

        let out = t.subscribe(&alice, &bob, None);
        assert!(out.iter().all(|s| s.type_attr() != Some("subscribe")));
        assert_eq!(t.roster().pending(&bob).len(), 1);

        let stanza =
            Stanza::from_element(parse_element("<presence xmlns='jabber:client'/>").unwrap()).unwrap();
        let delivered = t
            .update_presence(&"bob@example.com/r1".parse().unwrap(), &stanza)
            .unwrap();
        assert!(delivered.iter().any(|s| s.type_attr() == Some("subscribe")
            && s.from().unwrap().to_string() == "alice@example.com"));
    }

    #[test]
    fn test_approve_without_request_is_ignored() {
        let t = tracker();
        assert!(t.approve(&bare("bob@example.com"), &bare("alice@example.com")).is_empty());
        assert!(t.roster().items(&bare("bob@example.com")).is_empty());
    }

    #[test]
    fn test_unsubscribe_updates_both_sides() {
        let t = tracker();
        let alice = bare("alice@example.com");
        let bob = bare("bob@example.com");
        t.subscribe(&alice, &bob, None);
        t.approve(&bob, &alice);

        t.unsubscribe(&alice, &bob);
        assert_eq!(subscription(&t, "alice@example.com", "bob@example.com"), Some(Subscription::None));
        assert_eq!(subscription(&t, "bob@example.com", "alice@example.com"), Some(Subscription::None));
    }

    #[test]
    fn test_deny_pending_request() {
        let t = tracker();
        let alice = bare("alice@example.com");
        let bob = bare("bob@example.com");
        online(&t, "alice@example.com/r1");
        t.subscribe(&alice, &bob, None);

        let out = t.deny(&bob, &alice);
        assert!(out.iter().any(|s| s.type_attr() == Some("unsubscribed")));
        let item = t.roster().get(&alice, &bob).unwrap();
        assert_eq!(item.subscription, Subscription::None);
        assert_eq!(item.ask, None);
    }

    #[test]
    fn test_repeat_subscribe_after_approval_is_auto_answered() {
        let t = tracker();
        let alice = bare("alice@example.com");
        let bob = bare("bob@example.com");
        t.subscribe(&alice, &bob, None);
        t.approve(&bob, &alice);
        online(&t, "alice@example.com/r1");

        let out = t.subscribe(&alice, &bob, None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].type_attr(), Some("subscribed"));
        assert!(t.roster().pending(&bob).is_empty());
    }
}
