//! MUC message helpers: history, delay stamps, subjects and invitations.

use chrono::{DateTime, SecondsFormat, Utc};
use jid::{BareJid, FullJid, Jid};
use minidom::Element;

use crate::parser::ns;
use crate::stanza::{MessageType, Stanza};

/// A groupchat message kept for late joiners.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Broadcast form, `from` is `room@service/nick`
    pub stanza: Stanza,
    pub stamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(stanza: Stanza) -> Self {
        Self {
            stanza,
            stamp: Utc::now(),
        }
    }

    /// Replay to a joiner with an `urn:xmpp:delay` stamp.
    pub fn replay(&self, room: &BareJid, to: &FullJid) -> Stanza {
        let from = self
            .stanza
            .from()
            .cloned()
            .unwrap_or_else(|| Jid::from(room.clone()));
        self.stanza
            .readdressed(&from, &Jid::from(to.clone()))
            .with_children(vec![delay_element(room, self.stamp)])
    }
}

/// `<delay xmlns='urn:xmpp:delay' from='room@service' stamp='...'/>`
pub fn delay_element(from: &BareJid, stamp: DateTime<Utc>) -> Element {
    Element::builder("delay", ns::DELAY)
        .attr("from", from.to_string())
        .attr("stamp", stamp.to_rfc3339_opts(SecondsFormat::Millis, true))
        .build()
}

/// Room subject message sent at the end of a join.
pub fn subject_message(from: &Jid, to: &FullJid, subject: Option<&str>) -> Stanza {
    let mut subject_el = Element::builder("subject", ns::JABBER_CLIENT);
    if let Some(text) = subject {
        subject_el = subject_el.append(text);
    }
    Stanza::message(
        MessageType::Groupchat,
        from,
        &Jid::from(to.clone()),
        vec![subject_el.build()],
    )
}

/// A mediated invitation found in a message to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub to: BareJid,
    pub reason: Option<String>,
}

/// Extract `<x xmlns='muc#user'><invite to='...'/></x>`.
///
/// Returns `None` if the message carries no invitation and `Some(Err(..))`
/// for an invitation without a usable `to`.
pub fn parse_invite(stanza: &Stanza) -> Option<Result<Invite, String>> {
    let invite = stanza
        .element()
        .get_child("x", ns::MUC_USER)?
        .get_child("invite", ns::MUC_USER)?;
    let Some(to) = invite.attr("to") else {
        return Some(Err("invite without 'to'".to_string()));
    };
    let to = match to.parse::<BareJid>() {
        Ok(to) => to,
        Err(e) => return Some(Err(format!("invalid invitee '{}': {}", to, e))),
    };
    let reason = invite
        .get_child("reason", ns::MUC_USER)
        .map(|r| r.text())
        .filter(|r| !r.is_empty());
    Some(Ok(Invite { to, reason }))
}

/// Invitation forwarded from the room to the invitee.
pub fn invite_message(room: &BareJid, inviter: &BareJid, invite: &Invite) -> Stanza {
    let mut invite_el = Element::builder("invite", ns::MUC_USER).attr("from", inviter.to_string());
    if let Some(ref reason) = invite.reason {
        invite_el = invite_el.append(
            Element::builder("reason", ns::MUC_USER)
                .append(reason.as_str())
                .build(),
        );
    }
    let x = Element::builder("x", ns::MUC_USER)
        .append(invite_el.build())
        .build();
    Stanza::message(
        MessageType::Normal,
        &Jid::from(room.clone()),
        &Jid::from(invite.to.clone()),
        vec![x],
    )
}
