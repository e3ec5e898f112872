//! MUC presence stanzas (XEP-0045).

use jid::{FullJid, Jid};
use minidom::Element;
use tracing::debug;

use crate::parser::ns;
use crate::stanza::{PresenceType, Stanza};
use crate::types::{Affiliation, Role};

/// Self-presence marker.
pub const STATUS_SELF: u16 = 110;
/// The room was created by this join.
pub const STATUS_ROOM_CREATED: u16 = 201;

/// What a presence addressed to a room means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MucPresenceAction {
    Join { nick: String, password: Option<String> },
    Leave { nick: String },
    /// Addressed to the bare room; a nickname is required
    MissingNick,
    /// Subscription, probe or error presence; ignored by rooms
    Ignored,
}

/// Classify a presence stanza whose `to` is a room JID.
pub fn parse_muc_presence(stanza: &Stanza) -> MucPresenceAction {
    let nick = match stanza.to().and_then(|to| to.resource()) {
        Some(resource) => resource.to_string(),
        None => {
            return match stanza.presence_type() {
                Some(PresenceType::Available) | Some(PresenceType::Unavailable) => {
                    MucPresenceAction::MissingNick
                }
                _ => MucPresenceAction::Ignored,
            }
        }
    };

    match stanza.presence_type() {
        Some(PresenceType::Unavailable) => MucPresenceAction::Leave { nick },
        Some(PresenceType::Available) => {
            let password = stanza
                .element()
                .get_child("x", ns::MUC)
                .and_then(|x| x.get_child("password", ns::MUC))
                .map(|p| p.text());
            debug!(nick = %nick, has_password = password.is_some(), "Parsed MUC join");
            MucPresenceAction::Join { nick, password }
        }
        _ => MucPresenceAction::Ignored,
    }
}

/// `<x xmlns='http://jabber.org/protocol/muc#user'>` with an item and status codes.
pub fn muc_user_element(affiliation: Affiliation, role: Role, statuses: &[u16]) -> Element {
    let item = Element::builder("item", ns::MUC_USER)
        .attr("affiliation", affiliation.to_string())
        .attr("role", role.to_string())
        .build();
    Element::builder("x", ns::MUC_USER)
        .append(item)
        .append_all(statuses.iter().map(|code| {
            Element::builder("status", ns::MUC_USER)
                .attr("code", code.to_string())
                .build()
        }))
        .build()
}

/// Presence announcing an occupant (`from` is `room@service/nick`).
pub fn occupant_presence(
    from: &FullJid,
    to: &FullJid,
    affiliation: Affiliation,
    role: Role,
    statuses: &[u16],
) -> Stanza {
    Stanza::presence(
        PresenceType::Available,
        &Jid::from(from.clone()),
        &Jid::from(to.clone()),
        None,
        Some(muc_user_element(affiliation, role, statuses)),
    )
}

/// Presence announcing that an occupant left.
pub fn departure_presence(
    from: &FullJid,
    to: &FullJid,
    affiliation: Affiliation,
    statuses: &[u16],
) -> Stanza {
    Stanza::presence(
        PresenceType::Unavailable,
        &Jid::from(from.clone()),
        &Jid::from(to.clone()),
        None,
        Some(muc_user_element(affiliation, Role::None, statuses)),
    )
}

/// Status codes carried by a MUC presence.
pub fn status_codes(stanza: &Stanza) -> Vec<u16> {
    stanza
        .element()
        .get_child("x", ns::MUC_USER)
        .map(|x| {
            x.children()
                .filter(|c| c.is("status", ns::MUC_USER))
                .filter_map(|c| c.attr("code").and_then(|code| code.parse().ok()))
                .collect()
        })
        .unwrap_or_default()
}
