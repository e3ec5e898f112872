//! Multi-User Chat (XEP-0045).
//!
//! A [`MucRoom`] is plain state plus the rules for changing it. Each room
//! sits behind its own lock in the [`MucRoomRegistry`], which makes the room
//! manager the only writer of membership. Room operations return the stanzas
//! to deliver, addressed to occupants' real JIDs, in the order they must be
//! sent.

pub mod messages;
pub mod presence;
mod room_registry;

pub use room_registry::MucRoomRegistry;

use std::collections::{HashMap, HashSet, VecDeque};

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::parser::ns;
use crate::stanza::{MessageType, Stanza};
use crate::types::{Affiliation, Role, RoomType};
use crate::XmppError;
use messages::{subject_message, HistoryEntry, Invite};
use presence::{departure_presence, occupant_presence, STATUS_ROOM_CREATED, STATUS_SELF};

/// Room configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Human-readable name
    pub name: String,
    pub room_type: RoomType,
    /// Kept after the last occupant leaves
    pub persistent: bool,
    /// Maximum number of occupants (0 = unlimited)
    pub max_occupants: usize,
    /// Messages replayed to joiners
    pub history_size: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            room_type: RoomType::Public,
            persistent: false,
            max_occupants: 0,
            history_size: 20,
        }
    }
}

/// A user currently in the room.
#[derive(Debug, Clone)]
pub struct Occupant {
    pub real_jid: FullJid,
    pub nick: String,
    pub role: Role,
    pub affiliation: Affiliation,
}

#[derive(Debug, Clone)]
struct Subject {
    text: String,
    /// Nickname of whoever set it
    by: Option<String>,
}

/// State of one room.
#[derive(Debug)]
pub struct MucRoom {
    pub room_jid: BareJid,
    pub config: RoomConfig,
    /// Join order
    occupants: Vec<Occupant>,
    affiliations: HashMap<BareJid, Affiliation>,
    invitations: HashSet<BareJid>,
    history: VecDeque<HistoryEntry>,
    subject: Option<Subject>,
    /// Set when the registry has dropped the room
    closed: bool,
}

impl MucRoom {
    pub fn new(room_jid: BareJid, config: RoomConfig) -> Self {
        Self {
            room_jid,
            config,
            occupants: Vec::new(),
            affiliations: HashMap::new(),
            invitations: HashSet::new(),
            history: VecDeque::new(),
            subject: None,
            closed: false,
        }
    }

    pub fn occupants(&self) -> &[Occupant] {
        &self.occupants
    }

    pub fn occupant_count(&self) -> usize {
        self.occupants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupants.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.config.max_occupants != 0 && self.occupants.len() >= self.config.max_occupants
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub fn occupant_by_nick(&self, nick: &str) -> Option<&Occupant> {
        self.occupants.iter().find(|o| o.nick == nick)
    }

    pub fn occupant_by_real(&self, real_jid: &FullJid) -> Option<&Occupant> {
        self.occupants.iter().find(|o| &o.real_jid == real_jid)
    }

    pub fn set_affiliation(&mut self, jid: BareJid, affiliation: Affiliation) {
        if affiliation == Affiliation::None {
            self.affiliations.remove(&jid);
        } else {
            self.affiliations.insert(jid, affiliation);
        }
    }

    pub fn affiliation_of(&self, jid: &BareJid) -> Affiliation {
        self.affiliations
            .get(jid)
            .copied()
            .unwrap_or(Affiliation::None)
    }

    pub fn is_invited(&self, jid: &BareJid) -> bool {
        self.invitations.contains(jid)
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_ref().map(|s| s.text.as_str())
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn occupant_jid(&self, nick: &str) -> Result<FullJid, XmppError> {
        self.room_jid
            .with_resource_str(nick)
            .map_err(|e| XmppError::jid_malformed(Some(format!("invalid nickname '{}': {}", nick, e))))
    }

    /// Admit `real_jid` under `nick`.
    ///
    /// Output order for the joiner: existing occupants, its own presence
    /// (status 110), history, subject. Existing occupants get the new
    /// occupant's presence.
    pub fn join(&mut self, real_jid: &FullJid, nick: &str, created: bool) -> Result<Vec<Stanza>, XmppError> {
        let nick = nick.trim();
        if nick.is_empty() {
            return Err(XmppError::jid_malformed(Some("nickname is required".to_string())));
        }
        let occupant_jid = self.occupant_jid(nick)?;

        if let Some(existing) = self.occupant_by_real(real_jid) {
            if existing.nick == nick {
                // Repeated join: acknowledge again without changing anything.
                return Ok(vec![occupant_presence(
                    &occupant_jid,
                    real_jid,
                    existing.affiliation,
                    existing.role,
                    &[STATUS_SELF],
                )]);
            }
            return Err(XmppError::not_acceptable(Some(
                "nickname changes are not supported".to_string(),
            )));
        }
        if self.occupant_by_nick(nick).is_some() {
            return Err(XmppError::conflict(Some(format!(
                "nickname '{}' is already in use",
                nick
            ))));
        }

        let bare = real_jid.to_bare();
        let affiliation = self.affiliation_of(&bare);
        if self.config.room_type == RoomType::Private
            && affiliation < Affiliation::Member
            && !self.is_invited(&bare)
        {
            return Err(XmppError::registration_required(Some(
                "this room is members-only".to_string(),
            )));
        }
        if self.is_full() {
            return Err(XmppError::service_unavailable(Some(
                "the room is full".to_string(),
            )));
        }

        let role = if affiliation >= Affiliation::Admin {
            Role::Moderator
        } else {
            Role::Participant
        };
        let occupant = Occupant {
            real_jid: real_jid.clone(),
            nick: nick.to_string(),
            role,
            affiliation,
        };

        let mut out = Vec::with_capacity(self.occupants.len() * 2 + self.history.len() + 2);
        for other in &self.occupants {
            let other_jid = self.occupant_jid(&other.nick)?;
            out.push(occupant_presence(&other_jid, real_jid, other.affiliation, other.role, &[]));
        }
        for other in &self.occupants {
            out.push(occupant_presence(&occupant_jid, &other.real_jid, affiliation, role, &[]));
        }
        let self_codes: &[u16] = if created {
            &[STATUS_SELF, STATUS_ROOM_CREATED]
        } else {
            &[STATUS_SELF]
        };
        out.push(occupant_presence(&occupant_jid, real_jid, affiliation, role, self_codes));
        for entry in &self.history {
            out.push(entry.replay(&self.room_jid, real_jid));
        }
        let subject_from = match self.subject.as_ref().and_then(|s| s.by.as_deref()) {
            Some(by) => Jid::from(self.occupant_jid(by)?),
            None => Jid::from(self.room_jid.clone()),
        };
        out.push(subject_message(&subject_from, real_jid, self.subject()));

        self.invitations.remove(&bare);
        self.occupants.push(occupant);
        debug!(room = %self.room_jid, nick = %nick, occupants = self.occupants.len(), "Occupant joined");
        Ok(out)
    }

    /// Remove the occupant; `None` if `real_jid` was not in the room.
    pub fn leave(&mut self, real_jid: &FullJid) -> Option<Vec<Stanza>> {
        let index = self.occupants.iter().position(|o| &o.real_jid == real_jid)?;
        let occupant = self.occupants.remove(index);
        let occupant_jid = self.occupant_jid(&occupant.nick).ok()?;

        let mut out: Vec<Stanza> = self
            .occupants
            .iter()
            .map(|other| departure_presence(&occupant_jid, &other.real_jid, occupant.affiliation, &[]))
            .collect();
        out.push(departure_presence(
            &occupant_jid,
            real_jid,
            occupant.affiliation,
            &[STATUS_SELF],
        ));
        debug!(room = %self.room_jid, nick = %occupant.nick, "Occupant left");
        Some(out)
    }

    /// Broadcast a groupchat message to every occupant in join order.
    ///
    /// A message carrying only a `<subject/>` changes the subject.
    pub fn send_message(&mut self, from: &FullJid, stanza: &Stanza) -> Result<Vec<Stanza>, XmppError> {
        let Some(sender) = self.occupant_by_real(from) else {
            return Err(XmppError::not_acceptable(Some(
                "only occupants may send messages to the room".to_string(),
            )));
        };
        if sender.role == Role::None {
            return Err(XmppError::forbidden(Some("no voice in this room".to_string())));
        }
        let sender_nick = sender.nick.clone();
        let occupant_jid = Jid::from(self.occupant_jid(&sender_nick)?);

        let body = stanza.body();
        if body.is_none() {
            if let Some(subject) = stanza.subject() {
                self.subject = Some(Subject {
                    text: subject,
                    by: Some(sender_nick.clone()),
                });
                debug!(room = %self.room_jid, by = %sender_nick, "Subject changed");
            }
        }

        let out: Vec<Stanza> = self
            .occupants
            .iter()
            .map(|o| stanza.readdressed(&occupant_jid, &Jid::from(o.real_jid.clone())))
            .collect();

        if body.is_some() && self.config.history_size > 0 {
            if let Some(first) = out.first() {
                self.history.push_back(HistoryEntry::new(first.clone()));
                while self.history.len() > self.config.history_size {
                    self.history.pop_front();
                }
            }
        }
        Ok(out)
    }

    /// Relay a private message to the occupant behind `to_nick`.
    pub fn private_message(&self, from: &FullJid, to_nick: &str, stanza: &Stanza) -> Result<Stanza, XmppError> {
        let sender = self.occupant_by_real(from).ok_or_else(|| {
            XmppError::not_acceptable(Some("only occupants may send private messages".to_string()))
        })?;
        let target = self.occupant_by_nick(to_nick).ok_or_else(|| {
            XmppError::item_not_found(Some(format!("no occupant '{}'", to_nick)))
        })?;
        let from_jid = Jid::from(self.occupant_jid(&sender.nick)?);
        Ok(stanza.readdressed(&from_jid, &Jid::from(target.real_jid.clone())))
    }

    /// Record an invitation and build the message forwarded to the invitee.
    pub fn invite(&mut self, from: &FullJid, invite: &Invite) -> Result<Stanza, XmppError> {
        if self.occupant_by_real(from).is_none() {
            return Err(XmppError::not_acceptable(Some(
                "only occupants may invite".to_string(),
            )));
        }
        self.invitations.insert(invite.to.clone());
        debug!(room = %self.room_jid, invitee = %invite.to, "Invitation recorded");
        Ok(messages::invite_message(&self.room_jid, &from.to_bare(), invite))
    }

    /// `disco#info` payload for the room.
    pub fn disco_info(&self) -> Element {
        let mut features = vec![ns::MUC];
        features.push(match self.config.room_type {
            RoomType::Public => "muc_public",
            RoomType::Private => "muc_membersonly",
        });
        features.push(if self.config.persistent {
            "muc_persistent"
        } else {
            "muc_temporary"
        });
        features.push("muc_semianonymous");

        Element::builder("query", ns::DISCO_INFO)
            .append(
                Element::builder("identity", ns::DISCO_INFO)
                    .attr("category", "conference")
                    .attr("type", "text")
                    .attr("name", self.config.name.as_str())
                    .build(),
            )
            .append_all(features.into_iter().map(|var| {
                Element::builder("feature", ns::DISCO_INFO)
                    .attr("var", var)
                    .build()
            }))
            .build()
    }
}

/// Whether a message stanza addressed to a room is a groupchat broadcast.
pub fn is_groupchat(stanza: &Stanza) -> bool {
    stanza.message_type() == MessageType::Groupchat
}
