//! MUC room registry.
//!
//! Maps room JIDs to room state and keeps a per-session index of joined
//! rooms so teardown can leave every room without scanning them all.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::messages::parse_invite;
use super::presence::{parse_muc_presence, MucPresenceAction};
use super::{MucRoom, RoomConfig};
use crate::metrics;
use crate::parser::ns;
use crate::stanza::{IqType, MessageType, Stanza};
use crate::types::{Affiliation, StanzaKind};
use crate::XmppError;

type RoomRef = Arc<Mutex<MucRoom>>;

/// Registry of rooms hosted by this server.
pub struct MucRoomRegistry {
    rooms: DashMap<BareJid, RoomRef>,
    joined: DashMap<FullJid, HashSet<BareJid>>,
    muc_domain: String,
    auto_create: bool,
    default_config: RoomConfig,
}

impl MucRoomRegistry {
    pub fn new(muc_domain: String, auto_create: bool, default_config: RoomConfig) -> Self {
        info!(domain = %muc_domain, auto_create, "Creating MUC room registry");
        Self {
            rooms: DashMap::new(),
            joined: DashMap::new(),
            muc_domain,
            auto_create,
            default_config,
        }
    }

    pub fn muc_domain(&self) -> &str {
        &self.muc_domain
    }

    /// Whether `jid` is the MUC service or one of its rooms.
    pub fn is_muc_jid(&self, jid: &BareJid) -> bool {
        jid.domain().as_str() == self.muc_domain || self.rooms.contains_key(jid)
    }

    pub fn room_exists(&self, room_jid: &BareJid) -> bool {
        self.rooms.contains_key(room_jid)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn list_rooms(&self) -> Vec<BareJid> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    pub fn get_room(&self, room_jid: &BareJid) -> Option<RoomRef> {
        self.rooms.get(room_jid).map(|r| Arc::clone(r.value()))
    }

    /// Register a new room. Fails with `conflict` if the address is taken.
    #[instrument(skip(self, config), fields(room = %room_jid))]
    pub fn create_room(&self, room_jid: BareJid, config: RoomConfig) -> Result<(), XmppError> {
        match self.rooms.entry(room_jid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(XmppError::conflict(Some(format!(
                "room {} already exists",
                room_jid
            )))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(MucRoom::new(room_jid, config))));
                metrics::record_room_count(self.rooms.len() as i64);
                info!("Created MUC room");
                Ok(())
            }
        }
    }

    /// Look a room up, creating it if auto-creation is on.
    fn room_for_join(&self, room_jid: &BareJid) -> Result<(RoomRef, bool), XmppError> {
        if let Some(room) = self.get_room(room_jid) {
            return Ok((room, false));
        }
        if !self.auto_create || room_jid.domain().as_str() != self.muc_domain {
            return Err(XmppError::item_not_found(Some(format!(
                "room {} does not exist",
                room_jid
            ))));
        }
        let mut created = false;
        let entry = self.rooms.entry(room_jid.clone()).or_insert_with(|| {
            created = true;
            Arc::new(Mutex::new(MucRoom::new(
                room_jid.clone(),
                RoomConfig {
                    name: room_jid.node().map(|n| n.to_string()).unwrap_or_default(),
                    ..self.default_config.clone()
                },
            )))
        });
        let room = Arc::clone(entry.value());
        drop(entry);
        if created {
            metrics::record_room_count(self.rooms.len() as i64);
            info!(room = %room_jid, "Auto-created MUC room");
        }
        Ok((room, created))
    }

    /// Join `room_jid` as `nick`. Concurrent joins of one room are serialized
    /// by the room lock, so a nickname can only be granted once.
    #[instrument(skip(self), name = "xmpp.muc.join", fields(room = %room_jid, nick = %nick))]
    pub async fn join(&self, room_jid: &BareJid, real_jid: &FullJid, nick: &str) -> Result<Vec<Stanza>, XmppError> {
        // A room dropped between lookup and lock is looked up once more.
        for _ in 0..2 {
            let (room, created) = self.room_for_join(room_jid)?;
            let mut guard = room.lock().await;
            if guard.is_closed() {
                continue;
            }
            if created {
                guard.set_affiliation(real_jid.to_bare(), Affiliation::Owner);
            }
            let out = match guard.join(real_jid, nick, created) {
                Ok(out) => out,
                Err(e) => {
                    if created && guard.is_empty() {
                        guard.close();
                        self.rooms.remove_if(room_jid, |_, r| Arc::ptr_eq(r, &room));
                    }
                    return Err(e);
                }
            };
            self.joined
                .entry(real_jid.clone())
                .or_default()
                .insert(room_jid.clone());
            metrics::record_muc_presence("join");
            return Ok(out);
        }
        Err(XmppError::item_not_found(Some(format!(
            "room {} was destroyed",
            room_jid
        ))))
    }

    /// Leave a room, dropping it if it is empty and not persistent.
    #[instrument(skip(self), name = "xmpp.muc.leave", fields(room = %room_jid))]
    pub async fn leave(&self, room_jid: &BareJid, real_jid: &FullJid) -> Vec<Stanza> {
        let Some(room) = self.get_room(room_jid) else {
            return Vec::new();
        };
        let mut guard = room.lock().await;
        let Some(out) = guard.leave(real_jid) else {
            return Vec::new();
        };
        if let Some(mut rooms) = self.joined.get_mut(real_jid) {
            rooms.remove(room_jid);
        }
        self.joined.remove_if(real_jid, |_, rooms| rooms.is_empty());
        metrics::record_muc_presence("leave");

        if guard.is_empty() && !guard.config.persistent {
            guard.close();
            self.rooms.remove_if(room_jid, |_, r| Arc::ptr_eq(r, &room));
            metrics::record_room_count(self.rooms.len() as i64);
            info!("Destroyed empty MUC room");
        }
        out
    }

    /// Leave every room `real_jid` is in; used on session teardown.
    pub async fn leave_all(&self, real_jid: &FullJid) -> Vec<Stanza> {
        let rooms: Vec<BareJid> = self
            .joined
            .get(real_jid)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        let mut out = Vec::new();
        for room_jid in rooms {
            out.extend(self.leave(&room_jid, real_jid).await);
        }
        out
    }

    /// Rooms a session currently occupies.
    pub fn rooms_of(&self, real_jid: &FullJid) -> Vec<BareJid> {
        self.joined
            .get(real_jid)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Handle any stanza addressed to the MUC service or one of its rooms.
    ///
    /// Returns stanzas to deliver to real JIDs. Errors are answered to the
    /// sender by the caller.
    #[instrument(skip(self, stanza), name = "xmpp.muc.route", fields(from = %from, kind = %stanza.kind()))]
    pub async fn route(&self, from: &FullJid, stanza: &Stanza) -> Result<Vec<Stanza>, XmppError> {
        let to = stanza
            .to()
            .ok_or_else(|| XmppError::bad_request(Some("missing 'to'".to_string())))?;
        let room_jid = to.to_bare();

        match stanza.kind() {
            StanzaKind::Presence => match parse_muc_presence(stanza) {
                MucPresenceAction::Join { nick, .. } => self.join(&room_jid, from, &nick).await,
                MucPresenceAction::Leave { .. } => Ok(self.leave(&room_jid, from).await),
                MucPresenceAction::MissingNick => Err(XmppError::jid_malformed(Some(
                    "a nickname is required to join".to_string(),
                ))),
                MucPresenceAction::Ignored => Ok(Vec::new()),
            },
            StanzaKind::Message => self.route_message(from, &room_jid, to, stanza).await,
            StanzaKind::Iq => self.route_iq(&room_jid, to, stanza).await,
        }
    }

    async fn route_message(
        &self,
        from: &FullJid,
        room_jid: &BareJid,
        to: &Jid,
        stanza: &Stanza,
    ) -> Result<Vec<Stanza>, XmppError> {
        let room = self
            .get_room(room_jid)
            .ok_or_else(|| XmppError::item_not_found(Some(format!("no room {}", room_jid))))?;
        let mut guard = room.lock().await;

        if let Some(nick) = to.resource() {
            if stanza.message_type() == MessageType::Groupchat {
                return Err(XmppError::bad_request(Some(
                    "groupchat must be sent to the room".to_string(),
                )));
            }
            return Ok(vec![guard.private_message(from, nick.as_str(), stanza)?]);
        }

        if let Some(invite) = parse_invite(stanza) {
            let invite = invite.map_err(|e| XmppError::bad_request(Some(e)))?;
            return Ok(vec![guard.invite(from, &invite)?]);
        }

        match stanza.message_type() {
            MessageType::Groupchat => {
                let out = guard.send_message(from, stanza)?;
                metrics::record_muc_message();
                Ok(out)
            }
            MessageType::Error => Ok(Vec::new()),
            _ => Err(XmppError::bad_request(Some(
                "only groupchat messages may be sent to the room".to_string(),
            ))),
        }
    }

    async fn route_iq(&self, room_jid: &BareJid, to: &Jid, stanza: &Stanza) -> Result<Vec<Stanza>, XmppError> {
        let server = Jid::from(room_jid.clone());
        let iq_type = stanza.iq_type();
        if !iq_type.is_some_and(|t| t.is_request()) {
            return Ok(Vec::new());
        }
        let is_disco = |namespace: &str| {
            iq_type == Some(IqType::Get) && stanza.child_in(namespace).is_some()
        };

        // The service itself.
        if room_jid.node().is_none() {
            if is_disco(ns::DISCO_INFO) {
                return Ok(vec![stanza.iq_result(&server, Some(self.service_info()))]);
            }
            if is_disco(ns::DISCO_ITEMS) {
                return Ok(vec![stanza.iq_result(&server, Some(self.service_items().await))]);
            }
            return Err(XmppError::feature_not_implemented(None));
        }

        let room = self
            .get_room(room_jid)
            .ok_or_else(|| XmppError::item_not_found(Some(format!("no room {}", room_jid))))?;
        if to.resource().is_some() {
            // IQs to occupants are not relayed.
            return Err(XmppError::service_unavailable(None));
        }
        if is_disco(ns::DISCO_INFO) {
            let info = room.lock().await.disco_info();
            return Ok(vec![stanza.iq_result(&server, Some(info))]);
        }
        Err(XmppError::feature_not_implemented(None))
    }

    fn service_info(&self) -> Element {
        Element::builder("query", ns::DISCO_INFO)
            .append(
                Element::builder("identity", ns::DISCO_INFO)
                    .attr("category", "conference")
                    .attr("type", "text")
                    .attr("name", "Conference")
                    .build(),
            )
            .append(
                Element::builder("feature", ns::DISCO_INFO)
                    .attr("var", ns::MUC)
                    .build(),
            )
            .build()
    }

    async fn service_items(&self) -> Element {
        let mut items = Vec::new();
        for room_jid in self.list_rooms() {
            let Some(room) = self.get_room(&room_jid) else {
                continue;
            };
            let guard = room.lock().await;
            if guard.config.room_type != crate::types::RoomType::Public {
                continue;
            }
            items.push(
                Element::builder("item", ns::DISCO_ITEMS)
                    .attr("jid", room_jid.to_string())
                    .attr("name", guard.config.name.as_str())
                    .build(),
            );
        }
        if items.is_empty() {
            warn!("MUC service has no public rooms");
        }
        Element::builder("query", ns::DISCO_ITEMS)
            .append_all(items)
            .build()
    }
}

impl std::fmt::Debug for MucRoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MucRoomRegistry")
            .field("muc_domain", &self.muc_domain)
            .field("room_count", &self.rooms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_element;
    use crate::types::RoomType;

    fn registry(auto_create: bool) -> MucRoomRegistry {
        MucRoomRegistry::new("conference.example.com".to_string(), auto_create, RoomConfig::default())
    }

    fn room_jid(name: &str) -> BareJid {
        format!("{}@conference.example.com", name).parse().unwrap()
    }

    fn full(s: &str) -> FullJid {
        s.parse().unwrap()
    }

    #[test]
    fn test_create_duplicate_room_fails() {
        let registry = registry(false);
        registry.create_room(room_jid("a"), RoomConfig::default()).unwrap();
        assert!(registry.create_room(room_jid("a"), RoomConfig::default()).is_err());
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_join_missing_room_without_auto_create() {
        let registry = registry(false);
        let err = registry
            .join(&room_jid("nope"), &full("a@example.com/r"), "a")
            .await
            .unwrap_err();
        assert_eq!(err.to_stanza_error().0.as_str(), "item-not-found");
    }

    #[tokio::test]
    async fn test_auto_created_room_is_destroyed_when_empty() {
        let registry = registry(true);
        let room = room_jid("temp");
        registry.join(&room, &full("a@example.com/r"), "a").await.unwrap();
        assert!(registry.room_exists(&room));
        assert_eq!(registry.rooms_of(&full("a@example.com/r")), vec![room.clone()]);

        registry.leave(&room, &full("a@example.com/r")).await;
        assert!(!registry.room_exists(&room));
        assert!(registry.rooms_of(&full("a@example.com/r")).is_empty());
    }

    #[tokio::test]
    async fn test_permanent_room_survives_last_leave() {
        let registry = registry(false);
        let room = room_jid("public");
        registry
            .create_room(
                room.clone(),
                RoomConfig {
                    name: "Public Room".into(),
                    room_type: RoomType::Public,
                    persistent: true,
                    ..Default::default()
                },
            )
            .unwrap();
        registry.join(&room, &full("a@example.com/r"), "a").await.unwrap();
        let out = registry.leave_all(&full("a@example.com/r")).await;
        assert_eq!(out.len(), 1);
        assert!(registry.room_exists(&room));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_grant_nickname_once() {
        let registry = Arc::new(registry(false));
        let room = room_jid("race");
        registry.create_room(room.clone(), RoomConfig::default()).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            let room = room.clone();
            handles.push(tokio::spawn(async move {
                let real = full(&format!("user{}@example.com/r", i));
                registry.join(&room, &real, "alice").await.is_ok()
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        let guard = registry.get_room(&room).unwrap();
        assert_eq!(guard.lock().await.occupant_count(), 1);
    }

    #[tokio::test]
    async fn test_route_presence_and_groupchat() {
        let registry = registry(true);
        let alice = full("alice@example.com/r1");
        let join = Stanza::from_element(
            parse_element(
                "<presence xmlns='jabber:client' to='room@conference.example.com/alice'><x xmlns='http://jabber.org/protocol/muc'/></presence>",
            )
            .unwrap(),
        )
        .unwrap();
        let out = registry.route(&alice, &join).await.unwrap();
        assert!(out.iter().any(|s| s.kind() == StanzaKind::Presence));

        let message = Stanza::from_element(
            parse_element(
                "<message xmlns='jabber:client' type='groupchat' to='room@conference.example.com'><body>hi</body></message>",
            )
            .unwrap(),
        )
        .unwrap();
        let out = registry.route(&alice, &message).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to().unwrap().to_string(), "alice@example.com/r1");
    }
}
