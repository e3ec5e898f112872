//! Stanza routing.
//!
//! The [`StanzaRouter`] resolves the destination of every stanza submitted
//! by an active session and hands it to the right place: the connection
//! registry for local users, the room registry for MUC addresses, or an
//! installed module when the server itself is addressed.
//!
//! Routing runs on a [`RouterPool`] of worker tasks. Each sender's full JID
//! hashes to one worker, so a sender's stanzas are routed strictly in order
//! and each directed delivery waits for the destination queue before the
//! next one starts. That gives per (sender, destination) ordering without any
//! global lock; different senders proceed in parallel on other workers.
//! Fan-out to several recipients never waits: a full queue loses that copy.
//! Jobs carry the submitting session's id, and a worker skips jobs from a
//! session that no longer holds its address.
//!
//! # Routing Logic
//!
//! 1. No `to`, or `to` is the server domain: dispatch to a module
//! 2. `to` is the MUC service or a registered room: forward to the rooms
//! 3. `to` is a local user: deliver per message/presence/IQ rules
//! 4. Anything else: `remote-server-not-found`

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use jid::{BareJid, FullJid, Jid};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn, Instrument};
use uuid::Uuid;

use crate::auth::accounts::AccountStore;
use crate::metrics;
use crate::muc::MucRoomRegistry;
use crate::persistence::{MessageStore, PersistedMessage};
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionRegistry, SendResult};
use crate::parser::ns;
use crate::stanza::{MessageType, PresenceType, Stanza};
use crate::types::{OfflinePolicy, PersistMode, StanzaKind};
use crate::xep::{ModuleContext, ModuleRegistry};
use crate::XmppError;

/// Where a stanza is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDestination {
    /// The server itself
    Server,
    /// The MUC service or one of its rooms
    Muc,
    /// A local account or one of its resources
    Local(Jid),
    /// Another domain; federation is not supported
    Remote(String),
}

/// How long a delivery may wait for room in the recipient's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Up to the registry's delivery deadline
    Deadline,
    /// Not at all
    Immediate,
}

/// Offline and persistence behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutingPolicy {
    pub offline: OfflinePolicy,
    pub persist: PersistMode,
}

/// Resolves and delivers stanzas.
pub struct StanzaRouter {
    server_jid: Jid,
    policy: RoutingPolicy,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    rooms: Arc<MucRoomRegistry>,
    accounts: Arc<dyn AccountStore>,
    modules: Arc<ModuleRegistry>,
    message_store: Option<Arc<dyn MessageStore>>,
}

impl StanzaRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_jid: Jid,
        policy: RoutingPolicy,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        rooms: Arc<MucRoomRegistry>,
        accounts: Arc<dyn AccountStore>,
        modules: Arc<ModuleRegistry>,
        message_store: Option<Arc<dyn MessageStore>>,
    ) -> Self {
        Self {
            server_jid,
            policy,
            registry,
            presence,
            rooms,
            accounts,
            modules,
            message_store,
        }
    }

    pub fn server_jid(&self) -> &Jid {
        &self.server_jid
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn rooms(&self) -> &Arc<MucRoomRegistry> {
        &self.rooms
    }

    pub fn destination(&self, to: Option<&Jid>) -> RoutingDestination {
        let Some(to) = to else {
            return RoutingDestination::Server;
        };
        let domain = to.domain().as_str();
        if domain == self.server_jid.domain().as_str() && to.node().is_none() {
            RoutingDestination::Server
        } else if self.rooms.is_muc_jid(&to.to_bare()) {
            RoutingDestination::Muc
        } else if domain == self.server_jid.domain().as_str() {
            RoutingDestination::Local(to.clone())
        } else {
            RoutingDestination::Remote(domain.to_string())
        }
    }

    /// Run a stanza through the installed modules.
    ///
    /// `sender` is `None` for a session that has not authenticated yet.
    pub async fn dispatch_to_modules(
        &self,
        sender: Option<&FullJid>,
        stanza: &Stanza,
    ) -> Result<Vec<Stanza>, XmppError> {
        let ctx = ModuleContext {
            server: &self.server_jid,
            sender,
            accounts: self.accounts.as_ref(),
            presence: &self.presence,
            registry: &self.registry,
            rooms: &self.rooms,
            features: self.modules.features(),
        };
        self.modules.dispatch(stanza, &ctx).await
    }

    /// Route a stanza from an active session.
    ///
    /// The stanza is stamped with `sender` first, whatever `from` it had.
    /// Errors are answered with an error stanza to the sender, except when
    /// the offending stanza is itself an error.
    #[instrument(skip(self, sender, stanza), name = "xmpp.router.route", fields(from = %sender, kind = %stanza.kind()))]
    pub async fn route(&self, sender: &FullJid, stanza: Stanza) {
        let started = Instant::now();
        let stanza = stanza.with_from(&Jid::from(sender.clone()));
        let kind = stanza.kind();

        let result = match kind {
            StanzaKind::Message => self.route_message(sender, &stanza).await,
            StanzaKind::Presence => self.route_presence(sender, &stanza).await,
            StanzaKind::Iq => self.route_iq(sender, &stanza).await,
        };

        match result {
            Ok(()) => metrics::record_routed(kind.as_str(), "delivered"),
            Err(e) => {
                metrics::record_routed(kind.as_str(), "error");
                if stanza.type_attr() == Some("error") {
                    debug!(error = %e, "Dropping undeliverable error stanza");
                } else {
                    debug!(error = %e, "Bouncing stanza to sender");
                    let reply = stanza.error_reply(&e, &self.server_jid);
                    self.registry.send_to(sender, reply).await;
                }
            }
        }
        metrics::record_routing_latency(started.elapsed().as_secs_f64() * 1000.0, kind.as_str());
    }

    async fn route_message(&self, sender: &FullJid, stanza: &Stanza) -> Result<(), XmppError> {
        match self.destination(stanza.to()) {
            RoutingDestination::Server => {
                let out = self.dispatch_to_modules(Some(sender), stanza).await?;
                self.deliver_all(out).await;
                Ok(())
            }
            RoutingDestination::Muc => {
                let out = self.rooms.route(sender, stanza).await?;
                self.deliver_all(out).await;
                Ok(())
            }
            RoutingDestination::Remote(domain) => Err(XmppError::remote_server_not_found(Some(
                format!("no route to {}", domain),
            ))),
            RoutingDestination::Local(to) => self.route_message_local(sender, stanza, &to).await,
        }
    }

    async fn route_message_local(&self, sender: &FullJid, stanza: &Stanza, to: &Jid) -> Result<(), XmppError> {
        let message_type = stanza.message_type();
        if message_type == MessageType::Groupchat {
            return Err(XmppError::service_unavailable(Some(
                "groupchat messages must be sent to a room".into(),
            )));
        }

        let from = Jid::from(sender.clone());
        let stamped = stanza.readdressed(&from, to);
        let persistable = matches!(message_type, MessageType::Chat | MessageType::Normal);
        let saved = persistable
            && self.policy.persist == PersistMode::All
            && self.save(&stamped, &from, to).await;

        if let Ok(full) = to.clone().try_into_full() {
            if self.registry.is_connected(&full) {
                self.registry.send_to(&full, stamped).await;
                return Ok(());
            }
        }

        let bare = to.to_bare();
        let targets = self.message_targets(&bare);
        if targets.is_empty() {
            return self
                .handle_offline(stamped, &from, to, persistable, saved)
                .await;
        }
        let mode = Self::delivery_for(targets.len());
        for target in targets {
            self.send(&target, stamped.clone(), mode).await;
        }
        Ok(())
    }

    fn delivery_for(recipients: usize) -> Delivery {
        if recipients > 1 {
            Delivery::Immediate
        } else {
            Delivery::Deadline
        }
    }

    async fn send(&self, to: &FullJid, stanza: Stanza, mode: Delivery) -> SendResult {
        match mode {
            Delivery::Deadline => self.registry.send_to(to, stanza).await,
            Delivery::Immediate => self.registry.try_send_to(to, stanza),
        }
    }

    /// Resources that receive a message sent to a bare JID.
    ///
    /// Every available resource with non-negative priority, unless one of
    /// them negotiated exclusive delivery: then only the highest-priority
    /// exclusive resource.
    fn message_targets(&self, bare: &BareJid) -> Vec<FullJid> {
        let candidates: Vec<FullJid> = self
            .presence
            .query_availability(bare)
            .into_iter()
            .filter(|p| p.priority >= 0)
            .map(|p| p.jid)
            .collect();
        match candidates.iter().find(|jid| self.registry.is_exclusive(jid)) {
            Some(exclusive) => vec![exclusive.clone()],
            None => candidates,
        }
    }

    async fn handle_offline(
        &self,
        stanza: Stanza,
        from: &Jid,
        to: &Jid,
        persistable: bool,
        already_saved: bool,
    ) -> Result<(), XmppError> {
        if !persistable {
            metrics::record_offline("dropped");
            return Ok(());
        }
        match self.policy.offline {
            OfflinePolicy::Persist if self.message_store.is_some() => {
                if !already_saved {
                    self.save(&stanza, from, to).await;
                }
                metrics::record_offline("persisted");
                Ok(())
            }
            OfflinePolicy::Persist | OfflinePolicy::Drop => {
                debug!(to = %to, "Recipient offline, dropping message");
                metrics::record_offline("dropped");
                Ok(())
            }
            OfflinePolicy::Bounce => {
                metrics::record_offline("bounced");
                Err(XmppError::service_unavailable(Some("recipient is offline".into())))
            }
        }
    }

    /// Hand a message to the store. Failures are logged only.
    async fn save(&self, stanza: &Stanza, from: &Jid, to: &Jid) -> bool {
        let Some(ref store) = self.message_store else {
            return false;
        };
        match store.save(&PersistedMessage::from_stanza(stanza, from, to)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, to = %to, "Failed to persist message");
                metrics::record_offline("save_failed");
                false
            }
        }
    }

    async fn route_presence(&self, sender: &FullJid, stanza: &Stanza) -> Result<(), XmppError> {
        let presence_type = stanza
            .presence_type()
            .ok_or_else(|| XmppError::bad_request(Some("unknown presence type".into())))?;

        match self.destination(stanza.to()) {
            RoutingDestination::Server => match presence_type {
                PresenceType::Available | PresenceType::Unavailable => {
                    let mut out = self.presence.update_presence(sender, stanza)?;
                    if presence_type == PresenceType::Unavailable {
                        out.extend(self.rooms.leave_all(sender).await);
                    }
                    self.deliver_all(out).await;
                    Ok(())
                }
                PresenceType::Error => Ok(()),
                _ => Err(XmppError::bad_request(Some(
                    "subscription presence needs a recipient".into(),
                ))),
            },
            RoutingDestination::Muc => {
                let out = self.rooms.route(sender, stanza).await?;
                self.deliver_all(out).await;
                Ok(())
            }
            RoutingDestination::Remote(domain) => Err(XmppError::remote_server_not_found(Some(
                format!("no route to {}", domain),
            ))),
            RoutingDestination::Local(to) => {
                let user = sender.to_bare();
                let contact = to.to_bare();
                let out = match presence_type {
                    PresenceType::Subscribe => {
                        let status = stanza
                            .element()
                            .get_child("status", ns::JABBER_CLIENT)
                            .map(|s| s.text());
                        self.presence.subscribe(&user, &contact, status)
                    }
                    PresenceType::Subscribed => self.presence.approve(&user, &contact),
                    PresenceType::Unsubscribe => self.presence.unsubscribe(&user, &contact),
                    PresenceType::Unsubscribed => self.presence.deny(&user, &contact),
                    PresenceType::Probe => self.presence.probe(sender, &contact),
                    PresenceType::Available | PresenceType::Unavailable | PresenceType::Error => {
                        let target = match to.clone().try_into_full() {
                            Ok(full) => Some(full),
                            Err(bare) => self.presence.highest_priority(&bare),
                        };
                        if let Some(target) = target {
                            let from = Jid::from(sender.clone());
                            self.registry
                                .send_to(&target, stanza.readdressed(&from, &Jid::from(target.clone())))
                                .await;
                        }
                        Vec::new()
                    }
                };
                self.deliver_all(out).await;
                Ok(())
            }
        }
    }

    async fn route_iq(&self, sender: &FullJid, stanza: &Stanza) -> Result<(), XmppError> {
        let iq_type = stanza
            .iq_type()
            .ok_or_else(|| XmppError::bad_request(Some("missing or invalid IQ type".into())))?;
        if iq_type.is_request() && stanza.payload().is_none() {
            return Err(XmppError::bad_request(Some("IQ request without payload".into())));
        }

        match self.destination(stanza.to()) {
            RoutingDestination::Server => {
                let out = self.dispatch_to_modules(Some(sender), stanza).await?;
                self.deliver_all(out).await;
                Ok(())
            }
            RoutingDestination::Muc => {
                let out = self.rooms.route(sender, stanza).await?;
                self.deliver_all(out).await;
                Ok(())
            }
            RoutingDestination::Remote(domain) if iq_type.is_request() => Err(
                XmppError::remote_server_not_found(Some(format!("no route to {}", domain))),
            ),
            RoutingDestination::Remote(_) => Ok(()),
            RoutingDestination::Local(to) => {
                let target = match to.clone().try_into_full() {
                    Ok(full) => self.registry.is_connected(&full).then_some(full),
                    // The account answers for itself on its bare JID
                    Err(bare) if bare == sender.to_bare() => {
                        let out = self.dispatch_to_modules(Some(sender), stanza).await?;
                        self.deliver_all(out).await;
                        return Ok(());
                    }
                    Err(bare) => self.presence.highest_priority(&bare),
                };
                match target {
                    Some(target) => {
                        let from = Jid::from(sender.clone());
                        let result = self
                            .registry
                            .send_to(&target, stanza.readdressed(&from, &to))
                            .await;
                        if result != SendResult::Sent && iq_type.is_request() {
                            return Err(XmppError::service_unavailable(None));
                        }
                        Ok(())
                    }
                    None if iq_type.is_request() => Err(XmppError::service_unavailable(None)),
                    None => Ok(()),
                }
            }
        }
    }

    /// Deliver stanzas produced by the server's own components.
    ///
    /// A single stanza may wait for the delivery deadline; a batch is
    /// fan-out and only goes to queues with room.
    pub async fn deliver_all(&self, stanzas: Vec<Stanza>) {
        let mode = Self::delivery_for(stanzas.len());
        for stanza in stanzas {
            self.deliver_with(stanza, mode).await;
        }
    }

    /// Deliver one server-generated stanza. Never bounces.
    pub async fn deliver(&self, stanza: Stanza) {
        self.deliver_with(stanza, Delivery::Deadline).await;
    }

    async fn deliver_with(&self, stanza: Stanza, mode: Delivery) {
        let Some(to) = stanza.to().cloned() else {
            warn!(kind = %stanza.kind(), id = ?stanza.id(), "Dropping server-generated stanza without a recipient");
            return;
        };
        match to.clone().try_into_full() {
            Ok(full) => {
                self.send(&full, stanza, mode).await;
            }
            Err(bare) if bare.node().is_none() => {
                debug!(to = %bare, "Dropping server-generated stanza to a domain");
            }
            Err(bare) => match stanza.kind() {
                StanzaKind::Message => {
                    let targets = self.message_targets(&bare);
                    if targets.is_empty() {
                        let persistable = matches!(
                            stanza.message_type(),
                            MessageType::Chat | MessageType::Normal
                        );
                        let from = stanza.from().cloned().unwrap_or_else(|| self.server_jid.clone());
                        if persistable && self.policy.offline == OfflinePolicy::Persist {
                            self.save(&stanza, &from, &to).await;
                        }
                        return;
                    }
                    let mode = if targets.len() > 1 { Delivery::Immediate } else { mode };
                    for target in targets {
                        self.send(&target, stanza.clone(), mode).await;
                    }
                }
                _ => {
                    if let Some(target) = self.presence.highest_priority(&bare) {
                        self.send(&target, stanza, mode).await;
                    }
                }
            },
        }
    }

    /// Tear a session down: stop deliveries, broadcast unavailable presence,
    /// leave every room, then unregister.
    ///
    /// `reason` is sent to the session as a stream error when it is being
    /// evicted rather than closing on its own.
    #[instrument(skip(self), name = "xmpp.router.teardown", fields(jid = %jid))]
    pub async fn teardown(&self, jid: &FullJid, session_id: Uuid, reason: Option<&'static str>) {
        if !self.registry.mark_closing(jid, session_id) {
            debug!("Session already gone or replaced");
            return;
        }

        let offline = self.presence.remove_session(jid);
        self.deliver_all(offline).await;
        let departures = self.rooms.leave_all(jid).await;
        self.deliver_all(departures).await;

        if let Some(entry) = self.registry.unregister(jid, session_id) {
            if let Some(condition) = reason {
                self.registry
                    .close_session(&entry, condition, "Replaced by a new session");
            }
        }
    }
}

impl std::fmt::Debug for StanzaRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StanzaRouter")
            .field("server_jid", &self.server_jid)
            .field("policy", &self.policy)
            .field("persistence", &self.message_store.is_some())
            .finish()
    }
}

/// Work handed to a router worker.
#[derive(Debug)]
pub enum RouterJob {
    Inbound {
        sender: FullJid,
        /// Session that read the stanza off its socket
        session_id: Uuid,
        stanza: Stanza,
    },
    Teardown {
        jid: FullJid,
        session_id: Uuid,
        reason: Option<&'static str>,
        done: oneshot::Sender<()>,
    },
}

/// Sharded router workers.
#[derive(Debug, Clone)]
pub struct RouterPool {
    shards: Arc<Vec<mpsc::Sender<RouterJob>>>,
}

impl RouterPool {
    /// Start `workers` tasks, each with a queue of `capacity` jobs.
    ///
    /// Workers stop once every handle to the pool is dropped.
    pub fn spawn(router: Arc<StanzaRouter>, workers: usize, capacity: usize) -> (Self, Vec<JoinHandle<()>>) {
        let workers = workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, mut rx) = mpsc::channel::<RouterJob>(capacity.max(1));
            let router = Arc::clone(&router);
            let span = tracing::info_span!("xmpp.router.worker", worker = index);
            handles.push(tokio::spawn(
                async move {
                    while let Some(job) = rx.recv().await {
                        match job {
                            RouterJob::Inbound {
                                sender,
                                session_id,
                                stanza,
                            } => {
                                if router.registry().is_active(&sender, session_id) {
                                    router.route(&sender, stanza).await;
                                } else {
                                    debug!(from = %sender, session = %session_id, "Skipping stanza from a replaced or closing session");
                                }
                            }
                            RouterJob::Teardown {
                                jid,
                                session_id,
                                reason,
                                done,
                            } => {
                                router.teardown(&jid, session_id, reason).await;
                                let _ = done.send(());
                            }
                        }
                    }
                    debug!("Router worker stopped");
                }
                .instrument(span),
            ));
            shards.push(tx);
        }

        (
            Self {
                shards: Arc::new(shards),
            },
            handles,
        )
    }

    pub fn workers(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, jid: &FullJid) -> &mpsc::Sender<RouterJob> {
        let mut hasher = DefaultHasher::new();
        jid.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Queue a stanza for routing. Waits while the sender's worker is busy.
    ///
    /// The stanza is dropped on the worker if `session_id` no longer holds
    /// `sender` by the time it is routed.
    pub async fn submit(&self, sender: FullJid, session_id: Uuid, stanza: Stanza) -> Result<(), XmppError> {
        self.shard(&sender)
            .send(RouterJob::Inbound {
                sender,
                session_id,
                stanza,
            })
            .await
            .map_err(|_| XmppError::internal("router pool stopped"))
    }

    /// Tear a session down on its own worker, after everything it already
    /// submitted, and wait for completion.
    pub async fn teardown(
        &self,
        jid: FullJid,
        session_id: Uuid,
        reason: Option<&'static str>,
    ) -> Result<(), XmppError> {
        let (done, finished) = oneshot::channel();
        self.shard(&jid)
            .send(RouterJob::Teardown {
                jid,
                session_id,
                reason,
                done,
            })
            .await
            .map_err(|_| XmppError::internal("router pool stopped"))?;
        finished
            .await
            .map_err(|_| XmppError::internal("router worker dropped teardown"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::accounts::InMemoryAccountStore;
    use crate::muc::RoomConfig;
    use crate::parser::parse_element;
    use crate::persistence::InMemoryMessageStore;
    use crate::registry::{Eviction, Outbound};
    use crate::roster::RosterStore;
    use crate::xep::PubSubModule;

    struct Harness {
        router: Arc<StanzaRouter>,
        store: Arc<InMemoryMessageStore>,
    }

    fn harness(offline: OfflinePolicy) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_millis(50)));
        let presence = Arc::new(PresenceTracker::new(Arc::new(RosterStore::new()), Arc::clone(&registry)));
        let rooms = Arc::new(MucRoomRegistry::new(
            "conference.example.com".into(),
            true,
            RoomConfig::default(),
        ));
        let store = Arc::new(InMemoryMessageStore::new());
        let router = StanzaRouter::new(
            "example.com".parse().unwrap(),
            RoutingPolicy {
                offline,
                persist: PersistMode::Offline,
            },
            registry,
            presence,
            rooms,
            Arc::new(InMemoryAccountStore::new()),
            Arc::new(ModuleRegistry::with_defaults(PubSubModule::default())),
            Some(Arc::clone(&store) as Arc<dyn MessageStore>),
        );
        Harness {
            router: Arc::new(router),
            store,
        }
    }

    fn full(s: &str) -> FullJid {
        s.parse().unwrap()
    }

    fn stanza(xml: &str) -> Stanza {
        Stanza::from_element(parse_element(xml).unwrap()).unwrap()
    }

    /// Bind a session and optionally make it available with a priority.
    async fn connect(router: &StanzaRouter, jid: &str, priority: Option<i8>) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(64);
        router.registry().register(full(jid), Uuid::new_v4(), tx).unwrap();
        if let Some(priority) = priority {
            let presence = stanza(&format!(
                "<presence xmlns='jabber:client'><priority>{}</priority></presence>",
                priority
            ));
            router.route(&full(jid), presence).await;
        }
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>, kind: StanzaKind) -> Vec<Stanza> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Stanza(s) = item {
                if s.kind() == kind {
                    out.push(s);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn test_chat_to_bare_fans_out_to_all_resources() {
        let h = harness(OfflinePolicy::Bounce);
        let mut low = connect(&h.router, "bob@example.com/low", Some(5)).await;
        let mut high = connect(&h.router, "bob@example.com/high", Some(10)).await;
        let _alice = connect(&h.router, "alice@example.com/r1", Some(0)).await;

        let msg = stanza("<message xmlns='jabber:client' to='bob@example.com' type='chat' id='m1'><body>hi</body></message>");
        h.router.route(&full("alice@example.com/r1"), msg).await;

        for rx in [&mut low, &mut high] {
            let got = drain(rx, StanzaKind::Message);
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].body().as_deref(), Some("hi"));
            assert_eq!(got[0].from().unwrap().to_string(), "alice@example.com/r1");
        }
    }

    #[tokio::test]
    async fn test_exclusive_resource_takes_bare_messages() {
        let h = harness(OfflinePolicy::Bounce);
        let mut low = connect(&h.router, "bob@example.com/low", Some(5)).await;
        let mut high = connect(&h.router, "bob@example.com/high", Some(10)).await;
        h.router.registry().set_exclusive(&full("bob@example.com/low"), true);

        let msg = stanza("<message xmlns='jabber:client' to='bob@example.com' type='chat'><body>only one</body></message>");
        h.router.route(&full("alice@example.com/r1"), msg).await;

        assert_eq!(drain(&mut low, StanzaKind::Message).len(), 1);
        assert!(drain(&mut high, StanzaKind::Message).is_empty());
    }

    #[tokio::test]
    async fn test_offline_message_is_saved_once() {
        let h = harness(OfflinePolicy::Persist);
        let mut alice = connect(&h.router, "alice@example.com/r1", Some(0)).await;

        let msg = stanza("<message xmlns='jabber:client' to='carol@example.com' type='chat' id='x'><body>later</body></message>");
        h.router.route(&full("alice@example.com/r1"), msg).await;

        let saved = h.store.messages();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].body.as_deref(), Some("later"));
        assert_eq!(saved[0].from, "alice@example.com/r1");
        assert_eq!(saved[0].to, "carol@example.com");
        assert!(drain(&mut alice, StanzaKind::Message).is_empty());
    }

    #[tokio::test]
    async fn test_offline_message_bounces_under_bounce_policy() {
        let h = harness(OfflinePolicy::Bounce);
        let mut alice = connect(&h.router, "alice@example.com/r1", Some(0)).await;

        let msg = stanza("<message xmlns='jabber:client' to='carol@example.com' type='chat' id='b1'><body>?</body></message>");
        h.router.route(&full("alice@example.com/r1"), msg).await;

        let got = drain(&mut alice, StanzaKind::Message);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].type_attr(), Some("error"));
        assert_eq!(got[0].id(), Some("b1"));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_offline_message_dropped_under_drop_policy() {
        let h = harness(OfflinePolicy::Drop);
        let mut alice = connect(&h.router, "alice@example.com/r1", Some(0)).await;
        let msg = stanza("<message xmlns='jabber:client' to='carol@example.com' type='chat'><body>?</body></message>");
        h.router.route(&full("alice@example.com/r1"), msg).await;

        assert!(drain(&mut alice, StanzaKind::Message).is_empty());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_iq_errors_are_never_dropped() {
        let h = harness(OfflinePolicy::Drop);
        let mut alice = connect(&h.router, "alice@example.com/r1", Some(0)).await;

        let to_offline = stanza(
            "<iq xmlns='jabber:client' to='carol@example.com' type='get' id='q1'><query xmlns='jabber:iq:version'/></iq>",
        );
        h.router.route(&full("alice@example.com/r1"), to_offline).await;
        let unknown = stanza("<iq xmlns='jabber:client' type='get' id='q2'><query xmlns='urn:example:unknown'/></iq>");
        h.router.route(&full("alice@example.com/r1"), unknown).await;
        let remote = stanza("<iq xmlns='jabber:client' to='elsewhere.org' type='get' id='q3'><ping xmlns='urn:xmpp:ping'/></iq>");
        h.router.route(&full("alice@example.com/r1"), remote).await;

        let replies = drain(&mut alice, StanzaKind::Iq);
        let conditions: Vec<(Option<&str>, String)> = replies
            .iter()
            .map(|r| {
                let error = r.element().get_child("error", ns::JABBER_CLIENT).unwrap();
                (r.id(), error.children().next().unwrap().name().to_string())
            })
            .collect();
        assert_eq!(
            conditions,
            vec![
                (Some("q1"), "service-unavailable".to_string()),
                (Some("q2"), "feature-not-implemented".to_string()),
                (Some("q3"), "remote-server-not-found".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_ping_to_server() {
        let h = harness(OfflinePolicy::Drop);
        let mut alice = connect(&h.router, "alice@example.com/r1", None).await;
        let ping = stanza("<iq xmlns='jabber:client' to='example.com' type='get' id='p1'><ping xmlns='urn:xmpp:ping'/></iq>");
        h.router.route(&full("alice@example.com/r1"), ping).await;

        let replies = drain(&mut alice, StanzaKind::Iq);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].type_attr(), Some("result"));
        assert_eq!(replies[0].id(), Some("p1"));
    }

    #[tokio::test]
    async fn test_directed_iq_goes_to_highest_priority() {
        let h = harness(OfflinePolicy::Drop);
        let mut low = connect(&h.router, "bob@example.com/low", Some(1)).await;
        let mut high = connect(&h.router, "bob@example.com/high", Some(9)).await;

        let iq = stanza("<iq xmlns='jabber:client' to='bob@example.com' type='get' id='v'><query xmlns='jabber:iq:version'/></iq>");
        h.router.route(&full("alice@example.com/r1"), iq).await;

        assert!(drain(&mut low, StanzaKind::Iq).is_empty());
        assert_eq!(drain(&mut high, StanzaKind::Iq).len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_broadcasts_unavailable_and_unregisters() {
        let h = harness(OfflinePolicy::Drop);
        let mut other = connect(&h.router, "bob@example.com/phone", Some(0)).await;
        let (tx, _rx) = mpsc::channel(16);
        let session = Uuid::new_v4();
        let laptop = full("bob@example.com/laptop");
        h.router.registry().register(laptop.clone(), session, tx).unwrap();
        h.router
            .route(&laptop, stanza("<presence xmlns='jabber:client'/>"))
            .await;
        drain(&mut other, StanzaKind::Presence);

        h.router.teardown(&laptop, session, None).await;

        let presences = drain(&mut other, StanzaKind::Presence);
        assert_eq!(presences.len(), 1);
        assert_eq!(presences[0].type_attr(), Some("unavailable"));
        assert!(!h.router.registry().is_connected(&laptop));
        assert!(!h.router.presence().is_available(&laptop));
    }

    /// Register a session under a known id, without presence.
    fn bind(router: &StanzaRouter, jid: &str, capacity: usize) -> (Uuid, Eviction, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let session = Uuid::new_v4();
        let eviction = router.registry().register(full(jid), session, tx).unwrap();
        (session, eviction, rx)
    }

    async fn recv_kind(rx: &mut mpsc::Receiver<Outbound>, kind: StanzaKind) -> Stanza {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(Outbound::Stanza(s))) if s.kind() == kind => return s,
                Ok(Some(_)) => {}
                other => panic!("no {:?} arrived: {:?}", kind, other.is_ok()),
            }
        }
    }

    #[tokio::test]
    async fn test_pool_preserves_sender_order() {
        let h = harness(OfflinePolicy::Drop);
        let mut bob = connect(&h.router, "bob@example.com/r1", Some(0)).await;
        let (alice, _eviction, _alice_rx) = bind(&h.router, "alice@example.com/r1", 64);
        let (pool, _handles) = RouterPool::spawn(Arc::clone(&h.router), 4, 16);

        for i in 0..30 {
            let msg = stanza(&format!(
                "<message xmlns='jabber:client' to='bob@example.com/r1' type='chat'><body>{}</body></message>",
                i
            ));
            pool.submit(full("alice@example.com/r1"), alice, msg).await.unwrap();
        }

        let mut bodies = Vec::new();
        while bodies.len() < 30 {
            match tokio::time::timeout(Duration::from_secs(2), bob.recv()).await {
                Ok(Some(Outbound::Stanza(s))) if s.kind() == StanzaKind::Message => {
                    bodies.push(s.body().unwrap_or_default())
                }
                Ok(Some(_)) => {}
                other => panic!("stream ended early: {:?}", other.is_ok()),
            }
        }
        let expected: Vec<String> = (0..30).map(|i| i.to_string()).collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn test_pool_orders_each_sender_on_a_shared_worker() {
        let h = harness(OfflinePolicy::Drop);
        let mut bob = connect(&h.router, "bob@example.com/r1", Some(0)).await;
        let senders: Vec<(String, Uuid)> = (0..5)
            .map(|n| {
                let jid = format!("user{}@example.com/r", n);
                let (session, _, _rx) = bind(&h.router, &jid, 256);
                (jid, session)
            })
            .collect();
        let (pool, _handles) = RouterPool::spawn(Arc::clone(&h.router), 1, 8);

        let mut tasks = Vec::new();
        for (jid, session) in senders.clone() {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..20 {
                    let msg = stanza(&format!(
                        "<message xmlns='jabber:client' to='bob@example.com/r1' type='chat'><body>{}</body></message>",
                        i
                    ));
                    pool.submit(full(&jid), session, msg).await.unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut per_sender: std::collections::HashMap<String, Vec<String>> = Default::default();
        for _ in 0..senders.len() * 20 {
            let msg = recv_kind(&mut bob, StanzaKind::Message).await;
            per_sender
                .entry(msg.from().unwrap().to_string())
                .or_default()
                .push(msg.body().unwrap_or_default());
        }
        for task in tasks {
            task.await.unwrap();
        }
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        for (jid, _) in &senders {
            assert_eq!(per_sender.get(jid), Some(&expected), "order broken for {}", jid);
        }
    }

    #[tokio::test]
    async fn test_pool_answers_unstamped_stanza() {
        let h = harness(OfflinePolicy::Drop);
        let (session, _eviction, mut alice) = bind(&h.router, "alice@example.com/r1", 16);
        let (pool, _handles) = RouterPool::spawn(Arc::clone(&h.router), 2, 16);

        let ping = stanza("<iq xmlns='jabber:client' to='example.com' type='get' id='p2'><ping xmlns='urn:xmpp:ping'/></iq>");
        assert!(ping.from().is_none());
        pool.submit(full("alice@example.com/r1"), session, ping).await.unwrap();

        let reply = recv_kind(&mut alice, StanzaKind::Iq).await;
        assert_eq!(reply.type_attr(), Some("result"));
        assert_eq!(reply.id(), Some("p2"));
        assert_eq!(reply.to().unwrap().to_string(), "alice@example.com/r1");
    }

    #[tokio::test]
    async fn test_route_overrides_claimed_sender() {
        let h = harness(OfflinePolicy::Drop);
        let mut bob = connect(&h.router, "bob@example.com/r1", Some(0)).await;

        let forged = stanza(
            "<message xmlns='jabber:client' from='mallory@example.com/x' to='bob@example.com/r1' type='chat'><body>hi</body></message>",
        );
        h.router.route(&full("alice@example.com/r1"), forged).await;

        let got = drain(&mut bob, StanzaKind::Message);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].from().unwrap().to_string(), "alice@example.com/r1");
    }

    #[tokio::test]
    async fn test_late_stanzas_from_replaced_session_are_ignored() {
        let h = harness(OfflinePolicy::Drop);
        let laptop = full("dave@example.com/laptop");
        let (old, old_eviction, mut old_rx) = bind(&h.router, "dave@example.com/laptop", 16);
        let (pool, _handles) = RouterPool::spawn(Arc::clone(&h.router), 2, 16);

        pool.teardown(laptop.clone(), old, Some("conflict")).await.unwrap();
        assert!(matches!(
            old_rx.try_recv(),
            Ok(Outbound::Close { condition: "conflict", .. })
        ));
        assert!(!old_eviction.is_evicted());

        let (new, _new_eviction, mut new_rx) = bind(&h.router, "dave@example.com/laptop", 16);
        pool.submit(laptop.clone(), old, stanza("<presence xmlns='jabber:client'/>"))
            .await
            .unwrap();
        // Anything routed after this ping was submitted has already happened
        let ping = stanza("<iq xmlns='jabber:client' to='example.com' type='get' id='s'><ping xmlns='urn:xmpp:ping'/></iq>");
        pool.submit(laptop.clone(), new, ping).await.unwrap();
        recv_kind(&mut new_rx, StanzaKind::Iq).await;

        assert!(!h.router.presence().is_available(&laptop));
        assert!(h.router.registry().is_current(&laptop, new));
    }

    #[tokio::test]
    async fn test_replacing_a_session_with_full_queue_still_evicts_it() {
        let h = harness(OfflinePolicy::Drop);
        let laptop = full("dave@example.com/laptop");
        let (old, eviction, _old_rx) = bind(&h.router, "dave@example.com/laptop", 1);
        h.router
            .registry()
            .send_to(&laptop, stanza("<message xmlns='jabber:client' to='dave@example.com/laptop'><body>x</body></message>"))
            .await;

        h.router.teardown(&laptop, old, Some("conflict")).await;

        assert!(eviction.is_evicted());
        let (condition, _) = eviction.evicted().await;
        assert_eq!(condition, "conflict");
        assert!(!h.router.registry().is_current(&laptop, old));
    }

    #[tokio::test]
    async fn test_fan_out_skips_full_queues() {
        let h = harness(OfflinePolicy::Drop);
        let mut fast = connect(&h.router, "bob@example.com/fast", Some(5)).await;
        let (tx, _slow_rx) = mpsc::channel(1);
        let slow = full("bob@example.com/slow");
        h.router.registry().register(slow.clone(), Uuid::new_v4(), tx).unwrap();
        h.router
            .route(&slow, stanza("<presence xmlns='jabber:client'><priority>5</priority></presence>"))
            .await;
        drain(&mut fast, StanzaKind::Presence);
        h.router
            .registry()
            .try_send_to(&slow, stanza("<message xmlns='jabber:client'><body>filler</body></message>"));
        let drops = h.router.registry().backpressure_drops();

        let msg = stanza("<message xmlns='jabber:client' to='bob@example.com' type='chat'><body>fan</body></message>");
        let started = std::time::Instant::now();
        h.router.route(&full("alice@example.com/r1"), msg).await;

        // A deadline send would have waited the full 50ms on the slow queue
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(drain(&mut fast, StanzaKind::Message).len(), 1);
        assert_eq!(h.router.registry().backpressure_drops(), drops + 1);
    }

    #[tokio::test]
    async fn test_reply_without_recipient_is_dropped() {
        let h = harness(OfflinePolicy::Drop);
        let mut alice = connect(&h.router, "alice@example.com/r1", None).await;

        h.router
            .deliver(stanza("<message xmlns='jabber:client'><body>nowhere</body></message>"))
            .await;

        assert!(alice.try_recv().is_err());
    }

    #[test]
    fn test_destination_resolution() {
        let h = harness(OfflinePolicy::Drop);
        let jid = |s: &str| -> Jid { s.parse().unwrap() };
        assert_eq!(h.router.destination(None), RoutingDestination::Server);
        assert_eq!(h.router.destination(Some(&jid("example.com"))), RoutingDestination::Server);
        assert_eq!(
            h.router.destination(Some(&jid("room@conference.example.com/nick"))),
            RoutingDestination::Muc
        );
        assert_eq!(
            h.router.destination(Some(&jid("bob@example.com"))),
            RoutingDestination::Local(jid("bob@example.com"))
        );
        assert_eq!(
            h.router.destination(Some(&jid("x@other.org"))),
            RoutingDestination::Remote("other.org".into())
        );

        h.router
            .rooms()
            .create_room("public@example.com".parse().unwrap(), RoomConfig::default())
            .unwrap();
        assert_eq!(
            h.router.destination(Some(&jid("public@example.com/alice"))),
            RoutingDestination::Muc
        );
    }
}
