//! Installable server modules.
//!
//! Stanzas addressed to the server itself are dispatched by the namespace
//! of their payload to exactly one [`ServerModule`]. When two modules claim
//! the same namespace the one registered first keeps it.
//!
//! ## Installed by default
//!
//! - **XEP-0030** Service Discovery
//! - **XEP-0060** Publish-Subscribe (in-memory nodes)
//! - **XEP-0077** In-Band Registration
//! - **XEP-0092** Software Version
//! - **XEP-0199** XMPP Ping
//! - **RFC 6121** roster get/set
//! - legacy session establishment and exclusive delivery negotiation

pub mod session;
pub mod xep0030;
pub mod xep0060;
pub mod xep0077;
pub mod xep0092;
pub mod xep0199;

pub use session::{ExclusiveModule, SessionModule};
pub use xep0030::DiscoModule;
pub use xep0060::PubSubModule;
pub use xep0077::RegistrationModule;
pub use xep0092::VersionModule;
pub use xep0199::PingModule;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jid::{FullJid, Jid};
use tracing::{debug, warn};

use crate::auth::accounts::AccountStore;
use crate::muc::MucRoomRegistry;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::roster::RosterModule;
use crate::stanza::Stanza;
use crate::types::StanzaKind;
use crate::XmppError;

/// Shared state a module may read or act on.
pub struct ModuleContext<'a> {
    /// The server's own address
    pub server: &'a Jid,
    /// `None` before authentication
    pub sender: Option<&'a FullJid>,
    pub accounts: &'a dyn AccountStore,
    pub presence: &'a PresenceTracker,
    pub registry: &'a ConnectionRegistry,
    pub rooms: &'a MucRoomRegistry,
    /// Every namespace served by an installed module
    pub features: &'a [String],
}

impl ModuleContext<'_> {
    pub fn require_sender(&self) -> Result<&FullJid, XmppError> {
        self.sender
            .ok_or_else(|| XmppError::not_authorized(Some("authentication required".to_string())))
    }
}

/// A handler for server-directed stanzas.
#[async_trait]
pub trait ServerModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Payload namespaces dispatched to this module.
    fn namespaces(&self) -> &[&'static str];

    /// Handle a stanza and return the stanzas to deliver.
    async fn handle(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError>;
}

/// Namespace-to-module dispatch table.
#[derive(Default)]
pub struct ModuleRegistry {
    handlers: HashMap<&'static str, Arc<dyn ServerModule>>,
    features: Vec<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in module installed.
    pub fn with_defaults(pubsub_service: PubSubModule) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DiscoModule));
        registry.register(Arc::new(PingModule));
        registry.register(Arc::new(VersionModule::default()));
        registry.register(Arc::new(RegistrationModule));
        registry.register(Arc::new(pubsub_service));
        registry.register(Arc::new(RosterModule));
        registry.register(Arc::new(SessionModule));
        registry.register(Arc::new(ExclusiveModule));
        registry
    }

    /// Install a module. Namespaces already claimed stay with their owner.
    pub fn register(&mut self, module: Arc<dyn ServerModule>) {
        for namespace in module.namespaces() {
            if let Some(existing) = self.handlers.get(namespace) {
                warn!(
                    namespace,
                    kept = existing.name(),
                    ignored = module.name(),
                    "Namespace already handled, keeping first registration"
                );
                continue;
            }
            self.handlers.insert(namespace, Arc::clone(&module));
            self.features.push(namespace.to_string());
        }
        debug!(module = module.name(), "Installed server module");
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn handles(&self, namespace: &str) -> bool {
        self.handlers.contains_key(namespace)
    }

    fn find(&self, stanza: &Stanza) -> Option<&Arc<dyn ServerModule>> {
        match stanza.kind() {
            StanzaKind::Iq => stanza
                .payload()
                .and_then(|payload| self.handlers.get(payload.ns().as_str())),
            _ => stanza
                .element()
                .children()
                .find_map(|child| self.handlers.get(child.ns().as_str())),
        }
    }

    /// Dispatch a server-directed stanza.
    ///
    /// An IQ request nobody handles is answered with `feature-not-implemented`;
    /// anything else unhandled is dropped.
    pub async fn dispatch(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
        match self.find(stanza) {
            Some(module) => {
                debug!(module = module.name(), "Dispatching to module");
                module.handle(stanza, ctx).await
            }
            None if stanza.kind() == StanzaKind::Iq
                && stanza.iq_type().is_some_and(|t| t.is_request()) =>
            {
                Err(XmppError::feature_not_implemented(None))
            }
            None => {
                debug!(kind = %stanza.kind(), "No module for server-directed stanza, dropping");
                Ok(Vec::new())
            }
        }
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("features", &self.features)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{stanza, Fixture};
    use super::*;

    struct Echo(&'static str);

    #[async_trait]
    impl ServerModule for Echo {
        fn name(&self) -> &'static str {
            self.0
        }

        fn namespaces(&self) -> &[&'static str] {
            &["urn:xmpp:ping"]
        }

        async fn handle(&self, stanza: &Stanza, ctx: &ModuleContext<'_>) -> Result<Vec<Stanza>, XmppError> {
            Ok(vec![stanza.iq_result(ctx.server, None).with_children(vec![
                minidom::Element::builder(self.0, "urn:test").build(),
            ])])
        }
    }

    #[tokio::test]
    async fn test_first_registered_module_wins() {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Echo("first")));
        registry.register(Arc::new(Echo("second")));
        assert_eq!(registry.features().len(), 1);

        let fixture = Fixture::new();
        let ping = stanza("<iq xmlns='jabber:client' type='get' id='p'><ping xmlns='urn:xmpp:ping'/></iq>");
        let out = registry.dispatch(&ping, &fixture.ctx(true)).await.unwrap();
        assert!(out[0].element().has_child("first", "urn:test"));
    }

    #[tokio::test]
    async fn test_unknown_namespace_is_feature_not_implemented() {
        let registry = ModuleRegistry::new();
        let fixture = Fixture::new();
        let iq = stanza("<iq xmlns='jabber:client' type='get' id='q'><query xmlns='urn:example:nothing'/></iq>");
        let err = registry.dispatch(&iq, &fixture.ctx(true)).await.unwrap_err();
        assert_eq!(err.to_stanza_error().0.as_str(), "feature-not-implemented");

        let result = stanza("<iq xmlns='jabber:client' type='result' id='q'/>");
        assert!(registry.dispatch(&result, &fixture.ctx(true)).await.unwrap().is_empty());
    }
}
