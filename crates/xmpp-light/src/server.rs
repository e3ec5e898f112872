//! XMPP server implementation.
//!
//! The server listens on TCP port 5222 for client-to-server (C2S) connections,
//! upgraded in-band to TLS. It owns every shared table (sessions, presence,
//! rooms, modules) and hands them to connection tasks and router workers by
//! reference; there are no process-wide singletons.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jid::{BareJid, Jid};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::auth::accounts::{AccountStore, InMemoryAccountStore};
use crate::auth::SaslMechanism;
use crate::connection::ConnectionActor;
use crate::muc::{MucRoomRegistry, RoomConfig};
use crate::persistence::MessageStore;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::roster::RosterStore;
use crate::routing::{RouterPool, RoutingPolicy, StanzaRouter};
use crate::session::SessionLimits;
use crate::types::{BindConflictPolicy, OfflinePolicy, PersistMode};
use crate::xep::{ModuleRegistry, PubSubModule, ServerModule};
use crate::XmppError;

/// XMPP server configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// Server domain (e.g., "example.com")
    pub domain: String,
    /// Address to bind for C2S connections (default: 0.0.0.0:5222)
    pub c2s_addr: SocketAddr,
    /// MUC service domain (default: `conference.<domain>`)
    pub muc_domain: Option<String>,
    /// SASL mechanisms offered after STARTTLS
    pub sasl_mechanisms: Vec<SaslMechanism>,
    pub max_auth_attempts: u32,
    /// Policy violations tolerated before the stream is closed
    pub violation_threshold: u32,
    /// What happens when a second session binds a taken full JID
    pub bind_conflict: BindConflictPolicy,
    pub offline_policy: OfflinePolicy,
    pub persist_mode: PersistMode,
    /// Create rooms on first join instead of requiring `create_room`
    pub room_auto_create: bool,
    /// Messages replayed to joiners of auto-created rooms
    pub room_history_size: usize,
    /// Per-session output queue length
    pub outbound_queue_capacity: usize,
    /// How long a delivery may wait on a full output queue before it is dropped
    pub delivery_timeout: Duration,
    pub router_workers: usize,
    pub router_queue_capacity: usize,
    /// Largest accepted top-level element, in bytes
    pub max_stanza_size: usize,
    /// Whether XEP-0077 In-Band Registration is accepted before authentication
    pub registration_enabled: bool,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            c2s_addr: SocketAddr::from(([0, 0, 0, 0], 5222)),
            muc_domain: None,
            sasl_mechanisms: vec![SaslMechanism::Anonymous],
            max_auth_attempts: 3,
            violation_threshold: 5,
            bind_conflict: BindConflictPolicy::Replace,
            offline_policy: OfflinePolicy::default(),
            persist_mode: PersistMode::default(),
            room_auto_create: false,
            room_history_size: 20,
            outbound_queue_capacity: 256,
            delivery_timeout: Duration::from_millis(500),
            router_workers: 4,
            router_queue_capacity: 1024,
            max_stanza_size: 256 * 1024,
            registration_enabled: true,
        }
    }
}

impl XmppServerConfig {
    /// The MUC service domain, explicit or derived from the server domain.
    pub fn muc_domain(&self) -> String {
        self.muc_domain
            .clone()
            .unwrap_or_else(|| format!("conference.{}", self.domain))
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), XmppError> {
        if self.domain.trim().is_empty() {
            return Err(XmppError::config("domain must not be empty"));
        }
        if self.domain.parse::<BareJid>().map(|j| j.node().is_some()).unwrap_or(true) {
            return Err(XmppError::config(format!("invalid domain '{}'", self.domain)));
        }
        let muc_domain = self.muc_domain();
        if muc_domain.parse::<BareJid>().map(|j| j.node().is_some()).unwrap_or(true) {
            return Err(XmppError::config(format!("invalid MUC domain '{}'", muc_domain)));
        }
        if muc_domain.eq_ignore_ascii_case(&self.domain) {
            return Err(XmppError::config("MUC domain must differ from the server domain"));
        }
        if self.sasl_mechanisms.is_empty() {
            return Err(XmppError::config("at least one SASL mechanism must be enabled"));
        }
        if self.max_auth_attempts == 0 {
            return Err(XmppError::config("max_auth_attempts must be at least 1"));
        }
        if self.outbound_queue_capacity == 0
            || self.router_workers == 0
            || self.router_queue_capacity == 0
        {
            return Err(XmppError::config("queue capacities and worker count must be non-zero"));
        }
        if self.max_stanza_size < 1024 {
            return Err(XmppError::config("max_stanza_size must be at least 1 KiB"));
        }
        Ok(())
    }

    pub(crate) fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_auth_attempts: self.max_auth_attempts,
            violation_threshold: self.violation_threshold,
            registration_enabled: self.registration_enabled,
        }
    }
}

/// Load TLS configuration from PEM certificate and key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, XmppError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        XmppError::config(format!("Failed to open cert file {}: {}", cert_path.display(), e))
    })?;
    let key_pem = std::fs::read(key_path).map_err(|e| {
        XmppError::config(format!("Failed to open key file {}: {}", key_path.display(), e))
    })?;
    tls_acceptor_from_pem(&cert_pem, &key_pem)
}

/// Build a TLS acceptor from in-memory PEM material.
pub fn tls_acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, XmppError> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| XmppError::config(format!("Invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(XmppError::config("No certificate found"));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| XmppError::config(format!("Invalid private key PEM: {}", e)))?
        .ok_or_else(|| XmppError::config("No private key found"))?;

    let server_config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Everything a connection task needs, shared by all of them.
pub(crate) struct ServerContext {
    pub(crate) config: XmppServerConfig,
    pub(crate) tls_acceptor: TlsAcceptor,
    pub(crate) router: Arc<StanzaRouter>,
    pub(crate) pool: RouterPool,
    pub(crate) accounts: Arc<dyn AccountStore>,
}

/// XMPP server instance.
pub struct XmppServer {
    config: XmppServerConfig,
    server_jid: Jid,
    tls_acceptor: TlsAcceptor,
    connection_registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    room_registry: Arc<MucRoomRegistry>,
    accounts: Arc<dyn AccountStore>,
    message_store: Option<Arc<dyn MessageStore>>,
    modules: ModuleRegistry,
}

impl XmppServer {
    /// Create a new XMPP server instance with the default module set.
    pub fn new(config: XmppServerConfig, tls_acceptor: TlsAcceptor) -> Result<Self, XmppError> {
        config.validate()?;

        let server_jid: Jid = config
            .domain
            .parse()
            .map_err(|e| XmppError::config(format!("invalid domain '{}': {}", config.domain, e)))?;

        let connection_registry = Arc::new(ConnectionRegistry::new(config.delivery_timeout));
        let presence = Arc::new(PresenceTracker::new(
            Arc::new(RosterStore::new()),
            Arc::clone(&connection_registry),
        ));
        let room_registry = Arc::new(MucRoomRegistry::new(
            config.muc_domain(),
            config.room_auto_create,
            RoomConfig {
                history_size: config.room_history_size,
                ..RoomConfig::default()
            },
        ));

        info!(
            domain = %config.domain,
            muc_domain = %room_registry.muc_domain(),
            offline_policy = ?config.offline_policy,
            "XMPP server initialized"
        );

        Ok(Self {
            config,
            server_jid,
            tls_acceptor,
            connection_registry,
            presence,
            room_registry,
            accounts: Arc::new(InMemoryAccountStore::new()),
            message_store: None,
            modules: ModuleRegistry::with_defaults(PubSubModule::default()),
        })
    }

    /// Replace the in-memory account store used for PLAIN and registration.
    pub fn with_account_store(mut self, accounts: Arc<dyn AccountStore>) -> Self {
        self.accounts = accounts;
        self
    }

    /// Install the persistence collaborator for offline or all messages.
    pub fn with_message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    /// Install an extra module after the built-in ones.
    pub fn add_module(&mut self, module: Arc<dyn ServerModule>) {
        self.modules.register(module);
    }

    /// Get the server configuration.
    pub fn config(&self) -> &XmppServerConfig {
        &self.config
    }

    /// Get the room registry.
    pub fn rooms(&self) -> &Arc<MucRoomRegistry> {
        &self.room_registry
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.connection_registry
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn accounts(&self) -> &Arc<dyn AccountStore> {
        &self.accounts
    }

    /// Bind the configured C2S address and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), XmppError> {
        let listener = TcpListener::bind(self.config.c2s_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires, then wait
    /// for every session to finish its teardown and stop the router.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), XmppError> {
        let local_addr = listener.local_addr()?;
        let (ctx, workers) = self.into_context();
        info!(
            addr = %local_addr,
            domain = %ctx.config.domain,
            router_workers = ctx.pool.workers(),
            "XMPP C2S server listening"
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, closing listener");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept C2S connection");
                            continue;
                        }
                    };

                    let ctx = Arc::clone(&ctx);
                    let session_shutdown = shutdown.child_token();
                    connections.spawn(
                        async move {
                            if let Err(e) =
                                ConnectionActor::handle_connection(stream, peer_addr, ctx, session_shutdown).await
                            {
                                warn!(error = %e, "Connection error");
                            }
                        }
                        .instrument(info_span!(
                            "xmpp.connection.lifecycle",
                            client_ip = %peer_addr,
                            transport = "tcp",
                            jid = tracing::field::Empty,  // Set once a resource is bound
                        )),
                    );
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        drop(listener);
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                warn!(error = %e, "Connection task failed");
            }
        }

        // Workers exit once the last pool handle is gone.
        drop(ctx);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Router worker failed");
            }
        }

        info!("XMPP server stopped");
        Ok(())
    }

    fn into_context(self) -> (Arc<ServerContext>, Vec<JoinHandle<()>>) {
        let router = Arc::new(StanzaRouter::new(
            self.server_jid,
            RoutingPolicy {
                offline: self.config.offline_policy,
                persist: self.config.persist_mode,
            },
            self.connection_registry,
            self.presence,
            self.room_registry,
            Arc::clone(&self.accounts),
            Arc::new(self.modules),
            self.message_store,
        ));
        let (pool, workers) = RouterPool::spawn(
            Arc::clone(&router),
            self.config.router_workers,
            self.config.router_queue_capacity,
        );

        let ctx = Arc::new(ServerContext {
            config: self.config,
            tls_acceptor: self.tls_acceptor,
            router,
            pool,
            accounts: self.accounts,
        });
        (ctx, workers)
    }
}

impl std::fmt::Debug for XmppServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppServer")
            .field("config", &self.config)
            .field("modules", &self.modules)
            .finish()
    }
}
