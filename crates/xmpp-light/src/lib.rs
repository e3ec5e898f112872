//! # xmpp-light
//!
//! Lightweight XMPP server core.
//!
//! This crate implements the client-to-server half of RFC 6120/6121 and a
//! handful of XEPs, designed to be embedded in `xmpp-light-server` or in
//! another host that supplies TLS material and a message store.
//!
//! ## Architecture
//!
//! - **Server**: TCP listener on port 5222 with in-band STARTTLS
//! - **Connection Actors**: one task per client, driving a pure session state machine
//! - **Router Pool**: sharded workers routing each sender's stanzas in order
//! - **Presence Tracker**: per-resource availability and roster subscriptions
//! - **MUC Room Registry**: rooms behind per-room locks
//! - **Modules**: namespace-keyed handlers for server-addressed stanzas
//!
//! ## XEP Support
//!
//! - RFC 6120/6121 (XMPP Core/IM)
//! - XEP-0030 (Service Discovery)
//! - XEP-0045 (Multi-User Chat)
//! - XEP-0060 (Publish-Subscribe, in-memory)
//! - XEP-0077 (In-Band Registration)
//! - XEP-0092 (Software Version)
//! - XEP-0199 (XMPP Ping)

pub mod auth;
pub mod connection;
pub mod metrics;
pub mod muc;
pub mod parser;
pub mod persistence;
pub mod presence;
pub mod registry;
pub mod roster;
pub mod routing;
pub mod server;
pub mod session;
pub mod stanza;
pub mod stream;
pub mod xep;

mod error;
mod types;

pub use auth::{AccountStore, InMemoryAccountStore, SaslMechanism};
pub use error::{
    generate_stream_error, stream_errors, StanzaErrorCondition, StanzaErrorType, XmppError,
};
pub use muc::{MucRoomRegistry, RoomConfig};
pub use parser::{ns, StreamHeader};
pub use persistence::{InMemoryMessageStore, MessageStore, PersistedMessage};
pub use routing::{RouterPool, RoutingDestination, RoutingPolicy, StanzaRouter};
pub use server::{load_tls_acceptor, tls_acceptor_from_pem, XmppServer, XmppServerConfig};
pub use stanza::Stanza;
pub use types::*;
pub use xep::{ModuleContext, ModuleRegistry, ServerModule};
