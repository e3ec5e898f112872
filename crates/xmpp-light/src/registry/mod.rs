//! Registry of active sessions for stanza delivery.
//!
//! Each session registers the sending half of its bounded output queue once
//! a resource is bound. Directed delivery looks the full JID up and enqueues
//! with a deadline, fan-out enqueues only if there is room; the session task
//! drains the queue onto its socket. Eviction does not depend on queue space:
//! each entry carries an [`Eviction`] signal the session task watches.
//!
//! ```text
//! router worker --send_timeout--> mpsc::Sender<Outbound> --> session task --> socket
//!        |                               ^
//!        +--- ConnectionRegistry: DashMap<FullJid, ConnectionEntry>
//! ```

mod connection_registry;

pub use connection_registry::{ConnectionEntry, ConnectionRegistry, Eviction, Outbound, SendResult};
