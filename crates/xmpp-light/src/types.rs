//! Common types for the XMPP core.

use serde::{Deserialize, Serialize};

/// Session lifecycle states.
///
/// A session only moves forward through this list, except that any state may
/// jump to [`SessionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// TCP accepted, waiting for the stream header
    Connected,
    /// Stream header accepted, STARTTLS offered
    StreamOpened,
    /// `<proceed/>` sent, TLS handshake in progress
    TlsPending,
    /// Handshake done, SASL offered
    TlsEstablished,
    /// SASL exchange in progress
    Authenticating,
    /// SASL succeeded, resource binding offered
    Authenticated,
    /// Full JID assigned, waiting for registry activation
    ResourceBound,
    /// Stanzas flow to the router
    Active,
    /// Terminal
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Connected => "connected",
            SessionState::StreamOpened => "stream-opened",
            SessionState::TlsPending => "tls-pending",
            SessionState::TlsEstablished => "tls-established",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::ResourceBound => "resource-bound",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Transport type for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// Plain TCP (pre-STARTTLS)
    Tcp,
    /// TCP with TLS (post-STARTTLS)
    TcpTls,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::TcpTls => write!(f, "tcp+tls"),
        }
    }
}

/// The three stanza kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    /// Element name for this kind, or `None` for anything else.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            "iq" => Some(StanzaKind::Iq),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }
}

impl std::fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MUC room affiliation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Affiliation {
    None,
    Member,
    Admin,
    Owner,
}

impl std::fmt::Display for Affiliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Affiliation::None => write!(f, "none"),
            Affiliation::Member => write!(f, "member"),
            Affiliation::Admin => write!(f, "admin"),
            Affiliation::Owner => write!(f, "owner"),
        }
    }
}

/// MUC room role (per occupant session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    None,
    Participant,
    Moderator,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::None => write!(f, "none"),
            Role::Participant => write!(f, "participant"),
            Role::Moderator => write!(f, "moderator"),
        }
    }
}

/// Whether a room admits anyone or only members and invitees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    #[default]
    Public,
    Private,
}

/// What to do when a resource binds a full JID that already has a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindConflictPolicy {
    /// Terminate the old session with a `conflict` stream error
    #[default]
    Replace,
    /// Refuse the new bind with a `conflict` stanza error
    Reject,
}

/// Handling of chat/normal messages for a bare JID with no available resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflinePolicy {
    /// Hand to the message store; drop if none is installed
    Persist,
    /// Silently drop
    Drop,
    /// Bounce with `service-unavailable`
    #[default]
    Bounce,
}

/// Which messages reach the message store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    /// Only messages that could not be delivered
    #[default]
    Offline,
    /// Every routed chat/normal message
    All,
}
