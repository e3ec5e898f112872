//! Error types for the XMPP core.
//!
//! Errors fall into four families that decide how a session reacts:
//! stream errors close the connection, policy violations and stanza errors
//! are answered in-band, authentication failures are retried a bounded number
//! of times and persistence failures never leave the server.

use thiserror::Error;

use crate::parser::{escape, ns};

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML could not be parsed into an element
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Fatal stream-level error (RFC 6120 Section 4.9)
    #[error("Stream error: {condition}: {text}")]
    Stream {
        /// Stream error condition, see [`stream_errors`]
        condition: &'static str,
        /// Human readable description
        text: String,
    },

    /// Stanza out of order for the session state, or unauthorized action
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// SASL exchange failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Resource conflict (duplicate resource binding under the reject policy)
    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    /// Message persistence failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error, returned to the sender as an error-type stanza
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new fatal stream error.
    pub fn stream(condition: &'static str, text: impl Into<String>) -> Self {
        Self::Stream {
            condition,
            text: text.into(),
        }
    }

    /// Create a new policy violation.
    pub fn policy_violation(msg: impl Into<String>) -> Self {
        Self::PolicyViolation(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error with an explicit condition and type.
    pub fn stanza(
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<String>,
    ) -> Self {
        Self::Stanza {
            condition,
            error_type,
            text,
        }
    }

    pub fn bad_request(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::BadRequest, StanzaErrorType::Modify, text)
    }

    pub fn conflict(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::Conflict, StanzaErrorType::Cancel, text)
    }

    pub fn feature_not_implemented(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::FeatureNotImplemented,
            StanzaErrorType::Cancel,
            text,
        )
    }

    pub fn forbidden(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::Forbidden, StanzaErrorType::Auth, text)
    }

    pub fn item_not_found(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ItemNotFound, StanzaErrorType::Cancel, text)
    }

    pub fn jid_malformed(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::JidMalformed, StanzaErrorType::Modify, text)
    }

    pub fn not_acceptable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAcceptable, StanzaErrorType::Modify, text)
    }

    pub fn not_authorized(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAuthorized, StanzaErrorType::Auth, text)
    }

    pub fn registration_required(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::RegistrationRequired,
            StanzaErrorType::Auth,
            text,
        )
    }

    pub fn remote_server_not_found(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::RemoteServerNotFound,
            StanzaErrorType::Cancel,
            text,
        )
    }

    pub fn internal_server_error(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::InternalServerError,
            StanzaErrorType::Wait,
            text,
        )
    }

    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::ServiceUnavailable,
            StanzaErrorType::Cancel,
            text,
        )
    }

    /// Whether this error must terminate the stream.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Tls(_) | Self::XmlParse(_) | Self::Stream { .. }
        )
    }

    /// The stream error condition to send before closing, if the peer should
    /// be told anything at all.
    pub fn stream_condition(&self) -> Option<&'static str> {
        match self {
            Self::XmlParse(_) => Some(stream_errors::NOT_WELL_FORMED),
            Self::Stream { condition, .. } => Some(condition),
            Self::AuthFailed(_) => Some(stream_errors::NOT_AUTHORIZED),
            Self::PolicyViolation(_) => Some(stream_errors::POLICY_VIOLATION),
            Self::Internal(_) | Self::Config(_) | Self::Persistence(_) => {
                Some(stream_errors::INTERNAL_SERVER_ERROR)
            }
            Self::Io(_) | Self::Tls(_) => None,
            Self::ResourceConflict(_) => Some(stream_errors::CONFLICT),
            Self::Stanza { .. } => Some(stream_errors::UNDEFINED_CONDITION),
        }
    }

    /// Condition, type and text for an in-band error reply.
    ///
    /// Non-stanza errors collapse onto the closest RFC 6120 condition.
    pub fn to_stanza_error(&self) -> (StanzaErrorCondition, StanzaErrorType, Option<String>) {
        match self {
            Self::Stanza {
                condition,
                error_type,
                text,
            } => (*condition, *error_type, text.clone()),
            Self::PolicyViolation(msg) => (
                StanzaErrorCondition::PolicyViolation,
                StanzaErrorType::Modify,
                Some(msg.clone()),
            ),
            Self::AuthFailed(msg) => (
                StanzaErrorCondition::NotAuthorized,
                StanzaErrorType::Auth,
                Some(msg.clone()),
            ),
            Self::ResourceConflict(msg) => (
                StanzaErrorCondition::Conflict,
                StanzaErrorType::Cancel,
                Some(msg.clone()),
            ),
            Self::XmlParse(msg) => (
                StanzaErrorCondition::BadRequest,
                StanzaErrorType::Modify,
                Some(msg.clone()),
            ),
            _ => (
                StanzaErrorCondition::InternalServerError,
                StanzaErrorType::Wait,
                None,
            ),
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PolicyViolation,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a stream error followed by the closing stream tag.
///
/// Stream errors are fatal and must be followed by closing the stream.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    let mut error = format!("<stream:error><{} xmlns='{}'/>", condition, ns::STREAMS);

    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='{}' xml:lang='en'>{}</text>",
            ns::STREAMS,
            escape(t)
        ));
    }

    error.push_str("</stream:error></stream:stream>");
    error
}

/// Stream error conditions used by the server (RFC 6120 Section 4.9.3).
pub mod stream_errors {
    pub const BAD_FORMAT: &str = "bad-format";
    pub const CONFLICT: &str = "conflict";
    pub const HOST_UNKNOWN: &str = "host-unknown";
    pub const IMPROPER_ADDRESSING: &str = "improper-addressing";
    pub const INTERNAL_SERVER_ERROR: &str = "internal-server-error";
    pub const INVALID_NAMESPACE: &str = "invalid-namespace";
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    pub const NOT_WELL_FORMED: &str = "not-well-formed";
    pub const POLICY_VIOLATION: &str = "policy-violation";
    pub const RESOURCE_CONSTRAINT: &str = "resource-constraint";
    pub const RESTRICTED_XML: &str = "restricted-xml";
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
    pub const UNDEFINED_CONDITION: &str = "undefined-condition";
    pub const UNSUPPORTED_ENCODING: &str = "unsupported-encoding";
    pub const UNSUPPORTED_FEATURE: &str = "unsupported-feature";
    pub const UNSUPPORTED_STANZA_TYPE: &str = "unsupported-stanza-type";
    pub const UNSUPPORTED_VERSION: &str = "unsupported-version";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_generation() {
        let error = generate_stream_error(stream_errors::NOT_AUTHORIZED, Some("bad <creds>"));

        assert!(error.contains("<stream:error>"));
        assert!(error.contains("<not-authorized"));
        assert!(error.contains("bad &lt;creds&gt;"));
        assert!(error.ends_with("</stream:stream>"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(XmppError::xml_parse("eof").is_fatal());
        assert!(XmppError::stream(stream_errors::HOST_UNKNOWN, "nope").is_fatal());
        assert!(!XmppError::policy_violation("early").is_fatal());
        assert!(!XmppError::item_not_found(None).is_fatal());
        assert!(!XmppError::persistence("disk full").is_fatal());
    }

    #[test]
    fn test_stream_condition_mapping() {
        assert_eq!(
            XmppError::xml_parse("x").stream_condition(),
            Some(stream_errors::NOT_WELL_FORMED)
        );
        assert_eq!(
            XmppError::stream(stream_errors::RESTRICTED_XML, "comment").stream_condition(),
            Some(stream_errors::RESTRICTED_XML)
        );
        assert_eq!(
            XmppError::auth_failed("exhausted").stream_condition(),
            Some(stream_errors::NOT_AUTHORIZED)
        );
    }

    #[test]
    fn test_policy_violation_becomes_stanza_error() {
        let (condition, error_type, text) =
            XmppError::policy_violation("stanza before bind").to_stanza_error();
        assert_eq!(condition, StanzaErrorCondition::PolicyViolation);
        assert_eq!(error_type, StanzaErrorType::Modify);
        assert_eq!(text.as_deref(), Some("stanza before bind"));
    }
}
