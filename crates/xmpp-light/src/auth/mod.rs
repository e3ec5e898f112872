//! SASL authentication.
//!
//! Supports:
//! - SASL ANONYMOUS (RFC 4505): always succeeds with a generated localpart
//! - SASL PLAIN (RFC 4616): checked against in-band registered accounts

pub mod accounts;

use base64::prelude::*;
use jid::BareJid;
use tracing::debug;
use uuid::Uuid;

pub use accounts::{AccountStore, InMemoryAccountStore};

use crate::parser::ns;

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SaslMechanism {
    /// ANONYMOUS mechanism (RFC 4505)
    #[serde(rename = "ANONYMOUS")]
    Anonymous,
    /// PLAIN mechanism (RFC 4616)
    #[serde(rename = "PLAIN")]
    Plain,
}

impl SaslMechanism {
    /// Parse a mechanism name as sent in `<auth mechanism='...'>`.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ANONYMOUS" => Some(SaslMechanism::Anonymous),
            "PLAIN" => Some(SaslMechanism::Plain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Anonymous => "ANONYMOUS",
            SaslMechanism::Plain => "PLAIN",
        }
    }
}

impl std::fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a SASL exchange failed (RFC 6120 Section 6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslFailure {
    Aborted,
    EncryptionRequired,
    InvalidMechanism,
    MalformedRequest,
    NotAuthorized,
    TemporaryAuthFailure,
}

impl SaslFailure {
    pub fn condition(&self) -> &'static str {
        match self {
            SaslFailure::Aborted => "aborted",
            SaslFailure::EncryptionRequired => "encryption-required",
            SaslFailure::InvalidMechanism => "invalid-mechanism",
            SaslFailure::MalformedRequest => "malformed-request",
            SaslFailure::NotAuthorized => "not-authorized",
            SaslFailure::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }

    /// The `<failure/>` element sent to the client.
    pub fn to_xml(&self) -> String {
        format!("<failure xmlns='{}'><{}/></failure>", ns::SASL, self.condition())
    }
}

/// Parsed SASL PLAIN credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    pub authzid: Option<String>,
    /// Username or bare JID
    pub authcid: String,
    pub password: String,
}

/// Parse SASL PLAIN: `authzid \0 authcid \0 password`.
pub fn parse_plain(data: &[u8]) -> Result<PlainCredentials, SaslFailure> {
    let parts: Vec<&[u8]> = data.split(|&b| b == 0).collect();
    if parts.len() != 3 {
        return Err(SaslFailure::MalformedRequest);
    }

    let text = |bytes: &[u8]| {
        String::from_utf8(bytes.to_vec()).map_err(|_| SaslFailure::MalformedRequest)
    };
    let authzid = Some(text(parts[0])?).filter(|s| !s.is_empty());
    let authcid = text(parts[1])?;
    let password = text(parts[2])?;

    if authcid.is_empty() {
        return Err(SaslFailure::MalformedRequest);
    }

    Ok(PlainCredentials {
        authzid,
        authcid,
        password,
    })
}

/// A fresh, unique bare JID for an anonymous session.
pub fn anonymous_jid(domain: &str) -> Result<BareJid, SaslFailure> {
    format!("{}@{}", Uuid::new_v4().simple(), domain)
        .parse()
        .map_err(|_| SaslFailure::TemporaryAuthFailure)
}

/// Run a single-step SASL exchange and return the authenticated bare JID.
pub async fn authenticate(
    mechanism: &str,
    data: &str,
    domain: &str,
    enabled: &[SaslMechanism],
    accounts: &dyn AccountStore,
) -> Result<BareJid, SaslFailure> {
    let mechanism = SaslMechanism::from_name(mechanism)
        .filter(|m| enabled.contains(m))
        .ok_or(SaslFailure::InvalidMechanism)?;

    match mechanism {
        SaslMechanism::Anonymous => anonymous_jid(domain),
        SaslMechanism::Plain => {
            let decoded = BASE64_STANDARD
                .decode(data.trim())
                .map_err(|_| SaslFailure::MalformedRequest)?;
            let creds = parse_plain(&decoded)?;

            let username = match creds.authcid.split_once('@') {
                Some((node, host)) if host == domain => node.to_string(),
                Some(_) => return Err(SaslFailure::NotAuthorized),
                None => creds.authcid.clone(),
            };
            let username = username.to_lowercase();

            if let Some(authzid) = creds.authzid {
                if authzid != format!("{}@{}", username, domain) {
                    debug!(%authzid, "Rejecting PLAIN with foreign authzid");
                    return Err(SaslFailure::NotAuthorized);
                }
            }

            match accounts.verify(&username, &creds.password).await {
                Ok(true) => format!("{}@{}", username, domain)
                    .parse()
                    .map_err(|_| SaslFailure::NotAuthorized),
                Ok(false) => Err(SaslFailure::NotAuthorized),
                Err(_) => Err(SaslFailure::TemporaryAuthFailure),
            }
        }
    }
}

/// `<mechanisms/>` stream feature listing the enabled mechanisms.
pub fn mechanisms_feature(enabled: &[SaslMechanism]) -> String {
    let mut xml = format!("<mechanisms xmlns='{}'>", ns::SASL);
    for mechanism in enabled {
        xml.push_str(&format!("<mechanism>{}</mechanism>", mechanism));
    }
    xml.push_str("</mechanisms>");
    xml
}
