//! Server settings.
//!
//! Sources, later ones overriding earlier ones:
//! - built-in defaults
//! - an optional TOML file (`--config <path>`)
//! - `XMPP_LIGHT__*` environment variables, `__` separating key segments
//!   (e.g. `XMPP_LIGHT__XMPP__CLIENTS__PORT=5223`)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use jid::BareJid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xmpp_light::{OfflinePolicy, PersistMode, SaslMechanism, XmppServerConfig};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Client listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// C2S port (default 5222)
    pub port: u16,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self { port: 5222 }
    }
}

/// TLS material, PEM encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoreSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for KeystoreSettings {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("certs/server.crt"),
            key_path: PathBuf::from("certs/server.key"),
        }
    }
}

/// Message persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSettings {
    /// Install the libsql message store
    pub save: bool,
    pub db_path: PathBuf,
    /// `offline` saves undeliverable messages only, `all` every chat/normal message
    pub persist_mode: PersistMode,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            save: false,
            db_path: PathBuf::from("data/messages.db"),
            persist_mode: PersistMode::Offline,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MucSettings {
    /// Create rooms on first join
    pub auto_create: bool,
}

/// The `[xmpp]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XmppSettings {
    /// Server domain (e.g., "example.com")
    pub domain: String,
    pub clients: ClientSettings,
    pub keystore: KeystoreSettings,
    pub message: MessageSettings,
    pub muc: MucSettings,
    /// Defaults to `persist` when `message.save` is on, otherwise `bounce`
    pub offline_policy: Option<OfflinePolicy>,
    pub sasl_mechanisms: Vec<SaslMechanism>,
    pub registration_enabled: bool,
}

impl Default for XmppSettings {
    fn default() -> Self {
        Self {
            domain: "localhost".into(),
            clients: ClientSettings::default(),
            keystore: KeystoreSettings::default(),
            message: MessageSettings::default(),
            muc: MucSettings::default(),
            offline_policy: None,
            sasl_mechanisms: vec![SaslMechanism::Anonymous],
            registration_enabled: true,
        }
    }
}

/// Main settings struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub xmpp: XmppSettings,
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("XMPP_LIGHT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let xmpp = &self.xmpp;
        match xmpp.domain.parse::<BareJid>() {
            Ok(jid) if jid.node().is_none() => {}
            _ => return Err(invalid("xmpp.domain", format!("'{}' is not a domain", xmpp.domain))),
        }
        if xmpp.clients.port == 0 {
            return Err(invalid("xmpp.clients.port", "must not be 0"));
        }
        if xmpp.keystore.cert_path.as_os_str().is_empty() {
            return Err(invalid("xmpp.keystore.cert_path", "must be set"));
        }
        if xmpp.keystore.key_path.as_os_str().is_empty() {
            return Err(invalid("xmpp.keystore.key_path", "must be set"));
        }
        if xmpp.message.save && xmpp.message.db_path.as_os_str().is_empty() {
            return Err(invalid("xmpp.message.db_path", "must be set when message.save is on"));
        }
        if xmpp.sasl_mechanisms.is_empty() {
            return Err(invalid("xmpp.sasl_mechanisms", "at least one mechanism is required"));
        }
        Ok(())
    }

    pub fn offline_policy(&self) -> OfflinePolicy {
        match self.xmpp.offline_policy {
            Some(policy) => policy,
            None if self.xmpp.message.save => OfflinePolicy::Persist,
            None => OfflinePolicy::default(),
        }
    }

    /// The library configuration these settings describe.
    pub fn server_config(&self) -> XmppServerConfig {
        XmppServerConfig {
            domain: self.xmpp.domain.clone(),
            c2s_addr: SocketAddr::from(([0, 0, 0, 0], self.xmpp.clients.port)),
            sasl_mechanisms: self.xmpp.sasl_mechanisms.clone(),
            offline_policy: self.offline_policy(),
            persist_mode: self.xmpp.message.persist_mode,
            room_auto_create: self.xmpp.muc.auto_create,
            registration_enabled: self.xmpp.registration_enabled,
            ..XmppServerConfig::default()
        }
    }
}
