//! Account credentials for in-band registered users.
//!
//! Passwords are never stored: each account keeps a random salt and the
//! PBKDF2-HMAC-SHA256 derivation of the password.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::Sha256;

use crate::XmppError;

/// PBKDF2 iteration count for stored credentials.
pub const DEFAULT_ITERATIONS: u32 = 4096;

const SALT_LENGTH: usize = 16;
const HASH_LENGTH: usize = 32;

/// Storage for registered accounts, keyed by lowercase username.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Create an account. Fails with `conflict` if the username is taken.
    async fn create(&self, username: &str, password: &str) -> Result<(), XmppError>;

    async fn verify(&self, username: &str, password: &str) -> Result<bool, XmppError>;

    async fn exists(&self, username: &str) -> Result<bool, XmppError>;

    async fn change_password(&self, username: &str, password: &str) -> Result<(), XmppError>;

    /// Returns false if there was no such account.
    async fn remove(&self, username: &str) -> Result<bool, XmppError>;
}

#[derive(Debug, Clone)]
struct StoredCredentials {
    salt: [u8; SALT_LENGTH],
    hash: [u8; HASH_LENGTH],
    iterations: u32,
}

impl StoredCredentials {
    fn derive(password: &str) -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        rand::rng().fill(&mut salt[..]);
        let mut hash = [0u8; HASH_LENGTH];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, DEFAULT_ITERATIONS, &mut hash);
        Self {
            salt,
            hash,
            iterations: DEFAULT_ITERATIONS,
        }
    }

    fn matches(&self, password: &str) -> bool {
        let mut candidate = [0u8; HASH_LENGTH];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &self.salt, self.iterations, &mut candidate);
        candidate
            .iter()
            .zip(self.hash.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Process-local account store.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<String, StoredCredentials>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn create(&self, username: &str, password: &str) -> Result<(), XmppError> {
        match self.accounts.entry(username.to_lowercase()) {
            Entry::Occupied(_) => Err(XmppError::conflict(Some(format!(
                "username '{}' is already registered",
                username
            )))),
            Entry::Vacant(slot) => {
                slot.insert(StoredCredentials::derive(password));
                Ok(())
            }
        }
    }

    async fn verify(&self, username: &str, password: &str) -> Result<bool, XmppError> {
        Ok(self
            .accounts
            .get(&username.to_lowercase())
            .is_some_and(|creds| creds.matches(password)))
    }

    async fn exists(&self, username: &str) -> Result<bool, XmppError> {
        Ok(self.accounts.contains_key(&username.to_lowercase()))
    }

    async fn change_password(&self, username: &str, password: &str) -> Result<(), XmppError> {
        match self.accounts.get_mut(&username.to_lowercase()) {
            Some(mut creds) => {
                *creds = StoredCredentials::derive(password);
                Ok(())
            }
            None => Err(XmppError::item_not_found(None)),
        }
    }

    async fn remove(&self, username: &str) -> Result<bool, XmppError> {
        Ok(self.accounts.remove(&username.to_lowercase()).is_some())
    }
}
