use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::CookieJar;

const SERVICE_NAME: &str = "hubclient";

/// Account credentials. The password and OTP seed may be backfilled from a
/// credential store when only a username is supplied.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub otp_secret: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_otp_secret(mut self, secret: impl Into<String>) -> Self {
        self.otp_secret = Some(secret.into());
        self
    }
}

/// Persistence for passwords, cookie jars and OTP seeds.
///
/// A missing value is `Ok(None)`, never an error. `Error::StoreUnavailable`
/// means the backing store itself could not be reached.
pub trait CredentialStore: Send + Sync {
    fn load_credentials(&self, id: &str) -> Result<Option<(String, String)>>;
    fn save_credentials(&self, username: &str, password: &str) -> Result<()>;
    fn load_cookies(&self, id: &str) -> Result<Option<CookieJar>>;
    fn save_cookies(&self, id: &str, jar: &CookieJar) -> Result<()>;
    /// Forget the cached cookie jar. Deleting an absent jar succeeds.
    fn delete_cookies(&self, id: &str) -> Result<()>;
    fn get_secret(&self, id: &str) -> Result<Option<String>>;
    fn save_secret(&self, id: &str, seed: &str) -> Result<()>;
}

/// Everything stored for one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoredAccount {
    pub password: Option<String>,
    pub cookies: Option<CookieJar>,
    pub otp_secret: Option<String>,
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    accounts: RwLock<HashMap<String, StoredAccount>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, id: &str, f: impl FnOnce(&StoredAccount) -> Option<T>) -> Option<T> {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        accounts.get(id).and_then(f)
    }

    fn write(&self, id: &str, f: impl FnOnce(&mut StoredAccount)) {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        f(accounts.entry(id.to_string()).or_default());
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_credentials(&self, id: &str) -> Result<Option<(String, String)>> {
        Ok(self.read(id, |a| a.password.clone().map(|p| (id.to_string(), p))))
    }

    fn save_credentials(&self, username: &str, password: &str) -> Result<()> {
        self.write(username, |a| a.password = Some(password.to_string()));
        Ok(())
    }

    fn load_cookies(&self, id: &str) -> Result<Option<CookieJar>> {
        Ok(self.read(id, |a| a.cookies.clone()))
    }

    fn save_cookies(&self, id: &str, jar: &CookieJar) -> Result<()> {
        self.write(id, |a| a.cookies = Some(jar.clone()));
        Ok(())
    }

    fn delete_cookies(&self, id: &str) -> Result<()> {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(account) = accounts.get_mut(id) {
            account.cookies = None;
        }
        Ok(())
    }

    fn get_secret(&self, id: &str) -> Result<Option<String>> {
        Ok(self.read(id, |a| a.otp_secret.clone()))
    }

    fn save_secret(&self, id: &str, seed: &str) -> Result<()> {
        self.write(id, |a| a.otp_secret = Some(seed.to_string()));
        Ok(())
    }
}

// ============================================================================
// OS keychain store
// ============================================================================

/// Store backed by the OS keychain: one entry per account for the
/// password, the cookie jar (as JSON) and the OTP seed.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringCredentialStore;

impl KeyringCredentialStore {
    fn entry(key: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, key)
            .map_err(|e| Error::StoreUnavailable(format!("Failed to create keyring entry: {}", e)))
    }

    fn get(key: &str) -> Result<Option<String>> {
        match Self::entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::StoreUnavailable(format!(
                "Failed to read {} from keychain: {}",
                key, e
            ))),
        }
    }

    fn set(key: &str, value: &str) -> Result<()> {
        Self::entry(key)?.set_password(value).map_err(|e| {
            Error::StoreUnavailable(format!("Failed to store {} in keychain: {}", key, e))
        })
    }

    fn cookies_key(id: &str) -> String {
        format!("{}#cookies", id)
    }

    fn secret_key(id: &str) -> String {
        format!("{}#otp", id)
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load_credentials(&self, id: &str) -> Result<Option<(String, String)>> {
        Ok(Self::get(id)?.map(|password| (id.to_string(), password)))
    }

    fn save_credentials(&self, username: &str, password: &str) -> Result<()> {
        Self::set(username, password)
    }

    fn load_cookies(&self, id: &str) -> Result<Option<CookieJar>> {
        match Self::get(&Self::cookies_key(id))? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(jar) => Ok(Some(jar)),
                Err(e) => {
                    debug!(error = %e, "Discarding unreadable cookie jar from keychain");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn save_cookies(&self, id: &str, jar: &CookieJar) -> Result<()> {
        let raw = serde_json::to_string(jar)
            .map_err(|e| Error::StoreUnavailable(format!("Failed to encode cookie jar: {}", e)))?;
        Self::set(&Self::cookies_key(id), &raw)
    }

    fn delete_cookies(&self, id: &str) -> Result<()> {
        let key = Self::cookies_key(id);
        match Self::entry(&key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::StoreUnavailable(format!(
                "Failed to delete {} from keychain: {}",
                key, e
            ))),
        }
    }

    fn get_secret(&self, id: &str) -> Result<Option<String>> {
        Self::get(&Self::secret_key(id))
    }

    fn save_secret(&self, id: &str, seed: &str) -> Result<()> {
        Self::set(&Self::secret_key(id), seed)
    }
}
