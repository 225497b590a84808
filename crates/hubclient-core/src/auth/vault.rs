//! Encrypted single-file credential store.
//!
//! The vault keeps every account's password, cookie jar and OTP seed in one
//! JSON document sealed with ChaCha20-Poly1305. The key is derived from a
//! passphrase with Argon2 and a random per-vault salt; every write seals the
//! document again under a fresh nonce.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::credentials::{CredentialStore, StoredAccount};
use crate::error::{Error, Result};
use crate::transport::CookieJar;

const VAULT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// On-disk envelope.
#[derive(Serialize, Deserialize)]
struct SealedVault {
    version: u8,
    salt: Vec<u8>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

#[derive(Default, Serialize, Deserialize)]
struct VaultContents {
    accounts: BTreeMap<String, StoredAccount>,
}

pub struct VaultCredentialStore {
    path: PathBuf,
    salt: Vec<u8>,
    cipher: ChaCha20Poly1305,
    contents: Mutex<VaultContents>,
}

fn unavailable(context: &str, e: impl std::fmt::Display) -> Error {
    Error::StoreUnavailable(format!("{}: {}", context, e))
}

fn derive_cipher(passphrase: &str, salt: &[u8]) -> Result<ChaCha20Poly1305> {
    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| unavailable("Failed to derive vault key", e))?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
}

impl VaultCredentialStore {
    /// Open the vault at `path`, creating an empty one if it does not exist.
    /// A wrong passphrase surfaces as `StoreUnavailable`.
    pub fn open(path: impl AsRef<Path>, passphrase: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let mut salt = vec![0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            let store = Self {
                cipher: derive_cipher(passphrase, &salt)?,
                path,
                salt,
                contents: Mutex::new(VaultContents::default()),
            };
            store.persist(&store.contents())?;
            info!(path = %store.path.display(), "Created credential vault");
            return Ok(store);
        }

        let raw = std::fs::read_to_string(&path).map_err(|e| unavailable("Failed to read vault", e))?;
        let sealed: SealedVault =
            serde_json::from_str(&raw).map_err(|e| unavailable("Failed to parse vault", e))?;
        if sealed.version != VAULT_VERSION {
            return Err(Error::StoreUnavailable(format!(
                "Unsupported vault version {}",
                sealed.version
            )));
        }
        if sealed.nonce.len() != NONCE_LEN {
            return Err(Error::StoreUnavailable("Corrupt vault nonce".to_string()));
        }

        let cipher = derive_cipher(passphrase, &sealed.salt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
            .map_err(|_| Error::StoreUnavailable("Wrong passphrase or corrupt vault".to_string()))?;
        let contents: VaultContents = serde_json::from_slice(&plaintext)
            .map_err(|e| unavailable("Failed to decode vault contents", e))?;

        debug!(path = %path.display(), accounts = contents.accounts.len(), "Opened credential vault");
        Ok(Self {
            path,
            salt: sealed.salt,
            cipher,
            contents: Mutex::new(contents),
        })
    }

    fn contents(&self) -> MutexGuard<'_, VaultContents> {
        self.contents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, contents: &VaultContents) -> Result<()> {
        let plaintext =
            serde_json::to_vec(contents).map_err(|e| unavailable("Failed to encode vault", e))?;

        let mut nonce = vec![0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
            .map_err(|e| unavailable("Failed to seal vault", e))?;

        let sealed = SealedVault {
            version: VAULT_VERSION,
            salt: self.salt.clone(),
            nonce,
            ciphertext,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| unavailable("Failed to create vault dir", e))?;
        }
        let raw = serde_json::to_string(&sealed).map_err(|e| unavailable("Failed to encode vault", e))?;
        std::fs::write(&self.path, raw).map_err(|e| unavailable("Failed to write vault", e))
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut StoredAccount)) -> Result<()> {
        let mut contents = self.contents();
        f(contents.accounts.entry(id.to_string()).or_default());
        self.persist(&contents)
    }

    fn read<T>(&self, id: &str, f: impl FnOnce(&StoredAccount) -> Option<T>) -> Option<T> {
        self.contents().accounts.get(id).and_then(f)
    }
}

impl CredentialStore for VaultCredentialStore {
    fn load_credentials(&self, id: &str) -> Result<Option<(String, String)>> {
        Ok(self.read(id, |a| a.password.clone().map(|p| (id.to_string(), p))))
    }

    fn save_credentials(&self, username: &str, password: &str) -> Result<()> {
        self.update(username, |a| a.password = Some(password.to_string()))
    }

    fn load_cookies(&self, id: &str) -> Result<Option<CookieJar>> {
        Ok(self.read(id, |a| a.cookies.clone()))
    }

    fn save_cookies(&self, id: &str, jar: &CookieJar) -> Result<()> {
        self.update(id, |a| a.cookies = Some(jar.clone()))
    }

    fn delete_cookies(&self, id: &str) -> Result<()> {
        let mut contents = self.contents();
        let removed = contents
            .accounts
            .get_mut(id)
            .and_then(|a| a.cookies.take())
            .is_some();
        if removed {
            self.persist(&contents)
        } else {
            Ok(())
        }
    }

    fn get_secret(&self, id: &str) -> Result<Option<String>> {
        Ok(self.read(id, |a| a.otp_secret.clone()))
    }

    fn save_secret(&self, id: &str, seed: &str) -> Result<()> {
        self.update(id, |a| a.otp_secret = Some(seed.to_string()))
    }
}
