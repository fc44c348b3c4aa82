//! Backing key-value stores for persisted credentials.
//!
//! Credentials are kept in a small string map. Three storage modes exist:
//!
//! - `Encrypted`: the map is sealed with XChaCha20-Poly1305 using a key
//!   derived (Argon2id) from a master secret held in the OS keyring.
//! - `Debug`: plaintext JSON under a separate namespace, for local inspection.
//! - `FallbackPlaintext`: plaintext JSON used when the encryption layer could
//!   not be set up. Confidentiality is traded for availability here, so the
//!   switch is always logged.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use keyring::Entry;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::Config;

/// Keyring service name for the credential master secret.
const KEYRING_SERVICE: &str = "mealplan-credentials";

const MASTER_SECRET_LEN: usize = 32;
const DERIVED_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const SEALED_FORMAT_VERSION: u8 = 1;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt credential file: {0}")]
    Corrupt(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Key provider error: {0}")]
    KeyProvider(String),
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Encrypted,
    Debug,
    FallbackPlaintext,
}

impl StorageMode {
    /// Namespace that keeps each mode's data apart.
    pub fn namespace(&self) -> &'static str {
        match self {
            StorageMode::Encrypted => "secure",
            StorageMode::Debug => "debug",
            StorageMode::FallbackPlaintext => "fallback",
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, StorageMode::Encrypted)
    }

    fn file_name(&self) -> String {
        match self {
            StorageMode::Encrypted => format!("credentials.{}.bin", self.namespace()),
            _ => format!("credentials.{}.json", self.namespace()),
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

/// A string map persisted as a whole.
///
/// `write_batch` applies all of its updates in one write so readers see
/// either the old or the new field set, never a mix.
pub trait KeyValueStore: Send + Sync {
    fn snapshot(&self) -> Result<HashMap<String, String>, StorageError>;

    /// `None` removes the key.
    fn write_batch(&self, updates: &[(&str, Option<String>)]) -> Result<(), StorageError>;

    fn clear(&self) -> Result<(), StorageError>;
}

/// In-process store with no persistence.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn snapshot(&self) -> Result<HashMap<String, String>, StorageError> {
        Ok(self.entries().clone())
    }

    fn write_batch(&self, updates: &[(&str, Option<String>)]) -> Result<(), StorageError> {
        apply_updates(&mut self.entries(), updates);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.entries().clear();
        Ok(())
    }
}

fn apply_updates(map: &mut HashMap<String, String>, updates: &[(&str, Option<String>)]) {
    for (key, value) in updates {
        match value {
            Some(value) => {
                map.insert((*key).to_string(), value.clone());
            }
            None => {
                map.remove(*key);
            }
        }
    }
}

// ============================================================================
// Key material
// ============================================================================

/// Source of the master secret the file key is derived from.
pub trait KeyProvider: Send + Sync {
    fn master_secret(&self) -> Result<Zeroizing<Vec<u8>>, StorageError>;
}

/// Master secret kept in the platform keyring, created on first use.
pub struct KeyringKeyProvider {
    service: String,
    user: String,
}

impl KeyringKeyProvider {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
            user: user.into(),
        }
    }
}

impl KeyProvider for KeyringKeyProvider {
    fn master_secret(&self) -> Result<Zeroizing<Vec<u8>>, StorageError> {
        let entry = Entry::new(&self.service, &self.user)
            .map_err(|e| StorageError::KeyProvider(format!("keyring init: {e}")))?;

        match entry.get_password() {
            Ok(encoded) => {
                let secret = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| StorageError::KeyProvider(format!("decode master secret: {e}")))?;
                Ok(Zeroizing::new(secret))
            }
            Err(keyring::Error::NoEntry) => {
                info!(service = %self.service, "Creating credential master secret");
                let mut secret = Zeroizing::new(vec![0u8; MASTER_SECRET_LEN]);
                OsRng.fill_bytes(&mut secret);
                entry
                    .set_password(&STANDARD.encode(secret.as_slice()))
                    .map_err(|e| StorageError::KeyProvider(format!("store master secret: {e}")))?;
                Ok(secret)
            }
            Err(e) => Err(StorageError::KeyProvider(format!("load master secret: {e}"))),
        }
    }
}

/// Fixed master secret, for hosts that manage key material themselves.
pub struct StaticKeyProvider {
    secret: Zeroizing<Vec<u8>>,
}

impl StaticKeyProvider {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn master_secret(&self) -> Result<Zeroizing<Vec<u8>>, StorageError> {
        if self.secret.is_empty() {
            return Err(StorageError::KeyProvider("empty master secret".to_string()));
        }
        Ok(self.secret.clone())
    }
}

// ============================================================================
// File store
// ============================================================================

#[derive(Serialize, Deserialize)]
struct SealedFile {
    version: u8,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// File key for one salt.
struct DerivedKey {
    salt: [u8; SALT_LEN],
    key: Zeroizing<Vec<u8>>,
}

struct FileCipher {
    master: Zeroizing<Vec<u8>>,
    current: Mutex<DerivedKey>,
}

impl FileCipher {
    /// Derive the file key, reusing the salt of an existing sealed file.
    fn open(keys: &dyn KeyProvider, path: &Path) -> Result<Self, StorageError> {
        let master = keys.master_secret()?;
        let salt = match read_existing_salt(path) {
            Some(salt) => salt,
            None => {
                let mut salt = [0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                salt
            }
        };
        let key = derive_key(&master, &salt)?;
        Ok(Self {
            master,
            current: Mutex::new(DerivedKey { salt, key }),
        })
    }

    fn current(&self) -> MutexGuard<'_, DerivedKey> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let current = self.current();
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&current.key));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| StorageError::Crypto(format!("encrypt: {e}")))?;
        let sealed = SealedFile {
            version: SEALED_FORMAT_VERSION,
            salt: STANDARD.encode(current.salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        };
        serde_json::to_vec(&sealed).map_err(|e| StorageError::Crypto(format!("encode: {e}")))
    }

    /// Decrypt a sealed file. A salt other than the cached one (the file was
    /// rewritten by another process) gets its key derived and cached.
    fn unseal(&self, bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>, StorageError> {
        let sealed: SealedFile = serde_json::from_slice(bytes)
            .map_err(|e| StorageError::Corrupt(format!("sealed envelope: {e}")))?;
        if sealed.version != SEALED_FORMAT_VERSION {
            return Err(StorageError::Corrupt(format!(
                "unsupported format version {}",
                sealed.version
            )));
        }
        let salt: [u8; SALT_LEN] = STANDARD
            .decode(&sealed.salt)
            .map_err(|e| StorageError::Corrupt(format!("salt: {e}")))?
            .try_into()
            .map_err(|_| StorageError::Corrupt("salt has wrong length".to_string()))?;
        let nonce = STANDARD
            .decode(&sealed.nonce)
            .map_err(|e| StorageError::Corrupt(format!("nonce: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(StorageError::Corrupt("nonce has wrong length".to_string()));
        }
        let ciphertext = STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|e| StorageError::Corrupt(format!("ciphertext: {e}")))?;

        let mut current = self.current();
        if current.salt != salt {
            debug!("Credential file salt changed, deriving new file key");
            *current = DerivedKey {
                salt,
                key: derive_key(&self.master, &salt)?,
            };
        }
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&current.key));
        let plaintext = cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|e| StorageError::Crypto(format!("decrypt: {e}")))?;
        Ok(Zeroizing::new(plaintext))
    }
}

fn read_existing_salt(path: &Path) -> Option<[u8; SALT_LEN]> {
    let bytes = std::fs::read(path).ok()?;
    let sealed: SealedFile = serde_json::from_slice(&bytes).ok()?;
    let salt = STANDARD.decode(sealed.salt).ok()?;
    salt.try_into().ok()
}

fn derive_key(master: &[u8], salt: &[u8]) -> Result<Zeroizing<Vec<u8>>, StorageError> {
    let mut key = Zeroizing::new(vec![0u8; DERIVED_KEY_LEN]);
    Argon2::default()
        .hash_password_into(master, salt, &mut key)
        .map_err(|e| StorageError::Crypto(format!("argon2 derive: {e}")))?;
    Ok(key)
}

/// A JSON map on disk, optionally sealed. Writes go through a temp file and
/// an atomic rename.
pub struct FileStore {
    path: PathBuf,
    cipher: Option<FileCipher>,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn plaintext(path: PathBuf) -> Self {
        Self {
            path,
            cipher: None,
            lock: Mutex::new(()),
        }
    }

    pub fn encrypted(path: PathBuf, keys: &dyn KeyProvider) -> Result<Self, StorageError> {
        let cipher = FileCipher::open(keys, &path)?;
        Ok(Self {
            path,
            cipher: Some(cipher),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_map(&self) -> Result<HashMap<String, String>, StorageError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };
        match &self.cipher {
            Some(cipher) => {
                let plaintext = cipher.unseal(&bytes)?;
                serde_json::from_slice(&plaintext)
                    .map_err(|e| StorageError::Corrupt(format!("credential map: {e}")))
            }
            None => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Corrupt(format!("credential map: {e}"))),
        }
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let plaintext = Zeroizing::new(
            serde_json::to_vec_pretty(map)
                .map_err(|e| StorageError::Corrupt(format!("encode credential map: {e}")))?,
        );
        let contents = match &self.cipher {
            Some(cipher) => cipher.seal(&plaintext)?,
            None => plaintext.to_vec(),
        };

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents).map_err(|e| StorageError::io(&tmp, e))?;
        restrict_permissions(&tmp);
        std::fs::rename(&tmp, &self.path).map_err(|e| StorageError::io(&self.path, e))?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        debug!(path = %path.display(), error = %e, "Could not restrict credential file permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

impl KeyValueStore for FileStore {
    fn snapshot(&self) -> Result<HashMap<String, String>, StorageError> {
        let _guard = self.guard();
        self.read_map()
    }

    fn write_batch(&self, updates: &[(&str, Option<String>)]) -> Result<(), StorageError> {
        let _guard = self.guard();
        let mut map = match self.read_map() {
            Ok(map) => map,
            // Sealed with a key we no longer have; nothing in it is recoverable.
            Err(StorageError::Crypto(reason)) => {
                warn!(path = %self.path.display(), %reason, "Discarding unreadable credential file");
                HashMap::new()
            }
            Err(e) => return Err(e),
        };
        apply_updates(&mut map, updates);
        self.write_map(&map)
    }

    fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.guard();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&self.path, e)),
        }
    }
}

// ============================================================================
// Store selection
// ============================================================================

/// How to open the credential backend.
#[derive(Clone)]
pub struct StorageOptions {
    pub data_dir: PathBuf,
    pub debug: bool,
    pub keys: Arc<dyn KeyProvider>,
}

impl StorageOptions {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            data_dir: config.data_dir()?,
            debug: config.debug_storage,
            keys: Arc::new(KeyringKeyProvider::new(StorageMode::Encrypted.namespace())),
        })
    }
}

/// A backend together with the mode it was opened in.
pub struct OpenedStore {
    pub mode: StorageMode,
    pub store: Box<dyn KeyValueStore>,
}

/// Pick and open the backend: `Debug` when requested, otherwise
/// `Encrypted`, dropping to `FallbackPlaintext` if the encryption layer
/// cannot be built.
pub fn open(options: &StorageOptions) -> OpenedStore {
    if options.debug {
        let path = options.data_dir.join(StorageMode::Debug.file_name());
        debug!(path = %path.display(), "Using debug credential storage");
        return OpenedStore {
            mode: StorageMode::Debug,
            store: Box::new(FileStore::plaintext(path)),
        };
    }

    let path = options.data_dir.join(StorageMode::Encrypted.file_name());
    match FileStore::encrypted(path, options.keys.as_ref()) {
        Ok(store) => {
            debug!(path = %store.path().display(), "Using encrypted credential storage");
            OpenedStore {
                mode: StorageMode::Encrypted,
                store: Box::new(store),
            }
        }
        Err(e) => {
            let path = options.data_dir.join(StorageMode::FallbackPlaintext.file_name());
            warn!(
                error = %e,
                path = %path.display(),
                "Encrypted credential storage unavailable; credentials will be stored UNENCRYPTED"
            );
            OpenedStore {
                mode: StorageMode::FallbackPlaintext,
                store: Box::new(FileStore::plaintext(path)),
            }
        }
    }
}
