use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::session::{
    Session, ACCESS_TOKEN_KEY, EXPIRES_AT_KEY, REFRESH_TOKEN_KEY, USER_ID_KEY,
};
use super::storage::{self, KeyValueStore, MemoryStore, OpenedStore, StorageError, StorageMode, StorageOptions};
use super::token::{self, TokenError, TokenValidator};

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Persisted session credentials.
///
/// One instance is built at startup and shared (`Arc<CredentialStore>`)
/// with everything that needs tokens. The backend is opened on first use.
pub struct CredentialStore {
    options: Option<StorageOptions>,
    backend: OnceLock<OpenedStore>,
    clock: Box<dyn Clock>,
}

impl CredentialStore {
    /// Store backed by files under `options.data_dir`, opened lazily.
    pub fn new(options: StorageOptions) -> Self {
        Self {
            options: Some(options),
            backend: OnceLock::new(),
            clock: Box::new(SystemClock),
        }
    }

    /// Store with its backend opened up front on the blocking pool, so the
    /// keyring lookup and key derivation stay off async worker threads.
    pub async fn open(options: StorageOptions) -> Result<Self, tokio::task::JoinError> {
        tokio::task::spawn_blocking(move || {
            let store = Self::new(options);
            let mode = store.mode();
            debug!(%mode, "Opened credential storage");
            store
        })
        .await
    }

    /// Store with an already-opened backend.
    pub fn with_backend(mode: StorageMode, store: Box<dyn KeyValueStore>) -> Self {
        let backend = OnceLock::new();
        let _ = backend.set(OpenedStore { mode, store });
        Self {
            options: None,
            backend,
            clock: Box::new(SystemClock),
        }
    }

    /// Non-persistent store, for tests and short-lived tools.
    pub fn in_memory() -> Self {
        Self::with_backend(StorageMode::Debug, Box::new(MemoryStore::new()))
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    fn backend(&self) -> &OpenedStore {
        self.backend.get_or_init(|| match &self.options {
            Some(options) => storage::open(options),
            None => OpenedStore {
                mode: StorageMode::Debug,
                store: Box::new(MemoryStore::new()),
            },
        })
    }

    pub fn mode(&self) -> StorageMode {
        self.backend().mode
    }

    fn fields(&self) -> Option<HashMap<String, String>> {
        match self.backend().store.snapshot() {
            Ok(fields) => Some(fields),
            Err(e) => {
                warn!(error = %e, "Failed to read stored credentials");
                None
            }
        }
    }

    /// Store a full token pair. The access token must carry a readable
    /// payload; otherwise nothing is written and the previous session stays.
    ///
    /// Without an explicit `user_id` the token's `userId` claim is used; if
    /// neither is present the stored user id is left as is.
    pub fn save(
        &self,
        access_token: &str,
        refresh_token: &str,
        user_id: Option<&str>,
    ) -> Result<(), CredentialError> {
        let expires_at = self.parse_expiry(access_token)?;
        let user_id = user_id
            .map(str::to_string)
            .or_else(|| TokenValidator::extract_user_id(access_token).map(|id| id.to_string()));

        let mut updates = vec![
            (ACCESS_TOKEN_KEY, Some(access_token.to_string())),
            (REFRESH_TOKEN_KEY, Some(refresh_token.to_string())),
            (EXPIRES_AT_KEY, Some(expires_at.to_rfc3339())),
        ];
        if let Some(user_id) = user_id {
            updates.push((USER_ID_KEY, Some(user_id)));
        }
        self.backend().store.write_batch(&updates)?;

        info!(%expires_at, mode = %self.mode(), "Stored session credentials");
        Ok(())
    }

    /// Replace only the access token (and its expiry).
    pub fn save_access_token_only(&self, access_token: &str) -> Result<(), CredentialError> {
        let expires_at = self.parse_expiry(access_token)?;
        self.backend().store.write_batch(&[
            (ACCESS_TOKEN_KEY, Some(access_token.to_string())),
            (EXPIRES_AT_KEY, Some(expires_at.to_rfc3339())),
        ])?;

        debug!(%expires_at, "Stored refreshed access token");
        Ok(())
    }

    fn parse_expiry(&self, access_token: &str) -> Result<DateTime<Utc>, TokenError> {
        token::expiry_at(access_token, self.clock.now()).map_err(|e| {
            warn!(error = %e, "Refusing to store unparseable access token");
            e
        })
    }

    /// The access token, if one is stored and its expiry is still ahead.
    pub fn access_token(&self) -> Option<String> {
        let fields = self.fields()?;
        let token = fields.get(ACCESS_TOKEN_KEY)?;
        let expires_at = DateTime::parse_from_rfc3339(fields.get(EXPIRES_AT_KEY)?)
            .ok()?
            .with_timezone(&Utc);
        if expires_at > self.clock.now() {
            Some(token.clone())
        } else {
            debug!(%expires_at, "Stored access token has expired");
            None
        }
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.fields()?.remove(REFRESH_TOKEN_KEY)
    }

    pub fn user_id(&self) -> Option<String> {
        self.fields()?.remove(USER_ID_KEY)
    }

    /// Everything stored, regardless of expiry.
    pub fn session(&self) -> Option<Session> {
        Session::from_fields(&self.fields()?)
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some() && self.refresh_token().is_some()
    }

    /// Erase all credentials. Safe to call repeatedly.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.backend().store.clear()?;
        info!("Cleared stored credentials");
        Ok(())
    }
}
