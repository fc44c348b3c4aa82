//! Authentication module for managing session tokens and credentials.
//!
//! This module provides:
//! - `CredentialStore`: persisted access/refresh tokens with expiry checks
//! - `TokenValidator`: HS256 token verification and claim extraction
//! - `Session`: the stored token pair and its derived expiry
//! - Storage backends: encrypted, debug and fallback-plaintext files

pub mod credentials;
pub mod session;
pub mod storage;
pub mod token;

#[cfg(test)]
pub(crate) mod test_support;

pub use credentials::{Clock, CredentialError, CredentialStore, SystemClock};
pub use session::Session;
pub use storage::{
    KeyProvider, KeyValueStore, KeyringKeyProvider, StaticKeyProvider, StorageError, StorageMode,
    StorageOptions,
};
pub use token::{Claims, TokenError, TokenValidator};
