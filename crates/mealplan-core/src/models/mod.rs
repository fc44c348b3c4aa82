//! Request and response bodies for the account endpoints.
//!
//! - `LoginRequest`, `RegisterRequest`: credentials sent to the backend
//! - `RefreshRequest`: refresh-token exchange body
//! - `TokenPair`: tokens returned by login, registration and refresh

pub mod auth;

pub use auth::{LoginRequest, RefreshRequest, RegisterRequest, TokenPair};
