//! Core library for the mealplan client.
//!
//! Session handling for the mealplan backend: credential persistence
//! ([`auth::CredentialStore`]), access token verification
//! ([`auth::TokenValidator`]) and an authenticated HTTP client
//! ([`api::ApiClient`]) that renews expired sessions on its own.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mealplan_core::{ApiClient, Config, CredentialStore, StorageOptions};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let credentials = Arc::new(CredentialStore::new(StorageOptions::from_config(&config)?));
//! let api = ApiClient::from_config(&config, credentials)?;
//! api.login("cook@example.com", "hunter2").await?;
//! let recipes: serde_json::Value = api.get("/recipes").await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use auth::{CredentialStore, Session, StorageMode, StorageOptions, TokenValidator};
pub use config::Config;
