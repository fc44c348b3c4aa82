//! REST API client module for the mealplan backend.
//!
//! This module provides the `ApiClient`, which attaches the stored bearer
//! token to requests for the backend host, renews the session through
//! `/auth/refresh` when the token has expired or is rejected, and exposes
//! the account endpoints (login, registration).

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
pub use reqwest::Method;
