use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};

/// Persistence keys for the session fields.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USER_ID_KEY: &str = "user_id";
pub const EXPIRES_AT_KEY: &str = "expires_at";

/// Buffer time before expiry to trigger refresh (5 minutes)
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// Authentication state for one user on this device.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: Option<String>,
    /// Derived from the access token's `exp` claim.
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Session {
    /// Rebuild a session from stored fields. Incomplete records yield `None`.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let expires_at = DateTime::parse_from_rfc3339(fields.get(EXPIRES_AT_KEY)?)
            .ok()?
            .with_timezone(&Utc);
        Some(Self {
            access_token: fields.get(ACCESS_TOKEN_KEY)?.clone(),
            refresh_token: fields.get(REFRESH_TOKEN_KEY)?.clone(),
            user_id: fields.get(USER_ID_KEY).cloned(),
            expires_at,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        match self
            .expires_at
            .checked_sub_signed(Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES))
        {
            Some(refresh_at) => Utc::now() > refresh_at,
            None => true,
        }
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}
