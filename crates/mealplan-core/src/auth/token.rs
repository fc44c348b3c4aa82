//! Access token decoding and verification.
//!
//! Access tokens are compact JWTs (`header.payload.signature`, base64url
//! without padding) signed with HS256 using a secret shared with the
//! backend. Expiry extraction only needs the payload; full verification
//! also checks the signature, issuer, audience and `exp` claim.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime assumed for tokens that carry no `exp` claim.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

const SIGNING_ALGORITHM: &str = "HS256";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token verification failed: {0}")]
    VerificationFailed(String),

    #[error("Token expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Registered and custom claims read from the token payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    pub iss: Option<String>,
    /// Either a single audience string or an array of them.
    pub aud: Option<Value>,
    #[serde(rename = "userId")]
    pub user_id: Option<Value>,
}

impl Claims {
    /// Expiry instant, falling back to issue time (or `now`) plus one hour.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, TokenError> {
        if let Some(exp) = self.exp {
            return timestamp(exp, "exp");
        }
        let issued_at = match self.iat {
            Some(iat) => timestamp(iat, "iat")?,
            None => now,
        };
        issued_at
            .checked_add_signed(Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS))
            .ok_or_else(|| TokenError::Malformed(format!("iat claim out of range: {}", issued_at.timestamp())))
    }

    fn audiences(&self) -> Vec<&str> {
        match &self.aud {
            Some(Value::String(aud)) => vec![aud.as_str()],
            Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
            _ => vec![],
        }
    }

    fn numeric_user_id(&self) -> Option<i64> {
        match self.user_id.as_ref()? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

fn timestamp(secs: i64, claim: &str) -> Result<DateTime<Utc>, TokenError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| TokenError::Malformed(format!("{claim} claim out of range: {secs}")))
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

struct Segments<'a> {
    header: &'a str,
    payload: &'a str,
    signature: &'a str,
}

fn split_segments(token: &str) -> Result<Segments<'_>, TokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    match *parts.as_slice() {
        [header, payload, signature] if !header.is_empty() && !payload.is_empty() => {
            Ok(Segments {
                header,
                payload,
                signature,
            })
        }
        _ => Err(TokenError::Malformed(format!(
            "expected 3 segments, found {}",
            parts.len()
        ))),
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str, name: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenError::Malformed(format!("invalid {name} encoding: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::Malformed(format!("invalid {name} JSON: {e}")))
}

/// Decode the payload without checking the signature.
pub fn decode_claims(token: &str) -> Result<Claims, TokenError> {
    let segments = split_segments(token)?;
    decode_segment(segments.payload, "payload")
}

/// Expiry of `token`, using `now` as issue time when the token has neither
/// `exp` nor `iat`.
pub fn expiry_at(token: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TokenError> {
    decode_claims(token)?.expires_at(now)
}

/// Verifies access tokens against a fixed issuer, audience and HS256 secret.
#[derive(Clone)]
pub struct TokenValidator {
    issuer: String,
    audience: String,
    secret: Vec<u8>,
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl TokenValidator {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            secret: secret.as_ref().to_vec(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.token_issuer, &config.token_audience, &config.token_secret)
    }

    /// Extract the expiry instant from the token payload.
    pub fn parse_expiry(token: &str) -> Result<DateTime<Utc>, TokenError> {
        expiry_at(token, Utc::now())
    }

    /// Best-effort read of the numeric `userId` claim.
    pub fn extract_user_id(token: &str) -> Option<i64> {
        match decode_claims(token) {
            Ok(claims) => claims.numeric_user_id(),
            Err(e) => {
                debug!(error = %e, "Could not read userId claim");
                None
            }
        }
    }

    /// True only for a well-formed, correctly signed, unexpired token issued
    /// by the configured issuer for the configured audience.
    pub fn verify(&self, token: &str) -> bool {
        match self.verify_detailed(token) {
            Ok(_) => true,
            Err(TokenError::Malformed(reason)) => {
                warn!(%reason, "Rejected structurally invalid token");
                false
            }
            Err(e) => {
                debug!(error = %e, "Token failed verification");
                false
            }
        }
    }

    pub fn verify_detailed(&self, token: &str) -> Result<Claims, TokenError> {
        let segments = split_segments(token)?;

        let header: Header = decode_segment(segments.header, "header")?;
        if header.alg != SIGNING_ALGORITHM {
            return Err(TokenError::VerificationFailed(format!(
                "unsupported algorithm {}",
                header.alg
            )));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(segments.signature)
            .map_err(|e| TokenError::Malformed(format!("invalid signature encoding: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| TokenError::VerificationFailed(format!("signing key rejected: {e}")))?;
        mac.update(segments.header.as_bytes());
        mac.update(b".");
        mac.update(segments.payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::VerificationFailed("signature mismatch".to_string()))?;

        let claims: Claims = decode_segment(segments.payload, "payload")?;

        match claims.iss.as_deref() {
            Some(iss) if iss == self.issuer => {}
            other => {
                return Err(TokenError::VerificationFailed(format!(
                    "issuer mismatch: expected {}, got {:?}",
                    self.issuer, other
                )))
            }
        }

        let audiences = claims.audiences();
        if !audiences.iter().any(|aud| *aud == self.audience) {
            return Err(TokenError::VerificationFailed(format!(
                "audience mismatch: expected {}, got {:?}",
                self.audience, audiences
            )));
        }

        if let Some(exp) = claims.exp {
            let expires_at = timestamp(exp, "exp")?;
            if expires_at <= Utc::now() {
                return Err(TokenError::Expired(expires_at));
            }
        }

        Ok(claims)
    }
}
