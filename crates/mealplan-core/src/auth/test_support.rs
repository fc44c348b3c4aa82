//! Token minting and clock helpers shared by unit tests.

use std::sync::Mutex;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use super::credentials::Clock;

pub const TEST_ISSUER: &str = "mealplan-test-issuer";
pub const TEST_AUDIENCE: &str = "mealplan-test-app";
pub const TEST_SECRET: &str = "test-signing-secret";

/// Sign `claims` as an HS256 compact token.
pub fn sign_token(claims: &Value, secret: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{header}.{payload}").as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{header}.{payload}.{signature}")
}

/// A verifiable token for user 42 expiring `secs` from now. `nonce` keeps
/// tokens minted in the same second distinct.
pub fn access_token(secs: i64, nonce: &str) -> String {
    sign_token(
        &json!({
            "iss": TEST_ISSUER,
            "aud": TEST_AUDIENCE,
            "iat": Utc::now().timestamp(),
            "exp": Utc::now().timestamp() + secs,
            "userId": 42,
            "jti": nonce,
        }),
        TEST_SECRET,
    )
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_now() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
