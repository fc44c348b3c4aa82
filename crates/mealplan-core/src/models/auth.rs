use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

impl fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("email", &self.email)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Tokens issued by the backend. Refresh responses may omit the refresh
/// token when it is not rotated.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_refresh_request_uses_camel_case() {
        let body = serde_json::to_value(RefreshRequest { refresh_token: "r-1" }).unwrap();
        assert_eq!(body, json!({ "refreshToken": "r-1" }));
    }

    #[test]
    fn test_register_request_body() {
        let request = RegisterRequest {
            email: "cook@example.com".to_string(),
            password: "hunter2".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["firstName"], "Ada");
        assert_eq!(body["lastName"], "Lovelace");
        assert!(!format!("{request:?}").contains("hunter2"));
    }

    #[test]
    fn test_token_pair_without_refresh_token() {
        let pair: TokenPair = serde_json::from_value(json!({ "accessToken": "a" })).unwrap();
        assert_eq!(pair.access_token, "a");
        assert!(pair.refresh_token.is_none());
        assert!(pair.user_id.is_none());

        let pair: TokenPair =
            serde_json::from_value(json!({ "accessToken": "a", "refreshToken": "r", "userId": 5 }))
                .unwrap();
        assert_eq!(pair.refresh_token.as_deref(), Some("r"));
        assert_eq!(pair.user_id, Some(5));
    }
}
