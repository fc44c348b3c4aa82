//! API client for communicating with the mealplan REST API.
//!
//! Requests to the backend host carry `Authorization: Bearer <token>` when a
//! valid access token is stored. An expired token, or a 401 from the
//! backend, triggers one refresh-token exchange; the request is then sent
//! (or retried) once with the new token. A failed exchange clears the stored
//! credentials. Requests to any other host never see the token.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{CredentialStore, Session, TokenValidator};
use crate::config::Config;
use crate::models::{LoginRequest, RefreshRequest, RegisterRequest, TokenPair};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

const REFRESH_PATH: &str = "auth/refresh";
const LOGIN_PATH: &str = "auth/login";
const REGISTER_PATH: &str = "auth/register";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the mealplan backend.
/// Clone is cheap and clones share the credential store and refresh guard.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    credentials: Arc<CredentialStore>,
    validator: TokenValidator,
    /// Held while a refresh exchange is in flight.
    refresh_lock: Arc<Mutex<()>>,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        credentials: Arc<CredentialStore>,
        validator: TokenValidator,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        // Without the trailing slash `join` would replace the last path segment.
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| ApiError::InvalidUrl(format!("{base_url}: {e}")))?;

        Ok(Self {
            client,
            base_url,
            credentials,
            validator,
            refresh_lock: Arc::new(Mutex::new(())),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn from_config(config: &Config, credentials: Arc<CredentialStore>) -> Result<Self, ApiError> {
        Self::new(&config.base_url, credentials, TokenValidator::from_config(config))
    }

    /// Override the first rate-limit backoff delay.
    pub fn with_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_authenticated()
    }

    /// Resolve a path against the base URL; absolute URLs pass through.
    fn resolve(&self, path_or_url: &str) -> Result<Url, ApiError> {
        if let Ok(url) = Url::parse(path_or_url) {
            return Ok(url);
        }
        self.base_url
            .join(path_or_url.trim_start_matches('/'))
            .map_err(|e| ApiError::InvalidUrl(format!("{path_or_url}: {e}")))
    }

    /// Only the backend's own origin receives credentials.
    fn is_backend(&self, url: &Url) -> bool {
        url.origin() == self.base_url.origin()
    }

    // ===== Account =====

    /// Sign in and store the issued tokens.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let url = self.resolve(LOGIN_PATH)?;
        let body = LoginRequest { email, password };
        let response = self.send_with_retry(&Method::POST, &url, Some(&body), None).await?;
        let pair = Self::parse_json::<TokenPair>(Self::check_response(response).await?, LOGIN_PATH).await?;
        info!("Login successful");
        self.store_session(&pair)
    }

    /// Create an account and store the issued tokens.
    pub async fn register(&self, request: &RegisterRequest) -> Result<Session, ApiError> {
        let url = self.resolve(REGISTER_PATH)?;
        let response = self.send_with_retry(&Method::POST, &url, Some(request), None).await?;
        let pair =
            Self::parse_json::<TokenPair>(Self::check_response(response).await?, REGISTER_PATH).await?;
        info!("Registration successful");
        self.store_session(&pair)
    }

    /// Forget the stored session. No server call is made.
    pub fn logout(&self) -> Result<(), ApiError> {
        self.credentials.clear().map_err(|e| ApiError::Credentials(e.into()))?;
        info!("Logged out");
        Ok(())
    }

    fn store_session(&self, pair: &TokenPair) -> Result<Session, ApiError> {
        self.ensure_trusted(&pair.access_token)?;
        let refresh_token = pair
            .refresh_token
            .as_deref()
            .ok_or_else(|| ApiError::InvalidResponse("response is missing refreshToken".to_string()))?;
        let user_id = pair.user_id.map(|id| id.to_string());
        self.credentials
            .save(&pair.access_token, refresh_token, user_id.as_deref())?;
        self.credentials
            .session()
            .ok_or_else(|| ApiError::InvalidResponse("stored session could not be read back".to_string()))
    }

    fn ensure_trusted(&self, access_token: &str) -> Result<(), ApiError> {
        if self.validator.verify(access_token) {
            Ok(())
        } else {
            Err(ApiError::InvalidResponse(
                "access token failed verification".to_string(),
            ))
        }
    }

    // ===== Request pipeline =====

    /// Send a request and return the raw response, whatever its status.
    pub async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ApiError> {
        let url = self.resolve(path)?;

        if !self.is_backend(&url) {
            debug!(host = ?url.host_str(), "Sending request to external host without credentials");
            return self.send_with_retry(&method, &url, body, None).await;
        }

        let mut refreshed = false;
        let token = match self.credentials.access_token() {
            Some(token) => Some(token),
            None if self.credentials.refresh_token().is_some() => {
                debug!("Stored access token expired, refreshing before request");
                refreshed = true;
                Some(self.refresh_session(None).await?)
            }
            None => None,
        };

        let response = self.send_with_retry(&method, &url, body, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED
            || refreshed
            || self.credentials.refresh_token().is_none()
        {
            return Ok(response);
        }

        info!(url = %url, "Access token rejected, refreshing session");
        let token = self.refresh_session(token.as_deref()).await?;
        self.send_with_retry(&method, &url, body, Some(&token)).await
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// `stale` is the token the caller found unusable. Only one exchange runs
    /// at a time; a caller that waited on another's exchange reuses its
    /// result.
    async fn refresh_session(&self, stale: Option<&str>) -> Result<String, ApiError> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(current) = self.credentials.access_token() {
            if stale != Some(current.as_str()) {
                debug!("Session already refreshed by a concurrent request");
                return Ok(current);
            }
        }

        let Some(refresh_token) = self.credentials.refresh_token() else {
            return Err(self.terminate_session("no refresh token stored".to_string()));
        };

        match self.exchange_refresh_token(&refresh_token).await {
            Ok(access_token) => {
                info!("Session refreshed");
                Ok(access_token)
            }
            Err(e) => Err(self.terminate_session(e.to_string())),
        }
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<String, ApiError> {
        let url = self.resolve(REFRESH_PATH)?;
        let body = RefreshRequest { refresh_token };
        let response = self.send_with_retry(&Method::POST, &url, Some(&body), None).await?;
        let pair =
            Self::parse_json::<TokenPair>(Self::check_response(response).await?, REFRESH_PATH).await?;

        self.ensure_trusted(&pair.access_token)?;
        match pair.refresh_token.as_deref() {
            Some(rotated) => {
                let user_id = pair.user_id.map(|id| id.to_string());
                self.credentials
                    .save(&pair.access_token, rotated, user_id.as_deref())?;
            }
            None => self.credentials.save_access_token_only(&pair.access_token)?,
        }
        Ok(pair.access_token)
    }

    /// Clear all credentials after an unrecoverable refresh failure.
    fn terminate_session(&self, reason: String) -> ApiError {
        warn!(%reason, "Session refresh failed, signing out");
        if let Err(e) = self.credentials.clear() {
            warn!(error = %e, "Failed to clear credentials after refresh failure");
        }
        ApiError::RefreshFailed(reason)
    }

    async fn send_with_retry<B: Serialize + ?Sized>(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&B>,
        token: Option<&str>,
    ) -> Result<Response, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let mut request = self.client.request(method.clone(), url.clone());
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(backoff).await;
            backoff *= 2; // Exponential backoff
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse_json<T: DeserializeOwned>(response: Response, path: &str) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response from {path}: {e}")))
    }

    // ===== Typed helpers =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.execute(Method::GET, path, None::<&()>).await?;
        Self::parse_json(Self::check_response(response).await?, path).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.execute(Method::POST, path, Some(body)).await?;
        Self::parse_json(Self::check_response(response).await?, path).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.execute(Method::PUT, path, Some(body)).await?;
        Self::parse_json(Self::check_response(response).await?, path).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let response = self.execute(Method::DELETE, path, None::<&()>).await?;
        Self::check_response(response).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::{ApiClient, ApiError, Arc, CredentialStore, Duration, RegisterRequest, StatusCode, TokenValidator, Url};
    use crate::auth::test_support::{access_token, sign_token, TEST_AUDIENCE, TEST_ISSUER, TEST_SECRET};
    use httpmock::prelude::*;
    use serde_json::{json, Value};

    fn validator() -> TokenValidator {
        TokenValidator::new(TEST_ISSUER, TEST_AUDIENCE, TEST_SECRET)
    }

    fn client_for(server: &MockServer) -> ApiClient {
        ApiClient::new(&server.base_url(), Arc::new(CredentialStore::in_memory()), validator())
            .unwrap()
            .with_backoff(Duration::from_millis(1))
    }

    /// Client for a local port with nothing listening on it.
    fn unreachable_client() -> ApiClient {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        ApiClient::new(
            &format!("http://127.0.0.1:{port}"),
            Arc::new(CredentialStore::in_memory()),
            validator(),
        )
        .unwrap()
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {token}")
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let client = ApiClient::new(
            "https://api.mealplan.app/v1",
            Arc::new(CredentialStore::in_memory()),
            validator(),
        )
        .unwrap();
        assert_eq!(
            client.resolve("/recipes/3").unwrap().as_str(),
            "https://api.mealplan.app/v1/recipes/3"
        );
        assert_eq!(
            client.resolve("https://maps.example.com/geo").unwrap().as_str(),
            "https://maps.example.com/geo"
        );
    }

    #[test]
    fn test_backend_origin_check() {
        let client = ApiClient::new(
            "https://api.mealplan.app",
            Arc::new(CredentialStore::in_memory()),
            validator(),
        )
        .unwrap();
        assert!(client.is_backend(&Url::parse("https://api.mealplan.app/recipes").unwrap()));
        assert!(!client.is_backend(&Url::parse("http://api.mealplan.app/recipes").unwrap()));
        assert!(!client.is_backend(&Url::parse("https://api.mealplan.app:8443/x").unwrap()));
        assert!(!client.is_backend(&Url::parse("https://api.mealplan.app.evil.com/").unwrap()));
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let result = ApiClient::new("not a url", Arc::new(CredentialStore::in_memory()), validator());
        assert!(matches!(result, Err(ApiError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_valid_token_is_attached() {
        let server = MockServer::start();
        let client = client_for(&server);
        let token = access_token(3600, "a1");
        client.credentials().save(&token, "refresh-1", None).unwrap();

        let recipes = server.mock(|when, then| {
            when.method(GET).path("/recipes").header("authorization", bearer(&token));
            then.status(200).json_body(json!([{ "id": 1 }]));
        });

        let body: Value = client.get("/recipes").await.unwrap();
        assert_eq!(body[0]["id"], 1);
        recipes.assert_calls(1);
    }

    #[tokio::test]
    async fn test_unauthenticated_request_has_no_authorization_header() {
        let server = MockServer::start();
        let client = client_for(&server);

        let public = server.mock(|when, then| {
            when.method(GET).path("/recipes/public").header_missing("authorization");
            then.status(200).json_body(json!({ "ok": true }));
        });

        let body: Value = client.get("recipes/public").await.unwrap();
        assert_eq!(body["ok"], true);
        public.assert_calls(1);
    }

    #[tokio::test]
    async fn test_unauthenticated_401_surfaces_unauthorized() {
        let server = MockServer::start();
        let client = client_for(&server);
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200);
        });
        server.mock(|when, then| {
            when.method(GET).path("/goals");
            then.status(401);
        });

        let result: Result<Value, ApiError> = client.get("/goals").await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(refresh.calls(), 0);
    }

    #[tokio::test]
    async fn test_external_host_never_gets_token_or_refresh() {
        let backend = MockServer::start();
        let external = MockServer::start();
        let client = client_for(&backend);
        client
            .credentials()
            .save(&access_token(3600, "a1"), "refresh-1", None)
            .unwrap();

        let refresh = backend.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200);
        });
        let geo = external.mock(|when, then| {
            when.method(GET).path("/geocode").header_missing("authorization");
            then.status(401);
        });

        let response = client
            .execute(reqwest::Method::GET, &external.url("/geocode"), None::<&()>)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        geo.assert_calls(1);
        assert_eq!(refresh.calls(), 0);
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once_then_sends_with_new_token() {
        let server = MockServer::start();
        let client = client_for(&server);
        client
            .credentials()
            .save(&access_token(-60, "old"), "refresh-1", None)
            .unwrap();
        let renewed = access_token(3600, "new");

        let refresh = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/refresh")
                .header_missing("authorization")
                .json_body(json!({ "refreshToken": "refresh-1" }));
            then.status(200)
                .json_body(json!({ "accessToken": renewed, "refreshToken": "refresh-2" }));
        });
        let meals = server.mock(|when, then| {
            when.method(GET).path("/meals").header("authorization", bearer(&renewed));
            then.status(200).json_body(json!([]));
        });

        let body: Value = client.get("/meals").await.unwrap();
        assert_eq!(body, json!([]));
        refresh.assert_calls(1);
        meals.assert_calls(1);
        assert_eq!(client.credentials().access_token().as_deref(), Some(renewed.as_str()));
        assert_eq!(client.credentials().refresh_token().as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn test_rejected_token_refreshes_and_retries_once() {
        let server = MockServer::start();
        let client = client_for(&server);
        let revoked = access_token(3600, "revoked");
        let renewed = access_token(3600, "renewed");
        client.credentials().save(&revoked, "refresh-1", None).unwrap();

        let refresh = server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200)
                .json_body(json!({ "accessToken": renewed, "refreshToken": "refresh-2" }));
        });
        let rejected = server.mock(|when, then| {
            when.method(PUT).path("/menus/9").header("authorization", bearer(&revoked));
            then.status(401);
        });
        let accepted = server.mock(|when, then| {
            when.method(PUT)
                .path("/menus/9")
                .header("authorization", bearer(&renewed))
                .json_body(json!({ "name": "Week 12" }));
            then.status(200).json_body(json!({ "id": 9, "name": "Week 12" }));
        });

        let body: Value = client.put("/menus/9", &json!({ "name": "Week 12" })).await.unwrap();
        assert_eq!(body["id"], 9);
        refresh.assert_calls(1);
        rejected.assert_calls(1);
        accepted.assert_calls(1);
        assert_eq!(client.credentials().access_token().as_deref(), Some(renewed.as_str()));
    }

    #[tokio::test]
    async fn test_second_401_after_refresh_is_not_refreshed_again() {
        let server = MockServer::start();
        let client = client_for(&server);
        client
            .credentials()
            .save(&access_token(3600, "a1"), "refresh-1", None)
            .unwrap();
        let renewed = access_token(3600, "a2");

        let refresh = server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200)
                .json_body(json!({ "accessToken": renewed, "refreshToken": "refresh-2" }));
        });
        let always_401 = server.mock(|when, then| {
            when.method(GET).path("/ingredients");
            then.status(401);
        });

        let result: Result<Value, ApiError> = client.get("/ingredients").await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
        refresh.assert_calls(1);
        always_401.assert_calls(2);
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_session() {
        let server = MockServer::start();
        let client = client_for(&server);
        client
            .credentials()
            .save(&access_token(-60, "old"), "refresh-1", Some("user-7"))
            .unwrap();

        let refresh = server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(401).body("refresh token revoked");
        });
        let meals = server.mock(|when, then| {
            when.method(GET).path("/meals");
            then.status(200).json_body(json!([]));
        });

        let result: Result<Value, ApiError> = client.get("/meals").await;
        let err = result.unwrap_err();
        assert!(err.is_session_terminated());
        refresh.assert_calls(1);
        assert_eq!(meals.calls(), 0);

        let credentials = client.credentials();
        assert!(!credentials.is_authenticated());
        assert!(credentials.refresh_token().is_none());
        assert!(credentials.user_id().is_none());
        assert!(credentials.session().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_refresh_endpoint_clears_session() {
        let client = unreachable_client();
        client
            .credentials()
            .save(&access_token(-60, "old"), "refresh-1", Some("user-7"))
            .unwrap();

        let result: Result<Value, ApiError> = client.get("/meals").await;
        assert!(matches!(result, Err(ApiError::RefreshFailed(_))));
        assert!(client.credentials().session().is_none());
        assert!(client.credentials().refresh_token().is_none());
    }

    #[tokio::test]
    async fn test_network_error_keeps_session() {
        let client = unreachable_client();
        let access = access_token(3600, "a1");
        client.credentials().save(&access, "refresh-1", None).unwrap();

        let result: Result<Value, ApiError> = client.get("/meals").await;
        assert!(matches!(result, Err(ApiError::Network(_))));
        assert!(client.is_authenticated());
        assert_eq!(client.credentials().access_token().as_deref(), Some(access.as_str()));
        assert_eq!(client.credentials().refresh_token().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_malformed_refresh_response_clears_session() {
        let server = MockServer::start();
        let client = client_for(&server);
        client
            .credentials()
            .save(&access_token(-60, "old"), "refresh-1", None)
            .unwrap();

        server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200)
                .json_body(json!({ "accessToken": "not.a.jwt", "refreshToken": "refresh-2" }));
        });

        let result: Result<Value, ApiError> = client.get("/meals").await;
        assert!(matches!(result, Err(ApiError::RefreshFailed(_))));
        assert!(client.credentials().session().is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_keeps_refresh_token() {
        let server = MockServer::start();
        let client = client_for(&server);
        client
            .credentials()
            .save(&access_token(-60, "old"), "refresh-1", Some("user-7"))
            .unwrap();
        let renewed = access_token(3600, "new");

        server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200).json_body(json!({ "accessToken": renewed }));
        });
        server.mock(|when, then| {
            when.method(DELETE).path("/goals/4").header("authorization", bearer(&renewed));
            then.status(204);
        });

        client.delete("/goals/4").await.unwrap();
        assert_eq!(client.credentials().refresh_token().as_deref(), Some("refresh-1"));
        assert_eq!(client.credentials().user_id().as_deref(), Some("user-7"));
        assert_eq!(client.credentials().access_token().as_deref(), Some(renewed.as_str()));
    }

    #[tokio::test]
    async fn test_concurrent_expired_requests_share_one_refresh() {
        let server = MockServer::start();
        let client = client_for(&server);
        client
            .credentials()
            .save(&access_token(-60, "old"), "refresh-1", None)
            .unwrap();
        let renewed = access_token(3600, "new");

        let refresh = server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200)
                .json_body(json!({ "accessToken": renewed, "refreshToken": "refresh-2" }));
        });
        let recipes = server.mock(|when, then| {
            when.method(GET).path("/recipes").header("authorization", bearer(&renewed));
            then.status(200).json_body(json!([]));
        });

        let requests = (0..5).map(|_| client.get::<Value>("/recipes"));
        let results = futures::future::join_all(requests).await;

        assert!(results.iter().all(Result::is_ok));
        refresh.assert_calls(1);
        recipes.assert_calls(5);
    }

    #[tokio::test]
    async fn test_rate_limited_request_is_retried() {
        let server = MockServer::start();
        let client = client_for(&server);

        let limited = server.mock(|when, then| {
            when.method(GET).path("/menus");
            then.status(429);
        });

        let result: Result<Value, ApiError> = client.get("/menus").await;
        assert!(matches!(result, Err(ApiError::RateLimited)));
        limited.assert_calls(4);
    }

    #[tokio::test]
    async fn test_server_error_is_reported_without_clearing_session() {
        let server = MockServer::start();
        let client = client_for(&server);
        client
            .credentials()
            .save(&access_token(3600, "a1"), "refresh-1", None)
            .unwrap();

        server.mock(|when, then| {
            when.method(POST).path("/meals");
            then.status(503).body("maintenance");
        });

        let result: Result<Value, ApiError> = client.post("/meals", &json!({ "name": "Soup" })).await;
        match result {
            Err(ApiError::ServerError(body)) => assert_eq!(body, "maintenance"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_stores_verified_session() {
        let server = MockServer::start();
        let client = client_for(&server);
        let issued = access_token(3600, "login");

        let login = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/login")
                .json_body(json!({ "email": "cook@example.com", "password": "hunter2" }));
            then.status(200)
                .json_body(json!({ "accessToken": issued, "refreshToken": "refresh-1" }));
        });

        let session = client.login("cook@example.com", "hunter2").await.unwrap();
        login.assert_calls(1);
        assert_eq!(session.access_token, issued);
        assert_eq!(session.user_id.as_deref(), Some("42"));
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_rejects_unverifiable_token() {
        let server = MockServer::start();
        let client = client_for(&server);
        let forged = sign_token(
            &json!({
                "iss": TEST_ISSUER,
                "aud": TEST_AUDIENCE,
                "exp": chrono::Utc::now().timestamp() + 3600,
            }),
            "wrong-secret",
        );

        server.mock(|when, then| {
            when.method(POST).path("/auth/login");
            then.status(200)
                .json_body(json!({ "accessToken": forged, "refreshToken": "refresh-1" }));
        });

        let result = client.login("cook@example.com", "hunter2").await;
        assert!(matches!(result, Err(ApiError::InvalidResponse(_))));
        assert!(client.credentials().session().is_none());
    }

    #[tokio::test]
    async fn test_login_with_bad_credentials() {
        let server = MockServer::start();
        let client = client_for(&server);
        server.mock(|when, then| {
            when.method(POST).path("/auth/login");
            then.status(401);
        });

        let result = client.login("cook@example.com", "wrong").await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_register_then_logout() {
        let server = MockServer::start();
        let client = client_for(&server);
        let issued = access_token(3600, "register");

        let register = server.mock(|when, then| {
            when.method(POST).path("/auth/register").json_body(json!({
                "email": "new@example.com",
                "password": "s3cret",
                "firstName": "Ada",
                "lastName": "Lovelace",
            }));
            then.status(201).json_body(json!({
                "accessToken": issued,
                "refreshToken": "refresh-1",
                "userId": 77,
            }));
        });

        let request = RegisterRequest {
            email: "new@example.com".to_string(),
            password: "s3cret".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        };
        let session = client.register(&request).await.unwrap();
        register.assert_calls(1);
        assert_eq!(session.user_id.as_deref(), Some("77"));

        client.logout().unwrap();
        client.logout().unwrap();
        assert!(!client.is_authenticated());
        assert!(client.credentials().session().is_none());
    }
}
