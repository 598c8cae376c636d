use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::RefreshConfig;
use crate::error::{Error, Result};

/// Tokens within this window of expiry are refreshed early.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Supplies a bearer token; called before every API request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        if self.token.trim().is_empty() {
            return Err(Error::Auth("not signed in".into()));
        }
        Ok(self.token.clone())
    }
}

#[derive(Debug)]
struct TokenState {
    access_token: Option<String>,
    expires_at: Option<Instant>,
    refresh_token: String,
}

impl TokenState {
    fn valid_token(&self, now: Instant) -> Option<&str> {
        let token = self.access_token.as_deref()?;
        match self.expires_at {
            Some(expires_at) if now + EXPIRY_SKEW < expires_at => Some(token),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
}

/// OAuth2 refresh-token grant with an in-memory token cache.
pub struct RefreshingTokenProvider {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
    redirect_uri: Option<String>,
    scope: String,
    state: Mutex<TokenState>,
}

impl RefreshingTokenProvider {
    pub fn new(http: reqwest::Client, config: &RefreshConfig) -> Self {
        Self {
            http,
            endpoint: config.token_endpoint(),
            client_id: config.client_id.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scope: config.scopes.join(" "),
            state: Mutex::new(TokenState {
                access_token: None,
                expires_at: None,
                refresh_token: config.refresh_token.clone(),
            }),
        }
    }

    async fn refresh(&self, state: &mut TokenState) -> Result<String> {
        if state.refresh_token.trim().is_empty() {
            return Err(Error::Auth("not signed in".into()));
        }
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", state.refresh_token.as_str()),
            ("scope", self.scope.as_str()),
        ];
        if let Some(redirect) = self.redirect_uri.as_deref() {
            form.push(("redirect_uri", redirect));
        }

        debug!(endpoint = %self.endpoint, "refreshing access token");
        let response = self
            .http
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|err| Error::Auth(format!("token refresh failed: {err}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| Error::Auth(format!("token refresh failed: {err}")))?;
        if !status.is_success() {
            let detail = Error::http(status.as_u16(), &String::from_utf8_lossy(&body));
            return Err(Error::Auth(format!("token refresh failed: {detail}")));
        }
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| Error::Auth(format!("token refresh returned bad JSON: {err}")))?;

        let now = Instant::now();
        state.expires_at = Some(now + Duration::from_secs(parsed.expires_in.unwrap_or(3_600)));
        if let Some(rotated) = parsed.refresh_token.filter(|t| !t.is_empty()) {
            state.refresh_token = rotated;
        }
        state.access_token = Some(parsed.access_token.clone());
        info!(expires_in = ?parsed.expires_in, "access token refreshed");
        Ok(parsed.access_token)
    }
}

#[async_trait]
impl TokenProvider for RefreshingTokenProvider {
    async fn access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.valid_token(Instant::now()) {
            return Ok(token.to_string());
        }
        self.refresh(&mut state).await
    }
}
