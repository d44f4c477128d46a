//! REST client for the hosted backend (GoTrue-style auth endpoints plus a
//! PostgREST-style record store).

use chrono::{Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, RwLock};

use async_trait::async_trait;

use super::{AuthBackend, AuthEvent, AuthSession, BackendError, ProfileRecord, RecordStore};

const AUTH_TOKEN_PATH: &str = "/auth/v1/token";
const AUTH_SIGNUP_PATH: &str = "/auth/v1/signup";
const AUTH_LOGOUT_PATH: &str = "/auth/v1/logout";
const PROFILES_PATH: &str = "/rest/v1/profiles";
const PUSH_TOKENS_PATH: &str = "/rest/v1/push_tokens";

const EVENT_CHANNEL_CAPACITY: usize = 16;

pub struct RestBackend {
    http: Client,
    base_url: String,
    anon_key: String,
    session: RwLock<Option<AuthSession>>,
    events: broadcast::Sender<AuthEvent>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    user: TokenUser,
}

#[derive(Deserialize)]
struct TokenUser {
    id: String,
    email: Option<String>,
}

/// Sign-up responses carry a session only when the backend auto-confirms.
#[derive(Deserialize)]
struct SignUpResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    user: Option<TokenUser>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

impl RestBackend {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let anon_key = anon_key.into();

        let mut hasher = Sha256::new();
        hasher.update(anon_key.as_bytes());
        let fingerprint = hex_prefix(&hasher.finalize(), 4);
        tracing::debug!("REST backend for {} (key fingerprint {})", base_url, fingerprint);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            http: Client::new(),
            base_url,
            anon_key,
            session: RwLock::new(None),
            events,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn bearer_token(&self) -> String {
        match self.session.read().await.as_ref() {
            Some(session) => session.access_token.clone(),
            None => self.anon_key.clone(),
        }
    }

    fn emit(&self, event: AuthEvent) {
        // No subscribers is fine; the session manager attaches later.
        let _ = self.events.send(event);
    }

    fn session_from_token(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: i64,
        user: TokenUser,
    ) -> AuthSession {
        AuthSession {
            user_id: user.id,
            email: user.email.unwrap_or_default(),
            access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        }
    }

    /// Map a non-success response to the error taxonomy: a 4xx with a usable
    /// error body becomes `Rejected` with the server's message verbatim.
    async fn error_from(response: Response) -> BackendError {
        let status = response.status();

        if status.is_client_error() {
            if let Ok(body) = response.json::<ErrorBody>().await {
                if let Some(message) = body.error_description.or(body.msg).or(body.message) {
                    return BackendError::Rejected(message);
                }
            }
        }

        BackendError::Service(status.as_u16())
    }
}

#[async_trait]
impl AuthBackend for RestBackend {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
        let response = self
            .http
            .post(self.url(AUTH_TOKEN_PATH))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let token: TokenResponse = response.json().await.map_err(|_| BackendError::Decode)?;
        let session = Self::session_from_token(
            token.access_token,
            token.refresh_token,
            token.expires_in,
            token.user,
        );

        *self.session.write().await = Some(session.clone());
        self.emit(AuthEvent::SignedIn(session.clone()));

        tracing::info!("Signed in as {}", session.user_id);
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<Option<AuthSession>, BackendError> {
        let response = self
            .http
            .post(self.url(AUTH_SIGNUP_PATH))
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "data": { "full_name": display_name },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: SignUpResponse = response.json().await.map_err(|_| BackendError::Decode)?;

        let session = match (body.access_token, body.user) {
            (Some(access_token), Some(user)) => Some(Self::session_from_token(
                access_token,
                body.refresh_token,
                body.expires_in.unwrap_or(3600),
                user,
            )),
            // Confirmation still pending on the backend side
            _ => None,
        };

        if let Some(session) = &session {
            *self.session.write().await = Some(session.clone());
            self.emit(AuthEvent::SignedIn(session.clone()));
            tracing::info!("Signed up and in as {}", session.user_id);
        }

        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let token = self.bearer_token().await;

        let result = self
            .http
            .post(self.url(AUTH_LOGOUT_PATH))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await;

        // The local session is gone regardless of what the wire did; a
        // failed logout must not leave a stale bearer token behind.
        *self.session.write().await = None;
        self.emit(AuthEvent::SignedOut);

        let response = result?;

        // 401 means the token was already invalid remotely; same outcome.
        if !response.status().is_success() && response.status() != StatusCode::UNAUTHORIZED {
            return Err(Self::error_from(response).await);
        }

        Ok(())
    }

    async fn adopt_session(&self, session: AuthSession) {
        *self.session.write().await = Some(session);
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl RecordStore for RestBackend {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRecord>, BackendError> {
        let token = self.bearer_token().await;

        let response = self
            .http
            .get(self.url(PROFILES_PATH))
            .query(&[
                ("id", format!("eq.{}", user_id)),
                ("select", "id,email,full_name,theme".to_string()),
            ])
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let mut rows: Vec<ProfileRecord> =
            response.json().await.map_err(|_| BackendError::Decode)?;

        Ok(if rows.is_empty() { None } else { Some(rows.remove(0)) })
    }

    async fn read_field(
        &self,
        user_id: &str,
        field: &str,
    ) -> Result<Option<String>, BackendError> {
        let token = self.bearer_token().await;

        let response = self
            .http
            .get(self.url(PROFILES_PATH))
            .query(&[("id", format!("eq.{}", user_id)), ("select", field.to_string())])
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let rows: Vec<serde_json::Map<String, serde_json::Value>> =
            response.json().await.map_err(|_| BackendError::Decode)?;

        let value = rows
            .first()
            .and_then(|row| row.get(field))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(value)
    }

    async fn write_field(
        &self,
        user_id: &str,
        field: &str,
        value: &str,
    ) -> Result<(), BackendError> {
        let token = self.bearer_token().await;

        let response = self
            .http
            .post(self.url(PROFILES_PATH))
            .header("apikey", &self.anon_key)
            .header("Prefer", "resolution=merge-duplicates")
            .bearer_auth(token)
            .json(&serde_json::json!([{ "id": user_id, field: value }]))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        Ok(())
    }

    async fn register_push_token(
        &self,
        user_id: &str,
        device_id: &str,
        token: &str,
    ) -> Result<(), BackendError> {
        let bearer = self.bearer_token().await;

        let response = self
            .http
            .post(self.url(PUSH_TOKENS_PATH))
            .header("apikey", &self.anon_key)
            .header("Prefer", "resolution=merge-duplicates")
            .bearer_auth(bearer)
            .json(&serde_json::json!([{
                "user_id": user_id,
                "device_id": device_id,
                "token": token,
            }]))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        tracing::info!("Registered push token for {} on device {}", user_id, device_id);
        Ok(())
    }

    async fn unregister_push_tokens(&self, user_id: &str) -> Result<(), BackendError> {
        let token = self.bearer_token().await;

        let response = self
            .http
            .delete(self.url(PUSH_TOKENS_PATH))
            .query(&[("user_id", format!("eq.{}", user_id))])
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        tracing::info!("Unregistered push tokens for {}", user_id);
        Ok(())
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len)
        .map(|b| format!("{:02x}", b))
        .collect()
}
