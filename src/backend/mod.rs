//! External backend seam: identity-based auth plus a per-user record store.
//!
//! The production implementation is the REST client in [`rest`]; tests use the
//! in-memory fake in [`mock`]. The session manager and preference
//! synchronizers only ever see these traits.

pub mod rest;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum BackendError {
    /// Connectivity failure. Retryable by the caller; never cached as a
    /// definitive answer.
    #[error("Network error: {0}")]
    Network(String),

    /// The backend understood the request and refused it (bad credentials,
    /// policy). The message is the server's own, preserved verbatim.
    #[error("{0}")]
    Rejected(String),

    /// Unexpected status without a usable error body.
    #[error("Backend returned status {0}")]
    Service(u16),

    #[error("Malformed backend response")]
    Decode,
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Network(err.to_string())
    }
}

impl BackendError {
    /// Transient failures that should not poison caches. A 4xx without an
    /// error body is still a definitive answer; only connectivity problems
    /// and server-side errors qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Network(_) => true,
            BackendError::Service(status) => *status >= 500,
            _ => false,
        }
    }
}

/// An authenticated backend session, as returned by sign-in/sign-up and as
/// persisted (encrypted) for restore across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSession {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Auth-state change notifications emitted by the backend. Mirrors the
/// explicit call paths so state converges even when a local update was missed.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    SignedIn(AuthSession),
    TokenRefreshed(AuthSession),
    SignedOut,
}

impl AuthEvent {
    pub fn session(&self) -> Option<&AuthSession> {
        match self {
            AuthEvent::SignedIn(session) | AuthEvent::TokenRefreshed(session) => Some(session),
            AuthEvent::SignedOut => None,
        }
    }
}

/// Raw per-user record as stored remotely. Decoded into the internal
/// `Profile` type with explicit validation; fields are optional because the
/// row may be partial or absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub theme: Option<String>,
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, BackendError>;

    /// Register with auto-confirm intent. Backends configured for email
    /// verification return `None` instead of an active session.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<Option<AuthSession>, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Re-adopt a previously persisted session so subsequent record-store
    /// calls are authenticated. Emits no auth event.
    async fn adopt_session(&self, session: AuthSession);

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Point read of the full per-user record. `None` when no row exists.
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRecord>, BackendError>;

    /// Read a single field of the per-user record.
    async fn read_field(&self, user_id: &str, field: &str)
        -> Result<Option<String>, BackendError>;

    /// Upsert a single field of the per-user record.
    async fn write_field(
        &self,
        user_id: &str,
        field: &str,
        value: &str,
    ) -> Result<(), BackendError>;

    /// Upsert this device's push-notification token for `user_id`.
    async fn register_push_token(
        &self,
        user_id: &str,
        device_id: &str,
        token: &str,
    ) -> Result<(), BackendError>;

    /// Remove every push-notification registration for `user_id`.
    async fn unregister_push_tokens(&self, user_id: &str) -> Result<(), BackendError>;
}
