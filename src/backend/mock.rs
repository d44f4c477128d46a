//! In-memory backend fake for tests: scripted accounts, a per-user record
//! map, and injectable failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use super::{AuthBackend, AuthEvent, AuthSession, BackendError, ProfileRecord, RecordStore};

/// Failure to inject into a mock call site.
#[derive(Debug, Clone)]
pub enum MockFailure {
    Rejected(String),
    Network,
    Service(u16),
}

impl MockFailure {
    fn to_error(&self) -> BackendError {
        match self {
            MockFailure::Rejected(message) => BackendError::Rejected(message.clone()),
            MockFailure::Network => BackendError::Network("connection refused".into()),
            MockFailure::Service(status) => BackendError::Service(*status),
        }
    }
}

#[derive(Default)]
pub struct MockBackend {
    accounts: Mutex<HashMap<String, (String, String)>>,
    records: Mutex<HashMap<String, HashMap<String, String>>>,
    push_tokens: Mutex<HashMap<(String, String), String>>,
    events: Option<broadcast::Sender<AuthEvent>>,
    session: Mutex<Option<AuthSession>>,

    sign_in_failure: Mutex<Option<MockFailure>>,
    profile_failure: Mutex<Option<MockFailure>>,
    read_failure: Mutex<Option<MockFailure>>,
    write_failure: Mutex<Option<MockFailure>>,
    fetch_delay: Mutex<Option<Duration>>,

    pub fetch_profile_calls: AtomicUsize,
    pub sign_out_calls: AtomicUsize,
    pub unregister_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            events: Some(events),
            ..Default::default()
        }
    }

    fn events(&self) -> &broadcast::Sender<AuthEvent> {
        self.events.as_ref().expect("mock constructed via new()")
    }

    pub async fn with_account(self, email: &str, password: &str, user_id: &str) -> Self {
        self.accounts
            .lock()
            .await
            .insert(email.to_string(), (password.to_string(), user_id.to_string()));
        self
    }

    pub async fn set_record_field(&self, user_id: &str, field: &str, value: &str) {
        self.records
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    pub async fn record_field(&self, user_id: &str, field: &str) -> Option<String> {
        self.records
            .lock()
            .await
            .get(user_id)
            .and_then(|fields| fields.get(field))
            .cloned()
    }

    pub async fn set_sign_in_failure(&self, failure: Option<MockFailure>) {
        *self.sign_in_failure.lock().await = failure;
    }

    pub async fn set_profile_failure(&self, failure: Option<MockFailure>) {
        *self.profile_failure.lock().await = failure;
    }

    pub async fn set_read_failure(&self, failure: Option<MockFailure>) {
        *self.read_failure.lock().await = failure;
    }

    pub async fn set_write_failure(&self, failure: Option<MockFailure>) {
        *self.write_failure.lock().await = failure;
    }

    pub async fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().await = Some(delay);
    }

    pub async fn push_token(&self, user_id: &str, device_id: &str) -> Option<String> {
        self.push_tokens
            .lock()
            .await
            .get(&(user_id.to_string(), device_id.to_string()))
            .cloned()
    }

    /// Simulate an externally originated auth-state notification.
    pub fn push_event(&self, event: AuthEvent) {
        let _ = self.events().send(event);
    }

    pub fn session_for(user_id: &str, email: &str) -> AuthSession {
        AuthSession {
            user_id: user_id.to_string(),
            email: email.to_string(),
            access_token: format!("token-{}", user_id),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }
}

#[async_trait]
impl AuthBackend for MockBackend {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
        if let Some(failure) = self.sign_in_failure.lock().await.as_ref() {
            return Err(failure.to_error());
        }

        let accounts = self.accounts.lock().await;
        match accounts.get(email) {
            Some((stored, user_id)) if stored == password => {
                let session = Self::session_for(user_id, email);
                *self.session.lock().await = Some(session.clone());
                let _ = self.events().send(AuthEvent::SignedIn(session.clone()));
                Ok(session)
            }
            _ => Err(BackendError::Rejected("Invalid login credentials".into())),
        }
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<Option<AuthSession>, BackendError> {
        let user_id = format!("user-{}", uuid::Uuid::new_v4());

        self.accounts
            .lock()
            .await
            .insert(email.to_string(), (password.to_string(), user_id.clone()));
        self.set_record_field(&user_id, "full_name", display_name).await;
        self.set_record_field(&user_id, "email", email).await;

        let session = Self::session_for(&user_id, email);
        *self.session.lock().await = Some(session.clone());
        let _ = self.events().send(AuthEvent::SignedIn(session.clone()));

        Ok(Some(session))
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        *self.session.lock().await = None;
        let _ = self.events().send(AuthEvent::SignedOut);
        Ok(())
    }

    async fn adopt_session(&self, session: AuthSession) {
        *self.session.lock().await = Some(session);
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events().subscribe()
    }
}

#[async_trait]
impl RecordStore for MockBackend {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRecord>, BackendError> {
        self.fetch_profile_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(failure) = self.profile_failure.lock().await.as_ref() {
            return Err(failure.to_error());
        }

        let records = self.records.lock().await;
        Ok(records.get(user_id).map(|fields| ProfileRecord {
            id: user_id.to_string(),
            email: fields.get("email").cloned(),
            full_name: fields.get("full_name").cloned(),
            theme: fields.get("theme").cloned(),
        }))
    }

    async fn read_field(
        &self,
        user_id: &str,
        field: &str,
    ) -> Result<Option<String>, BackendError> {
        if let Some(failure) = self.read_failure.lock().await.as_ref() {
            return Err(failure.to_error());
        }

        Ok(self.record_field(user_id, field).await)
    }

    async fn write_field(
        &self,
        user_id: &str,
        field: &str,
        value: &str,
    ) -> Result<(), BackendError> {
        if let Some(failure) = self.write_failure.lock().await.as_ref() {
            return Err(failure.to_error());
        }

        self.set_record_field(user_id, field, value).await;
        Ok(())
    }

    async fn register_push_token(
        &self,
        user_id: &str,
        device_id: &str,
        token: &str,
    ) -> Result<(), BackendError> {
        self.push_tokens
            .lock()
            .await
            .insert((user_id.to_string(), device_id.to_string()), token.to_string());
        Ok(())
    }

    async fn unregister_push_tokens(&self, user_id: &str) -> Result<(), BackendError> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        self.push_tokens
            .lock()
            .await
            .retain(|(owner, _), _| owner != user_id);
        Ok(())
    }
}
