//! Authenticated-identity lifecycle: startup restore, sign-in/up/out,
//! biometric sign-in, and the auth-event watcher that keeps local state
//! converged with the backend's own notion of the session.
//!
//! Exactly one identity is current at a time, published on a watch channel
//! that the preference synchronizers and UI observe. Every async resolution
//! is tagged with the user id it was requested for and checked against the
//! current identity before anything is applied, so a fetch started for one
//! user can never land under another.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::backend::{AuthBackend, AuthEvent, AuthSession, BackendError, RecordStore};
use crate::db::{Database, DbError};
use crate::platform::BiometricAuthenticator;
use crate::profile::ProfileCache;
use crate::vault::{CredentialVault, StoredCredentials, VaultError};

const BIOMETRIC_FLAG_KEY: &str = "biometric_enabled";

#[derive(Error, Debug)]
pub enum SessionError {
    /// The backend refused the credentials or request; the message is the
    /// server's own.
    #[error("{0}")]
    Rejected(String),

    #[error("Backend error: {0}")]
    Backend(BackendError),

    #[error("Biometric check failed")]
    BiometricFailed,

    #[error("No stored credentials for biometric sign-in")]
    NoStoredCredentials,

    #[error("Credential vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Local store error: {0}")]
    Db(#[from] DbError),
}

impl From<BackendError> for SessionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Rejected(message) => SessionError::Rejected(message),
            other => SessionError::Backend(other),
        }
    }
}

/// The currently authenticated user, as seen by the rest of the app.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&AuthSession> for Identity {
    fn from(session: &AuthSession) -> Self {
        Self {
            user_id: session.user_id.clone(),
            email: session.email.clone(),
            expires_at: session.expires_at,
        }
    }
}

pub struct SessionManager {
    auth: Arc<dyn AuthBackend>,
    records: Arc<dyn RecordStore>,
    profiles: Arc<ProfileCache>,
    vault: Arc<CredentialVault>,
    biometrics: Arc<dyn BiometricAuthenticator>,
    db: Database,
    identity: watch::Sender<Option<Identity>>,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        auth: Arc<dyn AuthBackend>,
        records: Arc<dyn RecordStore>,
        profiles: Arc<ProfileCache>,
        vault: Arc<CredentialVault>,
        biometrics: Arc<dyn BiometricAuthenticator>,
        db: Database,
    ) -> Self {
        let (identity, _) = watch::channel(None);

        Self {
            auth,
            records,
            profiles,
            vault,
            biometrics,
            db,
            identity,
            watcher: std::sync::Mutex::new(None),
        }
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    /// Identity stream for downstream fan-out (preferences, UI).
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }

    /// Restore a persisted session on startup. A missing session leaves the
    /// identity absent; an expired one triggers a forced sign-out (recovery,
    /// not an error); a valid one is adopted and the profile warmed in the
    /// background.
    pub async fn restore_session(&self) -> Result<(), SessionError> {
        let stored = match self.vault.load_session().await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Could not read persisted session: {}", e);
                None
            }
        };

        match stored {
            None => {
                self.identity.send_replace(None);
            }
            Some(session) if session.is_expired() => {
                self.force_sign_out(&session).await;
            }
            Some(session) => {
                self.auth.adopt_session(session.clone()).await;
                self.apply_session(&session).await;
                tracing::info!("Restored session for {}", session.user_id);
            }
        }

        Ok(())
    }

    /// Sign in with email and password. The email is trimmed before use. On
    /// rejection the identity is untouched and the server's message comes
    /// back verbatim.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, SessionError> {
        let email = email.trim();
        let session = self.auth.sign_in(email, password).await?;

        self.finish_sign_in(&session, Some(password)).await;
        Ok(Identity::from(&session))
    }

    /// Register a new account with auto-confirm intent. Returns `None` when
    /// the backend requires a confirmation step before issuing a session.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<Option<Identity>, SessionError> {
        let email = email.trim();
        let Some(session) = self.auth.sign_up(email, password, display_name).await? else {
            tracing::info!("Sign-up for {} pending confirmation", email);
            return Ok(None);
        };

        self.finish_sign_in(&session, Some(password)).await;
        Ok(Some(Identity::from(&session)))
    }

    /// Sign out the current identity. Push-token unregistration is
    /// best-effort; local state is cleared even if the remote call fails.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let Some(identity) = self.current_identity() else {
            return Ok(());
        };

        if let Err(e) = self.records.unregister_push_tokens(&identity.user_id).await {
            tracing::warn!("Push-token unregistration for {} failed: {}", identity.user_id, e);
        }

        self.profiles.invalidate(&identity.user_id).await;

        let remote = self.auth.sign_out().await;

        if let Err(e) = self.vault.clear_session().await {
            tracing::warn!("Clearing persisted session failed: {}", e);
        }
        self.identity.send_replace(None);
        tracing::info!("Signed out {}", identity.user_id);

        remote.map_err(SessionError::from)
    }

    /// Register the host's push token for the current identity, keyed by the
    /// stable device id so sign-out can target this device's registrations.
    /// A call while signed out is a no-op.
    pub async fn register_push_token(&self, token: &str) -> Result<(), SessionError> {
        let Some(identity) = self.current_identity() else {
            return Ok(());
        };

        let device_id = self.db.device_id().await?;
        self.records
            .register_push_token(&identity.user_id, &device_id, token)
            .await?;

        Ok(())
    }

    /// Sign in using the platform biometric prompt and previously stored
    /// credentials.
    pub async fn biometric_sign_in(&self) -> Result<Identity, SessionError> {
        let accepted = self
            .biometrics
            .authenticate("Sign in to LifeSync")
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Biometric capability failed: {}", e);
                false
            });

        if !accepted {
            return Err(SessionError::BiometricFailed);
        }

        let credentials = self
            .vault
            .load_credentials()
            .await?
            .ok_or(SessionError::NoStoredCredentials)?;

        self.sign_in(&credentials.email, &credentials.password).await
    }

    pub async fn biometric_enabled(&self) -> bool {
        matches!(
            self.db.get_value(BIOMETRIC_FLAG_KEY).await,
            Ok(Some(value)) if value == "true"
        )
    }

    /// Opt in or out of biometric sign-in. Credentials are captured on the
    /// next successful password sign-in; opting out drops any stored pair.
    pub async fn set_biometric_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        if let Err(e) = self
            .db
            .set_value(BIOMETRIC_FLAG_KEY, if enabled { "true" } else { "false" })
            .await
        {
            tracing::warn!("Persisting biometric flag failed: {}", e);
        }

        if !enabled {
            self.vault.clear_credentials().await?;
        }

        Ok(())
    }

    /// Subscribe to the backend's auth-event stream for the lifetime of this
    /// manager. Events mirror the explicit call paths so state converges
    /// even when a local update was missed or delayed.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.watcher.lock().expect("watcher lock");
        if guard.is_some() {
            return;
        }

        let mut events = self.auth.subscribe();
        let manager = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        // Weak upgrade doubles as the liveness check: once
                        // the manager is gone, stop touching state.
                        let Some(manager) = manager.upgrade() else { break };
                        manager.handle_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Auth event stream lagged by {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *guard = Some(handle);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.watcher.lock().expect("watcher lock").take() {
            handle.abort();
        }
    }

    async fn handle_event(&self, event: AuthEvent) {
        match event {
            AuthEvent::SignedOut => {
                if let Some(identity) = self.current_identity() {
                    self.profiles.invalidate(&identity.user_id).await;
                }
                if let Err(e) = self.vault.clear_session().await {
                    tracing::warn!("Clearing persisted session failed: {}", e);
                }
                self.identity.send_replace(None);
            }
            event => {
                let Some(session) = event.session() else { return };

                // A notification for an already-expired session is stale by
                // definition; applying it would clobber newer state.
                if session.is_expired() {
                    tracing::warn!("Ignoring auth event for expired session {}", session.user_id);
                    return;
                }

                if self.apply_session(session).await {
                    if let Err(e) = self.vault.save_session(session).await {
                        tracing::warn!("Persisting session failed: {}", e);
                    }
                }
            }
        }
    }

    async fn finish_sign_in(&self, session: &AuthSession, password: Option<&str>) {
        self.apply_session(session).await;

        if let Err(e) = self.vault.save_session(session).await {
            tracing::warn!("Persisting session failed: {}", e);
        }

        // Opportunistic capture for biometric reuse; never fails the sign-in.
        if let Some(password) = password {
            if self.biometric_enabled().await {
                let credentials = StoredCredentials {
                    email: session.email.clone(),
                    password: password.to_string(),
                };
                if let Err(e) = self.vault.save_credentials(&credentials).await {
                    tracing::warn!("Storing biometric credentials failed: {}", e);
                }
            }
        }
    }

    /// Set the current identity from a session and warm the profile cache in
    /// the background. Idempotent: re-applying the session already current
    /// is a no-op. Returns whether anything changed.
    async fn apply_session(&self, session: &AuthSession) -> bool {
        let next = Identity::from(session);

        let previous = self.identity.borrow().clone();
        if previous.as_ref() == Some(&next) {
            return false;
        }

        // A direct switch to a different user drops the previous user's
        // cached profile before the new identity becomes observable.
        if let Some(previous) = previous {
            if previous.user_id != next.user_id {
                self.profiles.invalidate(&previous.user_id).await;
            }
        }

        self.identity.send_replace(Some(next));
        self.spawn_profile_fetch(session.user_id.clone());
        true
    }

    /// Non-blocking profile warm-up. The result is only kept if the identity
    /// it was fetched for is still current when it resolves.
    fn spawn_profile_fetch(&self, user_id: String) {
        let profiles = self.profiles.clone();
        let identity = self.identity.subscribe();

        tokio::spawn(async move {
            let result = profiles.fetch(&user_id).await;

            let still_current = identity
                .borrow()
                .as_ref()
                .map(|current| current.user_id == user_id)
                .unwrap_or(false);

            match result {
                Ok(_) if !still_current => {
                    // Superseded while in flight; drop the warm copy.
                    profiles.invalidate(&user_id).await;
                    tracing::debug!("Discarded stale profile fetch for {}", user_id);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Background profile fetch for {} failed: {}", user_id, e);
                }
            }
        });
    }

    /// Recovery path for an expired persisted session: clear everything and
    /// invalidate the remote session once.
    async fn force_sign_out(&self, session: &AuthSession) {
        tracing::warn!("Persisted session for {} expired; forcing sign-out", session.user_id);

        self.profiles.invalidate(&session.user_id).await;

        if let Err(e) = self.auth.sign_out().await {
            tracing::warn!("Remote sign-out for expired session failed: {}", e);
        }
        if let Err(e) = self.vault.clear_session().await {
            tracing::warn!("Clearing persisted session failed: {}", e);
        }

        self.identity.send_replace(None);
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.lock().expect("watcher lock").take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockFailure};
    use crate::crypto::CryptoService;
    use crate::platform::fakes::ScriptedBiometrics;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        backend: Arc<MockBackend>,
        manager: Arc<SessionManager>,
        profiles: Arc<ProfileCache>,
        vault: Arc<CredentialVault>,
        db: Database,
    }

    async fn fixture_with(biometrics: ScriptedBiometrics) -> Fixture {
        let backend = Arc::new(MockBackend::new().with_account("a@b.com", "pw", "u1").await);
        backend.set_record_field("u1", "full_name", "Ada").await;

        let db = Database::in_memory().await.unwrap();
        let crypto = CryptoService::with_key([5u8; 32]).unwrap();
        let vault = Arc::new(CredentialVault::new(db.clone(), crypto));
        let profiles = Arc::new(ProfileCache::new(backend.clone()));

        let manager = Arc::new(SessionManager::new(
            backend.clone(),
            backend.clone(),
            profiles.clone(),
            vault.clone(),
            Arc::new(biometrics),
            db.clone(),
        ));

        Fixture { backend, manager, profiles, vault, db }
    }

    async fn fixture() -> Fixture {
        fixture_with(ScriptedBiometrics::accepting()).await
    }

    async fn wait_for_identity(
        rx: &mut watch::Receiver<Option<Identity>>,
        want: Option<&str>,
    ) {
        timeout(Duration::from_secs(1), async {
            loop {
                let current = rx.borrow().as_ref().map(|i| i.user_id.clone());
                if current.as_deref() == want {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("identity did not reach expected state");
    }

    #[tokio::test]
    async fn test_sign_in_trims_email_and_sets_identity() {
        let f = fixture().await;

        let identity = f.manager.sign_in("a@b.com ", "pw").await.unwrap();

        assert_eq!(identity.user_id, "u1");
        assert_eq!(f.manager.current_identity().unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn test_sign_in_rejection_preserves_message_and_identity() {
        let f = fixture().await;
        f.backend
            .set_sign_in_failure(Some(MockFailure::Rejected("invalid credentials".into())))
            .await;

        let err = f.manager.sign_in("a@b.com", "pw").await.unwrap_err();

        assert_eq!(err.to_string(), "invalid credentials");
        assert!(f.manager.current_identity().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_persists_session() {
        let f = fixture().await;

        f.manager.sign_in("a@b.com", "pw").await.unwrap();

        let stored = f.vault.load_session().await.unwrap().unwrap();
        assert_eq!(stored.user_id, "u1");
    }

    #[tokio::test]
    async fn test_sign_in_captures_credentials_when_biometric_enabled() {
        let f = fixture().await;
        f.manager.set_biometric_enabled(true).await.unwrap();

        f.manager.sign_in("a@b.com", "pw").await.unwrap();

        let stored = f.vault.load_credentials().await.unwrap().unwrap();
        assert_eq!(stored.email, "a@b.com");
        assert_eq!(stored.password, "pw");
    }

    #[tokio::test]
    async fn test_sign_in_skips_credential_capture_when_disabled() {
        let f = fixture().await;

        f.manager.sign_in("a@b.com", "pw").await.unwrap();

        assert!(f.vault.load_credentials().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sign_up_sets_identity() {
        let f = fixture().await;

        let identity = f
            .manager
            .sign_up("new@b.com", "pw2", "New User")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.manager.current_identity(), Some(identity));
    }

    #[tokio::test]
    async fn test_restore_without_stored_session() {
        let f = fixture().await;

        f.manager.restore_session().await.unwrap();

        assert!(f.manager.current_identity().is_none());
    }

    #[tokio::test]
    async fn test_restore_valid_session() {
        let f = fixture().await;
        f.vault
            .save_session(&MockBackend::session_for("u1", "a@b.com"))
            .await
            .unwrap();

        f.manager.restore_session().await.unwrap();

        assert_eq!(f.manager.current_identity().unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn test_restore_expired_session_forces_sign_out() {
        let f = fixture().await;

        let mut session = MockBackend::session_for("u1", "a@b.com");
        session.expires_at = Utc::now() - chrono::Duration::minutes(5);
        f.vault.save_session(&session).await.unwrap();
        // A stale cached profile must not survive the forced sign-out
        f.profiles.fetch("u1").await.unwrap();

        f.manager.restore_session().await.unwrap();

        assert!(f.manager.current_identity().is_none());
        assert_eq!(f.backend.sign_out_calls.load(Ordering::SeqCst), 1);
        assert!(f.profiles.cached("u1").await.is_none());
        assert!(f.vault.load_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sign_out_clears_everything() {
        let f = fixture().await;
        f.manager.sign_in("a@b.com", "pw").await.unwrap();
        f.profiles.fetch("u1").await.unwrap();

        f.manager.sign_out().await.unwrap();

        assert!(f.manager.current_identity().is_none());
        assert!(f.profiles.cached("u1").await.is_none());
        assert!(f.vault.load_session().await.unwrap().is_none());
        assert_eq!(f.backend.unregister_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sign_out_removes_this_devices_push_token() {
        let f = fixture().await;
        f.manager.sign_in("a@b.com", "pw").await.unwrap();
        f.manager.register_push_token("apns-1").await.unwrap();
        let device_id = f.db.device_id().await.unwrap();

        f.manager.sign_out().await.unwrap();

        assert!(f.backend.push_token("u1", &device_id).await.is_none());
    }

    #[tokio::test]
    async fn test_register_push_token_targets_this_device() {
        let f = fixture().await;
        f.manager.sign_in("a@b.com", "pw").await.unwrap();

        f.manager.register_push_token("apns-1").await.unwrap();

        let device_id = f.db.device_id().await.unwrap();
        assert_eq!(
            f.backend.push_token("u1", &device_id).await.as_deref(),
            Some("apns-1")
        );
    }

    #[tokio::test]
    async fn test_register_push_token_while_signed_out_is_noop() {
        let f = fixture().await;

        f.manager.register_push_token("apns-1").await.unwrap();

        let device_id = f.db.device_id().await.unwrap();
        assert!(f.backend.push_token("u1", &device_id).await.is_none());
    }

    #[tokio::test]
    async fn test_sign_out_when_signed_out_is_noop() {
        let f = fixture().await;

        f.manager.sign_out().await.unwrap();

        assert_eq!(f.backend.sign_out_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_biometric_sign_in_roundtrip() {
        let f = fixture().await;
        f.manager.set_biometric_enabled(true).await.unwrap();
        f.manager.sign_in("a@b.com", "pw").await.unwrap();
        f.manager.sign_out().await.unwrap();

        let identity = f.manager.biometric_sign_in().await.unwrap();

        assert_eq!(identity.user_id, "u1");
    }

    #[tokio::test]
    async fn test_biometric_sign_in_refused() {
        let f = fixture_with(ScriptedBiometrics::refusing()).await;

        let err = f.manager.biometric_sign_in().await.unwrap_err();
        assert!(matches!(err, SessionError::BiometricFailed));
    }

    #[tokio::test]
    async fn test_biometric_capability_failure_is_fail_closed() {
        let f = fixture_with(ScriptedBiometrics::unavailable()).await;

        let err = f.manager.biometric_sign_in().await.unwrap_err();
        assert!(matches!(err, SessionError::BiometricFailed));
    }

    #[tokio::test]
    async fn test_biometric_sign_in_without_stored_credentials() {
        let f = fixture().await;

        let err = f.manager.biometric_sign_in().await.unwrap_err();
        assert!(matches!(err, SessionError::NoStoredCredentials));
    }

    #[tokio::test]
    async fn test_disabling_biometrics_clears_credentials() {
        let f = fixture().await;
        f.manager.set_biometric_enabled(true).await.unwrap();
        f.manager.sign_in("a@b.com", "pw").await.unwrap();

        f.manager.set_biometric_enabled(false).await.unwrap();

        assert!(f.vault.load_credentials().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watcher_applies_external_sign_in() {
        let f = fixture().await;
        f.manager.start();
        let mut rx = f.manager.subscribe();

        f.backend.push_event(AuthEvent::SignedIn(MockBackend::session_for("u9", "x@y.com")));

        wait_for_identity(&mut rx, Some("u9")).await;
    }

    #[tokio::test]
    async fn test_watcher_applies_external_sign_out() {
        let f = fixture().await;
        f.manager.start();
        f.manager.sign_in("a@b.com", "pw").await.unwrap();
        let mut rx = f.manager.subscribe();

        f.backend.push_event(AuthEvent::SignedOut);

        wait_for_identity(&mut rx, None).await;
        assert!(f.vault.load_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watcher_ignores_stale_expired_event() {
        let f = fixture().await;
        f.manager.start();
        f.manager.sign_in("a@b.com", "pw").await.unwrap();

        let mut stale = MockBackend::session_for("old-user", "old@b.com");
        stale.expires_at = Utc::now() - chrono::Duration::hours(1);
        f.backend.push_event(AuthEvent::SignedIn(stale));

        // Give the watcher a beat to (not) act
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.manager.current_identity().unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn test_profile_fetch_resolving_after_sign_out_is_discarded() {
        let f = fixture().await;
        f.backend.set_fetch_delay(Duration::from_millis(50)).await;

        f.manager.sign_in("a@b.com", "pw").await.unwrap();
        f.manager.sign_out().await.unwrap();

        // Let the in-flight warm-up resolve against the now-absent identity
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(f.profiles.cached("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_identity_switch_drops_previous_users_profile() {
        let f = fixture().await;
        f.manager.start();
        f.manager.sign_in("a@b.com", "pw").await.unwrap();
        f.profiles.fetch("u1").await.unwrap();
        let mut rx = f.manager.subscribe();

        f.backend
            .push_event(AuthEvent::SignedIn(MockBackend::session_for("u2", "b@c.com")));

        wait_for_identity(&mut rx, Some("u2")).await;
        assert!(f.profiles.cached("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_explicit_and_event_updates_are_idempotent() {
        let f = fixture().await;
        f.manager.start();

        // The mock emits SignedIn for the explicit call too; both paths land
        // on the same state.
        f.manager.sign_in("a@b.com", "pw").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.manager.current_identity().unwrap().user_id, "u1");
    }
}
