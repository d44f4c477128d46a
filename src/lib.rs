//! Client-side sync core for the LifeSync app: session lifecycle, profile
//! caching, and local/remote preference reconciliation over a hosted backend.
//!
//! The UI shell owns rendering and navigation; this crate owns the state.
//! [`SyncCore`] wires the managers together and fans the current-identity
//! signal out to the parts that reconcile their own remote/local state.

pub mod backend;
pub mod crypto;
pub mod db;
pub mod logging;
pub mod notifications;
pub mod platform;
pub mod prefs;
pub mod profile;
pub mod session;
pub mod vault;

use std::sync::Arc;

use tokio::task::JoinHandle;

use backend::{AuthBackend, RecordStore};
use crypto::CryptoService;
use db::Database;
use notifications::PermissionTracker;
use platform::{BiometricAuthenticator, NotificationPermissions};
use prefs::{Currency, PreferenceSync, Theme};
use profile::ProfileCache;
use session::{Identity, SessionError, SessionManager};
use vault::CredentialVault;

/// The assembled client core. Construction is plain dependency injection so
/// tests can build isolated instances; nothing in here is process-global.
pub struct SyncCore {
    pub session: Arc<SessionManager>,
    pub profiles: Arc<ProfileCache>,
    pub theme: Arc<PreferenceSync<Theme>>,
    pub currency: Arc<PreferenceSync<Currency>>,
    pub notifications: Arc<PermissionTracker>,
    fanout: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncCore {
    pub fn new(
        auth: Arc<dyn AuthBackend>,
        records: Arc<dyn RecordStore>,
        db: Database,
        crypto: CryptoService,
        biometrics: Arc<dyn BiometricAuthenticator>,
        notification_permissions: Arc<dyn NotificationPermissions>,
    ) -> Self {
        let vault = Arc::new(CredentialVault::new(db.clone(), crypto));
        let profiles = Arc::new(ProfileCache::new(records.clone()));

        let session = Arc::new(SessionManager::new(
            auth,
            records.clone(),
            profiles.clone(),
            vault,
            biometrics,
            db.clone(),
        ));

        let theme = Arc::new(PreferenceSync::new(db.clone(), records.clone()));
        let currency = Arc::new(PreferenceSync::new(db, records));
        let notifications = Arc::new(PermissionTracker::new(notification_permissions));

        Self {
            session,
            profiles,
            theme,
            currency,
            notifications,
            fanout: std::sync::Mutex::new(None),
        }
    }

    /// Startup sequence: begin watching auth events, restore any persisted
    /// session, load both preferences (remote-priority when an identity came
    /// back), take one notification-permission reading, and start the
    /// identity fan-out.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.session.start();
        self.session.restore_session().await?;

        let identity = self.session.current_identity();
        self.theme.load(identity.as_ref()).await;
        self.currency.load(identity.as_ref()).await;

        self.notifications.refresh().await;

        self.spawn_identity_fanout();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.session.shutdown();
        if let Some(handle) = self.fanout.lock().expect("fanout lock").take() {
            handle.abort();
        }
    }

    /// Fan identity transitions out to the preference synchronizers. The
    /// managers never reach into each other; this signal is the only
    /// coordination between them.
    fn spawn_identity_fanout(&self) {
        let mut guard = self.fanout.lock().expect("fanout lock");
        if guard.is_some() {
            return;
        }

        let mut identities = self.session.subscribe();
        let theme = self.theme.clone();
        let currency = self.currency.clone();

        let handle = tokio::spawn(async move {
            let mut previous: Option<Identity> = identities.borrow_and_update().clone();

            while identities.changed().await.is_ok() {
                let current = identities.borrow_and_update().clone();

                match (&previous, &current) {
                    (previous, Some(identity))
                        if previous.as_ref().map(|p| p.user_id.as_str())
                            != Some(identity.user_id.as_str()) =>
                    {
                        theme.on_signed_in(identity).await;
                        currency.on_signed_in(identity).await;
                    }
                    (Some(_), None) => {
                        theme.on_signed_out().await;
                        currency.on_signed_out().await;
                    }
                    _ => {}
                }

                previous = current;
            }
        });

        *guard = Some(handle);
    }
}

impl Drop for SyncCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
