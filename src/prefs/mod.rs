//! Preference synchronization: a single user-chosen value kept in memory,
//! persisted locally for instant availability, and mirrored to the per-user
//! remote record when someone is signed in. Remote wins on sign-in; local is
//! the offline fallback.

mod types;

pub use types::{Currency, Theme};

use std::sync::Arc;

use tokio::sync::watch;

use crate::backend::RecordStore;
use crate::db::Database;
use crate::session::Identity;

/// A value the preference synchronizer knows how to validate and store.
///
/// `parse` is the only way a stored string becomes a value; anything it
/// rejects is treated as corrupt and silently discarded.
pub trait Preference:
    Copy + Default + PartialEq + std::fmt::Debug + Send + Sync + 'static
{
    /// Key in the local key-value store.
    const LOCAL_KEY: &'static str;
    /// Field name in the remote per-user record.
    const REMOTE_FIELD: &'static str;

    fn parse(raw: &str) -> Option<Self>;
    fn as_str(&self) -> &'static str;
}

pub struct PreferenceSync<P: Preference> {
    db: Database,
    store: Arc<dyn RecordStore>,
    current: watch::Sender<P>,
}

impl<P: Preference> PreferenceSync<P> {
    pub fn new(db: Database, store: Arc<dyn RecordStore>) -> Self {
        let (current, _) = watch::channel(P::default());
        Self { db, store, current }
    }

    /// Current in-memory value; never blocks on I/O.
    pub fn get(&self) -> P {
        *self.current.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<P> {
        self.current.subscribe()
    }

    /// Startup load: local value first, then the remote-priority
    /// reconciliation when an identity is present.
    pub async fn load(&self, identity: Option<&Identity>) {
        match self.db.get_value(P::LOCAL_KEY).await {
            Ok(Some(raw)) => match P::parse(&raw) {
                Some(value) => {
                    self.current.send_replace(value);
                }
                None => {
                    tracing::warn!(
                        "Discarding unrecognized stored {} value: {:?}",
                        P::LOCAL_KEY,
                        raw
                    );
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Local read of {} failed: {}", P::LOCAL_KEY, e);
            }
        }

        if let Some(identity) = identity {
            self.sync_with_remote(identity).await;
        }
    }

    /// Update the value. The in-memory change is observable immediately;
    /// local persistence and the remote mirror follow, both without rollback
    /// on failure.
    pub async fn set(&self, value: P, identity: Option<&Identity>) {
        self.current.send_replace(value);

        if let Err(e) = self.db.set_value(P::LOCAL_KEY, value.as_str()).await {
            tracing::warn!("Local persist of {} failed: {}", P::LOCAL_KEY, e);
        }

        if let Some(identity) = identity {
            if let Err(e) = self
                .store
                .write_field(&identity.user_id, P::REMOTE_FIELD, value.as_str())
                .await
            {
                tracing::warn!(
                    "Remote mirror of {} for {} failed: {}",
                    P::REMOTE_FIELD,
                    identity.user_id,
                    e
                );
            }
        }
    }

    /// Remote-priority reconciliation, re-run on every sign-in.
    pub async fn on_signed_in(&self, identity: &Identity) {
        self.sync_with_remote(identity).await;
    }

    /// Sign-out resets to the default and persists it locally. Applies to
    /// every preference uniformly; the remote copy stays for the next
    /// sign-in.
    pub async fn on_signed_out(&self) {
        let default = P::default();
        self.current.send_replace(default);

        if let Err(e) = self.db.set_value(P::LOCAL_KEY, default.as_str()).await {
            tracing::warn!("Local reset of {} failed: {}", P::LOCAL_KEY, e);
        }
    }

    async fn sync_with_remote(&self, identity: &Identity) {
        match self
            .store
            .read_field(&identity.user_id, P::REMOTE_FIELD)
            .await
        {
            Ok(Some(raw)) => match P::parse(&raw) {
                Some(value) => {
                    self.current.send_replace(value);
                    if let Err(e) = self.db.set_value(P::LOCAL_KEY, value.as_str()).await {
                        tracing::warn!("Local mirror of {} failed: {}", P::LOCAL_KEY, e);
                    }
                }
                None => {
                    tracing::warn!(
                        "Discarding unrecognized remote {} value: {:?}",
                        P::REMOTE_FIELD,
                        raw
                    );
                }
            },
            // Confirmed miss: establish the current value as the default on
            // both tiers.
            Ok(None) => {
                let value = self.get();
                if let Err(e) = self
                    .store
                    .write_field(&identity.user_id, P::REMOTE_FIELD, value.as_str())
                    .await
                {
                    tracing::warn!(
                        "Establishing remote {} for {} failed: {}",
                        P::REMOTE_FIELD,
                        identity.user_id,
                        e
                    );
                }
                if let Err(e) = self.db.set_value(P::LOCAL_KEY, value.as_str()).await {
                    tracing::warn!("Local persist of {} failed: {}", P::LOCAL_KEY, e);
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Remote read of {} for {} failed: {}",
                    P::REMOTE_FIELD,
                    identity.user_id,
                    e
                );
            }
        }
    }
}
