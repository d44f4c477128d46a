//! Per-user profile cache. Each identity gets one memoized profile;
//! concurrent fetches for the same identity coalesce onto a single remote
//! read, so several UI surfaces mounting at once cost one request.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::backend::{BackendError, ProfileRecord, RecordStore};
use crate::prefs::{Preference, Theme};

/// Display record for one user, distinct from synced preferences.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub user_id: String,
    pub full_name: String,
    pub email: String,
    pub theme_hint: Theme,
}

impl Profile {
    /// Decode the raw remote record; an absent or unrecognized theme hint
    /// becomes the default rather than an error.
    fn from_record(record: ProfileRecord) -> Self {
        let theme_hint = record
            .theme
            .as_deref()
            .and_then(Theme::parse)
            .unwrap_or_default();

        Self {
            user_id: record.id,
            full_name: record.full_name.unwrap_or_default(),
            email: record.email.unwrap_or_default(),
            theme_hint,
        }
    }

    /// Placeholder cached when the backend has no record for the user, so a
    /// confirmed miss is not re-queried for the rest of the session.
    fn fallback(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            full_name: String::new(),
            email: String::new(),
            theme_hint: Theme::default(),
        }
    }
}

pub struct ProfileCache {
    store: Arc<dyn RecordStore>,
    entries: Mutex<HashMap<String, Arc<OnceCell<Profile>>>>,
}

impl ProfileCache {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the profile for `user_id`. Cached values return immediately;
    /// otherwise one remote read runs and every concurrent caller observes
    /// its result. Transient failures leave the slot empty so the next call
    /// retries; a confirmed miss caches a fallback profile.
    pub async fn fetch(&self, user_id: &str) -> Result<Profile, BackendError> {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries.entry(user_id.to_string()).or_default().clone()
        };

        let profile = cell
            .get_or_try_init(|| async {
                match self.store.fetch_profile(user_id).await {
                    Ok(Some(record)) => Ok(Profile::from_record(record)),
                    Ok(None) => {
                        tracing::warn!("No profile record for {}; caching fallback", user_id);
                        Ok(Profile::fallback(user_id))
                    }
                    Err(e) if e.is_transient() => Err(e),
                    Err(e) => {
                        tracing::warn!("Profile fetch for {} rejected: {}; caching fallback", user_id, e);
                        Ok(Profile::fallback(user_id))
                    }
                }
            })
            .await?;

        Ok(profile.clone())
    }

    /// Peek at the cached profile without triggering a fetch.
    pub async fn cached(&self, user_id: &str) -> Option<Profile> {
        let entries = self.entries.lock().await;
        entries.get(user_id).and_then(|cell| cell.get().cloned())
    }

    /// Drop the cached entry (and any in-flight marker) for one user.
    pub async fn invalidate(&self, user_id: &str) {
        self.entries.lock().await.remove(user_id);
    }

    /// Drop everything.
    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
    }
}
