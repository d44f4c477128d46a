//! Notification permission tracking. The tri-state is re-derived from the
//! platform on demand and never persisted; any capability failure counts as
//! a denial.

use std::sync::Arc;

use tokio::sync::watch;

use crate::platform::NotificationPermissions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Unknown,
    Granted,
    Denied,
}

pub struct PermissionTracker {
    capability: Arc<dyn NotificationPermissions>,
    state: watch::Sender<PermissionState>,
}

impl PermissionTracker {
    pub fn new(capability: Arc<dyn NotificationPermissions>) -> Self {
        let (state, _) = watch::channel(PermissionState::Unknown);
        Self { capability, state }
    }

    pub fn state(&self) -> PermissionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PermissionState> {
        self.state.subscribe()
    }

    /// Query the platform and update the tri-state. Fail-closed: a query
    /// failure reads as denied.
    pub async fn refresh(&self) -> PermissionState {
        let state = match self.capability.status().await {
            Ok(true) => PermissionState::Granted,
            Ok(false) => PermissionState::Denied,
            Err(e) => {
                tracing::warn!("Notification permission query failed: {}", e);
                PermissionState::Denied
            }
        };

        self.state.send_replace(state);
        state
    }

    /// Show the platform prompt, record the outcome, and report whether
    /// notifications are now allowed.
    pub async fn request(&self) -> bool {
        match self.capability.request().await {
            Ok(granted) => {
                self.state.send_replace(if granted {
                    PermissionState::Granted
                } else {
                    PermissionState::Denied
                });
                granted
            }
            Err(e) => {
                tracing::warn!("Notification permission prompt failed: {}", e);
                self.state.send_replace(PermissionState::Denied);
                false
            }
        }
    }
}
