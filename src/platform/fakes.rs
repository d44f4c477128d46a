//! Scripted capability implementations.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{BiometricAuthenticator, NotificationPermissions, PlatformError};

/// Biometric prompt with a fixed scripted answer.
pub struct ScriptedBiometrics {
    outcome: AtomicBool,
    failing: AtomicBool,
}

impl ScriptedBiometrics {
    pub fn accepting() -> Self {
        Self {
            outcome: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }

    pub fn refusing() -> Self {
        Self {
            outcome: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        }
    }

    /// Capability-level failure (no sensor, platform error).
    pub fn unavailable() -> Self {
        Self {
            outcome: AtomicBool::new(false),
            failing: AtomicBool::new(true),
        }
    }

    pub fn set_outcome(&self, accepted: bool) {
        self.outcome.store(accepted, Ordering::SeqCst);
    }
}

#[async_trait]
impl BiometricAuthenticator for ScriptedBiometrics {
    async fn authenticate(&self, _reason: &str) -> Result<bool, PlatformError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable("no biometric sensor".into()));
        }
        Ok(self.outcome.load(Ordering::SeqCst))
    }
}

/// Notification permission capability with scripted status and prompt
/// results.
pub struct ScriptedPermissions {
    granted: AtomicBool,
    grant_on_request: AtomicBool,
    failing: AtomicBool,
}

impl ScriptedPermissions {
    pub fn granted() -> Self {
        Self {
            granted: AtomicBool::new(true),
            grant_on_request: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }

    pub fn denied() -> Self {
        Self {
            granted: AtomicBool::new(false),
            grant_on_request: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        }
    }

    /// Denied now, but the user will accept the prompt.
    pub fn promptable() -> Self {
        Self {
            granted: AtomicBool::new(false),
            grant_on_request: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            granted: AtomicBool::new(false),
            grant_on_request: AtomicBool::new(false),
            failing: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl NotificationPermissions for ScriptedPermissions {
    async fn status(&self) -> Result<bool, PlatformError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable("permission query failed".into()));
        }
        Ok(self.granted.load(Ordering::SeqCst))
    }

    async fn request(&self) -> Result<bool, PlatformError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable("permission prompt failed".into()));
        }
        let granted = self.grant_on_request.load(Ordering::SeqCst);
        self.granted.store(granted, Ordering::SeqCst);
        Ok(granted)
    }
}
