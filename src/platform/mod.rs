//! Platform capability seams: biometric prompt and notification permission.
//! Real implementations live in the host shell (each OS has its own APIs);
//! the [`fakes`] module provides scripted implementations for tests and
//! headless development.

pub mod fakes;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Platform capability unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BiometricAuthenticator: Send + Sync {
    /// Show the platform biometric prompt. `Ok(false)` is a user-side
    /// refusal; `Err` means the capability itself failed.
    async fn authenticate(&self, reason: &str) -> Result<bool, PlatformError>;
}

#[async_trait]
pub trait NotificationPermissions: Send + Sync {
    /// Current system-level permission for sending notifications.
    async fn status(&self) -> Result<bool, PlatformError>;

    /// Show the permission prompt and report the resulting grant.
    async fn request(&self) -> Result<bool, PlatformError>;
}
