//! Encrypted at-rest storage for the persisted session and for the
//! credentials behind biometric sign-in. Blobs live in the local database,
//! ciphered by [`CryptoService`]; a blob that fails to decrypt or decode is
//! deleted and treated as absent rather than surfaced as an error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::AuthSession;
use crate::crypto::{CryptoError, CryptoService};
use crate::db::{Database, DbError};

const SESSION_ID: &str = "session";
const BIOMETRIC_ID: &str = "biometric-login";

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Store error: {0}")]
    Db(#[from] DbError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Email/password pair retained for biometric re-authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredCredentials {
    pub email: String,
    pub password: String,
}

pub struct CredentialVault {
    db: Database,
    crypto: CryptoService,
}

impl CredentialVault {
    pub fn new(db: Database, crypto: CryptoService) -> Self {
        Self { db, crypto }
    }

    pub async fn save_session(&self, session: &AuthSession) -> Result<(), VaultError> {
        self.store(SESSION_ID, session).await
    }

    pub async fn load_session(&self) -> Result<Option<AuthSession>, VaultError> {
        self.load(SESSION_ID).await
    }

    pub async fn clear_session(&self) -> Result<(), VaultError> {
        self.db.delete_credential(SESSION_ID).await?;
        Ok(())
    }

    pub async fn save_credentials(&self, credentials: &StoredCredentials) -> Result<(), VaultError> {
        self.store(BIOMETRIC_ID, credentials).await
    }

    pub async fn load_credentials(&self) -> Result<Option<StoredCredentials>, VaultError> {
        self.load(BIOMETRIC_ID).await
    }

    pub async fn clear_credentials(&self) -> Result<(), VaultError> {
        self.db.delete_credential(BIOMETRIC_ID).await?;
        Ok(())
    }

    async fn store<T: Serialize>(&self, id: &str, value: &T) -> Result<(), VaultError> {
        let json = serde_json::to_string(value).map_err(|_| CryptoError::Encryption)?;
        let encrypted = self.crypto.encrypt_string(&json)?;
        self.db.set_credential(id, &encrypted).await?;
        Ok(())
    }

    async fn load<T: for<'de> Deserialize<'de>>(&self, id: &str) -> Result<Option<T>, VaultError> {
        let Some(encrypted) = self.db.get_credential(id).await? else {
            return Ok(None);
        };

        let decrypted = match self.crypto.decrypt_string(&encrypted) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Dropping undecryptable {} blob: {}", id, e);
                self.db.delete_credential(id).await?;
                return Ok(None);
            }
        };

        match serde_json::from_str(&decrypted) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("Dropping malformed {} blob: {}", id, e);
                self.db.delete_credential(id).await?;
                Ok(None)
            }
        }
    }
}
