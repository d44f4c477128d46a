mod schema;

use std::path::Path;

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device-scoped durable store: a small sqlite database holding the key-value
/// `preferences` table and the encrypted `credentials` table.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        tracing::info!("Opening database at: {}", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        Self::init(pool).await
    }

    /// An in-memory database for tests. A single connection keeps every
    /// query on the same in-memory instance.
    pub async fn in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, DbError> {
        for statement in schema::CREATE_TABLES {
            sqlx::query(statement).execute(&pool).await?;
        }

        tracing::info!("Database initialized successfully");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Read a preference value by key. Missing keys are `None`, not an error.
    pub async fn get_value(&self, key: &str) -> Result<Option<String>, DbError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM preferences WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Write a preference value, replacing any existing one.
    pub async fn set_value(&self, key: &str, value: &str) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO preferences (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_value(&self, key: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM preferences WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Stable per-device identifier, generated on first use. Hosts tag push
    /// registrations with it so sign-out can target this device's tokens.
    pub async fn device_id(&self) -> Result<String, DbError> {
        if let Some(id) = self.get_value("device_id").await? {
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.set_value("device_id", &id).await?;
        tracing::info!("Generated device id {}", id);
        Ok(id)
    }

    /// Read an encrypted credential blob by id.
    pub async fn get_credential(&self, id: &str) -> Result<Option<String>, DbError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT encrypted_data FROM credentials WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(data,)| data))
    }

    /// Store an encrypted credential blob, replacing any existing one.
    pub async fn set_credential(&self, id: &str, encrypted_data: &str) -> Result<(), DbError> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO credentials (id, encrypted_data, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET encrypted_data = excluded.encrypted_data,
                                           updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(encrypted_data)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_credential(&self, id: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM credentials WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_value_missing_key() {
        let db = Database::in_memory().await.unwrap();

        assert_eq!(db.get_value("theme").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_value_roundtrip_and_replace() {
        let db = Database::in_memory().await.unwrap();

        db.set_value("theme", "dark").await.unwrap();
        assert_eq!(db.get_value("theme").await.unwrap().as_deref(), Some("dark"));

        db.set_value("theme", "light").await.unwrap();
        assert_eq!(db.get_value("theme").await.unwrap().as_deref(), Some("light"));
    }

    #[tokio::test]
    async fn test_delete_value() {
        let db = Database::in_memory().await.unwrap();

        db.set_value("currency", "eur").await.unwrap();
        db.delete_value("currency").await.unwrap();

        assert_eq!(db.get_value("currency").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_credential_roundtrip() {
        let db = Database::in_memory().await.unwrap();

        db.set_credential("session", "blob-1").await.unwrap();
        db.set_credential("session", "blob-2").await.unwrap();

        assert_eq!(
            db.get_credential("session").await.unwrap().as_deref(),
            Some("blob-2")
        );

        db.delete_credential("session").await.unwrap();
        assert_eq!(db.get_credential("session").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_device_id_is_stable() {
        let db = Database::in_memory().await.unwrap();

        let first = db.device_id().await.unwrap();
        let second = db.device_id().await.unwrap();

        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("lifesync.db");

        let db = Database::open(&path).await.unwrap();
        db.set_value("theme", "system").await.unwrap();

        assert!(path.exists());
    }
}
