// Persisted user record (spec §6 "Persisted state"): `{fullName, publicKey, privateKey,
// setupComplete, createdAt}` keyed by username, in SQLite via `sqlx`. The identity/LDAP provider
// itself is out of scope (spec §1 Non-goals); this only owns the row the rest of the system
// reads an SSH key pair from.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserRecord {
    pub username: String,
    pub full_name: String,
    pub public_key: Option<String>,
    /// The `enc:v2:...` / `enc:v3:...` encoded private key, never the decrypted bytes.
    pub private_key: Option<String>,
    pub setup_complete: bool,
    pub created_at: DateTime<Utc>,
}

pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        UserStore { pool }
    }

    pub async fn get(&self, username: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRecord>(
            "SELECT username, full_name, public_key, private_key, setup_complete, created_at \
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert(&self, record: &UserRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (username, full_name, public_key, private_key, setup_complete, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(username) DO UPDATE SET \
               full_name = excluded.full_name, \
               public_key = excluded.public_key, \
               private_key = excluded.private_key, \
               setup_complete = excluded.setup_complete",
        )
        .bind(&record.username)
        .bind(&record.full_name)
        .bind(&record.public_key)
        .bind(&record.private_key)
        .bind(record.setup_complete)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_keypair(
        &self,
        username: &str,
        public_key: &str,
        encrypted_private_key: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET public_key = ?, private_key = ?, setup_complete = 1 WHERE username = ?",
        )
        .bind(public_key)
        .bind(encrypted_private_key)
        .bind(username)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::Validation(format!("unknown user {username}")));
        }
        Ok(())
    }
}
